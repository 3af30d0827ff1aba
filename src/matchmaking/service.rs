//! Matchmaking service - join-or-create over the live match registry

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::{GameMatch, JoinError, MatchConfig, MatchHandle, MatchInput, MatchRegistry, SeatClaim};
use crate::replication::Outbound;
use crate::ws::protocol::PlayerInfo;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MatchmakingError {
    #[error("Match {0} not found")]
    MatchNotFound(Uuid),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error("Match stopped before the join completed")]
    MatchGone,
}

impl MatchmakingError {
    pub fn code(&self) -> &'static str {
        match self {
            MatchmakingError::MatchNotFound(_) => "match_not_found",
            MatchmakingError::Join(err) => err.code(),
            MatchmakingError::MatchGone => "match_gone",
        }
    }
}

/// Who wants to play, and where
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub display_name: String,
    /// Join this match instead of any open one
    pub match_id: Option<Uuid>,
    /// Take back a seat held before a disconnect
    pub claim: Option<SeatClaim>,
}

/// A participant seated in a match
pub struct Session {
    pub match_id: Uuid,
    pub player: PlayerInfo,
    /// Secret for taking the seat back later
    pub rejoin_token: Uuid,
    pub input_tx: mpsc::Sender<MatchInput>,
    /// Subscribed before the join, so the catch-up snapshot is included
    pub outbound_rx: broadcast::Receiver<Outbound>,
}

/// Matchmaking service
pub struct MatchmakingService {
    registry: Arc<MatchRegistry>,
    config: MatchConfig,
    /// Serializes join-or-create so two lone players share one match
    join_lock: Mutex<()>,
    /// Seat holder -> match, until that match ends. Routes rejoins that
    /// carry no match id.
    player_matches: Arc<DashMap<Uuid, Uuid>>,
}

impl MatchmakingService {
    pub fn new(registry: Arc<MatchRegistry>, config: MatchConfig) -> Self {
        Self {
            registry,
            config,
            join_lock: Mutex::new(()),
            player_matches: Arc::new(DashMap::new()),
        }
    }

    /// Seat a player: in the requested match, back in the match a claimed
    /// seat belongs to, in the first open one, or in a fresh match when
    /// nothing is open.
    pub async fn join(&self, request: JoinRequest) -> Result<Session, MatchmakingError> {
        if let Some(match_id) = request.match_id {
            let handle = self
                .registry
                .get(&match_id)
                .ok_or(MatchmakingError::MatchNotFound(match_id))?;
            return self.join_handle(&handle, &request).await;
        }

        if let Some(handle) = self.claimed_match(&request) {
            match self.join_handle(&handle, &request).await {
                Err(MatchmakingError::Join(JoinError::MatchFull)) | Err(MatchmakingError::MatchGone) => {
                    // Seat was released before the match started
                    debug!(match_id = %handle.id, "Claimed seat no longer held");
                }
                other => return other,
            }
        }

        let request = JoinRequest {
            claim: None,
            ..request
        };
        let _guard = self.join_lock.lock().await;

        if let Some(handle) = self.registry.find_available_match() {
            match self.join_handle(&handle, &request).await {
                Err(MatchmakingError::Join(err)) => {
                    // Lobby summary was stale
                    debug!(match_id = %handle.id, %err, "Open match refused join");
                }
                Err(MatchmakingError::MatchGone) => {
                    debug!(match_id = %handle.id, "Open match stopped during join");
                }
                other => return other,
            }
        }

        let handle = self.create_match();
        self.join_handle(&handle, &request).await
    }

    /// The socket closed. The seat mapping stays so the player can come back.
    pub async fn leave(&self, player_id: Uuid, input_tx: &mpsc::Sender<MatchInput>) {
        if input_tx
            .send(MatchInput::Disconnected { player_id })
            .await
            .is_err()
        {
            debug!(player_id = %player_id, "Match already stopped");
            self.player_matches.remove(&player_id);
        }
        info!(player_id = %player_id, "Player left matchmaking");
    }

    /// Spawn a new match task and register it until the task ends
    pub fn create_match(&self) -> MatchHandle {
        let match_id = Uuid::new_v4();
        let seed = rand::random::<u64>();

        let (game_match, handle) = GameMatch::new(match_id, self.config.clone(), seed);
        self.registry.insert(handle.clone());
        info!(match_id = %match_id, "Created new match");

        let registry = self.registry.clone();
        let player_matches = self.player_matches.clone();
        tokio::spawn(async move {
            game_match.run().await;

            registry.remove(&match_id);
            player_matches.retain(|_, m| *m != match_id);
            info!(match_id = %match_id, "Match removed from registry");
        });

        handle
    }

    /// Get player's current match ID
    pub fn player_match(&self, player_id: &Uuid) -> Option<Uuid> {
        self.player_matches.get(player_id).map(|r| *r)
    }

    fn claimed_match(&self, request: &JoinRequest) -> Option<MatchHandle> {
        let claim = request.claim?;
        let match_id = self.player_match(&claim.player_id)?;
        self.registry.get(&match_id)
    }

    async fn join_handle(
        &self,
        handle: &MatchHandle,
        request: &JoinRequest,
    ) -> Result<Session, MatchmakingError> {
        let outbound_rx = handle.subscribe();
        let (reply, reply_rx) = oneshot::channel();

        handle
            .input_tx
            .send(MatchInput::Join {
                claim: request.claim,
                display_name: request.display_name.clone(),
                reply,
            })
            .await
            .map_err(|_| MatchmakingError::MatchGone)?;

        let seat = reply_rx.await.map_err(|_| MatchmakingError::MatchGone)?.map_err(|err| {
            warn!(match_id = %handle.id, %err, "Join refused");
            MatchmakingError::from(err)
        })?;

        self.player_matches.insert(seat.player.player_id, handle.id);
        Ok(Session {
            match_id: handle.id,
            player: seat.player,
            rejoin_token: seat.rejoin_token,
            input_tx: handle.input_tx.clone(),
            outbound_rx,
        })
    }
}
