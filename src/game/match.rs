//! Match state machine and the task that hosts it

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::replication::{BroadcastReplication, Outbound, Replicated, ReplicationChannel};
use crate::ws::protocol::{ClientMsg, GamePhase, MatchSnapshot, PlayerHealth, PlayerInfo, ReplicatedValue, ServerMsg};

use super::card::CardRegistry;
use super::deal::{DealCoordinator, DealPolicy};
use super::events::{MatchEvents, ReplicationObserver};
use super::resolution::{resolve, IncompleteSelectionPolicy, Outcome};
use super::selection::{SelectionCollector, SelectionResult, SubmitOutcome};
use super::snapshot::{self, MatchSummary};
use super::MatchInput;

/// Players per match. The protocol is fixed to two.
pub const REQUIRED_PLAYERS: usize = 2;

const OUTBOUND_CAPACITY: usize = 512;
const INPUT_CAPACITY: usize = 256;

/// Per-match tunables
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub hand_size: usize,
    pub starting_health: i32,
    pub selection_timeout: Duration,
    /// Upper bound on waiting for spawn acknowledgements
    pub deal_ack_timeout: Duration,
    pub round_restart_delay: Duration,
    pub game_over_reset_delay: Duration,
    /// Between the reset notice and session teardown
    pub restart_notice_delay: Duration,
    pub player_poll_interval: Duration,
    pub deal_policy: DealPolicy,
    pub incomplete_selection_policy: IncompleteSelectionPolicy,
    pub reset_after_game_over: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            hand_size: 3,
            starting_health: 3,
            selection_timeout: Duration::from_secs(60),
            deal_ack_timeout: Duration::from_millis(10_000),
            round_restart_delay: Duration::from_millis(2_000),
            game_over_reset_delay: Duration::from_millis(5_000),
            restart_notice_delay: Duration::from_millis(2_000),
            player_poll_interval: Duration::from_millis(500),
            deal_policy: DealPolicy::Random,
            incomplete_selection_policy: IncompleteSelectionPolicy::Forfeit,
            reset_after_game_over: true,
        }
    }
}

impl GamePhase {
    /// Edges of the match lifecycle. Self-transitions are not edges.
    pub fn can_transition_to(self, next: GamePhase) -> bool {
        use GamePhase::*;
        matches!(
            (self, next),
            (WaitingForPlayers, DealingCards)
                | (DealingCards, PlayerSelection)
                | (DealingCards, WaitingForPlayers)
                | (PlayerSelection, Resolution)
                | (Resolution, DealingCards)
                | (Resolution, GameOver)
                | (Resolution, WaitingForPlayers)
                | (GameOver, WaitingForPlayers)
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Illegal phase transition {from:?} -> {to:?}")]
    Illegal { from: GamePhase, to: GamePhase },
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    #[error("Match is full")]
    MatchFull,

    #[error("Match is closing")]
    MatchClosing,

    #[error("Player is already connected to this match")]
    AlreadyConnected,

    #[error("Rejoin token does not match the seat")]
    InvalidRejoinToken,
}

impl JoinError {
    pub fn code(&self) -> &'static str {
        match self {
            JoinError::MatchFull => "match_full",
            JoinError::MatchClosing => "match_closing",
            JoinError::AlreadyConnected => "already_connected",
            JoinError::InvalidRejoinToken => "invalid_rejoin_token",
        }
    }
}

/// Suspension points of the lifecycle that end on a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTimer {
    DealAck,
    SelectionTimeout,
    NextRound,
    MatchReset,
    Teardown,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledTimer {
    kind: PhaseTimer,
    deadline: Instant,
}

/// Credentials presented to take back a seat after a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatClaim {
    pub player_id: Uuid,
    pub rejoin_token: Uuid,
}

/// A granted seat. The token is only ever handed to the seat holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seat {
    pub player: PlayerInfo,
    pub rejoin_token: Uuid,
}

/// Player slot state (authoritative)
#[derive(Debug, Clone)]
pub struct Player {
    pub id: Uuid,
    pub display_name: String,
    /// 0 = player one, 1 = player two
    pub slot: usize,
    pub connected: bool,
    health: Replicated<i32>,
    /// Secret bound to the seat; `id` alone is public
    rejoin_token: Uuid,
}

impl Player {
    pub fn new(id: Uuid, display_name: String, slot: usize, health: i32) -> Self {
        Self {
            id,
            display_name,
            slot,
            connected: true,
            health: Replicated::new(health),
            rejoin_token: Uuid::new_v4(),
        }
    }

    pub fn health(&self) -> i32 {
        *self.health.get()
    }

    fn health_entry(&self) -> PlayerHealth {
        PlayerHealth {
            player_id: self.id,
            health: self.health(),
        }
    }
}

/// The authoritative orchestrator of one match.
///
/// Every mutation goes through `&mut self` from a single task, so phase
/// changes, health and selections have exactly one writer.
pub struct MatchStateMachine {
    id: Uuid,
    config: MatchConfig,
    phase: Replicated<GamePhase>,
    slots: [Option<Player>; REQUIRED_PLAYERS],
    connected_players: Replicated<usize>,
    round: u32,
    /// Set on the first deal; from then on slots stay bound to their player
    started: bool,
    closing: bool,
    finished: bool,
    cards: CardRegistry,
    dealer: DealCoordinator,
    collector: SelectionCollector,
    /// Closed window waiting to be resolved
    closed_window: Option<SelectionResult>,
    timer: Option<ScheduledTimer>,
    channel: Arc<dyn ReplicationChannel>,
    events: MatchEvents,
    rng: ChaCha8Rng,
}

impl MatchStateMachine {
    pub fn new(
        id: Uuid,
        config: MatchConfig,
        channel: Arc<dyn ReplicationChannel>,
        events: MatchEvents,
        seed: u64,
    ) -> Self {
        Self {
            id,
            config,
            phase: Replicated::default(),
            slots: [None, None],
            connected_players: Replicated::new(0),
            round: 0,
            started: false,
            closing: false,
            finished: false,
            cards: CardRegistry::new(),
            dealer: DealCoordinator::new(),
            collector: SelectionCollector::new(),
            closed_window: None,
            timer: None,
            channel,
            events,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> GamePhase {
        *self.phase.get()
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    #[cfg(test)]
    pub fn cards(&self) -> &CardRegistry {
        &self.cards
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.slots.iter().flatten()
    }

    pub fn player(&self, player_id: Uuid) -> Option<&Player> {
        self.players().find(|p| p.id == player_id)
    }

    #[cfg(test)]
    pub fn health_of(&self, player_id: Uuid) -> Option<i32> {
        self.player(player_id).map(Player::health)
    }

    pub fn connected_count(&self) -> usize {
        self.players().filter(|p| p.connected).count()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.deadline)
    }

    pub fn pending_timer(&self) -> Option<PhaseTimer> {
        self.timer.map(|t| t.kind)
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        snapshot::build(
            self.phase(),
            self.round,
            self.players(),
            &self.cards,
            self.collector.selections(),
        )
    }

    pub fn summary(&self) -> MatchSummary {
        MatchSummary {
            match_id: self.id,
            phase: self.phase(),
            players: self.connected_count(),
            open_slots: self.slots.iter().filter(|s| s.is_none()).count(),
            accepting: !self.closing && !self.finished,
        }
    }

    /// Take a free slot, or reclaim the seat named by `claim`. A claim for a
    /// seat that no longer exists falls back to a fresh slot.
    /// The joiner receives a full snapshot; everyone else a `PlayerJoined`.
    pub fn join(&mut self, claim: Option<SeatClaim>, display_name: String) -> Result<Seat, JoinError> {
        if self.closing || self.finished {
            return Err(JoinError::MatchClosing);
        }

        let existing = claim.and_then(|c| self.slot_of(c.player_id));
        let slot = match existing {
            Some(slot) => slot,
            None => self
                .slots
                .iter()
                .position(Option::is_none)
                .ok_or(JoinError::MatchFull)?,
        };

        let (info, rejoin_token) = match &mut self.slots[slot] {
            Some(player) if claim.map(|c| c.rejoin_token) != Some(player.rejoin_token) => {
                warn!(match_id = %self.id, player_id = %player.id, "Seat claim with wrong token");
                return Err(JoinError::InvalidRejoinToken);
            }
            Some(player) if player.connected => return Err(JoinError::AlreadyConnected),
            Some(player) => {
                player.connected = true;
                info!(match_id = %self.id, player_id = %player.id, slot, "Player rejoined match");
                (snapshot::player_info(player), player.rejoin_token)
            }
            empty => {
                let player = Player::new(Uuid::new_v4(), display_name, slot, self.config.starting_health);
                info!(match_id = %self.id, player_id = %player.id, slot, "Player joined match");
                let player = empty.insert(player);
                (snapshot::player_info(player), player.rejoin_token)
            }
        };

        self.channel.invoke_on_all(ServerMsg::PlayerJoined { player: info.clone() });
        self.channel.send_to(
            info.player_id,
            ServerMsg::MatchJoined {
                match_id: self.id,
                snapshot: self.snapshot(),
            },
        );
        Ok(Seat {
            player: info,
            rejoin_token,
        })
    }

    /// A participant disconnected or asked to leave
    pub fn leave(&mut self, player_id: Uuid, reason: &str) {
        let Some(slot) = self.slot_of(player_id) else {
            return;
        };

        if self.started {
            if let Some(player) = self.slots[slot].as_mut() {
                if !player.connected {
                    return;
                }
                player.connected = false;
            }
        } else {
            self.slots[slot] = None;
        }

        info!(match_id = %self.id, player_id = %player_id, reason, "Player left match");
        self.channel.invoke_on_all(ServerMsg::PlayerLeft {
            player_id,
            reason: reason.to_string(),
        });

        match self.phase() {
            GamePhase::DealingCards => {
                if self.dealer.exclude_player(player_id, &self.cards) {
                    self.on_dealing_complete();
                }
            }
            GamePhase::PlayerSelection => {
                if let Some(result) =
                    self.collector
                        .exclude_player(player_id, &mut self.cards, self.channel.as_ref())
                {
                    self.on_selection_closed(result);
                }
            }
            _ => {}
        }

        if self.connected_count() == 0 {
            info!(match_id = %self.id, "All players left");
            self.finished = true;
        }
    }

    /// Readiness poll: replicate the connected count and start dealing
    /// once both slots are connected.
    pub fn poll_players(&mut self) {
        let connected = self.connected_count();
        if self.connected_players.set(connected).is_some() {
            self.channel
                .set_value(ReplicatedValue::ConnectedPlayers(connected));
        }

        if self.phase() == GamePhase::WaitingForPlayers
            && !self.closing
            && connected >= REQUIRED_PLAYERS
        {
            self.started = true;
            self.advance(GamePhase::DealingCards);
        }
    }

    pub fn handle_client(&mut self, player_id: Uuid, msg: ClientMsg) {
        if self.slot_of(player_id).is_none() {
            warn!(match_id = %self.id, player_id = %player_id, "Input from unknown player ignored");
            return;
        }

        match msg {
            ClientMsg::SelectCard { card_id } => {
                match self
                    .collector
                    .submit(player_id, card_id, &mut self.cards, self.channel.as_ref())
                {
                    SubmitOutcome::Accepted(Some(result)) => self.on_selection_closed(result),
                    SubmitOutcome::Accepted(None) | SubmitOutcome::Rejected(_) => {}
                }
            }
            ClientMsg::RevealCard { card_id } => {
                if self.cards.owner_of(card_id) != Some(player_id) {
                    warn!(player_id = %player_id, card_id, "Reveal of foreign card ignored");
                    return;
                }
                if let Some(view) = self.cards.reveal(card_id) {
                    self.channel.update_entity(view);
                }
            }
            ClientMsg::SpawnAck { entity_id } => {
                if self.phase() != GamePhase::DealingCards {
                    debug!(player_id = %player_id, entity_id, "Late spawn acknowledgement");
                    return;
                }
                if self.dealer.acknowledge(player_id, entity_id, &self.cards) {
                    self.on_dealing_complete();
                }
            }
            ClientMsg::Ping { t } => {
                self.channel.send_to(player_id, ServerMsg::Pong { t });
            }
            ClientMsg::LeaveMatch => self.leave(player_id, "left"),
        }
    }

    /// Fire the pending timer if its deadline has passed
    pub fn fire_due_timer(&mut self, now: Instant) {
        if let Some(timer) = self.timer {
            if timer.deadline <= now {
                self.fire_timer(timer.kind);
            }
        }
    }

    /// Run the handler of `kind` now. A timer whose phase has already been
    /// left has no effect.
    pub fn fire_timer(&mut self, kind: PhaseTimer) {
        if self.pending_timer() == Some(kind) {
            self.timer = None;
        }

        match (kind, self.phase()) {
            (PhaseTimer::DealAck, GamePhase::DealingCards) => {
                if self.dealer.force_complete() {
                    self.on_dealing_complete();
                }
            }
            (PhaseTimer::SelectionTimeout, GamePhase::PlayerSelection) => {
                if let Some(result) = self.collector.timeout(&mut self.cards, self.channel.as_ref()) {
                    self.on_selection_closed(result);
                }
            }
            (PhaseTimer::NextRound, GamePhase::Resolution) => {
                if self.connected_count() >= REQUIRED_PLAYERS {
                    self.advance(GamePhase::DealingCards);
                } else {
                    info!(match_id = %self.id, "Opponent missing, waiting before next round");
                    self.advance(GamePhase::WaitingForPlayers);
                }
            }
            (PhaseTimer::MatchReset, GamePhase::GameOver) => self.reset(),
            (PhaseTimer::Teardown, _) if self.closing => {
                info!(match_id = %self.id, "Session closed");
                self.events.session_closed();
                self.finished = true;
            }
            (kind, phase) => {
                debug!(match_id = %self.id, ?kind, ?phase, "Stale timer ignored");
            }
        }
    }

    fn slot_of(&self, player_id: Uuid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.id == player_id))
    }

    fn connected_ids(&self) -> Vec<Uuid> {
        self.players().filter(|p| p.connected).map(|p| p.id).collect()
    }

    fn schedule(&mut self, kind: PhaseTimer, after: Duration) {
        self.timer = Some(ScheduledTimer {
            kind,
            deadline: Instant::now() + after,
        });
    }

    fn advance(&mut self, next: GamePhase) {
        if let Err(err) = self.transition(next) {
            error!(match_id = %self.id, %err, "Phase transition refused");
        }
    }

    /// Write the phase, notify, then run the entry action of `next`.
    /// Any timer of the phase being left is cancelled.
    fn transition(&mut self, next: GamePhase) -> Result<(), TransitionError> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: current,
                to: next,
            });
        }

        self.timer = None;
        if let Some(change) = self.phase.set(next) {
            info!(
                match_id = %self.id,
                previous = ?change.previous,
                phase = ?change.current,
                round = self.round,
                "Phase changed"
            );
            self.channel.set_value(ReplicatedValue::Phase(change.current));
            self.events.phase_changed(change.previous, change.current);
        }

        match next {
            GamePhase::WaitingForPlayers => {}
            GamePhase::DealingCards => self.enter_dealing(),
            GamePhase::PlayerSelection => self.enter_selection(),
            GamePhase::Resolution => self.enter_resolution(),
            GamePhase::GameOver => self.enter_game_over(),
        }
        Ok(())
    }

    fn enter_dealing(&mut self) {
        let players = self.connected_ids();
        let result = self.dealer.deal(
            &players,
            self.config.hand_size,
            self.config.deal_policy,
            &mut self.rng,
            &mut self.cards,
            self.channel.as_ref(),
        );

        match result {
            Ok(()) => {
                self.round += 1;
                self.schedule(PhaseTimer::DealAck, self.config.deal_ack_timeout);
            }
            Err(err) => {
                warn!(match_id = %self.id, %err, "Deal refused");
                self.advance(GamePhase::WaitingForPlayers);
            }
        }
    }

    fn on_dealing_complete(&mut self) {
        self.events.dealing_complete();
        self.advance(GamePhase::PlayerSelection);
    }

    fn enter_selection(&mut self) {
        let participants = self.dealer.players().to_vec();
        self.collector
            .open(&participants, &mut self.cards, self.channel.as_ref());

        let timeout_ms = self.config.selection_timeout.as_millis() as u64;
        self.events.selection_opened(timeout_ms);
        self.schedule(PhaseTimer::SelectionTimeout, self.config.selection_timeout);

        // Whoever left while the hands were being dealt is not waited for
        for player_id in participants {
            if self.player(player_id).is_some_and(|p| p.connected) {
                continue;
            }
            if let Some(result) =
                self.collector
                    .exclude_player(player_id, &mut self.cards, self.channel.as_ref())
            {
                self.on_selection_closed(result);
                return;
            }
        }
    }

    fn on_selection_closed(&mut self, result: SelectionResult) {
        self.events.selection_complete(&result.selections);
        self.closed_window = Some(result);
        self.advance(GamePhase::Resolution);
    }

    fn enter_resolution(&mut self) {
        let window = self.closed_window.take().unwrap_or_default();
        let cards = &self.cards;
        let outcome = resolve(&window.selections, |id| cards.card_type_of(id));

        let losers: Vec<Uuid> = match outcome {
            Outcome::Winner(winner) => window
                .selections
                .keys()
                .filter(|p| **p != winner)
                .copied()
                .collect(),
            Outcome::Tie => Vec::new(),
            Outcome::Indeterminate => match self.config.incomplete_selection_policy {
                IncompleteSelectionPolicy::Forfeit => window.non_responders(),
                IncompleteSelectionPolicy::Skip => Vec::new(),
            },
        };

        let credited = match outcome {
            Outcome::Winner(winner) => Some(winner),
            _ if losers.is_empty() => None,
            _ => {
                let mut standing = window.participants.iter().filter(|p| !losers.contains(p));
                match (standing.next(), standing.next()) {
                    (Some(only), None) => Some(*only),
                    _ => None,
                }
            }
        };

        for loser in &losers {
            self.damage(*loser);
        }

        info!(
            match_id = %self.id,
            round = self.round,
            ?outcome,
            losers = losers.len(),
            "Round resolved"
        );
        self.events.winner_selected(self.round, outcome, credited);
        let health = self.health_entries();
        self.events.show_health(&health);

        if self.players().any(|p| p.health() <= 0) {
            self.advance(GamePhase::GameOver);
            return;
        }

        let text = match (outcome, credited) {
            (Outcome::Tie, _) => "Tie".to_string(),
            (_, Some(winner)) => format!("{} wins the round", self.name_of(winner)),
            (_, None) => "No winner this round".to_string(),
        };
        self.events.show_result_text(&text);
        self.schedule(PhaseTimer::NextRound, self.config.round_restart_delay);
    }

    fn enter_game_over(&mut self) {
        let winner = {
            let mut standing = self.players().filter(|p| p.health() > 0);
            match (standing.next(), standing.next()) {
                (Some(only), None) => Some(only.id),
                _ => None,
            }
        };

        let text = match winner {
            Some(id) => format!("{} wins the match", self.name_of(id)),
            None => "Match drawn".to_string(),
        };
        info!(match_id = %self.id, winner = ?winner, rounds = self.round, "Game over");
        self.events.game_over(winner);
        self.events.show_result_text(&text);

        if self.config.reset_after_game_over {
            self.schedule(PhaseTimer::MatchReset, self.config.game_over_reset_delay);
        }
    }

    /// Health back to full, phase back to waiting, then the session is torn
    /// down after the notice delay.
    fn reset(&mut self) {
        let starting = self.config.starting_health;
        let changed: Vec<PlayerHealth> = self
            .slots
            .iter_mut()
            .flatten()
            .filter_map(|p| {
                p.health.set(starting).map(|_| PlayerHealth {
                    player_id: p.id,
                    health: starting,
                })
            })
            .collect();
        for entry in changed {
            self.channel.set_value(ReplicatedValue::PlayerHealth(entry));
        }

        self.closing = true;
        info!(match_id = %self.id, "Match reset");
        self.advance(GamePhase::WaitingForPlayers);
        self.events.match_reset();
        self.schedule(PhaseTimer::Teardown, self.config.restart_notice_delay);
    }

    fn damage(&mut self, player_id: Uuid) {
        let Some(slot) = self.slot_of(player_id) else {
            return;
        };
        let Some(player) = self.slots[slot].as_mut() else {
            return;
        };
        let health = player.health() - 1;
        if player.health.set(health).is_some() {
            debug!(match_id = %self.id, player_id = %player_id, health, "Health lost");
            self.channel
                .set_value(ReplicatedValue::PlayerHealth(PlayerHealth { player_id, health }));
        }
    }

    fn health_entries(&self) -> Vec<PlayerHealth> {
        self.players().map(Player::health_entry).collect()
    }

    fn name_of(&self, player_id: Uuid) -> &str {
        self.player(player_id)
            .map(|p| p.display_name.as_str())
            .unwrap_or("Unknown")
    }
}

/// The task that owns one state machine and serializes all input into it
pub struct GameMatch {
    machine: MatchStateMachine,
    input_rx: mpsc::Receiver<MatchInput>,
    summary: Arc<RwLock<MatchSummary>>,
    poll_interval: Duration,
}

impl GameMatch {
    pub fn new(id: Uuid, config: MatchConfig, seed: u64) -> (Self, MatchHandle) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let channel = Arc::new(BroadcastReplication::new(OUTBOUND_CAPACITY));
        let summary = Arc::new(RwLock::new(MatchSummary::empty(id)));

        let handle = MatchHandle {
            id,
            input_tx,
            outbound_tx: channel.sender(),
            summary: summary.clone(),
        };

        let mut events = MatchEvents::new();
        events.subscribe(Arc::new(ReplicationObserver::new(channel.clone())));

        let poll_interval = config.player_poll_interval;
        let game_match = Self {
            machine: MatchStateMachine::new(id, config, channel, events, seed),
            input_rx,
            summary,
            poll_interval,
        };

        (game_match, handle)
    }

    /// Run until the session is torn down or everyone has left
    pub async fn run(mut self) {
        let match_id = self.machine.id();
        info!(match_id = %match_id, "Match task started");

        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.machine.next_deadline();

            tokio::select! {
                input = self.input_rx.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => {
                        info!(match_id = %match_id, "Match handles dropped");
                        break;
                    }
                },
                _ = poll.tick() => self.machine.poll_players(),
                _ = wait_until(deadline) => self.machine.fire_due_timer(Instant::now()),
            }

            *self.summary.write() = self.machine.summary();

            if self.machine.is_finished() {
                break;
            }
        }

        self.summary.write().accepting = false;
        info!(match_id = %match_id, rounds = self.machine.round(), "Match task ended");
    }

    fn handle_input(&mut self, input: MatchInput) {
        match input {
            MatchInput::Join {
                claim,
                display_name,
                reply,
            } => {
                let result = self.machine.join(claim, display_name);
                if reply.send(result).is_err() {
                    debug!(match_id = %self.machine.id(), "Join requester went away");
                }
            }
            MatchInput::Client {
                player_id,
                msg,
                received_at,
            } => {
                debug!(player_id = %player_id, received_at, "Client input");
                self.machine.handle_client(player_id, msg);
            }
            MatchInput::Disconnected { player_id } => {
                self.machine.leave(player_id, "disconnected");
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<MatchInput>,
    pub outbound_tx: broadcast::Sender<Outbound>,
    summary: Arc<RwLock<MatchSummary>>,
}

impl MatchHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.outbound_tx.subscribe()
    }

    pub fn summary(&self) -> MatchSummary {
        self.summary.read().clone()
    }

    pub fn player_count(&self) -> usize {
        self.summary.read().players
    }

    pub fn is_joinable(&self) -> bool {
        self.summary.read().is_joinable()
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().player_count())
            .sum()
    }

    /// First match with a free slot that is still accepting players
    pub fn find_available_match(&self) -> Option<MatchHandle> {
        self.matches
            .iter()
            .find(|m| m.value().is_joinable())
            .map(|m| m.value().clone())
    }

    /// Open lobbies for listing
    pub fn lobbies(&self) -> Vec<MatchSummary> {
        let mut lobbies: Vec<MatchSummary> = self
            .matches
            .iter()
            .map(|m| m.value().summary())
            .filter(MatchSummary::is_joinable)
            .collect();
        lobbies.sort_by_key(|s| s.match_id);
        lobbies
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::events::testing::{Recorded, RecordingObserver};
    use crate::replication::EntityId;
    use crate::ws::protocol::CardType;
    use tokio::sync::oneshot;

    struct Harness {
        machine: MatchStateMachine,
        recorder: Arc<RecordingObserver>,
        outbound: broadcast::Receiver<Outbound>,
        a: Uuid,
        b: Uuid,
        b_token: Uuid,
    }

    fn test_config() -> MatchConfig {
        MatchConfig {
            deal_policy: DealPolicy::Cycle,
            ..MatchConfig::default()
        }
    }

    fn harness(config: MatchConfig) -> Harness {
        let channel = Arc::new(BroadcastReplication::new(4096));
        let outbound = channel.subscribe();
        let recorder = Arc::new(RecordingObserver::default());
        let mut events = MatchEvents::new();
        events.subscribe(recorder.clone());

        let mut machine = MatchStateMachine::new(Uuid::new_v4(), config, channel, events, 11);
        let a = machine.join(None, "alice".into()).unwrap().player.player_id;
        let bob = machine.join(None, "bob".into()).unwrap();

        Harness {
            machine,
            recorder,
            outbound,
            a,
            b: bob.player.player_id,
            b_token: bob.rejoin_token,
        }
    }

    impl Harness {
        /// Both connected: the poll starts round one
        fn start(&mut self) {
            self.machine.poll_players();
            assert_eq!(self.machine.phase(), GamePhase::DealingCards);
        }

        fn ack_from(&mut self, peer: Uuid) {
            for id in self.machine.cards().ids() {
                self.machine
                    .handle_client(peer, ClientMsg::SpawnAck { entity_id: id });
            }
        }

        fn deal_round(&mut self) {
            let (a, b) = (self.a, self.b);
            self.ack_from(a);
            self.ack_from(b);
            assert_eq!(self.machine.phase(), GamePhase::PlayerSelection);
        }

        fn card(&self, player: Uuid, card_type: CardType) -> EntityId {
            let cards = self.machine.cards();
            *cards
                .hand(player)
                .iter()
                .find(|id| cards.card_type_of(**id) == Some(card_type))
                .unwrap()
        }

        fn select(&mut self, player: Uuid, card_type: CardType) {
            let card_id = self.card(player, card_type);
            self.machine
                .handle_client(player, ClientMsg::SelectCard { card_id });
        }

        fn health(&self) -> (i32, i32) {
            (
                self.machine.health_of(self.a).unwrap(),
                self.machine.health_of(self.b).unwrap(),
            )
        }

        fn texts(&self) -> Vec<String> {
            self.recorder
                .events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Recorded::Text(text) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn drain(&mut self) -> Vec<ServerMsg> {
            let mut msgs = Vec::new();
            while let Ok(out) = self.outbound.try_recv() {
                msgs.push(out.msg);
            }
            msgs
        }
    }

    #[test]
    fn test_lifecycle_edges() {
        use GamePhase::*;
        assert!(WaitingForPlayers.can_transition_to(DealingCards));
        assert!(Resolution.can_transition_to(DealingCards));
        assert!(GameOver.can_transition_to(WaitingForPlayers));
        assert!(!WaitingForPlayers.can_transition_to(Resolution));
        assert!(!GameOver.can_transition_to(DealingCards));
        assert!(!PlayerSelection.can_transition_to(DealingCards));
        assert!(!DealingCards.can_transition_to(DealingCards));
    }

    #[test]
    fn test_illegal_transition_is_refused() {
        let mut h = harness(test_config());
        assert_eq!(
            h.machine.transition(GamePhase::Resolution),
            Err(TransitionError::Illegal {
                from: GamePhase::WaitingForPlayers,
                to: GamePhase::Resolution
            })
        );
        assert_eq!(h.machine.phase(), GamePhase::WaitingForPlayers);
    }

    #[test]
    fn test_single_player_does_not_start() {
        let channel = Arc::new(BroadcastReplication::new(64));
        let mut machine =
            MatchStateMachine::new(Uuid::new_v4(), test_config(), channel, MatchEvents::new(), 1);
        machine.join(None, "solo".into()).unwrap();

        machine.poll_players();
        assert_eq!(machine.phase(), GamePhase::WaitingForPlayers);
        assert!(machine.cards().is_empty());
    }

    #[test]
    fn test_third_player_is_refused() {
        let mut h = harness(test_config());
        assert_eq!(
            h.machine.join(None, "carol".into()),
            Err(JoinError::MatchFull)
        );
    }

    #[test]
    fn test_connected_seat_cannot_be_claimed() {
        let mut h = harness(test_config());
        h.start();
        let claim = SeatClaim {
            player_id: h.b,
            rejoin_token: h.b_token,
        };
        assert_eq!(
            h.machine.join(Some(claim), "bob".into()),
            Err(JoinError::AlreadyConnected)
        );
    }

    #[test]
    fn test_seat_claim_needs_the_holders_token() {
        let mut h = harness(test_config());
        h.start();
        let b = h.b;
        h.machine.leave(b, "disconnected");

        // The player id is public, the token is not
        let forged = SeatClaim {
            player_id: b,
            rejoin_token: Uuid::new_v4(),
        };
        assert_eq!(
            h.machine.join(Some(forged), "not-bob".into()),
            Err(JoinError::InvalidRejoinToken)
        );
        assert_eq!(h.machine.join(None, "not-bob".into()), Err(JoinError::MatchFull));
        assert!(!h.machine.player(b).unwrap().connected);
        assert_eq!(h.machine.player(b).unwrap().display_name, "bob");
    }

    #[test]
    fn test_token_only_reaches_its_holder() {
        let mut h = harness(test_config());
        let (a, b) = (h.a, h.b);
        let token = h.b_token.to_string();
        let msgs: Vec<Outbound> = std::iter::from_fn(|| h.outbound.try_recv().ok()).collect();

        let leaked = msgs
            .iter()
            .filter_map(|o| o.for_viewer(a))
            .any(|o| serde_json::to_string(&o).unwrap().contains(&token));
        assert!(!leaked);
        assert!(msgs.iter().filter_map(|o| o.for_viewer(b)).count() > 0);
    }

    #[test]
    fn test_joiner_receives_snapshot() {
        let mut h = harness(test_config());
        let a = h.a;
        let msgs: Vec<Outbound> = std::iter::from_fn(|| h.outbound.try_recv().ok()).collect();

        let joined = msgs
            .iter()
            .filter_map(|o| o.for_viewer(a))
            .find(|o| matches!(o.msg, ServerMsg::MatchJoined { .. }));
        assert!(joined.is_some());
    }

    #[test]
    fn test_deal_gives_each_player_a_hand() {
        let mut h = harness(test_config());
        h.start();

        assert_eq!(h.machine.round(), 1);
        assert_eq!(h.machine.cards().len(), 6);
        assert_eq!(h.machine.cards().hand(h.a).len(), 3);
        assert_eq!(h.machine.cards().hand(h.b).len(), 3);
        assert_eq!(h.machine.pending_timer(), Some(PhaseTimer::DealAck));
    }

    #[test]
    fn test_selection_waits_for_every_acknowledgement() {
        let mut h = harness(test_config());
        h.start();
        let a = h.a;
        h.ack_from(a);
        assert_eq!(h.machine.phase(), GamePhase::DealingCards);

        let b = h.b;
        h.ack_from(b);
        assert_eq!(h.machine.phase(), GamePhase::PlayerSelection);
        assert_eq!(h.recorder.count(|e| *e == Recorded::DealingComplete), 1);
        assert!(h.machine.cards().views().iter().all(|c| c.interactable));
    }

    #[test]
    fn test_ack_timeout_opens_selection() {
        let mut h = harness(test_config());
        h.start();
        h.machine.fire_timer(PhaseTimer::DealAck);
        assert_eq!(h.machine.phase(), GamePhase::PlayerSelection);
        assert_eq!(h.machine.pending_timer(), Some(PhaseTimer::SelectionTimeout));
    }

    #[test]
    fn test_scenario_rock_beats_scissors() {
        let mut h = harness(test_config());
        h.start();
        h.deal_round();
        let (a, b) = (h.a, h.b);
        let first_round: Vec<EntityId> = h.machine.cards().ids();

        h.select(a, CardType::Rock);
        assert_eq!(h.machine.phase(), GamePhase::PlayerSelection);
        h.select(b, CardType::Scissors);

        assert_eq!(h.machine.phase(), GamePhase::Resolution);
        assert_eq!(h.health(), (3, 2));
        assert_eq!(h.recorder.count(|e| *e == Recorded::Winner(1, Outcome::Winner(a), Some(a))), 1);
        assert_eq!(h.texts(), vec!["alice wins the round".to_string()]);
        assert_eq!(h.machine.pending_timer(), Some(PhaseTimer::NextRound));

        h.machine.fire_timer(PhaseTimer::NextRound);
        assert_eq!(h.machine.phase(), GamePhase::DealingCards);
        assert_eq!(h.machine.round(), 2);
        assert!(h
            .machine
            .cards()
            .ids()
            .iter()
            .all(|id| !first_round.contains(id)));
    }

    #[test]
    fn test_scenario_timeout_with_one_selection_forfeits() {
        let mut h = harness(test_config());
        h.start();
        h.deal_round();
        let a = h.a;

        h.select(a, CardType::Paper);
        h.machine.fire_timer(PhaseTimer::SelectionTimeout);

        assert_eq!(h.machine.phase(), GamePhase::Resolution);
        assert_eq!(h.health(), (3, 2));
        assert_eq!(
            h.recorder.count(|e| *e == Recorded::Winner(1, Outcome::Indeterminate, Some(a))),
            1
        );
    }

    #[test]
    fn test_scenario_timeout_with_skip_policy() {
        let mut h = harness(MatchConfig {
            incomplete_selection_policy: IncompleteSelectionPolicy::Skip,
            ..test_config()
        });
        h.start();
        h.deal_round();
        let a = h.a;

        h.select(a, CardType::Paper);
        h.machine.fire_timer(PhaseTimer::SelectionTimeout);

        assert_eq!(h.health(), (3, 3));
        assert_eq!(h.texts(), vec!["No winner this round".to_string()]);
        h.machine.fire_timer(PhaseTimer::NextRound);
        assert_eq!(h.machine.phase(), GamePhase::DealingCards);
    }

    #[test]
    fn test_scenario_tie_keeps_health() {
        let mut h = harness(test_config());
        h.start();
        h.deal_round();
        let (a, b) = (h.a, h.b);

        h.select(a, CardType::Paper);
        h.select(b, CardType::Paper);

        assert_eq!(h.machine.phase(), GamePhase::Resolution);
        assert_eq!(h.health(), (3, 3));
        assert_eq!(h.texts(), vec!["Tie".to_string()]);

        h.machine.fire_timer(PhaseTimer::NextRound);
        assert_eq!(h.machine.phase(), GamePhase::DealingCards);
    }

    #[test]
    fn test_scenario_last_health_ends_match() {
        let mut h = harness(MatchConfig {
            starting_health: 1,
            ..test_config()
        });
        h.start();
        h.deal_round();
        let (a, b) = (h.a, h.b);

        h.select(a, CardType::Rock);
        h.select(b, CardType::Scissors);

        assert_eq!(h.machine.phase(), GamePhase::GameOver);
        assert_eq!(h.health(), (1, 0));
        assert_eq!(h.recorder.count(|e| *e == Recorded::GameOver(Some(a))), 1);
        assert_eq!(h.texts(), vec!["alice wins the match".to_string()]);

        // No further round
        h.machine.fire_timer(PhaseTimer::NextRound);
        assert_eq!(h.machine.phase(), GamePhase::GameOver);
        assert_eq!(
            h.recorder
                .count(|e| matches!(e, Recorded::Phase(_, GamePhase::DealingCards))),
            1
        );
    }

    #[test]
    fn test_double_forfeit_draws_match() {
        let mut h = harness(MatchConfig {
            starting_health: 1,
            ..test_config()
        });
        h.start();
        h.deal_round();
        h.machine.fire_timer(PhaseTimer::SelectionTimeout);

        assert_eq!(h.machine.phase(), GamePhase::GameOver);
        assert_eq!(h.health(), (0, 0));
        assert_eq!(h.recorder.count(|e| *e == Recorded::GameOver(None)), 1);
        assert_eq!(h.texts(), vec!["Match drawn".to_string()]);
    }

    #[test]
    fn test_reset_then_teardown() {
        let mut h = harness(MatchConfig {
            starting_health: 1,
            ..test_config()
        });
        h.start();
        h.deal_round();
        let (a, b) = (h.a, h.b);
        h.select(a, CardType::Scissors);
        h.select(b, CardType::Paper);
        assert_eq!(h.machine.pending_timer(), Some(PhaseTimer::MatchReset));

        h.machine.fire_timer(PhaseTimer::MatchReset);
        assert_eq!(h.machine.phase(), GamePhase::WaitingForPlayers);
        assert_eq!(h.health(), (1, 1));
        assert_eq!(h.recorder.count(|e| *e == Recorded::Reset), 1);
        assert!(!h.machine.summary().accepting);
        assert_eq!(h.machine.join(None, "late".into()), Err(JoinError::MatchClosing));

        // Closing matches do not deal again
        h.machine.poll_players();
        assert_eq!(h.machine.phase(), GamePhase::WaitingForPlayers);

        h.machine.fire_timer(PhaseTimer::Teardown);
        assert!(h.machine.is_finished());
        assert_eq!(h.recorder.count(|e| *e == Recorded::Closed), 1);
    }

    #[test]
    fn test_no_reset_when_disabled() {
        let mut h = harness(MatchConfig {
            starting_health: 1,
            reset_after_game_over: false,
            ..test_config()
        });
        h.start();
        h.deal_round();
        h.machine.fire_timer(PhaseTimer::SelectionTimeout);
        assert_eq!(h.machine.phase(), GamePhase::GameOver);
        assert_eq!(h.machine.pending_timer(), None);
    }

    #[test]
    fn test_health_is_replicated() {
        let mut h = harness(test_config());
        h.start();
        h.deal_round();
        let (a, b) = (h.a, h.b);
        h.drain();

        h.select(a, CardType::Paper);
        h.select(b, CardType::Rock);

        let changes: Vec<ReplicatedValue> = h
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ServerMsg::ValueChanged {
                    value: value @ ReplicatedValue::PlayerHealth(_),
                } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![ReplicatedValue::PlayerHealth(PlayerHealth {
                player_id: b,
                health: 2
            })]
        );
    }

    #[test]
    fn test_snapshot_forgets_last_rounds_selections() {
        let mut h = harness(test_config());
        h.start();
        h.deal_round();
        let (a, b) = (h.a, h.b);
        h.select(a, CardType::Rock);
        h.select(b, CardType::Scissors);
        assert_eq!(h.machine.snapshot().selected.len(), 2);

        h.machine.fire_timer(PhaseTimer::NextRound);
        let snapshot = h.machine.snapshot();
        assert_eq!(snapshot.phase, GamePhase::DealingCards);
        assert_eq!(snapshot.round, 2);
        assert!(snapshot.selected.is_empty());
    }

    #[test]
    fn test_input_outside_window_is_ignored() {
        let mut h = harness(test_config());
        h.start();
        let a = h.a;
        let card_id = h.card(a, CardType::Rock);

        h.machine
            .handle_client(a, ClientMsg::SelectCard { card_id });
        assert!(h.machine.snapshot().selected.is_empty());
        assert_eq!(h.machine.phase(), GamePhase::DealingCards);
    }

    #[test]
    fn test_reveal_only_own_cards() {
        let mut h = harness(test_config());
        h.start();
        let (a, b) = (h.a, h.b);
        let card_id = h.card(a, CardType::Rock);

        h.machine.handle_client(b, ClientMsg::RevealCard { card_id });
        assert!(!h.machine.cards().get(card_id).unwrap().is_face_up());

        h.machine.handle_client(a, ClientMsg::RevealCard { card_id });
        assert!(h.machine.cards().get(card_id).unwrap().is_face_up());
    }

    #[test]
    fn test_leave_mid_deal_does_not_stall() {
        let mut h = harness(test_config());
        h.start();
        let (a, b) = (h.a, h.b);

        h.ack_from(a);
        h.machine.leave(b, "disconnected");
        assert_eq!(h.machine.phase(), GamePhase::PlayerSelection);

        // Remaining player picks, the departed one forfeits
        h.select(a, CardType::Rock);
        assert_eq!(h.machine.phase(), GamePhase::Resolution);
        assert_eq!(h.health(), (3, 2));

        // Next round waits for the opponent to come back
        h.machine.fire_timer(PhaseTimer::NextRound);
        assert_eq!(h.machine.phase(), GamePhase::WaitingForPlayers);

        let claim = SeatClaim {
            player_id: b,
            rejoin_token: h.b_token,
        };
        let rejoined = h.machine.join(Some(claim), "bob".into()).unwrap();
        assert_eq!(rejoined.player.player_id, b);
        assert_eq!(rejoined.player.slot, 1);
        assert_eq!(rejoined.player.health, 2);
        assert_eq!(rejoined.rejoin_token, h.b_token);
        h.machine.poll_players();
        assert_eq!(h.machine.phase(), GamePhase::DealingCards);
        assert_eq!(h.machine.round(), 2);
    }

    #[test]
    fn test_leave_mid_selection_closes_window() {
        let mut h = harness(test_config());
        h.start();
        h.deal_round();
        let (a, b) = (h.a, h.b);

        h.select(a, CardType::Scissors);
        h.machine.handle_client(b, ClientMsg::LeaveMatch);

        assert_eq!(h.machine.phase(), GamePhase::Resolution);
        assert_eq!(h.health(), (3, 2));
        assert!(!h.machine.is_finished());
    }

    #[test]
    fn test_slot_freed_before_start() {
        let mut h = harness(test_config());
        let b = h.b;
        h.machine.leave(b, "disconnected");
        assert_eq!(h.machine.summary().open_slots, 1);

        let carol = h.machine.join(None, "carol".into()).unwrap();
        assert_eq!(carol.player.slot, 1);
        assert_ne!(carol.player.player_id, b);
    }

    #[test]
    fn test_everyone_leaving_finishes_match() {
        let mut h = harness(test_config());
        h.start();
        let (a, b) = (h.a, h.b);
        h.machine.leave(a, "disconnected");
        assert!(!h.machine.is_finished());
        h.machine.leave(b, "disconnected");
        assert!(h.machine.is_finished());
    }

    #[test]
    fn test_unknown_player_input_ignored() {
        let mut h = harness(test_config());
        h.start();
        h.machine
            .handle_client(Uuid::new_v4(), ClientMsg::SpawnAck { entity_id: 1 });
        assert_eq!(h.machine.phase(), GamePhase::DealingCards);
    }

    #[test]
    fn test_stale_timer_has_no_effect() {
        let mut h = harness(test_config());
        h.start();
        h.machine.fire_timer(PhaseTimer::SelectionTimeout);
        h.machine.fire_timer(PhaseTimer::NextRound);
        assert_eq!(h.machine.phase(), GamePhase::DealingCards);
        assert_eq!(h.machine.pending_timer(), Some(PhaseTimer::DealAck));
    }

    async fn join(handle: &MatchHandle, name: &str) -> PlayerInfo {
        let (reply, rx) = oneshot::channel();
        handle
            .input_tx
            .send(MatchInput::Join {
                claim: None,
                display_name: name.to_string(),
                reply,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap().player
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattended_match_runs_to_draw() {
        let config = MatchConfig {
            starting_health: 1,
            reset_after_game_over: false,
            ..test_config()
        };
        let (game_match, handle) = GameMatch::new(Uuid::new_v4(), config, 3);
        let mut outbound = handle.subscribe();
        tokio::spawn(game_match.run());

        join(&handle, "alice").await;
        join(&handle, "bob").await;

        // Nobody acknowledges or selects: both timers expire and both forfeit
        let winner = tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                match outbound.recv().await {
                    Ok(Outbound {
                        msg: ServerMsg::GameOver { winner },
                        ..
                    }) => return winner,
                    Ok(_) => {}
                    Err(err) => panic!("outbound closed: {}", err),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(winner, None);
        assert_eq!(handle.summary().phase, GamePhase::GameOver);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_task_ends_when_everyone_leaves() {
        let (game_match, handle) = GameMatch::new(Uuid::new_v4(), test_config(), 3);
        let task = tokio::spawn(game_match.run());

        let alice = join(&handle, "alice").await;
        assert_eq!(handle.player_count(), 1);

        handle
            .input_tx
            .send(MatchInput::Disconnected {
                player_id: alice.player_id,
            })
            .await
            .unwrap();

        let joined = tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(5), task).await);
        tokio_test::assert_ok!(joined);
        assert!(!handle.is_joinable());
    }

    #[test]
    fn test_registry_finds_joinable_match() {
        let registry = MatchRegistry::new();
        let (_open, open_handle) = GameMatch::new(Uuid::new_v4(), test_config(), 1);
        registry.insert(open_handle.clone());

        assert_eq!(registry.active_matches(), 1);
        assert_eq!(registry.find_available_match().map(|h| h.id), Some(open_handle.id));
        assert_eq!(registry.lobbies().len(), 1);

        open_handle.summary.write().accepting = false;
        assert!(registry.find_available_match().is_none());
        assert!(registry.lobbies().is_empty());
    }
}
