//! Deal coordinator - spawns one hand per player and tracks delivery

use rand::Rng;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::replication::{EntityId, ReplicationChannel, SpawnTracker};
use crate::ws::protocol::CardType;

use super::card::{Card, CardRegistry};
use super::r#match::REQUIRED_PLAYERS;

/// How card types are assigned while dealing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealPolicy {
    /// Uniformly random per card
    Random,
    /// Rock, Paper, Scissors by position in the hand
    Cycle,
}

impl FromStr for DealPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "cycle" => Ok(Self::Cycle),
            other => Err(format!("unknown deal policy '{}'", other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DealError {
    #[error("Need {required} connected players to deal, have {connected}")]
    NotEnoughPlayers { connected: usize, required: usize },

    #[error("Hand size must be at least one card")]
    EmptyHand,
}

/// Allocates hands and raises the completion signal exactly once per deal
#[derive(Debug, Default)]
pub struct DealCoordinator {
    tracker: SpawnTracker,
    /// Players dealt to, in deal order
    players: Vec<Uuid>,
    /// Players counted towards completion (shrinks when someone leaves)
    expected: HashSet<Uuid>,
    /// Players whose whole hand is present everywhere
    dealt: HashSet<Uuid>,
    active: bool,
    completed: bool,
}

impl DealCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destroy last round's cards and deal `hand_size` new cards to every player.
    ///
    /// Ownership is assigned and the card registered in its hand before it is
    /// announced. Nothing is destroyed or spawned when the deal is refused.
    pub fn deal(
        &mut self,
        players: &[Uuid],
        hand_size: usize,
        policy: DealPolicy,
        rng: &mut impl Rng,
        registry: &mut CardRegistry,
        channel: &dyn ReplicationChannel,
    ) -> Result<(), DealError> {
        if players.len() < REQUIRED_PLAYERS {
            return Err(DealError::NotEnoughPlayers {
                connected: players.len(),
                required: REQUIRED_PLAYERS,
            });
        }
        if hand_size == 0 {
            return Err(DealError::EmptyHand);
        }

        for id in registry.clear() {
            channel.destroy_entity(id);
        }
        self.tracker.clear();
        self.players = players.to_vec();
        self.expected = players.iter().copied().collect();
        self.dealt.clear();
        self.active = true;
        self.completed = false;

        for &player_id in players {
            for index in 0..hand_size {
                let card_type = match policy {
                    DealPolicy::Random => CardType::from_index(rng.gen_range(0..CardType::ALL.len())),
                    DealPolicy::Cycle => CardType::from_index(index),
                };

                let card = Card::new(channel.next_entity_id(), card_type, player_id);
                let view = card.view();
                registry.insert(card);
                self.tracker.track(view.id, players.iter().copied());
                channel.spawn_entity(view);
            }
            debug!(player_id = %player_id, hand_size, "Hand spawned");
        }

        info!(
            players = players.len(),
            cards = registry.len(),
            "Dealing started"
        );
        Ok(())
    }

    /// A participant confirmed it holds `entity_id`.
    /// Returns true exactly once, when the whole deal is complete.
    pub fn acknowledge(&mut self, peer: Uuid, entity_id: EntityId, registry: &CardRegistry) -> bool {
        if !self.active || self.completed {
            return false;
        }
        if self.tracker.acknowledge(peer, entity_id) {
            if let Some(owner) = registry.owner_of(entity_id) {
                self.refresh_hand(owner, registry);
            }
        }
        self.try_complete()
    }

    /// Remove a departed player from this deal: their hand no longer counts
    /// and nobody waits for their acknowledgements.
    /// Returns true if this completed the deal.
    pub fn exclude_player(&mut self, player_id: Uuid, registry: &CardRegistry) -> bool {
        if !self.active || self.completed {
            return false;
        }
        if !self.dealt.contains(&player_id) {
            self.expected.remove(&player_id);
        }
        let released = self.tracker.drop_peer(player_id);
        let owners: HashSet<Uuid> = released
            .iter()
            .filter_map(|id| registry.owner_of(*id))
            .collect();
        for owner in owners {
            self.refresh_hand(owner, registry);
        }
        info!(player_id = %player_id, "Player excluded from deal");
        self.try_complete()
    }

    /// Stop waiting for acknowledgements. Returns true if the deal was still pending.
    pub fn force_complete(&mut self) -> bool {
        if !self.active || self.completed {
            return false;
        }
        warn!(
            pending = self.tracker.pending_count(),
            "Spawn acknowledgements timed out, completing deal"
        );
        self.tracker.clear();
        self.dealt.extend(self.expected.iter().copied());
        self.finish()
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Players dealt to in the current deal, in deal order
    pub fn players(&self) -> &[Uuid] {
        &self.players
    }

    #[cfg(test)]
    pub fn dealt_count(&self) -> usize {
        self.dealt.len()
    }

    fn refresh_hand(&mut self, owner: Uuid, registry: &CardRegistry) {
        if self.dealt.contains(&owner) {
            return;
        }
        if registry.hand(owner).iter().all(|id| self.tracker.is_visible(*id)) {
            debug!(player_id = %owner, "Hand present on every side");
            self.dealt.insert(owner);
        }
    }

    fn try_complete(&mut self) -> bool {
        let dealt = self.expected.iter().filter(|p| self.dealt.contains(p)).count();
        if dealt < self.expected.len() {
            return false;
        }
        self.finish()
    }

    fn finish(&mut self) -> bool {
        self.completed = true;
        self.active = false;
        info!(dealt = self.dealt.len(), "Dealing complete");
        true
    }
}
