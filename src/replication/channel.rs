//! Outbound replication over a broadcast queue

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::ws::protocol::{CardView, ReplicatedValue, ServerMsg};

use super::EntityId;

/// A message leaving the authoritative side
///
/// `seq` increases by one per message within a match so receivers can drop
/// duplicates under at-least-once delivery.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    pub seq: u64,
    /// Single recipient, `None` = every participant
    #[serde(skip)]
    pub to: Option<Uuid>,
    pub msg: ServerMsg,
}

impl Outbound {
    /// The envelope as delivered to `viewer`, or `None` if it is addressed to someone else
    pub fn for_viewer(&self, viewer: Uuid) -> Option<Outbound> {
        match self.to {
            Some(to) if to != viewer => None,
            _ => Some(Outbound {
                seq: self.seq,
                to: self.to,
                msg: self.msg.redacted_for(viewer),
            }),
        }
    }
}

/// Primitives the match core consumes from the network layer
pub trait ReplicationChannel: Send + Sync {
    /// Push a new authoritative value to every side
    fn set_value(&self, value: ReplicatedValue);

    /// Fire-and-forget call executed on every side
    fn invoke_on_all(&self, msg: ServerMsg);

    /// Deliver a message to a single participant
    fn send_to(&self, player_id: Uuid, msg: ServerMsg);

    /// Reserve the id of an entity about to be spawned
    ///
    /// Spawning is split in two so the caller can assign ownership before
    /// anything is announced.
    fn next_entity_id(&self) -> EntityId;

    /// Announce an owned entity to every side
    fn spawn_entity(&self, card: CardView);

    /// Push new per-entity state to every side
    fn update_entity(&self, card: CardView);

    fn destroy_entity(&self, id: EntityId);
}

/// [`ReplicationChannel`] backed by a tokio broadcast queue, one per match
pub struct BroadcastReplication {
    tx: broadcast::Sender<Outbound>,
    seq: AtomicU64,
    next_entity: AtomicU64,
}

impl BroadcastReplication {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: AtomicU64::new(0),
            next_entity: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<Outbound> {
        self.tx.clone()
    }

    #[cfg(test)]
    /// Sequence number of the last message published
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    fn publish(&self, to: Option<Uuid>, msg: ServerMsg) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        // No receivers is fine: nobody is watching yet
        if self.tx.send(Outbound { seq, to, msg }).is_err() {
            debug!(seq, "No participants subscribed, message dropped");
        }
    }
}

impl ReplicationChannel for BroadcastReplication {
    fn set_value(&self, value: ReplicatedValue) {
        self.publish(None, ServerMsg::ValueChanged { value });
    }

    fn invoke_on_all(&self, msg: ServerMsg) {
        self.publish(None, msg);
    }

    fn send_to(&self, player_id: Uuid, msg: ServerMsg) {
        self.publish(Some(player_id), msg);
    }

    fn next_entity_id(&self) -> EntityId {
        self.next_entity.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_entity(&self, card: CardView) {
        self.publish(None, ServerMsg::CardSpawned { card });
    }

    fn update_entity(&self, card: CardView) {
        self.publish(None, ServerMsg::CardUpdated { card });
    }

    fn destroy_entity(&self, id: EntityId) {
        self.publish(None, ServerMsg::CardDestroyed { card_id: id });
    }
}
