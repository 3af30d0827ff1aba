//! Tracking which spawned entities are present on every side

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::EntityId;

/// Outstanding spawn acknowledgements, per entity
#[derive(Debug, Default)]
pub struct SpawnTracker {
    pending: HashMap<EntityId, HashSet<Uuid>>,
}

impl SpawnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for every peer in `peers` to acknowledge `id`
    pub fn track(&mut self, id: EntityId, peers: impl IntoIterator<Item = Uuid>) {
        let peers: HashSet<Uuid> = peers.into_iter().collect();
        if !peers.is_empty() {
            self.pending.insert(id, peers);
        }
    }

    /// Record an acknowledgement. Returns true only for the ack that made the
    /// entity visible everywhere; repeated or unknown acks return false.
    pub fn acknowledge(&mut self, peer: Uuid, id: EntityId) -> bool {
        let Some(waiting) = self.pending.get_mut(&id) else {
            return false;
        };
        if !waiting.remove(&peer) {
            return false;
        }
        if waiting.is_empty() {
            self.pending.remove(&id);
            return true;
        }
        false
    }

    /// Stop waiting on a departed peer. Returns the entities that became visible.
    pub fn drop_peer(&mut self, peer: Uuid) -> Vec<EntityId> {
        let mut visible = Vec::new();
        self.pending.retain(|id, waiting| {
            if waiting.remove(&peer) && waiting.is_empty() {
                visible.push(*id);
                return false;
            }
            true
        });
        visible.sort_unstable();
        visible
    }

    /// True unless the entity still waits for some acknowledgement
    pub fn is_visible(&self, id: EntityId) -> bool {
        !self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
