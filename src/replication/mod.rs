//! Replication channel - the authoritative side's only way to reach participants
//!
//! Values are set on the authoritative side and pushed to every side, remote calls
//! are fire-and-forget broadcasts, and entities are announced once they are owned.
//! Transport details live behind [`ReplicationChannel`].

pub mod channel;
pub mod spawn;
pub mod value;

pub use channel::{BroadcastReplication, Outbound, ReplicationChannel};
pub use spawn::SpawnTracker;
pub use value::Replicated;

/// Identity of a replicated entity, unique per spawn within one channel
pub type EntityId = u64;
