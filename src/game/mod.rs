//! Authoritative match modules

pub mod card;
pub mod deal;
pub mod events;
pub mod r#match;
pub mod resolution;
pub mod selection;
pub mod snapshot;

pub use deal::DealPolicy;
pub use r#match::{GameMatch, JoinError, MatchConfig, MatchHandle, MatchRegistry, Seat, SeatClaim};
pub use resolution::IncompleteSelectionPolicy;
pub use snapshot::MatchSummary;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::ws::protocol::ClientMsg;

/// Everything the match task consumes, in arrival order
#[derive(Debug)]
pub enum MatchInput {
    /// Take a slot, or reclaim the seat named by `claim`
    Join {
        claim: Option<SeatClaim>,
        display_name: String,
        reply: oneshot::Sender<Result<Seat, JoinError>>,
    },
    /// Message received from a participant's socket
    Client {
        player_id: Uuid,
        msg: ClientMsg,
        received_at: u64,
    },
    /// The participant's socket closed
    Disconnected { player_id: Uuid },
}
