//! Matchmaking: seats players into matches

pub mod service;

pub use service::{JoinRequest, MatchmakingService, Session};
