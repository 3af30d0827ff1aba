//! Read-only views of a match: catch-up snapshots and lobby summaries

use serde::Serialize;
use uuid::Uuid;

use crate::ws::protocol::{GamePhase, MatchSnapshot, PlayerInfo};

use super::card::CardRegistry;
use super::r#match::{Player, REQUIRED_PLAYERS};
use super::selection::Selections;

/// Lobby listing entry, kept current by the match task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub match_id: Uuid,
    pub phase: GamePhase,
    /// Connected players
    pub players: usize,
    pub open_slots: usize,
    /// False once the match is being torn down
    #[serde(skip)]
    pub accepting: bool,
}

impl MatchSummary {
    pub fn empty(match_id: Uuid) -> Self {
        Self {
            match_id,
            phase: GamePhase::WaitingForPlayers,
            players: 0,
            open_slots: REQUIRED_PLAYERS,
            accepting: true,
        }
    }

    pub fn is_joinable(&self) -> bool {
        self.accepting && self.open_slots > 0
    }
}

pub fn player_info(player: &Player) -> PlayerInfo {
    PlayerInfo {
        player_id: player.id,
        display_name: player.display_name.clone(),
        slot: player.slot,
        health: player.health(),
        connected: player.connected,
    }
}

/// Full state for a participant that (re)joins mid-match.
/// Card types are unredacted here; the socket writer redacts per viewer.
pub fn build<'a>(
    phase: GamePhase,
    round: u32,
    players: impl Iterator<Item = &'a Player>,
    cards: &CardRegistry,
    selections: &Selections,
) -> MatchSnapshot {
    // The collector keeps the last window until the next one opens
    let selected = match phase {
        GamePhase::PlayerSelection | GamePhase::Resolution => selections.keys().copied().collect(),
        _ => Vec::new(),
    };

    MatchSnapshot {
        phase,
        round,
        players: players.map(player_info).collect(),
        cards: cards.views(),
        selected,
    }
}
