//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::replication::EntityId;

/// Card types dealt into hands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Rock,
    Paper,
    Scissors,
}

/// Match lifecycle phase (replicated as a single authoritative value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    /// Waiting for both player slots to be connected
    WaitingForPlayers,
    /// Hands are being spawned and acknowledged
    DealingCards,
    /// Selection window is open
    PlayerSelection,
    /// Round outcome is being applied
    Resolution,
    /// One side ran out of health
    GameOver,
}

impl Default for GamePhase {
    fn default() -> Self {
        Self::WaitingForPlayers
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Pick a card from the own hand during the selection window
    SelectCard { card_id: EntityId },

    /// Flip an owned card face up
    RevealCard { card_id: EntityId },

    /// Confirm that a replicated entity now exists on this side
    SpawnAck { entity_id: EntityId },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave current match
    LeaveMatch,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection. Only the seat holder receives
    /// `rejoin_token`; it is needed to take the seat back after a disconnect.
    Welcome {
        player_id: Uuid,
        rejoin_token: Uuid,
        server_time: u64,
    },

    /// Confirmation of match join, carries the full state for catching up
    MatchJoined {
        match_id: Uuid,
        snapshot: MatchSnapshot,
    },

    /// Player took a slot (or came back to it)
    PlayerJoined { player: PlayerInfo },

    /// Player left the match
    PlayerLeft { player_id: Uuid, reason: String },

    /// An authoritative value changed
    ValueChanged { value: ReplicatedValue },

    /// Phase transition, for presentation only
    PhaseChanged {
        previous: GamePhase,
        next: GamePhase,
    },

    /// Card entity created (ownership already assigned)
    CardSpawned { card: CardView },

    /// Card visibility or interactability changed
    CardUpdated { card: CardView },

    /// Card entity destroyed
    CardDestroyed { card_id: EntityId },

    /// Every hand is present on every side
    DealingComplete,

    /// Selection window opened
    SelectionOpened {
        /// Window length in milliseconds
        timeout_ms: u64,
    },

    /// Selection window closed
    SelectionComplete { selections: Vec<SelectionEntry> },

    /// Round outcome
    RoundResult {
        round: u32,
        /// Winning player, `None` on a tie or when nobody chose
        winner: Option<Uuid>,
        tie: bool,
    },

    /// Health display for both slots
    Health { players: Vec<PlayerHealth> },

    /// Status line for the result widget
    ResultText { text: String },

    /// Match decided
    GameOver {
        /// `None` when both players ran out of health together
        winner: Option<Uuid>,
    },

    /// Match is being reset, clients should return to the lobby
    GameRestart,

    /// Session torn down, the connection will close
    SessionClosed,

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// Authoritative values replicated to every side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", content = "value", rename_all = "snake_case")]
pub enum ReplicatedValue {
    Phase(GamePhase),
    PlayerHealth(PlayerHealth),
    ConnectedPlayers(usize),
}

/// Card as seen by a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardView {
    pub id: EntityId,
    pub owner: Uuid,
    /// Hidden from non-owners until the card is face up
    pub card_type: Option<CardType>,
    pub face_up: bool,
    pub interactable: bool,
}

impl CardView {
    /// Copy of this view with the type hidden if `viewer` may not see it
    pub fn redacted_for(&self, viewer: Uuid) -> CardView {
        if self.owner == viewer || self.face_up {
            self.clone()
        } else {
            CardView {
                card_type: None,
                ..self.clone()
            }
        }
    }
}

/// Player info for lobby/join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub player_id: Uuid,
    pub display_name: String,
    /// 0 = player one, 1 = player two
    pub slot: usize,
    pub health: i32,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerHealth {
    pub player_id: Uuid,
    pub health: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionEntry {
    pub player_id: Uuid,
    pub card_id: EntityId,
}

/// Full read-only view of a match, sent to (re)joining participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub phase: GamePhase,
    pub round: u32,
    pub players: Vec<PlayerInfo>,
    pub cards: Vec<CardView>,
    /// Players that already locked in a card this round
    pub selected: Vec<Uuid>,
}

impl ServerMsg {
    /// Message as it may be shown to `viewer`: card types of hidden cards are stripped
    pub fn redacted_for(&self, viewer: Uuid) -> ServerMsg {
        match self {
            ServerMsg::CardSpawned { card } => ServerMsg::CardSpawned {
                card: card.redacted_for(viewer),
            },
            ServerMsg::CardUpdated { card } => ServerMsg::CardUpdated {
                card: card.redacted_for(viewer),
            },
            ServerMsg::MatchJoined { match_id, snapshot } => ServerMsg::MatchJoined {
                match_id: *match_id,
                snapshot: MatchSnapshot {
                    cards: snapshot
                        .cards
                        .iter()
                        .map(|c| c.redacted_for(viewer))
                        .collect(),
                    ..snapshot.clone()
                },
            },
            other => other.clone(),
        }
    }
}
