//! Resolution engine - rock/paper/scissors precedence over one selection per player

use std::str::FromStr;
use uuid::Uuid;

use crate::replication::EntityId;
use crate::ws::protocol::CardType;

use super::selection::Selections;

/// Outcome of one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Winner(Uuid),
    Tie,
    /// Fewer than two usable selections
    Indeterminate,
}

/// What the state machine does with an indeterminate round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteSelectionPolicy {
    /// Every participant without a selection loses one health
    Forfeit,
    /// Nobody loses health, the next round starts
    Skip,
}

impl FromStr for IncompleteSelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forfeit" => Ok(Self::Forfeit),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown incomplete selection policy '{}'", other)),
        }
    }
}

/// Compare two card types: `Some(true)` if `a` wins, `Some(false)` if `b` wins, `None` on a tie
pub fn duel(a: CardType, b: CardType) -> Option<bool> {
    if a == b {
        None
    } else {
        Some(a.beats(b))
    }
}

/// Resolve a round. Requires exactly two players with a selection whose card type is known.
pub fn resolve(
    selections: &Selections,
    card_type_of: impl Fn(EntityId) -> Option<CardType>,
) -> Outcome {
    if selections.len() != 2 {
        return Outcome::Indeterminate;
    }

    let mut picks = selections.iter();
    let (Some((&p1, &c1)), Some((&p2, &c2))) = (picks.next(), picks.next()) else {
        return Outcome::Indeterminate;
    };
    let (Some(t1), Some(t2)) = (card_type_of(c1), card_type_of(c2)) else {
        return Outcome::Indeterminate;
    };

    match duel(t1, t2) {
        None => Outcome::Tie,
        Some(true) => Outcome::Winner(p1),
        Some(false) => Outcome::Winner(p2),
    }
}
