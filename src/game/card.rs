//! Card registry - dealt cards and the hands that own them

use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::replication::EntityId;
use crate::ws::protocol::{CardType, CardView};

impl CardType {
    pub const ALL: [CardType; 3] = [CardType::Rock, CardType::Paper, CardType::Scissors];

    /// Cycling assignment: Rock, Paper, Scissors, Rock, ...
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }

    /// Rock beats Scissors, Scissors beats Paper, Paper beats Rock
    pub fn beats(self, other: CardType) -> bool {
        matches!(
            (self, other),
            (CardType::Rock, CardType::Scissors)
                | (CardType::Scissors, CardType::Paper)
                | (CardType::Paper, CardType::Rock)
        )
    }
}

/// A dealt card (authoritative)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub id: EntityId,
    pub card_type: CardType,
    pub owner: Uuid,
    face_up: bool,
    interactable: bool,
}

impl Card {
    pub fn new(id: EntityId, card_type: CardType, owner: Uuid) -> Self {
        Self {
            id,
            card_type,
            owner,
            face_up: false,
            interactable: false,
        }
    }

    #[cfg(test)]
    pub fn is_face_up(&self) -> bool {
        self.face_up
    }

    #[cfg(test)]
    pub fn is_interactable(&self) -> bool {
        self.interactable
    }

    /// Unredacted view; redaction happens per recipient at the edge
    pub fn view(&self) -> CardView {
        CardView {
            id: self.id,
            owner: self.owner,
            card_type: Some(self.card_type),
            face_up: self.face_up,
            interactable: self.interactable,
        }
    }
}

/// All cards of the current round, indexed by id and by owning hand
#[derive(Debug, Default)]
pub struct CardRegistry {
    cards: BTreeMap<EntityId, Card>,
    hands: HashMap<Uuid, Vec<EntityId>>,
}

impl CardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a card in its owner's hand
    pub fn insert(&mut self, card: Card) {
        self.hands.entry(card.owner).or_default().push(card.id);
        self.cards.insert(card.id, card);
    }

    pub fn get(&self, id: EntityId) -> Option<&Card> {
        self.cards.get(&id)
    }

    pub fn card_type_of(&self, id: EntityId) -> Option<CardType> {
        self.cards.get(&id).map(|c| c.card_type)
    }

    pub fn owner_of(&self, id: EntityId) -> Option<Uuid> {
        self.cards.get(&id).map(|c| c.owner)
    }

    /// Card ids of a player's hand, in deal order
    pub fn hand(&self, player_id: Uuid) -> &[EntityId] {
        self.hands.get(&player_id).map(Vec::as_slice).unwrap_or(&[])
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<EntityId> {
        self.cards.keys().copied().collect()
    }

    pub fn views(&self) -> Vec<CardView> {
        self.cards.values().map(Card::view).collect()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Remove every card and hand. Returns the removed ids in ascending order.
    pub fn clear(&mut self) -> Vec<EntityId> {
        self.hands.clear();
        std::mem::take(&mut self.cards).into_keys().collect()
    }

    /// Turn a card face up. Returns the new view if anything changed.
    pub fn reveal(&mut self, id: EntityId) -> Option<CardView> {
        let card = self.cards.get_mut(&id)?;
        if card.face_up {
            return None;
        }
        card.face_up = true;
        Some(card.view())
    }

    /// Only the selection collector toggles interactability
    pub(super) fn set_interactable(&mut self, id: EntityId, interactable: bool) -> Option<CardView> {
        let card = self.cards.get_mut(&id)?;
        if card.interactable == interactable {
            return None;
        }
        card.interactable = interactable;
        Some(card.view())
    }
}
