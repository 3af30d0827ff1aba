//! Selection collector - one card per player inside a bounded window

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::replication::{EntityId, ReplicationChannel};

use super::card::CardRegistry;

/// Chosen card per player
pub type Selections = BTreeMap<Uuid, EntityId>;

/// Why a submission was ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    WindowClosed,
    NotParticipant,
    AlreadySelected,
    CardClaimed,
    UnknownCard,
    NotOwner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Recorded. Carries the final result when this submission closed the window.
    Accepted(Option<SelectionResult>),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AllSelected,
    Timeout,
}

/// What a closed window hands to resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionResult {
    pub selections: Selections,
    /// Everyone the window was opened for, including players who left since
    pub participants: Vec<Uuid>,
    pub reason: Option<CloseReason>,
}

impl SelectionResult {
    /// Participants without a recorded selection
    pub fn non_responders(&self) -> Vec<Uuid> {
        self.participants
            .iter()
            .filter(|p| !self.selections.contains_key(p))
            .copied()
            .collect()
    }
}

/// Authoritative collector. All submissions go through `&mut self`, so each
/// accept decision is a single test-and-set against the current window.
#[derive(Debug, Default)]
pub struct SelectionCollector {
    open: bool,
    participants: Vec<Uuid>,
    /// Participants still counted towards completion
    awaiting: HashSet<Uuid>,
    selections: Selections,
    /// card -> player that claimed it
    claimed: HashMap<EntityId, Uuid>,
    cards: Vec<EntityId>,
}

impl SelectionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear previous selections, make every card of every participant's
    /// hand interactable and start accepting submissions.
    pub fn open(
        &mut self,
        participants: &[Uuid],
        registry: &mut CardRegistry,
        channel: &dyn ReplicationChannel,
    ) {
        self.selections.clear();
        self.claimed.clear();
        self.participants = participants.to_vec();
        self.awaiting = participants.iter().copied().collect();
        self.cards = participants
            .iter()
            .flat_map(|p| registry.hand(*p).to_vec())
            .collect();

        for &id in &self.cards {
            if let Some(view) = registry.set_interactable(id, true) {
                channel.update_entity(view);
            }
        }
        self.open = true;
        info!(
            participants = participants.len(),
            cards = self.cards.len(),
            "Selection window opened"
        );
    }

    /// Evaluate one submission. Invalid input is rejected without any state change.
    pub fn submit(
        &mut self,
        player_id: Uuid,
        card_id: EntityId,
        registry: &mut CardRegistry,
        channel: &dyn ReplicationChannel,
    ) -> SubmitOutcome {
        if let Err(reason) = self.check(player_id, card_id, registry) {
            warn!(player_id = %player_id, card_id, ?reason, "Selection rejected");
            return SubmitOutcome::Rejected(reason);
        }

        self.selections.insert(player_id, card_id);
        self.claimed.insert(card_id, player_id);
        debug!(player_id = %player_id, card_id, "Selection accepted");

        if let Some(view) = registry.reveal(card_id) {
            channel.update_entity(view);
        }

        if self.all_selected() {
            info!("All players selected");
            return SubmitOutcome::Accepted(Some(self.close(CloseReason::AllSelected, registry, channel)));
        }
        SubmitOutcome::Accepted(None)
    }

    /// Stop counting a departed player. Returns the result if this closed the window.
    pub fn exclude_player(
        &mut self,
        player_id: Uuid,
        registry: &mut CardRegistry,
        channel: &dyn ReplicationChannel,
    ) -> Option<SelectionResult> {
        if !self.open || !self.awaiting.remove(&player_id) {
            return None;
        }
        info!(player_id = %player_id, "Player excluded from selection");
        if self.all_selected() {
            return Some(self.close(CloseReason::AllSelected, registry, channel));
        }
        None
    }

    /// Force the window shut with whatever was gathered.
    /// Returns `None` if the window already closed.
    pub fn timeout(
        &mut self,
        registry: &mut CardRegistry,
        channel: &dyn ReplicationChannel,
    ) -> Option<SelectionResult> {
        if !self.open {
            return None;
        }
        warn!(
            selected = self.selections.len(),
            participants = self.participants.len(),
            "Selection time expired"
        );
        Some(self.close(CloseReason::Timeout, registry, channel))
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn selections(&self) -> &Selections {
        &self.selections
    }

    fn check(&self, player_id: Uuid, card_id: EntityId, registry: &CardRegistry) -> Result<(), RejectReason> {
        if !self.open {
            return Err(RejectReason::WindowClosed);
        }
        if !self.participants.contains(&player_id) {
            return Err(RejectReason::NotParticipant);
        }
        if self.selections.contains_key(&player_id) {
            return Err(RejectReason::AlreadySelected);
        }
        if self.claimed.contains_key(&card_id) {
            return Err(RejectReason::CardClaimed);
        }
        match registry.owner_of(card_id) {
            None => Err(RejectReason::UnknownCard),
            Some(owner) if owner != player_id => Err(RejectReason::NotOwner),
            Some(_) => Ok(()),
        }
    }

    fn all_selected(&self) -> bool {
        self.awaiting.iter().all(|p| self.selections.contains_key(p))
    }

    /// Flags go off in the same step the window closes
    fn close(
        &mut self,
        reason: CloseReason,
        registry: &mut CardRegistry,
        channel: &dyn ReplicationChannel,
    ) -> SelectionResult {
        self.open = false;
        for &id in &self.cards {
            if let Some(view) = registry.set_interactable(id, false) {
                channel.update_entity(view);
            }
        }
        info!(?reason, selected = self.selections.len(), "Selection window closed");
        SelectionResult {
            selections: self.selections.clone(),
            participants: self.participants.clone(),
            reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::card::Card;
    use crate::replication::BroadcastReplication;
    use crate::ws::protocol::CardType;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Round {
        collector: SelectionCollector,
        registry: CardRegistry,
        channel: BroadcastReplication,
        a: Uuid,
        b: Uuid,
    }

    impl Round {
        /// Two players with three cards each: a owns 1..=3, b owns 4..=6
        fn new() -> Self {
            let a = Uuid::new_v4();
            let b = Uuid::new_v4();
            let mut registry = CardRegistry::new();
            for i in 0..3 {
                registry.insert(Card::new(1 + i as u64, CardType::from_index(i), a));
                registry.insert(Card::new(4 + i as u64, CardType::from_index(i), b));
            }
            Self {
                collector: SelectionCollector::new(),
                registry,
                channel: BroadcastReplication::new(64),
                a,
                b,
            }
        }

        fn open(&mut self) {
            let players = [self.a, self.b];
            self.collector.open(&players, &mut self.registry, &self.channel);
        }

        fn submit(&mut self, player: Uuid, card: EntityId) -> SubmitOutcome {
            self.collector.submit(player, card, &mut self.registry, &self.channel)
        }
    }

    #[test]
    fn test_open_makes_hands_interactable() {
        let mut round = Round::new();
        round.open();
        assert!(round.registry.views().iter().all(|c| c.interactable));
    }

    #[test]
    fn test_rejected_before_open() {
        let mut round = Round::new();
        let a = round.a;
        assert_eq!(round.submit(a, 1), SubmitOutcome::Rejected(RejectReason::WindowClosed));
    }

    #[test]
    fn test_full_collection_closes_window() {
        let mut round = Round::new();
        round.open();
        let (a, b) = (round.a, round.b);

        assert_eq!(round.submit(a, 1), SubmitOutcome::Accepted(None));
        let result = match round.submit(b, 6) {
            SubmitOutcome::Accepted(Some(result)) => result,
            other => panic!("expected closing accept, got {:?}", other),
        };

        assert_eq!(result.reason, Some(CloseReason::AllSelected));
        assert_eq!(result.selections.get(&a), Some(&1));
        assert_eq!(result.selections.get(&b), Some(&6));
        assert!(!round.collector.is_open());
        assert!(round.registry.views().iter().all(|c| !c.interactable));
    }

    #[test]
    fn test_accepted_card_is_revealed() {
        let mut round = Round::new();
        round.open();
        let a = round.a;
        round.submit(a, 2);
        assert!(round.registry.get(2).unwrap().is_face_up());
        assert!(!round.registry.get(1).unwrap().is_face_up());
    }

    #[test]
    fn test_duplicate_submission_is_idempotent() {
        let mut round = Round::new();
        round.open();
        let a = round.a;

        assert_eq!(round.submit(a, 1), SubmitOutcome::Accepted(None));
        assert_eq!(round.submit(a, 1), SubmitOutcome::Rejected(RejectReason::AlreadySelected));
        assert_eq!(round.submit(a, 2), SubmitOutcome::Rejected(RejectReason::AlreadySelected));
        assert_eq!(round.collector.selections().len(), 1);
        assert_eq!(round.collector.selections().get(&a), Some(&1));
    }

    #[test]
    fn test_claimed_card_rejected_for_other_player() {
        let mut round = Round::new();
        round.open();
        let (a, b) = (round.a, round.b);

        round.submit(a, 1);
        assert_eq!(round.submit(b, 1), SubmitOutcome::Rejected(RejectReason::CardClaimed));
    }

    #[test]
    fn test_foreign_and_unknown_cards_rejected() {
        let mut round = Round::new();
        round.open();
        let b = round.b;

        assert_eq!(round.submit(b, 1), SubmitOutcome::Rejected(RejectReason::NotOwner));
        assert_eq!(round.submit(b, 42), SubmitOutcome::Rejected(RejectReason::UnknownCard));
        assert_eq!(
            round.submit(Uuid::new_v4(), 4),
            SubmitOutcome::Rejected(RejectReason::NotParticipant)
        );
        assert!(round.collector.selections().is_empty());
    }

    #[test]
    fn test_timeout_emits_partial_selection() {
        let mut round = Round::new();
        round.open();
        let (a, b) = (round.a, round.b);
        round.submit(a, 3);

        let result = round
            .collector
            .timeout(&mut round.registry, &round.channel)
            .unwrap();
        assert_eq!(result.reason, Some(CloseReason::Timeout));
        assert_eq!(result.selections.len(), 1);
        assert_eq!(result.non_responders(), vec![b]);
        assert!(round.registry.views().iter().all(|c| !c.interactable));

        // Late input and a second timeout have no effect
        assert_eq!(round.submit(b, 4), SubmitOutcome::Rejected(RejectReason::WindowClosed));
        assert!(round.collector.timeout(&mut round.registry, &round.channel).is_none());
    }

    #[test]
    fn test_departed_player_excluded_from_completion() {
        let mut round = Round::new();
        round.open();
        let (a, b) = (round.a, round.b);
        round.submit(a, 1);

        let result = round
            .collector
            .exclude_player(b, &mut round.registry, &round.channel)
            .unwrap();
        assert_eq!(result.selections.len(), 1);
        assert_eq!(result.participants, vec![a, b]);
        assert_eq!(result.non_responders(), vec![b]);
    }

    #[test]
    fn test_reopen_clears_previous_round() {
        let mut round = Round::new();
        round.open();
        let (a, b) = (round.a, round.b);
        round.submit(a, 1);
        round.submit(b, 4);

        round.open();
        assert!(round.collector.selections().is_empty());
        assert_eq!(round.submit(a, 1), SubmitOutcome::Accepted(None));
    }

    #[test]
    fn test_concurrent_submissions_accept_exactly_one_per_card() {
        let round = Arc::new(Mutex::new(Round::new()));
        round.lock().open();
        let (a, b) = {
            let r = round.lock();
            (r.a, r.b)
        };

        // Both players race for card 1 (owned by a) many times over
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let round = round.clone();
                let player = if i % 2 == 0 { a } else { b };
                std::thread::spawn(move || round.lock().submit(player, 1))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, SubmitOutcome::Accepted(_)))
            .count();

        assert_eq!(accepted, 1);
        let r = round.lock();
        assert_eq!(r.collector.selections().len(), 1);
        assert_eq!(r.collector.selections().get(&a), Some(&1));
    }
}
