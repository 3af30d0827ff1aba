//! Match event registry - observers scoped to one match instance

use std::sync::Arc;
use uuid::Uuid;

use crate::replication::ReplicationChannel;
use crate::ws::protocol::{GamePhase, PlayerHealth, SelectionEntry, ServerMsg};

use super::resolution::Outcome;
use super::selection::Selections;

/// Callbacks raised by the state machine. All default to no-ops.
pub trait MatchObserver: Send + Sync {
    fn on_phase_changed(&self, _previous: GamePhase, _next: GamePhase) {}

    fn on_dealing_complete(&self) {}

    fn on_selection_opened(&self, _timeout_ms: u64) {}

    fn on_selection_complete(&self, _selections: &Selections) {}

    /// Round outcome as computed by resolution; `winner` is who gets credit
    /// after the incomplete-selection policy was applied.
    fn on_winner_selected(&self, _round: u32, _outcome: Outcome, _winner: Option<Uuid>) {}

    /// Health of slot one and slot two
    fn show_health(&self, _players: &[PlayerHealth]) {}

    fn show_result_text(&self, _text: &str) {}

    fn on_game_over(&self, _winner: Option<Uuid>) {}

    fn on_match_reset(&self) {}

    fn on_session_closed(&self) {}
}

/// Observers of one match, passed by reference to whoever raises events
#[derive(Clone, Default)]
pub struct MatchEvents {
    observers: Vec<Arc<dyn MatchObserver>>,
}

impl MatchEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn MatchObserver>) {
        self.observers.push(observer);
    }

    pub fn phase_changed(&self, previous: GamePhase, next: GamePhase) {
        self.observers.iter().for_each(|o| o.on_phase_changed(previous, next));
    }

    pub fn dealing_complete(&self) {
        self.observers.iter().for_each(|o| o.on_dealing_complete());
    }

    pub fn selection_opened(&self, timeout_ms: u64) {
        self.observers.iter().for_each(|o| o.on_selection_opened(timeout_ms));
    }

    pub fn selection_complete(&self, selections: &Selections) {
        self.observers.iter().for_each(|o| o.on_selection_complete(selections));
    }

    pub fn winner_selected(&self, round: u32, outcome: Outcome, winner: Option<Uuid>) {
        self.observers
            .iter()
            .for_each(|o| o.on_winner_selected(round, outcome, winner));
    }

    pub fn show_health(&self, players: &[PlayerHealth]) {
        self.observers.iter().for_each(|o| o.show_health(players));
    }

    pub fn show_result_text(&self, text: &str) {
        self.observers.iter().for_each(|o| o.show_result_text(text));
    }

    pub fn game_over(&self, winner: Option<Uuid>) {
        self.observers.iter().for_each(|o| o.on_game_over(winner));
    }

    pub fn match_reset(&self) {
        self.observers.iter().for_each(|o| o.on_match_reset());
    }

    pub fn session_closed(&self) {
        self.observers.iter().for_each(|o| o.on_session_closed());
    }
}

/// Forwards match events to every participant as remote calls
pub struct ReplicationObserver {
    channel: Arc<dyn ReplicationChannel>,
}

impl ReplicationObserver {
    pub fn new(channel: Arc<dyn ReplicationChannel>) -> Self {
        Self { channel }
    }
}

impl MatchObserver for ReplicationObserver {
    fn on_phase_changed(&self, previous: GamePhase, next: GamePhase) {
        self.channel
            .invoke_on_all(ServerMsg::PhaseChanged { previous, next });
    }

    fn on_dealing_complete(&self) {
        self.channel.invoke_on_all(ServerMsg::DealingComplete);
    }

    fn on_selection_opened(&self, timeout_ms: u64) {
        self.channel
            .invoke_on_all(ServerMsg::SelectionOpened { timeout_ms });
    }

    fn on_selection_complete(&self, selections: &Selections) {
        let selections = selections
            .iter()
            .map(|(&player_id, &card_id)| SelectionEntry { player_id, card_id })
            .collect();
        self.channel
            .invoke_on_all(ServerMsg::SelectionComplete { selections });
    }

    fn on_winner_selected(&self, round: u32, outcome: Outcome, winner: Option<Uuid>) {
        self.channel.invoke_on_all(ServerMsg::RoundResult {
            round,
            winner,
            tie: outcome == Outcome::Tie,
        });
    }

    fn show_health(&self, players: &[PlayerHealth]) {
        self.channel.invoke_on_all(ServerMsg::Health {
            players: players.to_vec(),
        });
    }

    fn show_result_text(&self, text: &str) {
        self.channel.invoke_on_all(ServerMsg::ResultText {
            text: text.to_string(),
        });
    }

    fn on_game_over(&self, winner: Option<Uuid>) {
        self.channel.invoke_on_all(ServerMsg::GameOver { winner });
    }

    fn on_match_reset(&self) {
        self.channel.invoke_on_all(ServerMsg::GameRestart);
    }

    fn on_session_closed(&self) {
        self.channel.invoke_on_all(ServerMsg::SessionClosed);
    }
}
