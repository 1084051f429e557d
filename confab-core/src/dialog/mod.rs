//! Dialog turn tracking and the interruption coordinator.
//!
//! One turn = one user utterance plus the AI's streamed response. The
//! manager owns every turn; the rest of the engine only reads through it.
//!
//! ## The ghost-event guard
//!
//! Stream callbacks resolve at arbitrary times — often *after* the turn
//! they belong to was interrupted. `route_event` therefore drops any event
//! whose turn is not the currently active one. That single rule is what
//! keeps a cancelled turn's text and audio from leaking into the next
//! turn's display or playback; no timestamp comparison is involved.
//!
//! ## Bounded history
//!
//! At most `capacity` turns are tracked (default 5). Creating a turn past
//! the cap evicts the oldest tracked turn, FIFO, regardless of its state.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::protocol::Event;

/// Opaque turn token.
pub type TurnId = String;

/// Generate a fresh turn token.
pub fn generate_turn_id() -> TurnId {
    format!("turn-{:08x}{:08x}", rand::random::<u32>(), rand::random::<u32>())
}

/// Lifecycle of one turn: `Active → Completed | Interrupted` (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Active,
    Interrupted,
    Completed,
}

/// One tracked dialog turn.
#[derive(Debug, Clone)]
pub struct DialogTurn {
    pub id: TurnId,
    pub created_at: DateTime<Utc>,
    pub state: TurnState,
    /// Text accumulated from `text` and `transcript` events, in order.
    pub accumulated_text: String,
    /// Base64 audio payloads, in arrival order.
    pub accumulated_audio_chunks: Vec<String>,
    /// Every routed event, in arrival order.
    pub responses: Vec<Event>,
    /// Whether the transcript quote policy opened a quotation.
    quoted: bool,
}

impl DialogTurn {
    fn new(id: TurnId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: TurnState::Active,
            accumulated_text: String::new(),
            accumulated_audio_chunks: Vec::new(),
            responses: Vec::new(),
            quoted: false,
        }
    }
}

/// Summary handed back when a turn completes normally.
#[derive(Debug, Clone)]
pub struct TurnCompletion {
    pub id: TurnId,
    /// Final accumulated text, closing quote included when applicable.
    pub text: String,
    /// True when the quote policy appended a closing quote the UI still
    /// needs to render.
    pub closing_quote: bool,
}

/// Owner of all dialog turns. At most one turn is active at any instant.
pub struct DialogQueueManager {
    turns: VecDeque<DialogTurn>,
    capacity: usize,
    active_id: Option<TurnId>,
}

impl DialogQueueManager {
    /// `capacity` bounds the turn history; 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            capacity: capacity.max(1),
            active_id: None,
        }
    }

    /// Create and activate a new turn.
    ///
    /// Any currently active turn is forced to `Interrupted` first — the
    /// single-active invariant holds at every point in time. Beyond
    /// capacity, the oldest tracked turn is evicted.
    pub fn create_turn(&mut self, id: TurnId) {
        if self.active_id.is_some() {
            self.interrupt_active();
        }

        if self.turns.len() >= self.capacity {
            if let Some(evicted) = self.turns.pop_front() {
                debug!(turn = %evicted.id, "turn history full, evicting oldest");
            }
        }

        info!(turn = %id, "turn created");
        self.active_id = Some(id.clone());
        self.turns.push_back(DialogTurn::new(id));
    }

    /// Route one server event to its turn.
    ///
    /// Returns the event to apply to the consumers — with the transcript
    /// quote policy already applied — or `None` when the event belongs to
    /// a turn that is no longer active and must be dropped silently.
    pub fn route_event(&mut self, turn_id: &str, event: Event) -> Option<Event> {
        if self.active_id.as_deref() != Some(turn_id) {
            debug!(turn = turn_id, "dropping event for non-active turn");
            return None;
        }
        let turn = self.turn_mut(turn_id)?;
        if turn.state != TurnState::Active {
            debug!(turn = turn_id, state = ?turn.state, "dropping event for terminal turn");
            return None;
        }

        let applied = match event {
            Event::Text(content) => {
                turn.accumulated_text.push_str(&content);
                Event::Text(content)
            }
            Event::Transcript(content) => {
                // First content of the turn opens a quotation; the closing
                // quote waits for completion.
                let content = if turn.accumulated_text.is_empty() && !turn.quoted {
                    turn.quoted = true;
                    format!("\"{content}")
                } else {
                    content
                };
                turn.accumulated_text.push_str(&content);
                Event::Transcript(content)
            }
            Event::Audio(content) => {
                turn.accumulated_audio_chunks.push(content.clone());
                Event::Audio(content)
            }
            other => other,
        };

        turn.responses.push(applied.clone());
        Some(applied)
    }

    /// Mark the active turn `Interrupted` and clear the active pointer.
    ///
    /// Callable redundantly: with no active turn this is a no-op.
    pub fn interrupt_active(&mut self) -> Option<TurnId> {
        let id = self.active_id.take()?;
        if let Some(turn) = self.turn_mut(&id) {
            turn.state = TurnState::Interrupted;
            info!(turn = %id, "turn interrupted");
        }
        Some(id)
    }

    /// Interrupt `turn_id` only if it is still the active turn.
    ///
    /// Guards async cleanup paths: a stream callback that resolves after
    /// its turn was superseded must not interrupt the successor.
    pub fn interrupt_turn(&mut self, turn_id: &str) -> bool {
        if self.active_id.as_deref() == Some(turn_id) {
            self.interrupt_active();
            true
        } else {
            false
        }
    }

    /// Mark `turn_id` completed, if it is still the active turn.
    ///
    /// Returns `None` when the turn was superseded in the meantime — the
    /// caller must not render a completion for it.
    pub fn complete_active(&mut self, turn_id: &str) -> Option<TurnCompletion> {
        if self.active_id.as_deref() != Some(turn_id) {
            return None;
        }
        self.active_id = None;
        let turn = self.turn_mut(turn_id)?;
        turn.state = TurnState::Completed;

        let closing_quote = turn.quoted && !turn.accumulated_text.ends_with('"');
        if closing_quote {
            turn.accumulated_text.push('"');
        }
        info!(turn = %turn_id, "turn completed");
        Some(TurnCompletion {
            id: turn.id.clone(),
            text: turn.accumulated_text.clone(),
            closing_quote,
        })
    }

    /// The currently active turn, if any.
    pub fn active_turn(&self) -> Option<&DialogTurn> {
        let id = self.active_id.as_deref()?;
        self.turns.iter().find(|t| t.id == id)
    }

    /// Look up any tracked turn.
    pub fn turn(&self, turn_id: &str) -> Option<&DialogTurn> {
        self.turns.iter().find(|t| t.id == turn_id)
    }

    /// Number of tracked turns.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn turn_mut(&mut self, turn_id: &str) -> Option<&mut DialogTurn> {
        self.turns.iter_mut().find(|t| t.id == turn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Event {
        Event::Text(s.into())
    }

    #[test]
    fn at_most_one_turn_is_active() {
        let mut m = DialogQueueManager::new(5);
        for i in 0..8 {
            m.create_turn(format!("t{i}"));
            let active = m
                .turns
                .iter()
                .filter(|t| t.state == TurnState::Active)
                .count();
            assert_eq!(active, 1, "after creating t{i}");
        }
    }

    #[test]
    fn events_for_an_interrupted_turn_are_dropped() {
        let mut m = DialogQueueManager::new(5);
        m.create_turn("t1".into());

        assert!(m.route_event("t1", text("Hi")).is_some());
        assert_eq!(m.turn("t1").unwrap().accumulated_text, "Hi");

        m.interrupt_active();

        // Late async callback for the cancelled turn
        assert!(m.route_event("t1", text(" there")).is_none());
        assert_eq!(m.turn("t1").unwrap().accumulated_text, "Hi");
    }

    #[test]
    fn events_for_a_superseded_turn_are_dropped() {
        let mut m = DialogQueueManager::new(5);
        m.create_turn("t1".into());
        m.create_turn("t2".into());

        assert_eq!(m.turn("t1").unwrap().state, TurnState::Interrupted);
        assert!(m.route_event("t1", text("stale")).is_none());
        assert!(m.route_event("t2", text("fresh")).is_some());
        assert_eq!(m.turn("t2").unwrap().accumulated_text, "fresh");
    }

    #[test]
    fn history_is_bounded_with_fifo_eviction() {
        let mut m = DialogQueueManager::new(5);
        for i in 0..7 {
            m.create_turn(format!("t{i}"));
        }
        assert_eq!(m.len(), 5);
        assert!(m.turn("t0").is_none());
        assert!(m.turn("t1").is_none());
        assert!(m.turn("t2").is_some());
    }

    #[test]
    fn interrupt_with_no_active_turn_is_a_noop() {
        let mut m = DialogQueueManager::new(5);
        assert!(m.interrupt_active().is_none());
        m.create_turn("t1".into());
        assert_eq!(m.interrupt_active().as_deref(), Some("t1"));
        assert!(m.interrupt_active().is_none());
    }

    #[test]
    fn transcript_quote_policy_wraps_first_content_and_closes_on_completion() {
        let mut m = DialogQueueManager::new(5);
        m.create_turn("t1".into());

        let first = m
            .route_event("t1", Event::Transcript("Hello".into()))
            .unwrap();
        assert_eq!(first, Event::Transcript("\"Hello".into()));

        let second = m
            .route_event("t1", Event::Transcript(" again".into()))
            .unwrap();
        assert_eq!(second, Event::Transcript(" again".into()));

        let done = m.complete_active("t1").unwrap();
        assert!(done.closing_quote);
        assert_eq!(done.text, "\"Hello again\"");
    }

    #[test]
    fn plain_text_turns_get_no_quotes() {
        let mut m = DialogQueueManager::new(5);
        m.create_turn("t1".into());
        m.route_event("t1", text("Hello"));
        let done = m.complete_active("t1").unwrap();
        assert!(!done.closing_quote);
        assert_eq!(done.text, "Hello");
    }

    #[test]
    fn interrupt_turn_only_touches_the_named_turn() {
        let mut m = DialogQueueManager::new(5);
        m.create_turn("t1".into());
        m.create_turn("t2".into());
        // Stale cleanup for t1 must not interrupt the active t2
        assert!(!m.interrupt_turn("t1"));
        assert_eq!(m.turn("t2").unwrap().state, TurnState::Active);
        assert!(m.interrupt_turn("t2"));
        assert_eq!(m.turn("t2").unwrap().state, TurnState::Interrupted);
    }

    #[test]
    fn completion_of_a_superseded_turn_returns_none() {
        let mut m = DialogQueueManager::new(5);
        m.create_turn("t1".into());
        m.create_turn("t2".into());
        assert!(m.complete_active("t1").is_none());
        assert!(m.complete_active("t2").is_some());
    }

    #[test]
    fn audio_chunks_accumulate_in_order() {
        let mut m = DialogQueueManager::new(5);
        m.create_turn("t1".into());
        m.route_event("t1", Event::Audio("AAAA".into()));
        m.route_event("t1", Event::Audio("BBBB".into()));
        let turn = m.turn("t1").unwrap();
        assert_eq!(turn.accumulated_audio_chunks, vec!["AAAA", "BBBB"]);
        assert_eq!(turn.responses.len(), 2);
    }

    #[test]
    fn generated_turn_ids_are_unique() {
        let a = generate_turn_id();
        let b = generate_turn_id();
        assert_ne!(a, b);
        assert!(a.starts_with("turn-"));
    }
}
