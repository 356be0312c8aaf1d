//! Ephemeral typing/presence state
//!
//! Typing records carry an expiry and are never persisted across restarts.
//! A periodic sweep deletes expired records in bulk; readers additionally
//! filter on `expires_at` so an unswept stale record is never shown. The
//! debouncer keeps remote writes to at most one `true` per typing burst and
//! one scheduled `false` after inactivity.

use hashbrown::HashMap;

use crate::config::PresenceConfig;
use crate::reconcile::TypingSignal;
use crate::types::{ConversationId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Presence Table
// ----------------------------------------------------------------------------

/// In-memory table of live typing records
#[derive(Debug, Default)]
pub struct PresenceTable {
    /// (conversation, user) → expiry
    entries: HashMap<(ConversationId, UserId), Timestamp>,
}

impl PresenceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a typing signal. Returns true if the set of visible typists
    /// for the conversation may have changed.
    pub fn apply(&mut self, signal: &TypingSignal, now: Timestamp) -> bool {
        let key = (signal.conversation_id.clone(), signal.user_id.clone());
        if !signal.is_typing {
            return self.entries.remove(&key).is_some();
        }
        if signal.expires_at <= now {
            // Already stale on arrival; applying it would only flicker
            return false;
        }
        let previous = self.entries.insert(key, signal.expires_at);
        previous.is_none()
    }

    /// Users currently typing in a conversation, filtering expired records
    /// as a defense against unswept state
    pub fn active_typists(&self, conversation_id: &ConversationId, now: Timestamp) -> Vec<UserId> {
        let mut typists: Vec<UserId> = self
            .entries
            .iter()
            .filter(|((conv, _), expires_at)| conv == conversation_id && **expires_at > now)
            .map(|((_, user), _)| user.clone())
            .collect();
        typists.sort();
        typists
    }

    /// Delete all expired records, returning the conversations whose
    /// indicator sets changed
    pub fn sweep(&mut self, now: Timestamp) -> Vec<ConversationId> {
        let mut affected: Vec<ConversationId> = self
            .entries
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|((conv, _), _)| conv.clone())
            .collect();
        self.entries.retain(|_, expires_at| *expires_at > now);
        affected.sort();
        affected.dedup();
        affected
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Typing Debouncer
// ----------------------------------------------------------------------------

/// A remote presence write the debouncer decided to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingWrite {
    /// Publish `is_typing = true` with a fresh expiry
    Start,
    /// Publish `is_typing = false`
    Stop,
}

/// Debounces local keystrokes into at most one `true` write per burst and
/// one `false` write after inactivity
#[derive(Debug, Default)]
pub struct TypingDebouncer {
    active: bool,
    last_input: Option<Timestamp>,
}

impl TypingDebouncer {
    /// Create an idle debouncer
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a keystroke. Emits `Start` only on the idle→active edge;
    /// further keystrokes during the burst refresh the local deadline
    /// without another remote write.
    pub fn on_input(&mut self, now: Timestamp) -> Option<TypingWrite> {
        self.last_input = Some(now);
        if self.active {
            return None;
        }
        self.active = true;
        Some(TypingWrite::Start)
    }

    /// Message sent: the composer is empty again, stop immediately
    pub fn on_send(&mut self) -> Option<TypingWrite> {
        if !self.active {
            return None;
        }
        self.active = false;
        self.last_input = None;
        Some(TypingWrite::Stop)
    }

    /// Periodic check; emits `Stop` once `idle_timeout` has elapsed since
    /// the last keystroke
    pub fn tick(&mut self, now: Timestamp, config: &PresenceConfig) -> Option<TypingWrite> {
        if !self.active {
            return None;
        }
        let last = self.last_input?;
        if now.duration_since(last) >= config.idle_timeout {
            self.active = false;
            self.last_input = None;
            return Some(TypingWrite::Stop);
        }
        None
    }

    /// Whether a burst is in progress
    pub fn is_active(&self) -> bool {
        self.active
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(user: &str, is_typing: bool, expires_at: u64) -> TypingSignal {
        TypingSignal {
            conversation_id: ConversationId::new("conv-1"),
            user_id: UserId::new(user),
            is_typing,
            expires_at: Timestamp::new(expires_at),
        }
    }

    #[test]
    fn test_apply_and_read_back() {
        let mut table = PresenceTable::new();
        assert!(table.apply(&signal("bob", true, 5_000), Timestamp::new(1_000)));

        let typists = table.active_typists(&ConversationId::new("conv-1"), Timestamp::new(2_000));
        assert_eq!(typists, vec![UserId::new("bob")]);
    }

    #[test]
    fn test_readers_filter_unswept_stale_records() {
        let mut table = PresenceTable::new();
        table.apply(&signal("bob", true, 5_000), Timestamp::new(1_000));

        // Not swept yet, but past expiry: invisible to readers
        let typists = table.active_typists(&ConversationId::new("conv-1"), Timestamp::new(5_000));
        assert!(typists.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sweep_removes_expired_and_reports_conversations() {
        let mut table = PresenceTable::new();
        table.apply(&signal("bob", true, 5_000), Timestamp::new(1_000));
        table.apply(&signal("carol", true, 9_000), Timestamp::new(1_000));

        let affected = table.sweep(Timestamp::new(6_000));
        assert_eq!(affected, vec![ConversationId::new("conv-1")]);
        assert_eq!(table.len(), 1);

        assert!(table.sweep(Timestamp::new(6_000)).is_empty());
    }

    #[test]
    fn test_explicit_stop_clears_immediately() {
        let mut table = PresenceTable::new();
        table.apply(&signal("bob", true, 5_000), Timestamp::new(1_000));
        assert!(table.apply(&signal("bob", false, 0), Timestamp::new(2_000)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_on_arrival_is_dropped() {
        let mut table = PresenceTable::new();
        assert!(!table.apply(&signal("bob", true, 1_000), Timestamp::new(2_000)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_refresh_does_not_report_change() {
        let mut table = PresenceTable::new();
        assert!(table.apply(&signal("bob", true, 5_000), Timestamp::new(1_000)));
        // Same typist, extended expiry: no visible change
        assert!(!table.apply(&signal("bob", true, 8_000), Timestamp::new(2_000)));
    }

    #[test]
    fn test_debouncer_one_start_per_burst() {
        let config = PresenceConfig::default();
        let mut debouncer = TypingDebouncer::new();

        assert_eq!(debouncer.on_input(Timestamp::new(0)), Some(TypingWrite::Start));
        assert_eq!(debouncer.on_input(Timestamp::new(500)), None);
        assert_eq!(debouncer.on_input(Timestamp::new(1_000)), None);

        // Keystroke within the idle window keeps the burst alive
        assert_eq!(debouncer.tick(Timestamp::new(2_000), &config), None);

        // Inactivity past the window emits exactly one Stop
        let idle_ms = config.idle_timeout.as_millis() as u64;
        assert_eq!(
            debouncer.tick(Timestamp::new(1_000 + idle_ms), &config),
            Some(TypingWrite::Stop)
        );
        assert_eq!(debouncer.tick(Timestamp::new(10_000 + idle_ms), &config), None);

        // Next keystroke starts a fresh burst
        assert_eq!(
            debouncer.on_input(Timestamp::new(20_000)),
            Some(TypingWrite::Start)
        );
    }

    #[test]
    fn test_debouncer_stop_on_send() {
        let mut debouncer = TypingDebouncer::new();
        assert_eq!(debouncer.on_send(), None);

        debouncer.on_input(Timestamp::new(0));
        assert_eq!(debouncer.on_send(), Some(TypingWrite::Stop));
        assert!(!debouncer.is_active());
    }
}
