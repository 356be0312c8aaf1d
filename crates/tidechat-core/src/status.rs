//! Per-message delivery/read status tracking
//!
//! The status machine is `Sending → Sent → Delivered → Read`, with
//! `Sending → Failed → Sending` as the only backward-looking edge. The
//! `delivered_to`/`read_by` maps are written by each recipient's own client -
//! the sender never writes these fields for others - and the sender-visible
//! aggregate is a pure policy over those maps: Delivered once ANY recipient
//! has received, Read once ALL intended recipients have read.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::message::{Conversation, Message, MessageStatus};
use crate::types::{CanonicalId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Status Application
// ----------------------------------------------------------------------------

/// Result of applying a status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status advanced
    Applied,
    /// The update was stale or a replay; state is unchanged
    Ignored,
}

/// Apply a status update monotonically
///
/// Regressions and replays are ignored rather than rejected: replayed
/// listener events routinely carry statuses the local record has already
/// moved past.
pub fn apply_status(message: &mut Message, to: MessageStatus) -> Transition {
    if message.status == to {
        return Transition::Ignored;
    }
    if message.status.can_transition_to(to) {
        message.status = to;
        Transition::Applied
    } else {
        Transition::Ignored
    }
}

// ----------------------------------------------------------------------------
// Receipt Recording
// ----------------------------------------------------------------------------

/// Record that `user` received the message. Append-only: an existing entry
/// is never overwritten. Returns true if the map changed.
pub fn record_delivered(message: &mut Message, user: &UserId, at: Timestamp) -> bool {
    if message.delivered_to.contains_key(user) {
        return false;
    }
    message.delivered_to.insert(user.clone(), at);
    true
}

/// Record that `user` read the message. Reading implies delivery, so a
/// missing `delivered_to` entry is backfilled with the same timestamp.
/// Returns true if either map changed.
pub fn record_read(message: &mut Message, user: &UserId, at: Timestamp) -> bool {
    let delivered_changed = record_delivered(message, user, at);
    if message.read_by.contains_key(user) {
        return delivered_changed;
    }
    message.read_by.insert(user.clone(), at);
    true
}

// ----------------------------------------------------------------------------
// Aggregate Policy
// ----------------------------------------------------------------------------

/// Compute the sender-visible aggregate status from the per-recipient maps
///
/// Policy: Delivered when ANY recipient has a `delivered_to` entry, Read
/// when ALL intended recipients (participants minus the sender) have a
/// `read_by` entry. Purely eventual - no recipient blocks the sender's
/// status beyond simply not having acknowledged yet.
pub fn aggregate_status(message: &Message, conversation: &Conversation) -> MessageStatus {
    if !message.is_confirmed() {
        return message.status;
    }

    let mut recipients = conversation.recipients_of(&message.sender_id).peekable();
    if recipients.peek().is_none() {
        // Degenerate single-participant conversation; nothing to wait for
        return message.status;
    }

    if recipients.all(|r| message.read_by.contains_key(r)) {
        return MessageStatus::Read;
    }
    if !message.delivered_to.is_empty() || !message.read_by.is_empty() {
        return MessageStatus::Delivered;
    }
    message.status
}

// ----------------------------------------------------------------------------
// Receipt Ledger
// ----------------------------------------------------------------------------

/// Which acknowledgement a receipt carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptKind {
    Delivered,
    Read,
}

/// Tracks which receipts this client has already emitted, so replayed
/// merges and repeated read sweeps never produce duplicate remote writes.
#[derive(Debug, Default)]
pub struct ReceiptLedger {
    sent_delivered: HashSet<CanonicalId>,
    sent_read: HashSet<CanonicalId>,
    max_entries: usize,
}

impl ReceiptLedger {
    /// Create a ledger bounded to `max_entries` per receipt kind
    pub fn new(max_entries: usize) -> Self {
        Self {
            sent_delivered: HashSet::new(),
            sent_read: HashSet::new(),
            max_entries,
        }
    }

    /// Whether a receipt of this kind still needs to be sent
    pub fn should_send(&self, kind: ReceiptKind, id: &CanonicalId) -> bool {
        match kind {
            ReceiptKind::Delivered => !self.sent_delivered.contains(id),
            ReceiptKind::Read => !self.sent_read.contains(id),
        }
    }

    /// Mark a receipt as sent
    pub fn mark_sent(&mut self, kind: ReceiptKind, id: CanonicalId) {
        let set = match kind {
            ReceiptKind::Delivered => &mut self.sent_delivered,
            ReceiptKind::Read => &mut self.sent_read,
        };
        set.insert(id);
        if set.len() > self.max_entries {
            // Shed an arbitrary entry; re-sending an old receipt is harmless
            // because receipt application is append-only on the far side.
            if let Some(evict) = set.iter().next().cloned() {
                set.remove(&evict);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ConversationKind;
    use crate::types::ConversationId;

    fn group(participants: &[&str]) -> Conversation {
        Conversation::new(
            ConversationId::new("conv-1"),
            ConversationKind::Group,
            participants.iter().map(|p| UserId::new(*p)),
        )
    }

    fn confirmed_message(sender: &str) -> Message {
        let mut message = Message::local(
            ConversationId::new("conv-1"),
            UserId::new(sender),
            "hello".to_string(),
            Timestamp::new(1_000),
        );
        message.confirm(CanonicalId::new("srv-1"), Timestamp::new(2_000));
        message
    }

    #[test]
    fn test_apply_status_is_monotonic() {
        let mut message = confirmed_message("alice");
        assert_eq!(
            apply_status(&mut message, MessageStatus::Delivered),
            Transition::Applied
        );
        // Replayed or stale update is ignored, not an error
        assert_eq!(
            apply_status(&mut message, MessageStatus::Sent),
            Transition::Ignored
        );
        assert_eq!(message.status, MessageStatus::Delivered);
    }

    #[test]
    fn test_record_delivered_is_append_only() {
        let mut message = confirmed_message("alice");
        let bob = UserId::new("bob");

        assert!(record_delivered(&mut message, &bob, Timestamp::new(3_000)));
        // Second receipt for the same user never overwrites the timestamp
        assert!(!record_delivered(&mut message, &bob, Timestamp::new(9_000)));
        assert_eq!(message.delivered_to[&bob], Timestamp::new(3_000));
    }

    #[test]
    fn test_record_read_backfills_delivery() {
        let mut message = confirmed_message("alice");
        let bob = UserId::new("bob");

        assert!(record_read(&mut message, &bob, Timestamp::new(3_000)));
        assert_eq!(message.delivered_to[&bob], Timestamp::new(3_000));
        assert_eq!(message.read_by[&bob], Timestamp::new(3_000));
        assert!(!record_read(&mut message, &bob, Timestamp::new(9_000)));
    }

    #[test]
    fn test_aggregate_any_delivered() {
        let conv = group(&["alice", "bob", "carol"]);
        let mut message = confirmed_message("alice");
        assert_eq!(aggregate_status(&message, &conv), MessageStatus::Sent);

        record_delivered(&mut message, &UserId::new("bob"), Timestamp::new(3_000));
        assert_eq!(aggregate_status(&message, &conv), MessageStatus::Delivered);
    }

    #[test]
    fn test_aggregate_all_read() {
        let conv = group(&["alice", "bob", "carol"]);
        let mut message = confirmed_message("alice");

        record_read(&mut message, &UserId::new("bob"), Timestamp::new(3_000));
        // One of two recipients has read: still Delivered
        assert_eq!(aggregate_status(&message, &conv), MessageStatus::Delivered);

        record_read(&mut message, &UserId::new("carol"), Timestamp::new(4_000));
        assert_eq!(aggregate_status(&message, &conv), MessageStatus::Read);
    }

    #[test]
    fn test_aggregate_ignores_pending_messages() {
        let conv = group(&["alice", "bob"]);
        let message = Message::local(
            ConversationId::new("conv-1"),
            UserId::new("alice"),
            "hi".to_string(),
            Timestamp::new(1_000),
        );
        assert_eq!(aggregate_status(&message, &conv), MessageStatus::Sending);
    }

    #[test]
    fn test_receipt_ledger_deduplicates() {
        let mut ledger = ReceiptLedger::new(100);
        let id = CanonicalId::new("srv-1");

        assert!(ledger.should_send(ReceiptKind::Delivered, &id));
        ledger.mark_sent(ReceiptKind::Delivered, id.clone());
        assert!(!ledger.should_send(ReceiptKind::Delivered, &id));
        // Read receipts are tracked independently
        assert!(ledger.should_send(ReceiptKind::Read, &id));
    }

    #[test]
    fn test_receipt_ledger_is_bounded() {
        let mut ledger = ReceiptLedger::new(4);
        for i in 0..10 {
            ledger.mark_sent(ReceiptKind::Read, CanonicalId::new(format!("m-{i}")));
        }
        assert!(ledger.sent_read.len() <= 5);
    }
}
