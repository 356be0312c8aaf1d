//! Message and conversation data model
//!
//! Defines the message record that flows through the whole engine: created
//! local-pending by the send pipeline, confirmed in place by the reconciler,
//! and annotated with per-recipient receipts by each recipient's own client.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::{CanonicalId, ConversationId, CorrelationId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Message Status
// ----------------------------------------------------------------------------

/// Lifecycle status of a message from the sender's perspective
///
/// Transitions only move forward (`Sending → Sent → Delivered → Read`), with
/// `Sending → Failed → Sending` as the only backward-looking edge (retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Written locally, not yet acknowledged by the remote store
    Sending,
    /// Confirmed by the remote store (canonical id assigned)
    Sent,
    /// At least one recipient has received the message
    Delivered,
    /// All intended recipients have read the message
    Read,
    /// Dispatch failed terminally or exhausted its retries
    Failed,
}

impl MessageStatus {
    /// Forward-progress rank; Failed sits outside the forward chain
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 0,
        }
    }

    /// Whether a transition from `self` to `to` is legal
    pub fn can_transition_to(self, to: MessageStatus) -> bool {
        match (self, to) {
            // Retry path: the only backward-looking edges
            (MessageStatus::Sending, MessageStatus::Failed) => true,
            (MessageStatus::Failed, MessageStatus::Sending) => true,
            // Delivered/read states never fail or regress
            (MessageStatus::Delivered | MessageStatus::Read, MessageStatus::Failed) => false,
            (MessageStatus::Sent, MessageStatus::Failed) => false,
            _ => to.rank() > self.rank(),
        }
    }

    /// Stable storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    /// Parse the stable storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A single message record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Client-generated identity; permanent dedup and idempotency key
    pub correlation_id: CorrelationId,
    /// Server-assigned identity, None until confirmed
    pub canonical_id: Option<CanonicalId>,
    /// Conversation this message belongs to
    pub conversation_id: ConversationId,
    /// Author of the message
    pub sender_id: UserId,
    /// Message content
    pub body: String,
    /// Local wall-clock time at creation
    pub client_timestamp: Timestamp,
    /// Authoritative server time, None until confirmed
    pub server_timestamp: Option<Timestamp>,
    /// Sender-visible lifecycle status
    pub status: MessageStatus,
    /// Recipients that have received the message (append-only)
    pub delivered_to: HashMap<UserId, Timestamp>,
    /// Recipients that have read the message (append-only)
    pub read_by: HashMap<UserId, Timestamp>,
}

impl Message {
    /// Create a new local-pending message with a fresh correlation id
    pub fn local(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: String,
        now: Timestamp,
    ) -> Self {
        Self {
            correlation_id: CorrelationId::generate(),
            canonical_id: None,
            conversation_id,
            sender_id,
            body,
            client_timestamp: now,
            server_timestamp: None,
            status: MessageStatus::Sending,
            delivered_to: HashMap::new(),
            read_by: HashMap::new(),
        }
    }

    /// Whether the remote store has confirmed this message
    pub fn is_confirmed(&self) -> bool {
        self.canonical_id.is_some()
    }

    /// Timestamp the timeline orders this message by: server time once
    /// confirmed, client time while pending
    pub fn effective_timestamp(&self) -> Timestamp {
        self.server_timestamp.unwrap_or(self.client_timestamp)
    }

    /// Total ordering key within a conversation
    ///
    /// Confirmed messages order by `(server_timestamp, canonical_id)` -
    /// identical on every device. Pending messages are local-only and order
    /// by `(client_timestamp, correlation_id)` until confirmed.
    pub fn ordering_key(&self) -> (Timestamp, String) {
        match (&self.canonical_id, self.server_timestamp) {
            (Some(canonical), Some(server_ts)) => (server_ts, canonical.as_str().to_string()),
            _ => (self.client_timestamp, self.correlation_id.to_string()),
        }
    }

    /// Apply a remote confirmation in place: assign the canonical identity
    /// and advance to Sent if the message has not progressed further already
    pub fn confirm(&mut self, canonical_id: CanonicalId, server_timestamp: Timestamp) {
        self.canonical_id = Some(canonical_id);
        self.server_timestamp = Some(server_timestamp);
        // A late confirmation of a message marked failed still wins: the
        // remote store applied it, so the failure was ambiguous. Statuses
        // past Sent never regress.
        if matches!(self.status, MessageStatus::Sending | MessageStatus::Failed) {
            self.status = MessageStatus::Sent;
        }
    }
}

// ----------------------------------------------------------------------------
// Conversation
// ----------------------------------------------------------------------------

/// Whether a conversation is a fixed pair or an extensible group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    /// Two participants, membership immutable
    Direct,
    /// Any number of participants, membership append-only
    Group,
}

impl ConversationKind {
    /// Stable storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    /// Parse the stable storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

/// Denormalized last-message snapshot for list rendering without a join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessageSnapshot {
    pub body: String,
    pub timestamp: Timestamp,
    pub sender_id: UserId,
}

impl LastMessageSnapshot {
    /// Derive a snapshot from a message
    pub fn of(message: &Message) -> Self {
        Self {
            body: message.body.clone(),
            timestamp: message.effective_timestamp(),
            sender_id: message.sender_id.clone(),
        }
    }
}

/// A conversation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Participant set, kept sorted; immutable for direct conversations,
    /// append-only for groups
    pub participant_ids: SmallVec<[UserId; 4]>,
    pub last_message: Option<LastMessageSnapshot>,
}

impl Conversation {
    /// Create a new conversation; participants are deduplicated and sorted
    pub fn new(
        id: ConversationId,
        kind: ConversationKind,
        participants: impl IntoIterator<Item = UserId>,
    ) -> Self {
        let mut participant_ids: SmallVec<[UserId; 4]> = participants.into_iter().collect();
        participant_ids.sort();
        participant_ids.dedup();
        Self {
            id,
            kind,
            participant_ids,
            last_message: None,
        }
    }

    /// Whether the user belongs to this conversation
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participant_ids.binary_search(user).is_ok()
    }

    /// Append a participant (groups only; direct membership is immutable).
    /// Returns true if the set changed.
    pub fn add_participant(&mut self, user: UserId) -> bool {
        if self.kind == ConversationKind::Direct {
            return false;
        }
        match self.participant_ids.binary_search(&user) {
            Ok(_) => false,
            Err(idx) => {
                self.participant_ids.insert(idx, user);
                true
            }
        }
    }

    /// Everyone except the given sender - the intended recipients used by
    /// the aggregate status policy
    pub fn recipients_of(&self, sender: &UserId) -> impl Iterator<Item = &UserId> {
        let sender = sender.clone();
        self.participant_ids.iter().filter(move |p| **p != sender)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_message() -> Message {
        Message::local(
            ConversationId::new("conv-1"),
            UserId::new("alice"),
            "hello".to_string(),
            Timestamp::new(1_000),
        )
    }

    #[test]
    fn test_status_moves_forward_only() {
        use MessageStatus::*;
        assert!(Sending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Sending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Sending));

        // Regressions are never legal
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Sending));
        // A delivered or read message can no longer fail
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Read.can_transition_to(Failed));
        assert!(!Sent.can_transition_to(Failed));
    }

    #[test]
    fn test_status_storage_roundtrip() {
        use MessageStatus::*;
        for status in [Sending, Sent, Delivered, Read, Failed] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("bogus"), None);
    }

    #[test]
    fn test_confirm_assigns_identity_in_place() {
        let mut message = test_message();
        let correlation = message.correlation_id;
        assert!(!message.is_confirmed());

        message.confirm(CanonicalId::new("srv-1"), Timestamp::new(2_000));

        assert!(message.is_confirmed());
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.effective_timestamp(), Timestamp::new(2_000));
        // Correlation id is permanent
        assert_eq!(message.correlation_id, correlation);
    }

    #[test]
    fn test_confirm_after_failed_recovers() {
        let mut message = test_message();
        message.status = MessageStatus::Failed;
        message.confirm(CanonicalId::new("srv-1"), Timestamp::new(2_000));
        assert_eq!(message.status, MessageStatus::Sent);
    }

    #[test]
    fn test_confirm_never_regresses_delivered() {
        let mut message = test_message();
        message.status = MessageStatus::Delivered;
        message.confirm(CanonicalId::new("srv-1"), Timestamp::new(2_000));
        assert_eq!(message.status, MessageStatus::Delivered);
    }

    #[test]
    fn test_ordering_key_switches_on_confirmation() {
        let mut message = test_message();
        let (ts, _) = message.ordering_key();
        assert_eq!(ts, Timestamp::new(1_000));

        message.confirm(CanonicalId::new("srv-1"), Timestamp::new(5_000));
        let (ts, tie) = message.ordering_key();
        assert_eq!(ts, Timestamp::new(5_000));
        assert_eq!(tie, "srv-1");
    }

    #[test]
    fn test_direct_membership_is_immutable() {
        let mut conv = Conversation::new(
            ConversationId::new("dm"),
            ConversationKind::Direct,
            [UserId::new("alice"), UserId::new("bob")],
        );
        assert!(!conv.add_participant(UserId::new("carol")));
        assert_eq!(conv.participant_ids.len(), 2);
    }

    #[test]
    fn test_group_membership_is_append_only() {
        let mut conv = Conversation::new(
            ConversationId::new("grp"),
            ConversationKind::Group,
            [UserId::new("alice"), UserId::new("bob")],
        );
        assert!(conv.add_participant(UserId::new("carol")));
        assert!(!conv.add_participant(UserId::new("carol")));
        assert_eq!(conv.participant_ids.len(), 3);
        assert!(conv.has_participant(&UserId::new("carol")));
    }

    #[test]
    fn test_recipients_exclude_sender() {
        let conv = Conversation::new(
            ConversationId::new("grp"),
            ConversationKind::Group,
            [UserId::new("alice"), UserId::new("bob"), UserId::new("carol")],
        );
        let recipients: Vec<_> = conv.recipients_of(&UserId::new("alice")).collect();
        assert_eq!(recipients.len(), 2);
        assert!(!recipients.contains(&&UserId::new("alice")));
    }
}
