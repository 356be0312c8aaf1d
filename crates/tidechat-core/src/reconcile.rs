//! Remote event types and snapshot decoding
//!
//! Everything the live subscription can deliver is modeled here: confirmed
//! message snapshots, per-recipient receipts, and ephemeral typing signals.
//! Snapshot decoding is explicit - a raw snapshot with permissive optional
//! fields is validated into `RemoteMessage`, and a missing required field is
//! a decode error, never a silently substituted default.

use serde::{Deserialize, Serialize};

use crate::errors::ListenerError;
use crate::status::ReceiptKind;
use crate::types::{CanonicalId, ConversationId, CorrelationId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Remote Acknowledgement
// ----------------------------------------------------------------------------

/// Returned by the remote store when a dispatched message is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub canonical_id: CanonicalId,
    pub server_timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Remote Message Snapshot
// ----------------------------------------------------------------------------

/// A validated, confirmed message snapshot from the subscription feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub canonical_id: CanonicalId,
    /// Present when the originating client attached its idempotency key;
    /// absent for messages from clients that predate correlation tracking
    pub correlation_id: Option<CorrelationId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub server_timestamp: Timestamp,
}

/// Wire-shaped snapshot with every field optional, as the listener actually
/// receives it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRemoteMessage {
    pub canonical_id: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub conversation_id: Option<String>,
    pub sender_id: Option<String>,
    pub body: Option<String>,
    pub server_timestamp: Option<u64>,
}

impl RemoteMessage {
    /// Validate a raw snapshot
    ///
    /// `canonical_id`, `conversation_id`, `sender_id`, `body`, and
    /// `server_timestamp` are required; `correlation_id` is optional.
    pub fn decode(raw: RawRemoteMessage) -> Result<Self, ListenerError> {
        let canonical_id = raw
            .canonical_id
            .ok_or(ListenerError::Decode {
                field: "canonical_id",
            })?
            .into();
        let conversation_id = raw
            .conversation_id
            .ok_or(ListenerError::Decode {
                field: "conversation_id",
            })?
            .into();
        let sender_id = raw
            .sender_id
            .ok_or(ListenerError::Decode { field: "sender_id" })?
            .into();
        let body = raw.body.ok_or(ListenerError::Decode { field: "body" })?;
        let server_timestamp = raw
            .server_timestamp
            .map(Timestamp::new)
            .ok_or(ListenerError::Decode {
                field: "server_timestamp",
            })?;

        Ok(Self {
            canonical_id,
            correlation_id: raw.correlation_id,
            conversation_id,
            sender_id,
            body,
            server_timestamp,
        })
    }
}

// ----------------------------------------------------------------------------
// Remote Receipt
// ----------------------------------------------------------------------------

/// A delivery or read acknowledgement written by a recipient's client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReceipt {
    pub conversation_id: ConversationId,
    pub canonical_id: CanonicalId,
    pub user_id: UserId,
    pub kind: ReceiptKind,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Typing Signal
// ----------------------------------------------------------------------------

/// An ephemeral typing signal observed on the subscription feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    /// false clears the indicator immediately rather than waiting for expiry
    pub is_typing: bool,
    pub expires_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Remote Event
// ----------------------------------------------------------------------------

/// One event from a conversation's live subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteEvent {
    Message(RemoteMessage),
    Receipt(RemoteReceipt),
    Typing(TypingSignal),
}

/// Outcome of merging a remote message snapshot into the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A local-pending entry with the same correlation id was confirmed in
    /// place, preserving its timeline identity
    ConfirmedLocal,
    /// No local counterpart existed; inserted as a new confirmed message
    Inserted,
    /// The canonical id was already applied; the event was a replay
    Duplicate,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_raw() -> RawRemoteMessage {
        RawRemoteMessage {
            canonical_id: Some("srv-1".to_string()),
            correlation_id: Some(CorrelationId::generate()),
            conversation_id: Some("conv-1".to_string()),
            sender_id: Some("alice".to_string()),
            body: Some("hello".to_string()),
            server_timestamp: Some(2_000),
        }
    }

    #[test]
    fn test_decode_complete_snapshot() {
        let decoded = RemoteMessage::decode(complete_raw()).unwrap();
        assert_eq!(decoded.canonical_id, CanonicalId::new("srv-1"));
        assert_eq!(decoded.server_timestamp, Timestamp::new(2_000));
    }

    #[test]
    fn test_decode_without_correlation_is_valid() {
        let mut raw = complete_raw();
        raw.correlation_id = None;
        let decoded = RemoteMessage::decode(raw).unwrap();
        assert!(decoded.correlation_id.is_none());
    }

    #[test]
    fn test_decode_rejects_missing_required_fields() {
        let mut raw = complete_raw();
        raw.canonical_id = None;
        assert!(matches!(
            RemoteMessage::decode(raw),
            Err(ListenerError::Decode {
                field: "canonical_id"
            })
        ));

        let mut raw = complete_raw();
        raw.server_timestamp = None;
        assert!(matches!(
            RemoteMessage::decode(raw),
            Err(ListenerError::Decode {
                field: "server_timestamp"
            })
        ));

        let mut raw = complete_raw();
        raw.body = None;
        assert!(matches!(
            RemoteMessage::decode(raw),
            Err(ListenerError::Decode { field: "body" })
        ));
    }
}
