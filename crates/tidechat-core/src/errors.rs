//! Error types for the Tidechat sync engine
//!
//! This module contains all error types used throughout the engine: storage,
//! network, permission, conflict, and listener errors, plus the main
//! SyncError type that unifies them. The taxonomy drives recovery policy -
//! transient errors are retried, terminal errors surface to the caller, and
//! storage errors fail the operation without crashing the process.

use std::path::PathBuf;

use crate::message::MessageStatus;
use crate::types::{CanonicalId, ConversationId, CorrelationId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Local storage error types
///
/// Fatal to the operation that triggered them, never to the process.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open database at {path}: {reason}")]
    ConnectionFailed { path: PathBuf, reason: String },
    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("stored row for message {correlation_id} is corrupt: {reason}")]
    CorruptRow {
        correlation_id: String,
        reason: String,
    },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::QueryFailed(err.to_string())
    }
}

/// Transient network error types, recovered by the offline queue
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("remote store unreachable: {reason}")]
    Unreachable { reason: String },
    #[error("remote operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("connection to remote store was lost")]
    Disconnected,
}

/// Terminal errors, surfaced immediately and never retried
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("user is not a participant of conversation {conversation_id}")]
    NotParticipant { conversation_id: ConversationId },
    #[error("remote store rejected the operation: {reason}")]
    Rejected { reason: String },
    #[error("message failed validation: {reason}")]
    InvalidMessage { reason: String },
}

/// Subscription/listener error types, handled by bounded resubscription
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("remote snapshot missing required field `{field}`")]
    Decode { field: &'static str },
    #[error("subscription stream closed: {reason}")]
    StreamClosed { reason: String },
    #[error("failed to establish subscription: {reason}")]
    SubscribeFailed { reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Unified error type for the Tidechat sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("permission error: {0}")]
    Permission(#[from] PermissionError),

    /// Canonical-id collision on a retried dispatch. Carries the id assigned
    /// by the original, successfully applied attempt; callers treat this as
    /// success via idempotent apply.
    #[error("message {correlation_id} already confirmed as {canonical_id}")]
    Conflict {
        correlation_id: CorrelationId,
        canonical_id: CanonicalId,
    },

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("channel error: {reason}")]
    Channel { reason: String },

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("illegal status transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("no message {correlation_id} in conversation {conversation_id}")]
    UnknownMessage {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
    },

    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(StorageError::from(err))
    }
}

impl SyncError {
    /// Whether the offline queue should retry the failed operation
    ///
    /// Network errors are transient; everything else either succeeded
    /// idempotently (Conflict) or is terminal for the dispatch path.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    /// Whether this error terminally fails a send (no automatic retry)
    pub fn is_terminal_for_send(&self) -> bool {
        matches!(
            self,
            SyncError::Permission(_) | SyncError::Serialization(_)
        )
    }
}

/// Result alias used throughout the engine
pub type Result<T> = core::result::Result<T, SyncError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let net = SyncError::Network(NetworkError::Disconnected);
        assert!(net.is_transient());
        assert!(!net.is_terminal_for_send());

        let perm = SyncError::Permission(PermissionError::Rejected {
            reason: "banned".to_string(),
        });
        assert!(!perm.is_transient());
        assert!(perm.is_terminal_for_send());

        let conflict = SyncError::Conflict {
            correlation_id: CorrelationId::generate(),
            canonical_id: CanonicalId::new("m-1"),
        };
        assert!(!conflict.is_transient());
        assert!(!conflict.is_terminal_for_send());
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::QueryFailed("disk I/O error".to_string());
        assert_eq!(err.to_string(), "query failed: disk I/O error");
    }
}
