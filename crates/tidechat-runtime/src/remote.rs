//! Remote authoritative store interface
//!
//! The remote store is opaque to the engine: an idempotent `put` keyed on
//! the correlation id, a resumable per-conversation subscription, and
//! fire-level receipt/typing writes. Implementations adapt whatever backend
//! actually serves the account; the integration tests drive an in-memory
//! fake through the same trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

use tidechat_core::errors::Result;
use tidechat_core::reconcile::{RemoteAck, RemoteEvent, RemoteReceipt, TypingSignal};
use tidechat_core::types::{ConversationId, CorrelationId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Remote Store Trait
// ----------------------------------------------------------------------------

/// The opaque remote authoritative store
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Apply a message, idempotently keyed on `correlation_id`
    ///
    /// A retried put for an already-applied correlation id must return the
    /// original ack (or `SyncError::Conflict` carrying the original
    /// canonical id) - it must never create a second message.
    async fn put(
        &self,
        conversation_id: &ConversationId,
        correlation_id: CorrelationId,
        sender_id: &UserId,
        body: &str,
    ) -> Result<RemoteAck>;

    /// Open a live subscription for one conversation
    ///
    /// `since = None` requests a full replay; `Some(ts)` resumes with
    /// events strictly after the given server timestamp. Delivery is
    /// at-least-once: the caller absorbs replays idempotently.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since: Option<Timestamp>,
    ) -> Result<Subscription>;

    /// Record a delivery/read acknowledgement for a confirmed message
    async fn send_receipt(&self, receipt: RemoteReceipt) -> Result<()>;

    /// Publish an ephemeral typing signal
    async fn publish_typing(&self, signal: TypingSignal) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Subscription
// ----------------------------------------------------------------------------

/// A cancellable, restartable stream of remote events for one conversation
///
/// Dropping the subscription cancels it: the provider observes the closed
/// channel and stops delivering. A `None` from `next_event` means the
/// stream ended (disconnect) and the caller should resubscribe from its
/// cursor.
pub struct Subscription {
    events: mpsc::Receiver<Result<RemoteEvent>>,
}

impl Subscription {
    /// Wrap a provider-fed event channel
    pub fn new(events: mpsc::Receiver<Result<RemoteEvent>>) -> Self {
        Self { events }
    }

    /// Next event, or None when the stream has ended
    pub async fn next_event(&mut self) -> Option<Result<RemoteEvent>> {
        self.events.recv().await
    }
}
