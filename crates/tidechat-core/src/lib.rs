//! Tidechat Core Synchronization Logic
//!
//! This crate provides the foundational types, durable storage, merge rules,
//! and status tracking for the Tidechat local-first message sync engine. It
//! contains no long-lived tasks - `tidechat-runtime` orchestrates these
//! pieces into per-conversation actors.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod message;
pub mod presence;
pub mod reconcile;
pub mod retry;
pub mod status;
pub mod store;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{create_app_event_channel, AppEvent, AppEventReceiver, AppEventSender};
pub use config::SyncConfig;
pub use errors::{Result, SyncError};
pub use message::{Conversation, ConversationKind, LastMessageSnapshot, Message, MessageStatus};
pub use reconcile::{MergeOutcome, RemoteAck, RemoteEvent, RemoteMessage, RemoteReceipt, TypingSignal};
pub use status::ReceiptKind;
pub use store::LocalStore;
pub use types::{
    CanonicalId, ConversationId, CorrelationId, SystemTimeSource, TimeSource, Timestamp, UserId,
};
