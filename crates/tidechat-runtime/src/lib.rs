//! Tidechat Runtime Engine
//!
//! This crate contains the runtime for the Tidechat local-first sync engine:
//! - `SyncEngine`: the facade owning one actor per open conversation
//! - `ConversationActor`: serialized sends, merges, and receipt handling
//! - `ReconcilerTask`: subscription lifecycle with bounded resync
//! - `PresenceChannel`: TTL typing records and the periodic sweeper
//!
//! `tidechat-core` provides the types, storage, and merge rules this crate
//! orchestrates.

mod actor;
pub mod context;
pub mod engine;
pub mod presence;
pub mod reconciler;
pub mod remote;

pub use context::SessionContext;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use presence::PresenceChannel;
pub use remote::{RemoteStore, Subscription};

// Re-export core types for convenience
pub use tidechat_core::{
    AppEvent, AppEventReceiver, CanonicalId, Conversation, ConversationId, ConversationKind,
    CorrelationId, MergeOutcome, Message, MessageStatus, ReceiptKind, RemoteAck, RemoteEvent,
    RemoteMessage, RemoteReceipt, Result, SyncConfig, SyncError, SystemTimeSource, TimeSource,
    Timestamp, TypingSignal, UserId,
};
