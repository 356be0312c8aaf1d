//! Session context
//!
//! One explicitly constructed bundle of everything a component needs -
//! identity, configuration, the durable store, the remote store, the event
//! channel, and the clock - injected at construction time instead of being
//! reached for through process-wide globals.

use std::sync::Arc;

use tidechat_core::channel::AppEventSender;
use tidechat_core::config::SyncConfig;
use tidechat_core::store::LocalStore;
use tidechat_core::types::{TimeSource, UserId};

use crate::remote::RemoteStore;

/// Dependencies shared by every engine component for one user session
pub struct SessionContext {
    /// The signed-in user, supplied by the external identity provider
    pub current_user: UserId,
    /// Engine configuration, fixed for the session
    pub config: SyncConfig,
    /// Durable local store (sole source for cold-start rendering)
    pub store: Arc<LocalStore>,
    /// Opaque remote authoritative store
    pub remote: Arc<dyn RemoteStore>,
    /// Broadcast channel to UI observers and the notification dispatcher
    pub app_events: AppEventSender,
    /// Clock; swapped for a manual clock in tests
    pub time: Arc<dyn TimeSource>,
}

impl SessionContext {
    /// Current time as seen by this session
    pub fn now(&self) -> tidechat_core::types::Timestamp {
        self.time.now()
    }
}
