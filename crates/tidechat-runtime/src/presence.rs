//! Presence channel and sweeper task
//!
//! Holds the engine-wide table of live typing records and runs the periodic
//! sweep that deletes expired entries. Indicator changes are published as
//! `AppEvent::TypingChanged`; readers always re-check expiry client-side, so
//! a record the sweeper has not reached yet is still never shown.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use tidechat_core::channel::{publish, AppEvent, AppEventSender};
use tidechat_core::presence::PresenceTable;
use tidechat_core::reconcile::TypingSignal;
use tidechat_core::types::{ConversationId, TimeSource, UserId};

// ----------------------------------------------------------------------------
// Presence Channel
// ----------------------------------------------------------------------------

/// Engine-wide ephemeral typing state
pub struct PresenceChannel {
    table: Mutex<PresenceTable>,
    app_events: AppEventSender,
    time: Arc<dyn TimeSource>,
}

impl PresenceChannel {
    /// Create an empty presence channel
    pub fn new(app_events: AppEventSender, time: Arc<dyn TimeSource>) -> Self {
        Self {
            table: Mutex::new(PresenceTable::new()),
            app_events,
            time,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PresenceTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply an observed typing signal and publish the change, if any
    pub fn apply_signal(&self, signal: &TypingSignal) {
        let now = self.time.now();
        let (changed, typists) = {
            let mut table = self.lock();
            let changed = table.apply(signal, now);
            (changed, table.active_typists(&signal.conversation_id, now))
        };
        if changed {
            publish(
                &self.app_events,
                AppEvent::TypingChanged {
                    conversation_id: signal.conversation_id.clone(),
                    typists,
                },
            );
        }
    }

    /// Users currently typing in a conversation
    pub fn typists(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        let now = self.time.now();
        self.lock().active_typists(conversation_id, now)
    }

    /// Run one sweep pass, publishing changes for affected conversations
    pub fn sweep(&self) {
        let now = self.time.now();
        let affected = {
            let mut table = self.lock();
            let affected = table.sweep(now);
            affected
                .into_iter()
                .map(|conv| {
                    let typists = table.active_typists(&conv, now);
                    (conv, typists)
                })
                .collect::<Vec<_>>()
        };
        for (conversation_id, typists) in affected {
            debug!(%conversation_id, "typing record expired");
            publish(
                &self.app_events,
                AppEvent::TypingChanged {
                    conversation_id,
                    typists,
                },
            );
        }
    }

    /// Spawn the periodic sweeper, stopped via the shutdown signal
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: core::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => channel.sweep(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
