//! Remote subscription lifecycle
//!
//! One reconciler task per open conversation: it keeps a live subscription,
//! forwards events to the conversation actor's merge loop, and handles
//! reconnects. A resubscription resumes from the last applied server
//! timestamp (bounded resync); a full resync runs only on first launch,
//! when the gap since the last sync exceeds the configured threshold, or as
//! the escalation after repeated listener failures.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tidechat_core::reconcile::RemoteEvent;
use tidechat_core::types::{ConversationId, Timestamp};

use crate::context::SessionContext;

// ----------------------------------------------------------------------------
// Reconciler Task
// ----------------------------------------------------------------------------

/// Feeds one conversation's merge loop from the remote subscription
pub struct ReconcilerTask {
    ctx: Arc<SessionContext>,
    conversation_id: ConversationId,
    merge_tx: mpsc::Sender<RemoteEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ReconcilerTask {
    pub fn new(
        ctx: Arc<SessionContext>,
        conversation_id: ConversationId,
        merge_tx: mpsc::Sender<RemoteEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            conversation_id,
            merge_tx,
            shutdown,
        }
    }

    /// Resumption cursor for the next subscribe call
    fn resume_from(&self, force_full_resync: bool) -> Option<Timestamp> {
        if force_full_resync {
            return None;
        }
        let cursor = match self
            .ctx
            .store
            .last_applied_server_timestamp(&self.conversation_id)
        {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(conversation = %self.conversation_id, error = %e,
                      "cursor lookup failed, falling back to full resync");
                return None;
            }
        };
        match cursor {
            // First launch: nothing applied yet
            None => None,
            Some(ts) => {
                let gap = self.ctx.now().duration_since(ts);
                if gap > self.ctx.config.reconciler.full_resync_gap {
                    info!(conversation = %self.conversation_id, gap_secs = gap.as_secs(),
                          "sync gap exceeds threshold, full resync");
                    None
                } else {
                    Some(ts)
                }
            }
        }
    }

    /// Run until shutdown, resubscribing across disconnects
    pub async fn run(mut self) {
        let config = self.ctx.config.reconciler.clone();
        let mut consecutive_failures: u32 = 0;
        let mut force_full_resync = false;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let since = self.resume_from(force_full_resync);
            force_full_resync = false;

            let subscription = tokio::select! {
                result = self.ctx.remote.subscribe(&self.conversation_id, since) => result,
                _ = self.shutdown.changed() => continue,
            };

            let mut subscription = match subscription {
                Ok(subscription) => {
                    consecutive_failures = 0;
                    subscription
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(conversation = %self.conversation_id, error = %e,
                          failures = consecutive_failures, "subscribe failed");
                    if consecutive_failures >= config.max_listener_restarts {
                        // Escalate: the cursor may be the problem
                        force_full_resync = true;
                        consecutive_failures = 0;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(config.listener_restart_backoff) => {}
                        _ = self.shutdown.changed() => {}
                    }
                    continue;
                }
            };

            debug!(conversation = %self.conversation_id, resumed = since.is_some(),
                   "subscription established");

            let mut received_any = false;
            loop {
                tokio::select! {
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() {
                            return;
                        }
                    }
                    event = subscription.next_event() => match event {
                        Some(Ok(event)) => {
                            received_any = true;
                            // Actor gone means the conversation closed
                            if self.merge_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            // Decode anomalies and stream faults surface
                            // here; never crash, resubscribe from the cursor
                            warn!(conversation = %self.conversation_id, error = %e,
                                  "listener fault, resubscribing");
                            break;
                        }
                        None => {
                            debug!(conversation = %self.conversation_id,
                                   "subscription ended, resubscribing");
                            break;
                        }
                    }
                }
            }

            // A stream that dies before delivering anything would otherwise
            // make this loop spin
            if !received_any {
                tokio::select! {
                    _ = tokio::time::sleep(config.listener_restart_backoff) => {}
                    _ = self.shutdown.changed() => {}
                }
            }
        }
    }
}
