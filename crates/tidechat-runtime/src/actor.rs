//! Per-conversation actor
//!
//! All mutations to one conversation's state - optimistic sends, remote
//! merges, receipt application, read sweeps - are serialized through this
//! actor's loop; different conversations proceed fully concurrently. The
//! suspension points are exactly the asynchronous boundaries: remote
//! dispatch, subscription delivery, and storage I/O. Closing the
//! conversation stops its subscription but in-flight sends run to
//! completion, retries included.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use tidechat_core::channel::{publish, AppEvent};
use tidechat_core::dedup::RecentIdCache;
use tidechat_core::errors::{PermissionError, Result, SyncError};
use tidechat_core::message::{LastMessageSnapshot, Message, MessageStatus};
use tidechat_core::presence::{TypingDebouncer, TypingWrite};
use tidechat_core::reconcile::{
    MergeOutcome, RemoteAck, RemoteEvent, RemoteMessage, RemoteReceipt, TypingSignal,
};
use tidechat_core::retry::{backoff_delay, QueuedSend, SendQueue};
use tidechat_core::status::{self, ReceiptKind, ReceiptLedger, Transition};
use tidechat_core::types::{CanonicalId, ConversationId, CorrelationId, Timestamp};

use crate::context::SessionContext;
use crate::presence::PresenceChannel;
use crate::reconciler::ReconcilerTask;

// ----------------------------------------------------------------------------
// Actor Commands
// ----------------------------------------------------------------------------

/// Control messages from the engine facade to one conversation's actor
pub(crate) enum ActorCommand {
    Send {
        body: String,
        reply: oneshot::Sender<Result<Message>>,
    },
    RetryMessage {
        correlation_id: CorrelationId,
        reply: oneshot::Sender<Result<()>>,
    },
    MarkRead {
        reply: oneshot::Sender<Result<usize>>,
    },
    SetFocused {
        focused: bool,
    },
    SetTyping {
        is_typing: bool,
    },
    Connectivity {
        online: bool,
    },
    Foregrounded,
    Close,
}

/// Handle the engine keeps per open conversation
pub(crate) struct ActorHandle {
    pub commands: mpsc::Sender<ActorCommand>,
    pub join: JoinHandle<()>,
}

/// Spawn the actor and its reconciler for one conversation
pub(crate) fn spawn_conversation_actor(
    ctx: Arc<SessionContext>,
    presence: Arc<PresenceChannel>,
    conversation_id: ConversationId,
    online: bool,
) -> ActorHandle {
    let (command_tx, command_rx) = mpsc::channel(ctx.config.channels.command_buffer_size);
    let (merge_tx, merge_rx) = mpsc::channel(ctx.config.reconciler.event_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = ReconcilerTask::new(
        Arc::clone(&ctx),
        conversation_id.clone(),
        merge_tx,
        shutdown_rx,
    );
    let reconciler_span = info_span!("reconciler", conversation = %conversation_id);
    tokio::spawn(reconciler.run().instrument(reconciler_span));

    let dedup_capacity = ctx.config.reconciler.dedup_cache_size;
    let actor = ConversationActor {
        ctx,
        presence,
        conversation_id: conversation_id.clone(),
        commands: command_rx,
        merge_events: merge_rx,
        reconciler_shutdown: shutdown_tx,
        dedup: RecentIdCache::new(dedup_capacity),
        queue: SendQueue::new(),
        receipts: ReceiptLedger::new(dedup_capacity),
        debouncer: TypingDebouncer::new(),
        online,
        focused: false,
        closing: false,
        commands_open: true,
        merge_open: true,
    };
    let actor_span = info_span!("conversation_actor", conversation = %conversation_id);
    let join = tokio::spawn(actor.run().instrument(actor_span));

    ActorHandle {
        commands: command_tx,
        join,
    }
}

// ----------------------------------------------------------------------------
// Conversation Actor
// ----------------------------------------------------------------------------

struct ConversationActor {
    ctx: Arc<SessionContext>,
    presence: Arc<PresenceChannel>,
    conversation_id: ConversationId,
    commands: mpsc::Receiver<ActorCommand>,
    merge_events: mpsc::Receiver<RemoteEvent>,
    reconciler_shutdown: watch::Sender<bool>,
    /// Absorbs replayed listener events before they hit the store
    dedup: RecentIdCache,
    /// FIFO offline queue for this conversation
    queue: SendQueue,
    /// Receipts this client already emitted
    receipts: ReceiptLedger,
    /// Local keystroke debouncer
    debouncer: TypingDebouncer,
    online: bool,
    focused: bool,
    closing: bool,
    commands_open: bool,
    merge_open: bool,
}

impl ConversationActor {
    async fn run(mut self) {
        info!("conversation actor starting");
        self.restore_pending();

        let mut typing_tick = tokio::time::interval(self.ctx.config.presence.sweep_interval);
        typing_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.closing {
                if self.queue.is_empty() {
                    break;
                }
                if !self.commands_open && !self.online {
                    // No signal can arrive anymore; the queue is durable in
                    // the store and redrives on the next launch
                    warn!(pending = self.queue.len(), "closing with pending sends");
                    break;
                }
            }

            let redrive_delay = if self.online {
                self.queue.next_deadline().map(|deadline| {
                    core::time::Duration::from_millis(deadline - self.ctx.now())
                })
            } else {
                None
            };

            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.commands_open = false;
                        self.begin_close();
                    }
                },
                event = self.merge_events.recv(), if self.merge_open && !self.closing => match event {
                    Some(event) => self.handle_remote_event(event).await,
                    None => self.merge_open = false,
                },
                _ = tokio::time::sleep(redrive_delay.unwrap_or_default()),
                    if redrive_delay.is_some() =>
                {
                    self.drain_queue().await;
                }
                _ = typing_tick.tick() => {
                    let now = self.ctx.now();
                    if let Some(write) = self.debouncer.tick(now, &self.ctx.config.presence) {
                        self.publish_typing_write(write).await;
                    }
                }
            }
        }
        info!("conversation actor stopped");
    }

    /// Re-arm the offline queue from the durable store after a relaunch
    fn restore_pending(&mut self) {
        match self.ctx.store.pending_messages(&self.conversation_id) {
            Ok(pending) => {
                let now = self.ctx.now();
                for message in pending {
                    // Failed messages wait for the manual retry affordance
                    if message.status == MessageStatus::Sending {
                        self.queue.push(QueuedSend::immediate(message.correlation_id, now));
                    }
                }
                if !self.queue.is_empty() {
                    info!(count = self.queue.len(), "restored pending sends");
                }
            }
            Err(e) => warn!(error = %e, "failed to restore pending sends"),
        }
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: ActorCommand) {
        match command {
            ActorCommand::Send { body, reply } => {
                let result = self.handle_send(body).await;
                let dispatch = result.is_ok();
                let _ = reply.send(result);
                if dispatch {
                    self.drain_queue().await;
                }
            }
            ActorCommand::RetryMessage {
                correlation_id,
                reply,
            } => {
                let result = self.handle_retry(correlation_id);
                let dispatch = result.is_ok();
                let _ = reply.send(result);
                if dispatch {
                    self.drain_queue().await;
                }
            }
            ActorCommand::MarkRead { reply } => {
                let result = self.handle_mark_read().await;
                let _ = reply.send(result);
            }
            ActorCommand::SetFocused { focused } => {
                self.focused = focused;
                if focused {
                    // Everything in view becomes read
                    if let Err(e) = self.handle_mark_read().await {
                        warn!(error = %e, "read sweep on focus failed");
                    }
                }
            }
            ActorCommand::SetTyping { is_typing } => {
                let write = if is_typing {
                    let now = self.ctx.now();
                    self.debouncer.on_input(now)
                } else {
                    self.debouncer.on_send()
                };
                if let Some(write) = write {
                    self.publish_typing_write(write).await;
                }
            }
            ActorCommand::Connectivity { online } => {
                if online != self.online {
                    info!(online, "connectivity changed");
                }
                self.online = online;
                if online {
                    let now = self.ctx.now();
                    self.queue.release_all(now);
                    self.drain_queue().await;
                }
            }
            ActorCommand::Foregrounded => {
                let now = self.ctx.now();
                self.queue.release_all(now);
                self.drain_queue().await;
            }
            ActorCommand::Close => {
                if let Some(write) = self.debouncer.on_send() {
                    self.publish_typing_write(write).await;
                }
                self.begin_close();
            }
        }
    }

    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        info!(pending = self.queue.len(), "closing conversation");
        self.closing = true;
        // Stop the subscription; in-flight sends keep running
        let _ = self.reconciler_shutdown.send(true);
    }

    /// Optimistic local write: durable, then visible, then dispatched
    async fn handle_send(&mut self, body: String) -> Result<Message> {
        if self.closing {
            return Err(SyncError::ShuttingDown);
        }
        if body.trim().is_empty() {
            return Err(PermissionError::InvalidMessage {
                reason: "message body is empty".to_string(),
            }
            .into());
        }
        let now = self.ctx.now();

        if let Some(conversation) = self.ctx.store.conversation(&self.conversation_id)? {
            if !conversation.has_participant(&self.ctx.current_user) {
                return Err(PermissionError::NotParticipant {
                    conversation_id: self.conversation_id.clone(),
                }
                .into());
            }
        }

        let message = Message::local(
            self.conversation_id.clone(),
            self.ctx.current_user.clone(),
            body,
            now,
        );

        // Write-before-render: nothing is published until this returns
        self.ctx.store.put(&message)?;
        self.publish_upsert(&message);
        self.refresh_snapshot(&message);

        if let Some(write) = self.debouncer.on_send() {
            self.publish_typing_write(write).await;
        }

        self.queue.push(QueuedSend::immediate(message.correlation_id, now));
        Ok(message)
    }

    fn handle_retry(&mut self, correlation_id: CorrelationId) -> Result<()> {
        let message = self
            .ctx
            .store
            .get(&self.conversation_id, &correlation_id)?
            .ok_or_else(|| SyncError::UnknownMessage {
                conversation_id: self.conversation_id.clone(),
                correlation_id,
            })?;

        if message.status != MessageStatus::Failed {
            return Err(SyncError::InvalidTransition {
                from: message.status,
                to: MessageStatus::Sending,
            });
        }

        self.ctx
            .store
            .update_status(&self.conversation_id, &correlation_id, MessageStatus::Sending)?;
        if let Some(updated) = self.ctx.store.get(&self.conversation_id, &correlation_id)? {
            self.publish_upsert(&updated);
        }
        self.queue
            .push(QueuedSend::immediate(correlation_id, self.ctx.now()));
        Ok(())
    }

    async fn handle_mark_read(&mut self) -> Result<usize> {
        let now = self.ctx.now();
        let reader = self.ctx.current_user.clone();
        let updated = self
            .ctx
            .store
            .mark_conversation_read(&self.conversation_id, &reader, now)?;
        let count = updated.len();

        for message in updated {
            self.publish_upsert(&message);
            if let Some(canonical) = message.canonical_id.clone() {
                self.send_receipt(ReceiptKind::Read, canonical, now).await;
            }
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Offline queue redrive
    // ------------------------------------------------------------------

    async fn drain_queue(&mut self) {
        if !self.online {
            return;
        }
        while let Some(mut entry) = self.queue.pop_ready(self.ctx.now()) {
            let message = match self.ctx.store.get(&self.conversation_id, &entry.correlation_id) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "queued message unreadable, skipping");
                    continue;
                }
            };
            // The listener may have confirmed it before the redrive ran
            if message.is_confirmed() {
                continue;
            }

            entry.attempts += 1;
            let outcome = self
                .ctx
                .remote
                .put(
                    &self.conversation_id,
                    entry.correlation_id,
                    &self.ctx.current_user,
                    &message.body,
                )
                .await;

            match outcome {
                Ok(ack) => self.apply_ack(&entry.correlation_id, ack),
                Err(SyncError::Conflict { canonical_id, .. }) => {
                    // An ambiguous earlier attempt actually landed; the
                    // listener echo carries the authoritative record
                    debug!(%canonical_id, "dispatch conflict treated as applied");
                }
                Err(e) if e.is_transient() => {
                    if entry.attempts >= self.ctx.config.retry.max_retries {
                        self.mark_send_failed(&entry.correlation_id, &e);
                    } else {
                        let delay = backoff_delay(
                            &self.ctx.config.retry,
                            &entry.correlation_id,
                            entry.attempts,
                        );
                        debug!(attempt = entry.attempts, delay_ms = delay.as_millis() as u64,
                               "transient dispatch failure, backing off");
                        entry.not_before = self.ctx.now().add_duration(delay);
                        self.queue.requeue_front(entry);
                        // Head of line blocks: later messages never overtake
                        break;
                    }
                }
                Err(e) => self.mark_send_failed(&entry.correlation_id, &e),
            }
        }
    }

    fn apply_ack(&mut self, correlation_id: &CorrelationId, ack: RemoteAck) {
        match self.ctx.store.apply_confirmation(
            &self.conversation_id,
            correlation_id,
            ack.canonical_id.clone(),
            ack.server_timestamp,
        ) {
            Ok(message) => {
                // The subscription echo of our own message is a replay
                self.dedup.observe(&ack.canonical_id);
                self.publish_upsert(&message);
                publish(
                    &self.ctx.app_events,
                    AppEvent::MessageStatusChanged {
                        conversation_id: self.conversation_id.clone(),
                        correlation_id: *correlation_id,
                        status: message.status,
                    },
                );
                self.refresh_snapshot(&message);
            }
            Err(e) => error!(error = %e, "failed to apply dispatch ack"),
        }
    }

    fn mark_send_failed(&mut self, correlation_id: &CorrelationId, cause: &SyncError) {
        warn!(%correlation_id, error = %cause, "send failed");
        match self
            .ctx
            .store
            .update_status(&self.conversation_id, correlation_id, MessageStatus::Failed)
        {
            Ok(Transition::Applied) => {
                if let Ok(Some(message)) =
                    self.ctx.store.get(&self.conversation_id, correlation_id)
                {
                    self.publish_upsert(&message);
                }
                publish(
                    &self.ctx.app_events,
                    AppEvent::SendFailed {
                        conversation_id: self.conversation_id.clone(),
                        correlation_id: *correlation_id,
                        terminal: true,
                        reason: cause.to_string(),
                    },
                );
            }
            Ok(Transition::Ignored) => {}
            Err(e) => error!(error = %e, "failed to record send failure"),
        }
    }

    // ------------------------------------------------------------------
    // Remote event handling
    // ------------------------------------------------------------------

    async fn handle_remote_event(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Message(remote) => self.merge_remote_message(remote).await,
            RemoteEvent::Receipt(receipt) => self.apply_receipt(receipt),
            RemoteEvent::Typing(signal) => {
                if signal.user_id != self.ctx.current_user {
                    self.presence.apply_signal(&signal);
                }
            }
        }
    }

    async fn merge_remote_message(&mut self, remote: RemoteMessage) {
        if !self.dedup.observe(&remote.canonical_id) {
            debug!(canonical_id = %remote.canonical_id, "replayed listener event suppressed");
            return;
        }

        let (outcome, message) = match self.ctx.store.apply_remote(&remote) {
            Ok(merged) => merged,
            Err(e) => {
                error!(error = %e, "remote merge failed");
                return;
            }
        };

        match outcome {
            MergeOutcome::Duplicate => {}
            MergeOutcome::ConfirmedLocal => {
                // Confirmed through the listener before (or instead of) the
                // dispatch ack; drop any queued redrive
                self.queue.remove(&message.correlation_id);
                self.publish_upsert(&message);
                publish(
                    &self.ctx.app_events,
                    AppEvent::MessageStatusChanged {
                        conversation_id: self.conversation_id.clone(),
                        correlation_id: message.correlation_id,
                        status: message.status,
                    },
                );
                self.refresh_snapshot(&message);
            }
            MergeOutcome::Inserted => {
                self.publish_upsert(&message);
                self.refresh_snapshot(&message);
                if message.sender_id != self.ctx.current_user {
                    self.acknowledge_incoming(&message).await;
                    publish(
                        &self.ctx.app_events,
                        AppEvent::IncomingMessage {
                            conversation_id: self.conversation_id.clone(),
                            correlation_id: message.correlation_id,
                            sender_id: message.sender_id.clone(),
                            focused: self.focused,
                        },
                    );
                }
            }
        }
    }

    /// Recipient-side acknowledgement of a newly inserted incoming message
    async fn acknowledge_incoming(&mut self, message: &Message) {
        let Some(canonical) = message.canonical_id.clone() else {
            return;
        };
        let now = self.ctx.now();
        let me = self.ctx.current_user.clone();

        match self
            .ctx
            .store
            .record_delivered(&self.conversation_id, &canonical, &me, now)
        {
            Ok(Some(updated)) => self.publish_upsert(&updated),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to record own delivery"),
        }
        self.send_receipt(ReceiptKind::Delivered, canonical.clone(), now)
            .await;

        if self.focused {
            match self
                .ctx
                .store
                .record_read(&self.conversation_id, &canonical, &me, now)
            {
                Ok(Some(updated)) => self.publish_upsert(&updated),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to record own read"),
            }
            self.send_receipt(ReceiptKind::Read, canonical, now).await;
        }
    }

    async fn send_receipt(&mut self, kind: ReceiptKind, canonical_id: CanonicalId, at: Timestamp) {
        if !self.receipts.should_send(kind, &canonical_id) {
            return;
        }
        let receipt = RemoteReceipt {
            conversation_id: self.conversation_id.clone(),
            canonical_id: canonical_id.clone(),
            user_id: self.ctx.current_user.clone(),
            kind,
            timestamp: at,
        };
        match self.ctx.remote.send_receipt(receipt).await {
            Ok(()) => self.receipts.mark_sent(kind, canonical_id),
            Err(e) => warn!(error = %e, "receipt send failed"),
        }
    }

    fn apply_receipt(&mut self, receipt: RemoteReceipt) {
        let result = match receipt.kind {
            ReceiptKind::Delivered => self.ctx.store.record_delivered(
                &receipt.conversation_id,
                &receipt.canonical_id,
                &receipt.user_id,
                receipt.timestamp,
            ),
            ReceiptKind::Read => self.ctx.store.record_read(
                &receipt.conversation_id,
                &receipt.canonical_id,
                &receipt.user_id,
                receipt.timestamp,
            ),
        };

        let updated = match result {
            Ok(Some(updated)) => updated,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to apply receipt");
                return;
            }
        };

        self.publish_upsert(&updated);
        if updated.sender_id == self.ctx.current_user {
            self.recompute_aggregate(&updated);
        }
    }

    /// Advance the sender-visible status from the per-recipient maps
    fn recompute_aggregate(&mut self, message: &Message) {
        let conversation = match self.ctx.store.conversation(&self.conversation_id) {
            Ok(Some(conversation)) => conversation,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "conversation lookup failed");
                return;
            }
        };

        let target = status::aggregate_status(message, &conversation);
        if target == message.status {
            return;
        }
        match self
            .ctx
            .store
            .update_status(&self.conversation_id, &message.correlation_id, target)
        {
            Ok(Transition::Applied) => publish(
                &self.ctx.app_events,
                AppEvent::MessageStatusChanged {
                    conversation_id: self.conversation_id.clone(),
                    correlation_id: message.correlation_id,
                    status: target,
                },
            ),
            Ok(Transition::Ignored) => {}
            Err(e) => warn!(error = %e, "aggregate status update failed"),
        }
    }

    // ------------------------------------------------------------------
    // Publishing helpers
    // ------------------------------------------------------------------

    fn publish_upsert(&self, message: &Message) {
        publish(
            &self.ctx.app_events,
            AppEvent::MessageUpserted {
                message: message.clone(),
            },
        );
    }

    /// Keep the denormalized conversation snapshot current
    fn refresh_snapshot(&self, message: &Message) {
        match self
            .ctx
            .store
            .upsert_conversation_snapshot(&self.conversation_id, LastMessageSnapshot::of(message))
        {
            Ok(Some(conversation)) => publish(
                &self.ctx.app_events,
                AppEvent::ConversationUpdated { conversation },
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "snapshot update failed"),
        }
    }

    async fn publish_typing_write(&mut self, write: TypingWrite) {
        let now = self.ctx.now();
        let (is_typing, expires_at) = match write {
            TypingWrite::Start => (
                true,
                now.add_duration(self.ctx.config.presence.typing_ttl),
            ),
            TypingWrite::Stop => (false, now),
        };
        let signal = TypingSignal {
            conversation_id: self.conversation_id.clone(),
            user_id: self.ctx.current_user.clone(),
            is_typing,
            expires_at,
        };
        if let Err(e) = self.ctx.remote.publish_typing(signal).await {
            warn!(error = %e, "typing publish failed");
        }
    }
}
