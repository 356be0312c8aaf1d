//! Engine facade and builder
//!
//! `SyncEngine` is the public surface of the runtime: it owns the registry
//! of per-conversation actors, fans connectivity/foreground transitions out
//! to them, and exposes the read API over the local store. Everything it
//! needs is injected through the builder - there are no process-wide
//! globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use tidechat_core::channel::{create_app_event_channel, publish, AppEvent, AppEventReceiver};
use tidechat_core::config::SyncConfig;
use tidechat_core::errors::{Result, SyncError};
use tidechat_core::message::{Conversation, ConversationKind, Message};
use tidechat_core::store::{LocalStore, StoreStats};
use tidechat_core::types::{ConversationId, CorrelationId, SystemTimeSource, TimeSource, UserId};

use crate::actor::{spawn_conversation_actor, ActorCommand, ActorHandle};
use crate::context::SessionContext;
use crate::presence::PresenceChannel;
use crate::remote::RemoteStore;

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for a `SyncEngine`
pub struct SyncEngineBuilder {
    config: SyncConfig,
    current_user: Option<UserId>,
    remote: Option<Arc<dyn RemoteStore>>,
    time: Option<Arc<dyn TimeSource>>,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            current_user: None,
            remote: None,
            time: None,
        }
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject the session identity from the identity provider
    pub fn with_current_user(mut self, user: UserId) -> Self {
        self.current_user = Some(user);
        self
    }

    /// Inject the remote authoritative store
    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Override the clock (tests)
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    /// Validate, open the store, and start the engine
    ///
    /// Must run inside a Tokio runtime: the presence sweeper is spawned
    /// here, and conversation actors are spawned as conversations open.
    pub fn build(self) -> Result<SyncEngine> {
        self.config
            .validate()
            .map_err(|reason| SyncError::Configuration { reason })?;

        let current_user = self.current_user.ok_or(SyncError::Configuration {
            reason: "current user is required".to_string(),
        })?;
        let remote = self.remote.ok_or(SyncError::Configuration {
            reason: "remote store is required".to_string(),
        })?;
        let time: Arc<dyn TimeSource> = self
            .time
            .unwrap_or_else(|| Arc::new(SystemTimeSource::new()));

        let store = Arc::new(LocalStore::open(&self.config.store)?);
        // The initial receiver is dropped; observers subscribe on demand
        let (app_events, _initial_receiver) = create_app_event_channel(&self.config.channels);

        let ctx = Arc::new(SessionContext {
            current_user,
            config: self.config,
            store,
            remote,
            app_events,
            time: Arc::clone(&time),
        });

        let presence = Arc::new(PresenceChannel::new(ctx.app_events.clone(), time));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper =
            presence.spawn_sweeper(ctx.config.presence.sweep_interval, shutdown_rx);

        info!(user = %ctx.current_user, "sync engine started");
        Ok(SyncEngine {
            ctx,
            presence,
            actors: DashMap::new(),
            online: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            sweeper: std::sync::Mutex::new(Some(sweeper)),
        })
    }
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// The local-first message synchronization engine for one user session
pub struct SyncEngine {
    ctx: Arc<SessionContext>,
    presence: Arc<PresenceChannel>,
    actors: DashMap<ConversationId, ActorHandle>,
    online: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("online", &self.online)
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create a builder
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    /// Subscribe to state-change events (UI, notification dispatcher)
    pub fn subscribe(&self) -> AppEventReceiver {
        self.ctx.app_events.subscribe()
    }

    /// The signed-in user this engine syncs for
    pub fn current_user(&self) -> &UserId {
        &self.ctx.current_user
    }

    // ------------------------------------------------------------------
    // Conversation lifecycle
    // ------------------------------------------------------------------

    /// Register (or replace) a conversation record
    pub fn create_conversation(
        &self,
        id: ConversationId,
        kind: ConversationKind,
        participants: impl IntoIterator<Item = UserId>,
    ) -> Result<Conversation> {
        let conversation = Conversation::new(id, kind, participants);
        self.ctx.store.upsert_conversation(&conversation)?;
        publish(
            &self.ctx.app_events,
            AppEvent::ConversationUpdated {
                conversation: conversation.clone(),
            },
        );
        Ok(conversation)
    }

    /// Append a participant to a group conversation
    ///
    /// Direct conversations have immutable membership; the call is a no-op
    /// for them and for already-present users.
    pub fn add_participant(
        &self,
        conversation_id: &ConversationId,
        user: UserId,
    ) -> Result<Conversation> {
        let mut conversation = self
            .ctx
            .store
            .conversation(conversation_id)?
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.clone()))?;
        if conversation.add_participant(user) {
            self.ctx.store.upsert_conversation(&conversation)?;
            publish(
                &self.ctx.app_events,
                AppEvent::ConversationUpdated {
                    conversation: conversation.clone(),
                },
            );
        }
        Ok(conversation)
    }

    /// Open a conversation: spawn its actor and subscription if not running
    pub fn open_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.ensure_actor(conversation_id).map(|_| ())
    }

    /// Close a conversation: the subscription stops, in-flight sends run to
    /// completion in the background
    pub async fn close_conversation(&self, conversation_id: &ConversationId) {
        if let Some((_, handle)) = self.actors.remove(conversation_id) {
            let _ = handle.commands.send(ActorCommand::Close).await;
        }
    }

    fn ensure_actor(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<tokio::sync::mpsc::Sender<ActorCommand>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        let entry = self
            .actors
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                spawn_conversation_actor(
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.presence),
                    conversation_id.clone(),
                    self.online.load(Ordering::SeqCst),
                )
            });
        Ok(entry.commands.clone())
    }

    async fn send_command(
        &self,
        conversation_id: &ConversationId,
        command: ActorCommand,
    ) -> Result<()> {
        let sender = self.ensure_actor(conversation_id)?;
        sender.send(command).await.map_err(|_| SyncError::Channel {
            reason: "conversation actor stopped".to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Messaging API
    // ------------------------------------------------------------------

    /// Send a message
    ///
    /// Completes once the message is durably local-pending and visible to
    /// observers; remote dispatch continues in the background and never
    /// blocks this call.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        body: impl Into<String>,
    ) -> Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(
            conversation_id,
            ActorCommand::Send {
                body: body.into(),
                reply: reply_tx,
            },
        )
        .await?;
        reply_rx.await.map_err(|_| SyncError::Channel {
            reason: "send reply dropped".to_string(),
        })?
    }

    /// Manually retry a permanently failed message
    pub async fn retry_message(
        &self,
        conversation_id: &ConversationId,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(
            conversation_id,
            ActorCommand::RetryMessage {
                correlation_id,
                reply: reply_tx,
            },
        )
        .await?;
        reply_rx.await.map_err(|_| SyncError::Channel {
            reason: "retry reply dropped".to_string(),
        })?
    }

    /// Record read receipts for every unread incoming message
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(conversation_id, ActorCommand::MarkRead { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| SyncError::Channel {
            reason: "mark-read reply dropped".to_string(),
        })?
    }

    /// Tell the engine whether the conversation is visually active;
    /// focusing runs a read sweep
    pub async fn set_focused(&self, conversation_id: &ConversationId, focused: bool) -> Result<()> {
        self.send_command(conversation_id, ActorCommand::SetFocused { focused })
            .await
    }

    /// Debounced typing indicator input
    pub async fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool) -> Result<()> {
        self.send_command(conversation_id, ActorCommand::SetTyping { is_typing })
            .await
    }

    // ------------------------------------------------------------------
    // Environment transitions
    // ------------------------------------------------------------------

    /// Connectivity changed; regaining it redrives every offline queue
    pub async fn notify_connectivity(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        for (conversation_id, sender) in self.actor_senders() {
            if sender
                .send(ActorCommand::Connectivity { online })
                .await
                .is_err()
            {
                warn!(conversation = %conversation_id, "actor unreachable for connectivity change");
            }
        }
    }

    /// App moved to the foreground; redrives every offline queue
    pub async fn notify_foregrounded(&self) {
        for (_, sender) in self.actor_senders() {
            let _ = sender.send(ActorCommand::Foregrounded).await;
        }
    }

    /// Snapshot the command senders so no map lock is held across awaits
    fn actor_senders(&self) -> Vec<(ConversationId, tokio::sync::mpsc::Sender<ActorCommand>)> {
        self.actors
            .iter()
            .map(|entry| (entry.key().clone(), entry.commands.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Read API (local store; AI/search features consume these read-only)
    // ------------------------------------------------------------------

    /// Ordered messages of a conversation
    pub fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.ctx.store.get_ordered(conversation_id)
    }

    /// All conversations, most recently active first
    pub fn conversations(&self) -> Result<Vec<Conversation>> {
        self.ctx.store.conversations()
    }

    /// Unread incoming messages for the current user
    pub fn unread_count(&self, conversation_id: &ConversationId) -> Result<usize> {
        self.ctx
            .store
            .unread_count(conversation_id, &self.ctx.current_user)
    }

    /// Users currently typing in a conversation
    pub fn typists(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.presence.typists(conversation_id)
    }

    /// Store diagnostics
    pub fn store_stats(&self) -> StoreStats {
        self.ctx.store.stats()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop all actors (draining in-flight sends) and the presence sweeper
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("sync engine shutting down");

        let handles: Vec<(ConversationId, ActorHandle)> = {
            let keys: Vec<ConversationId> =
                self.actors.iter().map(|e| e.key().clone()).collect();
            keys.into_iter()
                .filter_map(|k| self.actors.remove(&k))
                .collect()
        };
        for (conversation_id, handle) in handles {
            let ActorHandle { commands, join } = handle;
            let _ = commands.send(ActorCommand::Close).await;
            // Dropping the sender lets an offline actor with pending sends
            // finish closing instead of waiting for signals that cannot come
            drop(commands);
            if let Err(e) = join.await {
                warn!(conversation = %conversation_id, error = %e, "actor join failed");
            }
        }

        let _ = self.shutdown_tx.send(true);
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tidechat_core::reconcile::{RemoteAck, RemoteReceipt, TypingSignal};
    use tidechat_core::types::Timestamp;

    use crate::remote::Subscription;

    struct NullRemote;

    #[async_trait]
    impl RemoteStore for NullRemote {
        async fn put(
            &self,
            _conversation_id: &ConversationId,
            _correlation_id: CorrelationId,
            _sender_id: &UserId,
            _body: &str,
        ) -> Result<RemoteAck> {
            Err(SyncError::Network(
                tidechat_core::errors::NetworkError::Disconnected,
            ))
        }

        async fn subscribe(
            &self,
            _conversation_id: &ConversationId,
            _since: Option<Timestamp>,
        ) -> Result<Subscription> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(Subscription::new(rx))
        }

        async fn send_receipt(&self, _receipt: RemoteReceipt) -> Result<()> {
            Ok(())
        }

        async fn publish_typing(&self, _signal: TypingSignal) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_builder_requires_identity_and_remote() {
        let err = SyncEngine::builder().build().unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));

        let err = SyncEngine::builder()
            .with_current_user(UserId::new("alice"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let mut config = SyncConfig::testing();
        config.retry.max_retries = 0;

        let err = SyncEngine::builder()
            .with_config(config)
            .with_current_user(UserId::new("alice"))
            .with_remote(Arc::new(NullRemote))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_group_membership_is_append_only_through_engine() {
        let engine = SyncEngine::builder()
            .with_config(SyncConfig::testing())
            .with_current_user(UserId::new("alice"))
            .with_remote(Arc::new(NullRemote))
            .build()
            .unwrap();

        let conv = ConversationId::new("grp");
        engine
            .create_conversation(
                conv.clone(),
                ConversationKind::Group,
                [UserId::new("alice"), UserId::new("bob")],
            )
            .unwrap();

        let updated = engine
            .add_participant(&conv, UserId::new("carol"))
            .unwrap();
        assert_eq!(updated.participant_ids.len(), 3);

        // Direct conversations never grow
        let dm = ConversationId::new("dm");
        engine
            .create_conversation(
                dm.clone(),
                ConversationKind::Direct,
                [UserId::new("alice"), UserId::new("bob")],
            )
            .unwrap();
        let unchanged = engine.add_participant(&dm, UserId::new("carol")).unwrap();
        assert_eq!(unchanged.participant_ids.len(), 2);

        engine.shutdown().await;
    }
}
