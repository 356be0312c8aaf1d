//! Durable local message store
//!
//! SQLite-backed cache that is the sole source for cold-start rendering: a
//! `messages` table keyed by `(conversation_id, correlation_id)` with a
//! unique canonical-id index, and a `conversations` table holding the
//! denormalized last-message snapshot. An in-memory ordered timeline per
//! conversation serves `get_ordered` without re-querying SQLite and is
//! rebuilt from the tables on startup.
//!
//! Write-before-render: every mutation commits to SQLite before it returns,
//! so callers can only notify observers of state that survives a crash. A
//! storage failure fails the operation, never the process.

use std::path::Path;
use std::sync::Mutex;

use hashbrown::HashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::errors::{Result, StorageError, SyncError};
use crate::message::{
    Conversation, ConversationKind, LastMessageSnapshot, Message, MessageStatus,
};
use crate::reconcile::{MergeOutcome, RemoteMessage};
use crate::status::{self, Transition};
use crate::types::{CanonicalId, ConversationId, CorrelationId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Schema Migrations
// ----------------------------------------------------------------------------

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "
        CREATE TABLE messages (
            conversation_id TEXT NOT NULL,
            correlation_id  TEXT NOT NULL,
            canonical_id    TEXT,
            sender_id       TEXT NOT NULL,
            body            TEXT NOT NULL,
            client_ts       INTEGER NOT NULL,
            server_ts       INTEGER,
            status          TEXT NOT NULL,
            delivered_to    TEXT NOT NULL DEFAULT '{}',
            read_by         TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (conversation_id, correlation_id)
        );
        CREATE UNIQUE INDEX idx_messages_canonical
            ON messages (canonical_id) WHERE canonical_id IS NOT NULL;
        CREATE INDEX idx_messages_order
            ON messages (conversation_id, server_ts, client_ts);
        CREATE TABLE conversations (
            conversation_id TEXT PRIMARY KEY,
            kind            TEXT NOT NULL,
            participants    TEXT NOT NULL,
            last_message    TEXT
        );
    ",
}];

fn run_migrations(conn: &mut Connection) -> std::result::Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
    )?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
            row.get(0)
        })?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| StorageError::MigrationFailed {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version) VALUES (?1)",
            params![migration.version],
        )?;
        tx.commit()?;
        info!(version = migration.version, "applied store migration");
    }

    Ok(())
}

// ----------------------------------------------------------------------------
// Timeline
// ----------------------------------------------------------------------------

/// In-memory ordered view of one conversation's most recent messages
#[derive(Debug, Default)]
struct Timeline {
    /// Sorted by `Message::ordering_key`
    entries: Vec<Message>,
    /// Secondary index for receipt and duplicate lookups
    by_canonical: HashMap<CanonicalId, CorrelationId>,
}

impl Timeline {
    fn position(&self, correlation_id: &CorrelationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|m| m.correlation_id == *correlation_id)
    }

    fn sorted_insert_index(&self, message: &Message) -> usize {
        let key = message.ordering_key();
        self.entries
            .partition_point(|existing| existing.ordering_key() <= key)
    }

    /// Insert or update an entry, keeping the vector sorted. An update of an
    /// existing correlation id mutates that entry and shifts it to its new
    /// sorted position - the message itself is never duplicated.
    fn upsert(&mut self, message: Message) {
        if let Some(canonical) = &message.canonical_id {
            self.by_canonical
                .insert(canonical.clone(), message.correlation_id);
        }
        if let Some(idx) = self.position(&message.correlation_id) {
            self.entries.remove(idx);
        }
        let idx = self.sorted_insert_index(&message);
        self.entries.insert(idx, message);
    }

    fn get(&self, correlation_id: &CorrelationId) -> Option<&Message> {
        self.position(correlation_id).map(|idx| &self.entries[idx])
    }

    fn contains_canonical(&self, canonical_id: &CanonicalId) -> bool {
        self.by_canonical.contains_key(canonical_id)
    }

    fn evict_oldest_beyond(&mut self, cap: usize) {
        while self.entries.len() > cap {
            let evicted = self.entries.remove(0);
            if let Some(canonical) = &evicted.canonical_id {
                self.by_canonical.remove(canonical);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Store Statistics
// ----------------------------------------------------------------------------

/// Lightweight counters for diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub messages_stored: u64,
    pub confirmations_applied: u64,
    pub duplicates_suppressed: u64,
    pub receipts_recorded: u64,
}

// ----------------------------------------------------------------------------
// Local Store
// ----------------------------------------------------------------------------

struct StoreInner {
    conn: Connection,
    timelines: HashMap<ConversationId, Timeline>,
    conversations: HashMap<ConversationId, Conversation>,
    max_timeline_messages: usize,
    stats: StoreStats,
}

/// Durable, queryable local message cache
///
/// Shared across conversation actors behind an internal lock; the actors
/// guarantee single-writer-per-conversation, the lock guarantees readers a
/// consistent snapshot.
pub struct LocalStore {
    inner: Mutex<StoreInner>,
}

impl LocalStore {
    /// Open the store, running migrations and rebuilding the in-memory
    /// timelines from the tables (cold-start render source)
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let mut conn = match &config.database_path {
            Some(path) => {
                Connection::open(path).map_err(|e| StorageError::ConnectionFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                })?
            }
            None => Connection::open_in_memory().map_err(|e| StorageError::ConnectionFailed {
                path: Path::new(":memory:").to_path_buf(),
                reason: e.to_string(),
            })?,
        };

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(StorageError::from)?;

        run_migrations(&mut conn)?;

        let mut inner = StoreInner {
            conn,
            timelines: HashMap::new(),
            conversations: HashMap::new(),
            max_timeline_messages: config.max_timeline_messages,
            stats: StoreStats::default(),
        };
        inner.reload()?;

        info!(
            conversations = inner.conversations.len(),
            "local store opened"
        );
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // A poisoned lock means another thread panicked mid-write; the
        // SQLite state is still consistent, so continue with the data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Durably write a message (insert or full replace by correlation id)
    pub fn put(&self, message: &Message) -> Result<()> {
        let mut inner = self.lock();
        inner.persist_message(message)?;
        inner.cache_upsert(message.clone());
        inner.stats.messages_stored += 1;
        Ok(())
    }

    /// Fetch one message by its correlation id
    pub fn get(
        &self,
        conversation_id: &ConversationId,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Message>> {
        let inner = self.lock();
        if let Some(timeline) = inner.timelines.get(conversation_id) {
            if let Some(message) = timeline.get(correlation_id) {
                return Ok(Some(message.clone()));
            }
        }
        inner.load_message(conversation_id, correlation_id)
    }

    /// Fetch one message by its canonical id
    pub fn get_by_canonical(
        &self,
        conversation_id: &ConversationId,
        canonical_id: &CanonicalId,
    ) -> Result<Option<Message>> {
        let inner = self.lock();
        if let Some(timeline) = inner.timelines.get(conversation_id) {
            if let Some(correlation) = timeline.by_canonical.get(canonical_id) {
                return Ok(timeline.get(correlation).cloned());
            }
        }
        inner.load_message_by_canonical(canonical_id)
    }

    /// Ordered view of a conversation's recent messages
    ///
    /// Confirmed messages order by `(server_timestamp, canonical_id)`;
    /// pending messages sit at their insertion position until confirmed.
    pub fn get_ordered(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let inner = self.lock();
        Ok(inner
            .timelines
            .get(conversation_id)
            .map(|t| t.entries.clone())
            .unwrap_or_default())
    }

    /// Monotonically advance a message's status
    pub fn update_status(
        &self,
        conversation_id: &ConversationId,
        correlation_id: &CorrelationId,
        to: MessageStatus,
    ) -> Result<Transition> {
        let mut inner = self.lock();
        let mut message = inner
            .load_anywhere(conversation_id, correlation_id)?
            .ok_or_else(|| SyncError::UnknownMessage {
                conversation_id: conversation_id.clone(),
                correlation_id: *correlation_id,
            })?;

        let transition = status::apply_status(&mut message, to);
        if transition == Transition::Applied {
            inner.persist_message(&message)?;
            inner.cache_upsert(message);
        }
        Ok(transition)
    }

    /// Map a local-pending entry to its confirmed identity in place
    pub fn apply_confirmation(
        &self,
        conversation_id: &ConversationId,
        correlation_id: &CorrelationId,
        canonical_id: CanonicalId,
        server_timestamp: Timestamp,
    ) -> Result<Message> {
        let mut inner = self.lock();
        let mut message = inner
            .load_anywhere(conversation_id, correlation_id)?
            .ok_or_else(|| SyncError::UnknownMessage {
                conversation_id: conversation_id.clone(),
                correlation_id: *correlation_id,
            })?;

        message.confirm(canonical_id, server_timestamp);
        inner.persist_message(&message)?;
        inner.cache_upsert(message.clone());
        inner.stats.confirmations_applied += 1;
        Ok(message)
    }

    /// Merge one remote message snapshot
    ///
    /// Matching correlation id ⇒ confirm the local entry in place;
    /// unknown canonical id ⇒ insert as new; known canonical id ⇒ replay.
    pub fn apply_remote(&self, remote: &RemoteMessage) -> Result<(MergeOutcome, Message)> {
        let mut inner = self.lock();

        // Canonical id already applied: replayed listener event
        let already_applied = inner
            .timelines
            .get(&remote.conversation_id)
            .map(|t| t.contains_canonical(&remote.canonical_id))
            .unwrap_or(false)
            || inner.load_message_by_canonical(&remote.canonical_id)?.is_some();
        if already_applied {
            inner.stats.duplicates_suppressed += 1;
            let existing = inner
                .load_message_by_canonical(&remote.canonical_id)?
                .expect("canonical id was just observed");
            return Ok((MergeOutcome::Duplicate, existing));
        }

        // Local-pending counterpart: confirm in place, preserving identity
        if let Some(correlation_id) = remote.correlation_id {
            if let Some(mut message) =
                inner.load_anywhere(&remote.conversation_id, &correlation_id)?
            {
                message.confirm(remote.canonical_id.clone(), remote.server_timestamp);
                inner.persist_message(&message)?;
                inner.cache_upsert(message.clone());
                inner.stats.confirmations_applied += 1;
                return Ok((MergeOutcome::ConfirmedLocal, message));
            }
        }

        // New confirmed message from another device or participant
        let message = Message {
            correlation_id: remote.correlation_id.unwrap_or_else(CorrelationId::generate),
            canonical_id: Some(remote.canonical_id.clone()),
            conversation_id: remote.conversation_id.clone(),
            sender_id: remote.sender_id.clone(),
            body: remote.body.clone(),
            client_timestamp: remote.server_timestamp,
            server_timestamp: Some(remote.server_timestamp),
            status: MessageStatus::Sent,
            delivered_to: HashMap::new(),
            read_by: HashMap::new(),
        };
        inner.persist_message(&message)?;
        inner.cache_upsert(message.clone());
        inner.stats.messages_stored += 1;
        Ok((MergeOutcome::Inserted, message))
    }

    /// Append-only delivery receipt. Returns the updated message when the
    /// map changed, None for replays or unknown canonical ids.
    pub fn record_delivered(
        &self,
        conversation_id: &ConversationId,
        canonical_id: &CanonicalId,
        user: &UserId,
        at: Timestamp,
    ) -> Result<Option<Message>> {
        self.record_receipt(conversation_id, canonical_id, user, at, false)
    }

    /// Append-only read receipt (backfills delivery). Returns the updated
    /// message when the map changed.
    pub fn record_read(
        &self,
        conversation_id: &ConversationId,
        canonical_id: &CanonicalId,
        user: &UserId,
        at: Timestamp,
    ) -> Result<Option<Message>> {
        self.record_receipt(conversation_id, canonical_id, user, at, true)
    }

    fn record_receipt(
        &self,
        conversation_id: &ConversationId,
        canonical_id: &CanonicalId,
        user: &UserId,
        at: Timestamp,
        read: bool,
    ) -> Result<Option<Message>> {
        let mut inner = self.lock();
        let correlation = inner
            .timelines
            .get(conversation_id)
            .and_then(|t| t.by_canonical.get(canonical_id).copied());
        let mut message = match correlation {
            Some(c) => inner.load_anywhere(conversation_id, &c)?,
            None => inner.load_message_by_canonical(canonical_id)?,
        };
        let Some(message) = message.as_mut() else {
            debug!(%canonical_id, "receipt for unknown message dropped");
            return Ok(None);
        };

        let changed = if read {
            status::record_read(message, user, at)
        } else {
            status::record_delivered(message, user, at)
        };
        if !changed {
            return Ok(None);
        }

        inner.persist_message(message)?;
        inner.cache_upsert(message.clone());
        inner.stats.receipts_recorded += 1;
        Ok(Some(message.clone()))
    }

    /// Record a read receipt for every unread incoming message in one pass.
    /// Returns the messages that gained a `read_by` entry.
    pub fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
        at: Timestamp,
    ) -> Result<Vec<Message>> {
        let mut inner = self.lock();
        let mut updated = Vec::new();

        for mut message in inner.load_conversation(conversation_id)? {
            if message.sender_id == *reader || message.read_by.contains_key(reader) {
                continue;
            }
            if status::record_read(&mut message, reader, at) {
                inner.persist_message(&message)?;
                inner.cache_upsert(message.clone());
                inner.stats.receipts_recorded += 1;
                updated.push(message);
            }
        }
        Ok(updated)
    }

    /// Create or replace a conversation record
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut inner = self.lock();
        inner.persist_conversation(conversation)?;
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        inner.timelines.entry(conversation.id.clone()).or_default();
        Ok(())
    }

    /// Refresh the denormalized last-message snapshot
    pub fn upsert_conversation_snapshot(
        &self,
        conversation_id: &ConversationId,
        snapshot: LastMessageSnapshot,
    ) -> Result<Option<Conversation>> {
        let mut inner = self.lock();
        let Some(mut conversation) = inner.conversations.get(conversation_id).cloned() else {
            return Ok(None);
        };
        // Only move the snapshot forward in time
        if let Some(existing) = &conversation.last_message {
            if existing.timestamp > snapshot.timestamp {
                return Ok(None);
            }
        }
        conversation.last_message = Some(snapshot);
        inner.persist_conversation(&conversation)?;
        inner
            .conversations
            .insert(conversation_id.clone(), conversation.clone());
        Ok(Some(conversation))
    }

    /// Fetch a conversation record
    pub fn conversation(&self, conversation_id: &ConversationId) -> Result<Option<Conversation>> {
        Ok(self.lock().conversations.get(conversation_id).cloned())
    }

    /// All known conversations, most recently active first
    pub fn conversations(&self) -> Result<Vec<Conversation>> {
        let inner = self.lock();
        let mut all: Vec<Conversation> = inner.conversations.values().cloned().collect();
        all.sort_by(|a, b| {
            let at = a.last_message.as_ref().map(|s| s.timestamp);
            let bt = b.last_message.as_ref().map(|s| s.timestamp);
            bt.cmp(&at).then_with(|| a.id.cmp(&b.id))
        });
        Ok(all)
    }

    /// Messages still awaiting remote acknowledgement, in send order -
    /// the redrive source for the offline queue, surviving restarts
    pub fn pending_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let inner = self.lock();
        let mut pending: Vec<Message> = inner
            .load_conversation(conversation_id)?
            .into_iter()
            .filter(|m| matches!(m.status, MessageStatus::Sending | MessageStatus::Failed))
            .collect();
        pending.sort_by_key(|m| (m.client_timestamp, m.correlation_id.to_string()));
        Ok(pending)
    }

    /// Latest applied server timestamp - the resubscription cursor
    pub fn last_applied_server_timestamp(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Timestamp>> {
        let inner = self.lock();
        let max: Option<i64> = inner
            .conn
            .query_row(
                "SELECT MAX(server_ts) FROM messages WHERE conversation_id = ?1",
                params![conversation_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?
            .flatten();
        Ok(max.map(|ms| Timestamp::new(ms as u64)))
    }

    /// Incoming messages the user has not read yet
    pub fn unread_count(&self, conversation_id: &ConversationId, user: &UserId) -> Result<usize> {
        let inner = self.lock();
        Ok(inner
            .load_conversation(conversation_id)?
            .iter()
            .filter(|m| m.sender_id != *user && !m.read_by.contains_key(user))
            .count())
    }

    /// Diagnostic counters
    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }
}

// ----------------------------------------------------------------------------
// Inner Implementation
// ----------------------------------------------------------------------------

const MESSAGE_COLUMNS: &str = "correlation_id, canonical_id, conversation_id, sender_id, body, \
                               client_ts, server_ts, status, delivered_to, read_by";

impl StoreInner {
    fn reload(&mut self) -> Result<()> {
        self.conversations.clear();
        self.timelines.clear();

        let conversations = {
            let mut stmt = self.conn.prepare(
                "SELECT conversation_id, kind, participants, last_message FROM conversations",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, kind, participants, last_message) = row.map_err(StorageError::from)?;
                out.push(decode_conversation(id, kind, participants, last_message)?);
            }
            out
        };
        for conversation in conversations {
            self.timelines.entry(conversation.id.clone()).or_default();
            self.conversations.insert(conversation.id.clone(), conversation);
        }

        let ids: Vec<ConversationId> = self.conversations.keys().cloned().collect();
        for id in ids {
            let mut recent = self.load_recent(&id, self.max_timeline_messages)?;
            let timeline = self.timelines.entry(id).or_default();
            recent.sort_by_key(|m| m.ordering_key());
            for message in recent {
                timeline.upsert(message);
            }
        }
        Ok(())
    }

    fn persist_message(&self, message: &Message) -> Result<()> {
        let delivered = serde_json::to_string(&message.delivered_to)?;
        let read = serde_json::to_string(&message.read_by)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO messages (conversation_id, correlation_id, canonical_id, \
                 sender_id, body, client_ts, server_ts, status, delivered_to, read_by) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.conversation_id.as_str(),
                    message.correlation_id.to_string(),
                    message.canonical_id.as_ref().map(|c| c.as_str()),
                    message.sender_id.as_str(),
                    message.body,
                    message.client_timestamp.as_millis() as i64,
                    message.server_timestamp.map(|t| t.as_millis() as i64),
                    message.status.as_str(),
                    delivered,
                    read,
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn persist_conversation(&self, conversation: &Conversation) -> Result<()> {
        let participants = serde_json::to_string(&conversation.participant_ids)?;
        let last_message = conversation
            .last_message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO conversations (conversation_id, kind, participants, \
                 last_message) VALUES (?1, ?2, ?3, ?4)",
                params![
                    conversation.id.as_str(),
                    conversation.kind.as_str(),
                    participants,
                    last_message,
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn cache_upsert(&mut self, message: Message) {
        let cap = self.max_timeline_messages;
        let timeline = self
            .timelines
            .entry(message.conversation_id.clone())
            .or_default();
        timeline.upsert(message);
        timeline.evict_oldest_beyond(cap);
    }

    /// Cache lookup with SQLite fallback for entries evicted from the window
    fn load_anywhere(
        &self,
        conversation_id: &ConversationId,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Message>> {
        if let Some(message) = self
            .timelines
            .get(conversation_id)
            .and_then(|t| t.get(correlation_id))
        {
            return Ok(Some(message.clone()));
        }
        self.load_message(conversation_id, correlation_id)
    }

    fn load_message(
        &self,
        conversation_id: &ConversationId,
        correlation_id: &CorrelationId,
    ) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = ?1 AND correlation_id = ?2"
        );
        self.conn
            .query_row(
                &sql,
                params![conversation_id.as_str(), correlation_id.to_string()],
                row_to_message,
            )
            .optional()
            .map_err(StorageError::from)?
            .transpose()
    }

    fn load_message_by_canonical(&self, canonical_id: &CanonicalId) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE canonical_id = ?1");
        self.conn
            .query_row(&sql, params![canonical_id.as_str()], row_to_message)
            .optional()
            .map_err(StorageError::from)?
            .transpose()
    }

    fn load_conversation(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
             ORDER BY COALESCE(server_ts, client_ts), correlation_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id.as_str()], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(StorageError::from)??);
        }
        Ok(out)
    }

    fn load_recent(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
             ORDER BY COALESCE(server_ts, client_ts) DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit as i64],
            row_to_message,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(StorageError::from)??);
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// Row Decoding
// ----------------------------------------------------------------------------

type DecodedRow = std::result::Result<Message, SyncError>;

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecodedRow> {
    let correlation: String = row.get(0)?;
    let canonical: Option<String> = row.get(1)?;
    let conversation: String = row.get(2)?;
    let sender: String = row.get(3)?;
    let body: String = row.get(4)?;
    let client_ts: i64 = row.get(5)?;
    let server_ts: Option<i64> = row.get(6)?;
    let status: String = row.get(7)?;
    let delivered: String = row.get(8)?;
    let read: String = row.get(9)?;

    Ok(decode_message(
        correlation, canonical, conversation, sender, body, client_ts, server_ts, status,
        delivered, read,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_message(
    correlation: String,
    canonical: Option<String>,
    conversation: String,
    sender: String,
    body: String,
    client_ts: i64,
    server_ts: Option<i64>,
    status: String,
    delivered: String,
    read: String,
) -> DecodedRow {
    let corrupt = |reason: String| {
        SyncError::Storage(StorageError::CorruptRow {
            correlation_id: correlation.clone(),
            reason,
        })
    };

    let correlation_id: CorrelationId = correlation
        .parse()
        .map_err(|e: uuid::Error| corrupt(e.to_string()))?;
    let status = MessageStatus::parse(&status)
        .ok_or_else(|| corrupt(format!("unknown status `{status}`")))?;
    let delivered_to: HashMap<UserId, Timestamp> =
        serde_json::from_str(&delivered).map_err(|e| corrupt(e.to_string()))?;
    let read_by: HashMap<UserId, Timestamp> =
        serde_json::from_str(&read).map_err(|e| corrupt(e.to_string()))?;

    Ok(Message {
        correlation_id,
        canonical_id: canonical.map(CanonicalId::new),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new(sender),
        body,
        client_timestamp: Timestamp::new(client_ts as u64),
        server_timestamp: server_ts.map(|ms| Timestamp::new(ms as u64)),
        status,
        delivered_to,
        read_by,
    })
}

fn decode_conversation(
    id: String,
    kind: String,
    participants: String,
    last_message: Option<String>,
) -> Result<Conversation> {
    let kind = ConversationKind::parse(&kind).ok_or_else(|| {
        SyncError::Storage(StorageError::QueryFailed(format!(
            "conversation {id} has unknown kind `{kind}`"
        )))
    })?;
    let participant_ids: Vec<UserId> = serde_json::from_str(&participants)?;
    let last_message: Option<LastMessageSnapshot> = last_message
        .map(|json| serde_json::from_str(&json))
        .transpose()?;

    let mut conversation = Conversation::new(ConversationId::new(id), kind, participant_ids);
    conversation.last_message = last_message;
    Ok(conversation)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ConversationKind;

    fn open_store() -> LocalStore {
        LocalStore::open(&StoreConfig::testing()).unwrap()
    }

    fn seed_conversation(store: &LocalStore, id: &str, participants: &[&str]) -> ConversationId {
        let conv_id = ConversationId::new(id);
        let conversation = Conversation::new(
            conv_id.clone(),
            ConversationKind::Group,
            participants.iter().map(|p| UserId::new(*p)),
        );
        store.upsert_conversation(&conversation).unwrap();
        conv_id
    }

    fn local_message(conv: &ConversationId, sender: &str, body: &str, ts: u64) -> Message {
        Message::local(
            conv.clone(),
            UserId::new(sender),
            body.to_string(),
            Timestamp::new(ts),
        )
    }

    fn remote_message(
        conv: &ConversationId,
        canonical: &str,
        sender: &str,
        body: &str,
        server_ts: u64,
        correlation: Option<CorrelationId>,
    ) -> RemoteMessage {
        RemoteMessage {
            canonical_id: CanonicalId::new(canonical),
            correlation_id: correlation,
            conversation_id: conv.clone(),
            sender_id: UserId::new(sender),
            body: body.to_string(),
            server_timestamp: Timestamp::new(server_ts),
        }
    }

    #[test]
    fn test_put_then_get() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);
        let message = local_message(&conv, "alice", "hello", 1_000);

        store.put(&message).unwrap();
        let loaded = store.get(&conv, &message.correlation_id).unwrap().unwrap();
        assert_eq!(loaded, message);
    }

    #[test]
    fn test_get_ordered_interleaves_pending_at_insertion() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);

        // Confirmed message at server time 1000
        store
            .apply_remote(&remote_message(&conv, "srv-1", "bob", "first", 1_000, None))
            .unwrap();
        // Pending local message written at client time 2000
        let pending = local_message(&conv, "alice", "second", 2_000);
        store.put(&pending).unwrap();

        let ordered = store.get_ordered(&conv).unwrap();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].body, "first");
        assert_eq!(ordered[1].body, "second");
        assert_eq!(ordered[1].status, MessageStatus::Sending);
    }

    #[test]
    fn test_confirmation_repositions_in_place() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);

        let pending = local_message(&conv, "alice", "mine", 2_000);
        store.put(&pending).unwrap();
        store
            .apply_remote(&remote_message(&conv, "srv-2", "bob", "theirs", 5_000, None))
            .unwrap();

        // Server assigns an earlier timestamp than the peer's message
        store
            .apply_confirmation(
                &conv,
                &pending.correlation_id,
                CanonicalId::new("srv-1"),
                Timestamp::new(4_000),
            )
            .unwrap();

        let ordered = store.get_ordered(&conv).unwrap();
        assert_eq!(ordered.len(), 2, "confirmation must not duplicate the entry");
        assert_eq!(ordered[0].correlation_id, pending.correlation_id);
        assert_eq!(ordered[0].status, MessageStatus::Sent);
        assert_eq!(ordered[1].body, "theirs");
    }

    #[test]
    fn test_apply_remote_merge_rules() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);

        // Pending local entry confirmed by its own echo
        let pending = local_message(&conv, "alice", "hi", 1_000);
        store.put(&pending).unwrap();
        let echo = remote_message(&conv, "srv-1", "alice", "hi", 2_000, Some(pending.correlation_id));

        let (outcome, merged) = store.apply_remote(&echo).unwrap();
        assert_eq!(outcome, MergeOutcome::ConfirmedLocal);
        assert_eq!(merged.correlation_id, pending.correlation_id);

        // Replay of the same canonical id is suppressed
        let (outcome, _) = store.apply_remote(&echo).unwrap();
        assert_eq!(outcome, MergeOutcome::Duplicate);

        // Unknown canonical id inserts as new
        let (outcome, _) = store
            .apply_remote(&remote_message(&conv, "srv-2", "bob", "yo", 3_000, None))
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Inserted);

        assert_eq!(store.get_ordered(&conv).unwrap().len(), 2);
        assert_eq!(store.stats().duplicates_suppressed, 1);
    }

    #[test]
    fn test_status_update_is_monotonic() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);
        let message = local_message(&conv, "alice", "hi", 1_000);
        store.put(&message).unwrap();
        store
            .apply_confirmation(
                &conv,
                &message.correlation_id,
                CanonicalId::new("srv-1"),
                Timestamp::new(2_000),
            )
            .unwrap();

        assert_eq!(
            store
                .update_status(&conv, &message.correlation_id, MessageStatus::Delivered)
                .unwrap(),
            Transition::Applied
        );
        // Regression attempt is ignored
        assert_eq!(
            store
                .update_status(&conv, &message.correlation_id, MessageStatus::Sent)
                .unwrap(),
            Transition::Ignored
        );
        let loaded = store.get(&conv, &message.correlation_id).unwrap().unwrap();
        assert_eq!(loaded.status, MessageStatus::Delivered);
    }

    #[test]
    fn test_update_status_unknown_message_errors() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);
        let err = store
            .update_status(&conv, &CorrelationId::generate(), MessageStatus::Sent)
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownMessage { .. }));
    }

    #[test]
    fn test_receipts_are_append_only() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);
        store
            .apply_remote(&remote_message(&conv, "srv-1", "alice", "hi", 1_000, None))
            .unwrap();

        let bob = UserId::new("bob");
        let canonical = CanonicalId::new("srv-1");
        let updated = store
            .record_delivered(&conv, &canonical, &bob, Timestamp::new(2_000))
            .unwrap()
            .unwrap();
        assert_eq!(updated.delivered_to[&bob], Timestamp::new(2_000));

        // Replay does not change anything
        assert!(store
            .record_delivered(&conv, &canonical, &bob, Timestamp::new(9_000))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_mark_conversation_read_sweeps_unread() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);
        for n in 0..5 {
            store
                .apply_remote(&remote_message(
                    &conv,
                    &format!("srv-{n}"),
                    "alice",
                    "msg",
                    1_000 + n,
                    None,
                ))
                .unwrap();
        }

        let bob = UserId::new("bob");
        assert_eq!(store.unread_count(&conv, &bob).unwrap(), 5);

        let updated = store
            .mark_conversation_read(&conv, &bob, Timestamp::new(9_000))
            .unwrap();
        assert_eq!(updated.len(), 5);
        assert_eq!(store.unread_count(&conv, &bob).unwrap(), 0);

        // Second sweep finds nothing
        assert!(store
            .mark_conversation_read(&conv, &bob, Timestamp::new(9_500))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_pending_messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            database_path: Some(dir.path().join("tidechat.db")),
            ..StoreConfig::testing()
        };

        let conv = ConversationId::new("conv-1");
        let correlation;
        {
            let store = LocalStore::open(&config).unwrap();
            let conversation = Conversation::new(
                conv.clone(),
                ConversationKind::Direct,
                [UserId::new("alice"), UserId::new("bob")],
            );
            store.upsert_conversation(&conversation).unwrap();
            let message = local_message(&conv, "alice", "offline hello", 1_000);
            correlation = message.correlation_id;
            store.put(&message).unwrap();
        }

        // Simulated relaunch: the pending message is still there
        let store = LocalStore::open(&config).unwrap();
        let pending = store.pending_messages(&conv).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id, correlation);
        assert_eq!(pending[0].status, MessageStatus::Sending);

        let ordered = store.get_ordered(&conv).unwrap();
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_resubscription_cursor() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);
        assert!(store.last_applied_server_timestamp(&conv).unwrap().is_none());

        store
            .apply_remote(&remote_message(&conv, "srv-1", "bob", "a", 3_000, None))
            .unwrap();
        store
            .apply_remote(&remote_message(&conv, "srv-2", "bob", "b", 5_000, None))
            .unwrap();

        assert_eq!(
            store.last_applied_server_timestamp(&conv).unwrap(),
            Some(Timestamp::new(5_000))
        );
    }

    #[test]
    fn test_snapshot_only_moves_forward() {
        let store = open_store();
        let conv = seed_conversation(&store, "conv-1", &["alice", "bob"]);

        let newer = LastMessageSnapshot {
            body: "newer".to_string(),
            timestamp: Timestamp::new(5_000),
            sender_id: UserId::new("bob"),
        };
        store
            .upsert_conversation_snapshot(&conv, newer.clone())
            .unwrap();

        let stale = LastMessageSnapshot {
            body: "stale".to_string(),
            timestamp: Timestamp::new(1_000),
            sender_id: UserId::new("alice"),
        };
        assert!(store.upsert_conversation_snapshot(&conv, stale).unwrap().is_none());

        let conversation = store.conversation(&conv).unwrap().unwrap();
        assert_eq!(conversation.last_message.unwrap().body, "newer");
    }
}
