use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

/// Upper bound for any single store command. Commands that block on purpose
/// (grouped stream reads) get their block time added on top.
const STORE_TIMEOUT_MILLISECS: u64 = 2000;

/// Enumeration of errors for operations with the keyed store.
/// Errors can originate from the redis client and are wrapped by us to provide
/// additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: redis::RedisError },
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: String,
        error: redis::RedisError,
    },
    #[error("{command} command timed out")]
    TimeoutError { command: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A single entry delivered from an append-only stream: the store-assigned id
/// plus flat string field/value pairs in append order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

/// The shared keyed store the pipeline stages items in.
///
/// Covers the four facilities the pipeline relies on: set membership (dedup
/// index), document read/write/delete by key (staged items), pattern-based
/// key enumeration (the scan/delete protocol) and an append-only stream with
/// consumer-group semantics (the stream/ack protocol). Components take this
/// interface as a constructor parameter, never a process-wide handle.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Add a member to a set, creating the set if it does not exist.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Membership check on a set. Missing sets behave as empty.
    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Write a document under a key, overwriting any previous value.
    async fn put_document(&self, key: &str, document: &str) -> StoreResult<()>;

    /// Read the document stored under a key, if any.
    async fn get_document(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete a key. Returns whether the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Enumerate every key matching a glob pattern, scanning with a cursor in
    /// pages of `page_size` until the cursor returns to its start value.
    async fn scan_keys(&self, pattern: &str, page_size: usize) -> StoreResult<Vec<String>>;

    /// Append an entry to a stream, returning the assigned entry id.
    async fn stream_append(&self, stream: &str, fields: &[(String, String)])
        -> StoreResult<String>;

    /// Create a consumer group at the stream origin. Creating a group that
    /// already exists is success, not an error.
    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<()>;

    /// Blocking grouped read of new entries only: entries never delivered to
    /// any member of the group. Blocks up to `block_ms` waiting for entries,
    /// delivering at most `count` of them.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// Acknowledge a delivered entry, removing it from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<()>;

    /// Claim pending entries that have been idle for at least `min_idle_ms`,
    /// transferring their ownership to `consumer` for re-processing.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: usize,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>>;
}

/// `StoreClient` backed by a Redis server.
pub struct RedisStoreClient {
    client: redis::Client,
}

impl RedisStoreClient {
    /// Connect to Redis and verify the server answers. Fails fast: callers
    /// get an error to propagate instead of a handle that silently does
    /// nothing.
    pub async fn connect(addr: &str) -> StoreResult<RedisStoreClient> {
        let client = redis::Client::open(addr)
            .map_err(|error| StoreError::ConnectionError { error })?;

        let mut conn = client
            .get_async_connection()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(RedisStoreClient { client })
    }

    async fn connection(&self) -> StoreResult<redis::aio::Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|error| StoreError::ConnectionError { error })
    }
}

/// Await a redis future with a bounded timeout, mapping both failure modes
/// into `StoreError`.
async fn bounded<T>(
    command: &str,
    limit: Duration,
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> StoreResult<T> {
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(StoreError::CommandError {
            command: command.to_owned(),
            error,
        }),
        Err(_) => Err(StoreError::TimeoutError {
            command: command.to_owned(),
        }),
    }
}

fn command_timeout() -> Duration {
    Duration::from_millis(STORE_TIMEOUT_MILLISECS)
}

#[async_trait]
impl StoreClient for RedisStoreClient {
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        bounded("SADD", command_timeout(), conn.sadd(key, member)).await
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        bounded("SISMEMBER", command_timeout(), conn.sismember(key, member)).await
    }

    async fn put_document(&self, key: &str, document: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        bounded("SET", command_timeout(), conn.set(key, document)).await
    }

    async fn get_document(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        bounded("GET", command_timeout(), conn.get(key)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = bounded("DEL", command_timeout(), conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn scan_keys(&self, pattern: &str, page_size: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut page = redis::cmd("SCAN");
            page.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(page_size);
            let (next_cursor, page_keys): (u64, Vec<String>) =
                bounded("SCAN", command_timeout(), page.query_async(&mut conn)).await?;

            keys.extend(page_keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> StoreResult<String> {
        let mut conn = self.connection().await?;
        bounded("XADD", command_timeout(), conn.xadd(stream, "*", fields)).await
    }

    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let result = bounded(
            "XGROUP CREATE",
            command_timeout(),
            conn.xgroup_create_mkstream(stream, group, "0"),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            // BUSYGROUP means the group already exists, which is fine.
            Err(StoreError::CommandError { error, .. })
                if error.to_string().contains("BUSYGROUP") =>
            {
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.connection().await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);

        // The read deliberately blocks for block_ms, so the command timeout
        // only guards the margin past that.
        let limit = Duration::from_millis(block_ms as u64 + STORE_TIMEOUT_MILLISECS);
        let reply: Option<StreamReadReply> = bounded(
            "XREADGROUP",
            limit,
            conn.xread_options(&[stream], &[">"], &options),
        )
        .await?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for delivered in key.ids {
                entries.push(StreamEntry {
                    id: delivered.id,
                    fields: flatten_field_map(delivered.map),
                });
            }
        }

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _acked: i64 =
            bounded("XACK", command_timeout(), conn.xack(stream, group, &[id])).await?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: usize,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.connection().await?;

        let pending: StreamPendingCountReply = bounded(
            "XPENDING",
            command_timeout(),
            conn.xpending_count(stream, group, "-", "+", count),
        )
        .await?;

        let stale_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();
        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = bounded(
            "XCLAIM",
            command_timeout(),
            conn.xclaim(stream, group, consumer, min_idle_ms, &stale_ids),
        )
        .await?;

        Ok(claimed
            .ids
            .into_iter()
            .map(|delivered| StreamEntry {
                id: delivered.id,
                fields: flatten_field_map(delivered.map),
            })
            .collect())
    }
}

/// Stream field values come back as redis bulk strings; anything else is
/// rendered through its string form so a single odd field cannot fail the
/// whole delivery.
fn flatten_field_map(map: HashMap<String, redis::Value>) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = map
        .into_iter()
        .map(|(name, value)| {
            let rendered = redis::from_redis_value::<String>(&value)
                .unwrap_or_else(|_| format!("{:?}", value));
            (name, rendered)
        })
        .collect();
    fields.sort();
    fields
}

#[derive(Default)]
struct MemoryGroup {
    /// Index into the stream's entries of the next never-delivered entry.
    delivered: usize,
    /// Entry id -> (owning consumer, delivery count).
    pending: BTreeMap<String, (String, u32)>,
}

#[derive(Default)]
struct MemoryStream {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, MemoryGroup>,
}

#[derive(Default)]
struct MemoryStoreInner {
    documents: BTreeMap<String, String>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, MemoryStream>,
}

/// In-memory `StoreClient` used by tests, mirroring the store semantics the
/// pipeline relies on: per-key atomicity, glob key enumeration, and grouped
/// stream delivery with a pending list. Clones share state, so a "restarted"
/// consumer observes what a previous one left behind.
#[derive(Clone, Default)]
pub struct MemoryStoreClient {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStoreClient {
    pub fn new() -> MemoryStoreClient {
        MemoryStoreClient::default()
    }

    /// Number of entries currently pending for a group, for test assertions.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        let inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn matches(pattern: &str, key: &str) -> bool {
        match pattern.split_once('*') {
            Some((prefix, suffix)) => {
                key.len() >= prefix.len() + suffix.len()
                    && key.starts_with(prefix)
                    && key.ends_with(suffix)
            }
            None => pattern == key,
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStoreClient {
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        inner
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    async fn put_document(&self, key: &str, document: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        inner.documents.insert(key.to_owned(), document.to_owned());
        Ok(())
    }

    async fn get_document(&self, key: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        Ok(inner.documents.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        Ok(inner.documents.remove(key).is_some())
    }

    async fn scan_keys(&self, pattern: &str, _page_size: usize) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        Ok(inner
            .documents
            .keys()
            .filter(|key| Self::matches(pattern, key))
            .cloned()
            .collect())
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> StoreResult<String> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        let stream = inner.streams.entry(stream.to_owned()).or_default();
        let id = format!("{}-0", stream.next_seq);
        stream.next_seq += 1;
        stream.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields.to_vec(),
        });
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        let stream = inner.streams.entry(stream.to_owned()).or_default();
        stream.groups.entry(group.to_owned()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block_ms: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        let stream = inner.streams.entry(stream.to_owned()).or_default();

        let start = stream.groups.entry(group.to_owned()).or_default().delivered;
        let end = (start + count).min(stream.entries.len());
        let delivered: Vec<StreamEntry> = stream.entries[start..end].to_vec();

        let state = stream
            .groups
            .get_mut(group)
            .expect("group created just above");
        for entry in &delivered {
            state
                .pending
                .insert(entry.id.clone(), (consumer.to_owned(), 1));
        }
        state.delivered = end;

        Ok(delivered)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        if let Some(state) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            state.pending.remove(id);
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        _min_idle_ms: usize,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        // The memory store keeps no delivery timestamps: every pending entry
        // counts as stale, which is what recovery tests want.
        let mut inner = self.inner.lock().expect("poisoned MemoryStoreClient");
        let Some(stream) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let entries = stream.entries.clone();
        let Some(state) = stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for (id, owner) in state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if let Some(entry) = entries.iter().find(|e| &e.id == id) {
                *owner = (consumer.to_owned(), owner.1 + 1);
                claimed.push(entry.clone());
            }
        }

        Ok(claimed)
    }
}
