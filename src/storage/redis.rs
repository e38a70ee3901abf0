//! Redis storage backend.
//!
//! Layout (all keys under the configured prefix):
//! - **op-log** → a capped stream `{prefix}oplog_ops`. Entries are
//!   written with explicit `millis-seq` ids produced by the shared
//!   [`OpIdGenerator`], so stream ids and [`OpId`]s are the same value
//!   in two spellings and `XREAD BLOCK` is a tailable cursor with a
//!   built-in timeout. `MAXLEN ~` keeps the log bounded.
//! - **states** → one JSON value per object at
//!   `{prefix}oplog_states:{type/id}` plus a `{prefix}oplog_states.ts`
//!   sorted set scoring each key by its append `ts`, which serves the
//!   timestamp-ordered replication reads.
//!
//! Redis streams trim by entry count, not bytes, so `max_bytes` is
//! converted with an estimated entry size.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::{cmd, pipe, Client};
use tokio::sync::RwLock;
use tracing::warn;

use super::traits::{OpStore, StateCursor, StateEvents, StoreError, TailChunk};
use crate::filter::Filter;
use crate::ident::{OpId, OpIdGenerator};
use crate::operation::{unix_millis, EventKind, ObjectState, Operation, OperationData};
use crate::resilience::retry::{retry, RetryConfig};

/// Estimated bytes per stream entry, used to convert the byte bound
/// into the entry-count bound Redis streams can enforce.
const EST_ENTRY_BYTES: u64 = 1024;

pub struct RedisStore {
    client: Client,
    connection: RwLock<ConnectionManager>,
    prefix: String,
    ids: OpIdGenerator,
    max_entries: std::sync::atomic::AtomicU64,
}

impl RedisStore {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix for namespacing when sharing
    /// a Redis instance with other applications.
    pub async fn with_prefix(
        connection_string: &str,
        prefix: Option<&str>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(connection_string)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        // Startup config: fail fast on bad configuration instead of
        // hanging forever.
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            connection: RwLock::new(connection),
            prefix: prefix.unwrap_or("").to_string(),
            ids: OpIdGenerator::new(),
            max_entries: std::sync::atomic::AtomicU64::new(u64::MAX),
        })
    }

    async fn conn(&self) -> ConnectionManager {
        self.connection.read().await.clone()
    }

    fn ops_key(&self) -> String {
        format!("{}oplog_ops", self.prefix)
    }

    fn state_key(&self, id: &str) -> String {
        format!("{}oplog_states:{}", self.prefix, id)
    }

    fn state_ts_key(&self) -> String {
        format!("{}oplog_states.ts", self.prefix)
    }

    fn stream_id(id: OpId) -> String {
        format!("{}-{}", id.millis(), id.seq())
    }

    fn parse_stream_id(s: &str) -> Result<OpId, StoreError> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| StoreError::Corrupt(format!("stream id {s:?}")))?;
        let millis = millis
            .parse::<u64>()
            .map_err(|_| StoreError::Corrupt(format!("stream id {s:?}")))?;
        let seq = seq
            .parse::<u32>()
            .map_err(|_| StoreError::Corrupt(format!("stream id {s:?}")))?;
        Ok(OpId::new(millis, seq))
    }

    fn decode_entry(entry: &StreamId) -> Result<Operation, StoreError> {
        let json: String = entry
            .get("op")
            .ok_or_else(|| StoreError::Corrupt(format!("entry {} has no op field", entry.id)))?;
        serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

#[async_trait]
impl OpStore for RedisStore {
    async fn init(&self, max_bytes: u64) -> Result<(), StoreError> {
        let entries = (max_bytes / EST_ENTRY_BYTES).max(1);
        self.max_entries
            .store(entries, std::sync::atomic::Ordering::Release);

        let conn = self.conn().await;
        let key = self.ops_key();
        let reply: StreamRangeReply = retry("redis_init", &RetryConfig::startup(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: String = cmd("PING").query_async(&mut conn).await?;
                let reply: StreamRangeReply = cmd("XREVRANGE")
                    .arg(&key)
                    .arg("+")
                    .arg("-")
                    .arg("COUNT")
                    .arg(1)
                    .query_async(&mut conn)
                    .await?;
                Ok(reply)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StoreError::Connection(e.to_string()))?;

        // Ids from a previous run must stay behind everything we issue.
        if let Some(entry) = reply.ids.first() {
            self.ids.observe(Self::parse_stream_id(&entry.id)?);
        }
        Ok(())
    }

    async fn append_op(
        &self,
        event: EventKind,
        data: OperationData,
    ) -> Result<Operation, StoreError> {
        let op = Operation {
            id: self.ids.next(unix_millis() as u64),
            event,
            data,
        };
        let json = serde_json::to_string(&op).map_err(|e| StoreError::Backend(e.to_string()))?;
        let max_entries = self.max_entries.load(std::sync::atomic::Ordering::Acquire);

        let conn = self.conn().await;
        let key = self.ops_key();
        let id = Self::stream_id(op.id);
        retry("redis_append_op", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let id = id.clone();
            let json = json.clone();
            async move {
                let _: String = cmd("XADD")
                    .arg(&key)
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(max_entries)
                    .arg(&id)
                    .arg("op")
                    .arg(&json)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StoreError::Backend(e.to_string()))?;

        Ok(op)
    }

    async fn upsert_state(&self, state: ObjectState) -> Result<(), StoreError> {
        let conn = self.conn().await;
        let key = self.state_key(&state.id);

        // Tombstone guard: the ingestor is the only writer, so a plain
        // read-compare-write is race-free here.
        let existing: Option<String> = retry("redis_state_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let value: Option<String> = cmd("GET").arg(&key).query_async(&mut conn).await?;
                Ok(value)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StoreError::Backend(e.to_string()))?;

        if let Some(json) = existing {
            let current: ObjectState =
                serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            if current.event == EventKind::Delete
                && state.event == EventKind::Insert
                && state.data.timestamp < current.data.timestamp
            {
                return Ok(());
            }
        }

        let json =
            serde_json::to_string(&state).map_err(|e| StoreError::Backend(e.to_string()))?;
        let ts_key = self.state_ts_key();
        retry("redis_state_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let ts_key = ts_key.clone();
            let member = state.id.clone();
            let json = json.clone();
            let ts = state.ts;
            async move {
                let mut pipeline = pipe();
                pipeline.cmd("SET").arg(&key).arg(&json);
                pipeline.cmd("ZADD").arg(&ts_key).arg(ts).arg(&member);
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StoreError::Backend(e.to_string()))
    }

    async fn has_op(&self, id: OpId) -> Result<bool, StoreError> {
        let mut conn = self.conn().await;
        let stream_id = Self::stream_id(id);
        let reply: StreamRangeReply = cmd("XRANGE")
            .arg(self.ops_key())
            .arg(&stream_id)
            .arg(&stream_id)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(!reply.ids.is_empty())
    }

    async fn last_op_id(&self) -> Result<Option<OpId>, StoreError> {
        let mut conn = self.conn().await;
        let reply: StreamRangeReply = cmd("XREVRANGE")
            .arg(self.ops_key())
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match reply.ids.first() {
            Some(entry) => Ok(Some(Self::parse_stream_id(&entry.id)?)),
            None => Ok(None),
        }
    }

    async fn tail_ops(
        &self,
        after: Option<OpId>,
        filter: &Filter,
        wait: Duration,
    ) -> Result<TailChunk, StoreError> {
        let mut conn = self.conn().await;
        let key = self.ops_key();

        let len: u64 = cmd("XLEN")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if len == 0 {
            return Ok(TailChunk::EmptyLog);
        }

        let start = match after {
            Some(id) => Self::stream_id(id),
            None => "0".to_string(),
        };
        let block_ms = wait.as_millis().max(1) as u64;
        let reply: Option<StreamReadReply> = cmd("XREAD")
            .arg("COUNT")
            .arg(1000)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&key)
            .arg(&start)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let entries = match reply {
            Some(reply) => reply
                .keys
                .into_iter()
                .next()
                .map(|stream| stream.ids)
                .unwrap_or_default(),
            None => return Ok(TailChunk::TimedOut),
        };
        let last = match entries.last() {
            Some(entry) => Self::parse_stream_id(&entry.id)?,
            None => return Ok(TailChunk::TimedOut),
        };

        let mut ops = Vec::with_capacity(entries.len());
        for entry in &entries {
            let op = Self::decode_entry(entry)?;
            if filter.matches(&op.data) {
                ops.push(op);
            }
        }
        Ok(TailChunk::Ops { ops, last_seen: last })
    }

    async fn read_states(
        &self,
        from: &StateCursor,
        ts_to: i64,
        filter: &Filter,
        events: StateEvents,
        limit: usize,
    ) -> Result<Vec<ObjectState>, StoreError> {
        let mut conn = self.conn().await;
        let ts_key = self.state_ts_key();
        let mut page = Vec::new();
        let mut offset = 0usize;

        // The zset orders candidates by (score, member), which is the
        // same (ts, id) order the cursor speaks. Matching and the
        // cursor's id tiebreak are applied after decode, so keep
        // pulling chunks until the page fills or the range is
        // exhausted; ties wider than one chunk are walked by offset.
        loop {
            let chunk: Vec<(String, f64)> = cmd("ZRANGEBYSCORE")
                .arg(&ts_key)
                .arg(from.ts)
                .arg(ts_to)
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(offset)
                .arg(limit.max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if chunk.is_empty() {
                break;
            }
            let exhausted = chunk.len() < limit.max(1);
            offset += chunk.len();

            // Skip members at or before the cursor's id within the
            // boundary millisecond without fetching their values.
            let wanted: Vec<&String> = chunk
                .iter()
                .filter(|(member, score)| {
                    (*score as i64) > from.ts
                        || from
                            .after_id
                            .as_deref()
                            .map_or(true, |id| member.as_str() > id)
                })
                .map(|(member, _)| member)
                .collect();

            if !wanted.is_empty() {
                let keys: Vec<String> = wanted.iter().map(|id| self.state_key(id)).collect();
                let values: Vec<Option<String>> = cmd("MGET")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;

                for value in values.into_iter().flatten() {
                    let state: ObjectState = serde_json::from_str(&value)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                    if events == StateEvents::InsertsOnly && state.event == EventKind::Delete {
                        continue;
                    }
                    if !filter.matches(&state.data) {
                        continue;
                    }
                    page.push(state);
                    if page.len() == limit {
                        return Ok(page);
                    }
                }
            }
            if exhausted {
                break;
            }
        }
        Ok(page)
    }

    async fn reset_session(&self) {
        match ConnectionManager::new(self.client.clone()).await {
            Ok(fresh) => {
                *self.connection.write().await = fresh;
            }
            Err(e) => {
                // Keep the old manager; it reconnects on its own and the
                // caller is about to back off anyway.
                warn!(error = %e, "failed to refresh redis session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_round_trip() {
        let id = OpId::new(1_735_776_000_123, 7);
        let s = RedisStore::stream_id(id);
        assert_eq!(s, "1735776000123-7");
        assert_eq!(RedisStore::parse_stream_id(&s).unwrap(), id);
    }

    #[test]
    fn test_parse_stream_id_rejects_garbage() {
        assert!(RedisStore::parse_stream_id("nope").is_err());
        assert!(RedisStore::parse_stream_id("12x-0").is_err());
        assert!(RedisStore::parse_stream_id("12-").is_err());
    }
}
