//! Broker facade over Redis: trimmed streams, consumer groups, pub/sub and
//! TTL'd key/value.
//!
//! Every durable hand-off between tasks goes through this facade. Stream
//! entries are self-describing records with `kind`, `ts` and `payload`
//! (canonical JSON) fields. All errors surface as `FeedError::Transport`;
//! callers retry with their own backoff.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::error::{FeedError, FeedResult};

/// One decoded stream entry.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub kind: String,
    pub ts: i64,
    pub payload: String,
}

/// Entries read from one stream in a consumer-group batch.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// Cheap-to-clone handle to the broker. Safe for concurrent use; the
/// underlying multiplexed connection reconnects on its own.
#[derive(Clone)]
pub struct Broker {
    client: redis::Client,
    mgr: ConnectionManager,
}

impl Broker {
    pub async fn connect(url: &str) -> FeedResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| FeedError::Config(format!("invalid broker url: {e}")))?;
        let mgr = client.get_connection_manager().await?;
        Ok(Self { client, mgr })
    }

    /// Append one record and trim the stream to approximately `maxlen`.
    /// Returns the broker-assigned, monotonically increasing entry id.
    pub async fn stream_append(
        &self,
        stream: &str,
        kind: &str,
        ts: i64,
        payload: &str,
        maxlen: usize,
    ) -> FeedResult<String> {
        let mut conn = self.mgr.clone();
        let ts_s = ts.to_string();
        let fields: [(&str, &str); 3] = [("kind", kind), ("ts", &ts_s), ("payload", payload)];
        let id: String = conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", &fields)
            .await?;
        Ok(id)
    }

    /// Newest-first read of up to `count` entries.
    pub async fn stream_tail(&self, stream: &str, count: usize) -> FeedResult<Vec<StreamEntry>> {
        let mut conn = self.mgr.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(stream, "+", "-", count).await?;
        Ok(decode_ids(stream, reply.ids))
    }

    /// Oldest-first range read between two entry ids (inclusive).
    pub async fn stream_range(
        &self,
        stream: &str,
        from: &str,
        to: &str,
        count: usize,
    ) -> FeedResult<Vec<StreamEntry>> {
        let mut conn = self.mgr.clone();
        let reply: StreamRangeReply = conn.xrange_count(stream, from, to, count).await?;
        Ok(decode_ids(stream, reply.ids))
    }

    /// Idempotently create a consumer group starting at the stream tail.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> FeedResult<()> {
        let mut conn = self.mgr.clone();
        let res: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Build a consumer-group reader with its own connection. Blocking
    /// reads must not share the multiplexed command connection.
    pub async fn group_reader(
        &self,
        group: &str,
        consumer: &str,
        streams: Vec<String>,
    ) -> FeedResult<GroupReader> {
        for s in &streams {
            self.ensure_group(s, group).await?;
        }
        let conn = self.client.get_connection_manager().await?;
        Ok(GroupReader {
            conn,
            group: group.to_string(),
            consumer: consumer.to_string(),
            streams,
        })
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> FeedResult<()> {
        let mut conn = self.mgr.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Subscribe to a set of channels on a dedicated connection. Yields
    /// `(channel, payload)`; the stream ends if the connection drops.
    pub async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> FeedResult<BoxStream<'static, (String, String)>> {
        #[allow(deprecated)]
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        for ch in &channels {
            pubsub.subscribe(ch).await?;
        }
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            let payload: String = msg.get_payload().ok()?;
            Some((channel, payload))
        });
        Ok(stream.boxed())
    }

    pub async fn kv_set(&self, key: &str, value: &str, ttl_secs: u64) -> FeedResult<()> {
        let mut conn = self.mgr.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn kv_get(&self, key: &str) -> FeedResult<Option<String>> {
        let mut conn = self.mgr.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }
}

/// Consumer-group reader bound to one (group, consumer) identity.
///
/// Offsets are tracked server-side; entries stay pending until `ack`, so a
/// crashed consumer's batch is redelivered to its successor (at-least-once).
pub struct GroupReader {
    conn: ConnectionManager,
    group: String,
    consumer: String,
    streams: Vec<String>,
}

impl GroupReader {
    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Blocking read of new entries across all bound streams.
    pub async fn read(&mut self, block_ms: usize, count: usize) -> FeedResult<Vec<StreamBatch>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(block_ms)
            .count(count);
        let ids: Vec<&str> = self.streams.iter().map(|_| ">").collect();
        let keys: Vec<&str> = self.streams.iter().map(|s| s.as_str()).collect();
        let reply: StreamReadReply = self.conn.xread_options(&keys, &ids, &opts).await?;
        let mut out = Vec::with_capacity(reply.keys.len());
        for key in reply.keys {
            let stream = key.key;
            let entries = decode_ids(&stream, key.ids);
            out.push(StreamBatch { stream, entries });
        }
        Ok(out)
    }

    pub async fn ack(&mut self, stream: &str, ids: &[String]) -> FeedResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _: () = self.conn.xack(stream, &self.group, ids).await?;
        Ok(())
    }
}

fn decode_ids(stream: &str, ids: Vec<redis::streams::StreamId>) -> Vec<StreamEntry> {
    let mut out = Vec::with_capacity(ids.len());
    for raw in ids {
        let field = |name: &str| -> Option<String> {
            raw.map
                .get(name)
                .and_then(|v| redis::from_redis_value::<String>(v).ok())
        };
        let Some(kind) = field("kind") else {
            tracing::warn!(stream, id = %raw.id, "stream entry without kind field, skipping");
            continue;
        };
        let ts = field("ts").and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let payload = field("payload").unwrap_or_default();
        out.push(StreamEntry {
            id: raw.id,
            kind,
            ts,
            payload,
        });
    }
    out
}
