//! Redis stream consumer with consumer-group semantics.
//!
//! Delivery is at-least-once: every entry is dispatched to the registered
//! handlers in order, and only a fully handled entry is XACKed.  A handler
//! error leaves the entry in the pending entry list, where the next pass
//! picks it up again (after `nack_resend_sleep`); entries idle past
//! `claim_min_idle_time` are XAUTOCLAIMed from dead consumers.  Handlers
//! must therefore be idempotent on `event_id`.
//!
//! Entries that cannot be decoded at all are acked anyway so a poison
//! message cannot wedge the group; the raw bytes are logged and a failure
//! counter incremented.
//!
//! # Read order per iteration
//! 1. own pending entries (`XREADGROUP ... 0`) — redelivery of nacked work
//! 2. stale entries claimed from dead consumers (`XAUTOCLAIM`)
//! 3. new entries (`XREADGROUP ... >` with a bounded BLOCK)
//!
//! Shutdown is observed between reads, so latency to stop is bounded by
//! `block_time` plus the in-flight handler chain.

use crate::config::{ConsumerConfig, RedisConfig};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, IntoConnectionInfo, RedisResult, Value};
use relay_protocol::StreamMessage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Preferred stream-entry field carrying the event JSON.
const PAYLOAD_FIELD: &str = "json_payload";
/// Fallback field some producers use instead.
const FALLBACK_PAYLOAD_FIELD: &str = "payload";
/// Entries fetched per read.
const READ_COUNT: usize = 64;
/// Backoff after a failed Redis round-trip.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Link health
// ---------------------------------------------------------------------------

/// Health of the Redis link, surfaced on the REST `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Connected,
    Connecting,
    Disconnected,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("store: {0}")]
    Store(#[from] relay_store::StoreError),
}

/// One of the per-message fan-out targets (persist, project, broadcast).
///
/// Handlers run synchronously per message, in registration order; the first
/// error fails the whole message and triggers redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, msg: &StreamMessage) -> Result<(), HandlerError>;
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ConsumerStats {
    processed: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    decode_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub acked: u64,
    pub nacked: u64,
    pub decode_failures: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Connect a managed (auto-reconnecting) Redis connection, applying the
/// password/db/timeout overrides from config.
pub async fn connect(cfg: &RedisConfig) -> RedisResult<ConnectionManager> {
    let mut info = cfg.url.as_str().into_connection_info()?;
    if let Some(password) = &cfg.password {
        info.redis.password = Some(password.clone());
    }
    if cfg.db != 0 {
        info.redis.db = cfg.db;
    }
    let client = redis::Client::open(info)?;
    let manager_cfg = ConnectionManagerConfig::new()
        .set_connection_timeout(cfg.dial_timeout)
        .set_number_of_retries(cfg.max_retries);
    ConnectionManager::new_with_config(client, manager_cfg).await
}

/// Append one event (the producer's wire shape) to the stream.
///
/// Ops tooling and the integration tests publish through this; the service
/// itself only reads.
pub async fn publish_event(
    conn: &mut ConnectionManager,
    stream: &str,
    event_json: &str,
) -> RedisResult<String> {
    redis::cmd("XADD")
        .arg(stream)
        .arg("*")
        .arg(PAYLOAD_FIELD)
        .arg(event_json)
        .query_async(conn)
        .await
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// A raw stream entry before decoding.
#[derive(Debug)]
struct RawEntry {
    id: String,
    fields: HashMap<String, Value>,
}

enum Dispatch {
    /// Handled by every handler; ack.
    Ack,
    /// A handler failed; leave pending for redelivery.
    Nack,
    /// Undecodable; ack to avoid a poison loop.
    Poison,
}

pub struct Consumer {
    conn: ConnectionManager,
    settings: ConsumerConfig,
    handlers: Vec<Arc<dyn MessageHandler>>,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    pub fn new(
        conn: ConnectionManager,
        mut settings: ConsumerConfig,
        handlers: Vec<Arc<dyn MessageHandler>>,
    ) -> Self {
        if settings.name.is_empty() {
            settings.name = format!("relay-{}", Uuid::new_v4());
        }
        Consumer {
            conn,
            settings,
            handlers,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown.  Publishes link health on `health`; Redis errors
    /// flip it to `Disconnected` and the loop retries with a short backoff.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, health: watch::Sender<LinkState>) {
        'session: loop {
            if *shutdown.borrow() {
                break;
            }
            let _ = health.send(LinkState::Connecting);
            if let Err(e) = self.ensure_group().await {
                warn!(error = %e, "consumer group setup failed, retrying");
                let _ = health.send(LinkState::Disconnected);
                if wait_or_shutdown(&mut shutdown, RECONNECT_DELAY).await {
                    break;
                }
                continue;
            }
            info!(
                stream = %self.settings.stream_name,
                group = %self.settings.group,
                consumer = %self.settings.name,
                "joined consumer group"
            );
            let _ = health.send(LinkState::Connected);

            loop {
                if *shutdown.borrow() {
                    break 'session;
                }
                let batch = match self.next_batch().await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "stream read failed");
                        let _ = health.send(LinkState::Disconnected);
                        if wait_or_shutdown(&mut shutdown, RECONNECT_DELAY).await {
                            break 'session;
                        }
                        continue 'session;
                    }
                };
                if batch.is_empty() {
                    continue;
                }

                let mut to_ack: Vec<String> = Vec::new();
                let mut nacked = false;
                for entry in &batch {
                    match self.dispatch(entry).await {
                        Dispatch::Ack => {
                            self.stats.processed.fetch_add(1, Ordering::Relaxed);
                            to_ack.push(entry.id.clone());
                        }
                        Dispatch::Poison => {
                            self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                            to_ack.push(entry.id.clone());
                        }
                        Dispatch::Nack => {
                            // Nothing behind the failed entry may be acked
                            // ahead of it, or the pending pass would redeliver
                            // it out of order.
                            self.stats.nacked.fetch_add(1, Ordering::Relaxed);
                            nacked = true;
                            break;
                        }
                    }
                    if to_ack.len() >= self.settings.commit_offset_after {
                        self.flush_acks(&mut to_ack).await;
                    }
                }
                self.flush_acks(&mut to_ack).await;

                if nacked {
                    // Failed entries sit in the PEL; give the fault a beat
                    // before the pending pass re-reads them.
                    if wait_or_shutdown(&mut shutdown, self.settings.nack_resend_sleep).await {
                        break 'session;
                    }
                }
            }
        }
        let _ = health.send(LinkState::Disconnected);
        info!("consumer stopped");
    }

    /// Create the consumer group if needed (idempotent; stream is created
    /// with MKSTREAM, starting delivery at the beginning of the stream).
    async fn ensure_group(&mut self) -> RedisResult<()> {
        let result: RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.settings.stream_name)
            .arg(&self.settings.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;
        match result {
            Ok(_) => {
                info!(group = %self.settings.group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.settings.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn next_batch(&mut self) -> RedisResult<Vec<RawEntry>> {
        let pending = self.read_group("0", false).await?;
        if !pending.is_empty() {
            debug!(count = pending.len(), "re-reading pending entries");
            return Ok(pending);
        }
        let claimed = self.claim_stale().await?;
        if !claimed.is_empty() {
            info!(count = claimed.len(), "claimed stale entries from dead consumers");
            return Ok(claimed);
        }
        self.read_group(">", true).await
    }

    async fn read_group(&mut self, id: &str, block: bool) -> RedisResult<Vec<RawEntry>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.settings.group, &self.settings.name)
            .count(READ_COUNT);
        if block {
            opts = opts.block(self.settings.block_time.as_millis() as usize);
        }
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[self.settings.stream_name.as_str()], &[id], &opts)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for sid in key.ids {
                entries.push(RawEntry {
                    id: sid.id,
                    fields: sid.map,
                });
            }
        }
        Ok(entries)
    }

    /// XAUTOCLAIM entries idle past `claim_min_idle_time` over to this
    /// consumer, so work from dead replicas is not stranded.
    async fn claim_stale(&mut self) -> RedisResult<Vec<RawEntry>> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.settings.stream_name)
            .arg(&self.settings.group)
            .arg(&self.settings.name)
            .arg(self.settings.claim_min_idle_time.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(READ_COUNT)
            .query_async(&mut self.conn)
            .await?;
        Ok(parse_autoclaim_reply(reply))
    }

    async fn dispatch(&self, entry: &RawEntry) -> Dispatch {
        let Some(msg) = decode_entry(entry) else {
            return Dispatch::Poison;
        };
        // One ack_wait deadline covers the whole handler chain, not each
        // handler separately.
        match tokio::time::timeout(self.settings.ack_wait, self.run_handlers(&msg)).await {
            Ok(Ok(())) => Dispatch::Ack,
            Ok(Err(())) => Dispatch::Nack,
            Err(_) => {
                warn!(
                    event_id = %msg.event.event_id,
                    "handler chain exceeded ack_wait, message will be redelivered"
                );
                Dispatch::Nack
            }
        }
    }

    async fn run_handlers(&self, msg: &StreamMessage) -> Result<(), ()> {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(msg).await {
                warn!(
                    handler = handler.name(),
                    event_id = %msg.event.event_id,
                    error = %e,
                    "handler failed, message will be redelivered"
                );
                return Err(());
            }
        }
        Ok(())
    }

    async fn flush_acks(&mut self, ids: &mut Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let result: RedisResult<u64> = self
            .conn
            .xack(
                self.settings.stream_name.as_str(),
                self.settings.group.as_str(),
                &ids[..],
            )
            .await;
        match result {
            Ok(_) => {
                self.stats
                    .acked
                    .fetch_add(ids.len() as u64, Ordering::Relaxed);
            }
            // Messages stay pending and will be redelivered; handlers are
            // idempotent so a double apply is harmless.
            Err(e) => warn!(error = %e, count = ids.len(), "XACK failed"),
        }
        ids.clear();
    }
}

/// Sleep for `delay`, returning early (true) when shutdown fires.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        () = tokio::time::sleep(delay) => false,
    }
}

// ---------------------------------------------------------------------------
// Entry decoding
// ---------------------------------------------------------------------------

fn decode_entry(entry: &RawEntry) -> Option<StreamMessage> {
    let Some(raw) = entry_payload(&entry.fields) else {
        warn!(entry_id = %entry.id, "stream entry has no payload field, acking as poison");
        return None;
    };
    match relay_protocol::decode_event(&raw) {
        Ok(event) => Some(StreamMessage {
            entry_id: entry.id.clone(),
            event,
            raw,
        }),
        Err(e) => {
            warn!(entry_id = %entry.id, error = %e, raw = %raw, "undecodable event, acking as poison");
            None
        }
    }
}

/// Extract the event JSON from a stream entry's field map.
///
/// `json_payload` is preferred; `payload` is accepted as a fallback.
fn entry_payload(fields: &HashMap<String, Value>) -> Option<String> {
    fields
        .get(PAYLOAD_FIELD)
        .or_else(|| fields.get(FALLBACK_PAYLOAD_FIELD))
        .and_then(value_to_string)
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse an XAUTOCLAIM reply: `[next_cursor, [[id, [k, v, ...]], ...], [...]]`.
///
/// Deleted entries show up as nil placeholders in the entry list; they are
/// skipped.
fn parse_autoclaim_reply(reply: Value) -> Vec<RawEntry> {
    let Value::Array(mut parts) = reply else {
        return Vec::new();
    };
    if parts.len() < 2 {
        return Vec::new();
    }
    parse_entry_list(parts.remove(1))
}

fn parse_entry_list(list: Value) -> Vec<RawEntry> {
    let Value::Array(items) = list else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for item in items {
        let Value::Array(mut pair) = item else {
            continue;
        };
        if pair.len() < 2 {
            continue;
        }
        let fields_value = pair.remove(1);
        let Some(id) = value_to_string(&pair[0]) else {
            continue;
        };
        let Value::Array(kv) = fields_value else {
            continue;
        };
        let mut fields = HashMap::new();
        for chunk in kv.chunks(2) {
            if let [k, v] = chunk {
                if let Some(key) = value_to_string(k) {
                    fields.insert(key, v.clone());
                }
            }
        }
        entries.push(RawEntry { id, fields });
    }
    entries
}
