//! Redis Streams transport (durable, at-least-once delivery).
//!
//! - **Topic**: one stream key per topic
//! - **Consumer groups**: `XGROUP CREATE <topic> <group> 0 MKSTREAM` on subscribe
//! - **Poll**: `XREADGROUP GROUP <group> <consumer> COUNT <n> BLOCK <slice> STREAMS ...`
//! - **Commit**: cumulative `XACK` of this consumer's pending entries up to
//!   the committed id, run on a background thread
//! - **Send**: `XADD`, run on a background thread
//!
//! ## Entry layout
//!
//! Each entry carries a `key` field (absent when the message has no key), a
//! `value` field with the raw payload and one `header:<name>` field per
//! header, in header order. Offsets are stream entry ids.
//!
//! ## Redelivery
//!
//! Entries read but never acknowledged stay in the group's pending list. After
//! a subscribe the consumer first replays its own pending entries, then moves
//! on to new ones, so a restarted consumer sees everything it did not commit.
//! A commit covers every earlier entry the consumer still holds, so messages
//! that were skipped (handed to the retry or dead-letter topic) before a later
//! success leave the pending list with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use redis::Value;
use tracing::{debug, info, instrument, warn};

use orderflow_events::{
    BrokerError, CommitCallback, Consumer, DeliveryCallback, DeliveryReport, Headers, Message,
    Offset, OutgoingMessage, PollError, Producer, SourcePosition,
};

use crate::config::Acks;

/// Longest single `XREADGROUP BLOCK`, so a wakeup is seen promptly.
const BLOCK_SLICE: Duration = Duration::from_millis(100);

const KEY_FIELD: &str = "key";
const VALUE_FIELD: &str = "value";
const HEADER_PREFIX: &str = "header:";

/// Streams have a single partition.
const PARTITION: i32 = 0;

/// Pending entries fetched per `XPENDING` page during a commit.
const ACK_PAGE: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<RedisStreamsError> for BrokerError {
    fn from(e: RedisStreamsError) -> Self {
        match e {
            RedisStreamsError::Connection(msg) => BrokerError::Connection(msg),
            RedisStreamsError::Command(msg) => BrokerError::Command(msg),
            RedisStreamsError::Deserialization(msg) => BrokerError::Command(msg),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_client(url: &str) -> Result<redis::Client, RedisStreamsError> {
    redis::Client::open(url).map_err(|e| RedisStreamsError::Connection(e.to_string()))
}

/// Lazily (re)connected synchronous connection.
struct LazyConnection {
    client: redis::Client,
    conn: Option<redis::Connection>,
}

impl LazyConnection {
    fn new(client: redis::Client) -> Self {
        Self { client, conn: None }
    }

    /// Run `f` on the connection. A failed command drops the connection so
    /// the next call reconnects.
    fn with<T>(
        &mut self,
        f: impl FnOnce(&mut redis::Connection) -> Result<T, RedisStreamsError>,
    ) -> Result<T, RedisStreamsError> {
        if self.conn.is_none() {
            let conn = self
                .client
                .get_connection()
                .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
            self.conn = Some(conn);
        }

        let Some(conn) = self.conn.as_mut() else {
            return Err(RedisStreamsError::Connection("not connected".to_string()));
        };
        let result = f(conn);
        if result.is_err() {
            self.conn = None;
        }
        result
    }
}

/// Per-topic read position for `XREADGROUP`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamCursor {
    topic: String,
    /// `Some(id)` while replaying pending entries after `id`; `None` once
    /// reading new entries (`>`).
    pending_after: Option<String>,
}

struct AckRequest {
    position: SourcePosition,
    on_complete: CommitCallback,
}

/// Consumer-group reader over one or more streams.
pub struct RedisStreamsConsumer {
    group: String,
    consumer_name: String,
    max_poll_records: usize,
    conn: Mutex<LazyConnection>,
    cursors: Mutex<Vec<StreamCursor>>,
    woken: AtomicBool,
    acks: Mutex<mpsc::Sender<AckRequest>>,
}

impl RedisStreamsConsumer {
    /// Connect to `redis_url` as `consumer_name` within `group`.
    pub fn connect(
        redis_url: &str,
        group: impl Into<String>,
        consumer_name: impl Into<String>,
        max_poll_records: usize,
    ) -> Result<Self, RedisStreamsError> {
        let group = group.into();
        let client = open_client(redis_url)?;

        let (tx, rx) = mpsc::channel::<AckRequest>();
        let mut ack_conn = LazyConnection::new(client.clone());
        let ack_group = group.clone();
        let consumer_name = consumer_name.into();
        let ack_consumer = consumer_name.clone();
        thread::Builder::new()
            .name("redis-streams-ack".to_string())
            .spawn(move || {
                for request in rx {
                    let result =
                        acknowledge(&mut ack_conn, &ack_group, &ack_consumer, &request.position);
                    (request.on_complete)(result.map_err(BrokerError::from));
                }
                debug!("redis streams ack thread stopped");
            })
            .map_err(|e| {
                RedisStreamsError::Connection(format!("failed to spawn ack thread: {e}"))
            })?;

        Ok(Self {
            group,
            consumer_name,
            max_poll_records: max_poll_records.max(1),
            conn: Mutex::new(LazyConnection::new(client)),
            cursors: Mutex::new(Vec::new()),
            woken: AtomicBool::new(false),
            acks: Mutex::new(tx),
        })
    }

    /// Ensure the consumer group exists on `topic` (idempotent).
    fn ensure_group(&self, topic: &str) -> Result<(), RedisStreamsError> {
        lock(&self.conn).with(|conn| {
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(topic)
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query(conn);

            match created {
                Ok(_) => Ok(()),
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
            }
        })
    }

    fn read(&self, block: Duration) -> Result<Vec<Message>, RedisStreamsError> {
        let mut cursors = lock(&self.cursors);

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer_name)
            // COUNT applies per stream.
            .arg("COUNT")
            .arg(self.max_poll_records)
            .arg("BLOCK")
            .arg(block.as_millis().max(1) as u64)
            .arg("STREAMS");
        for cursor in cursors.iter() {
            cmd.arg(&cursor.topic);
        }
        for cursor in cursors.iter() {
            cmd.arg(cursor.pending_after.as_deref().unwrap_or(">"));
        }

        let reply: Value = lock(&self.conn).with(|conn| {
            cmd.query(conn)
                .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))
        })?;

        let streams = parse_read_reply(reply)?;
        let mut batch = Vec::new();

        for (topic, messages) in streams {
            if let Some(cursor) = cursors.iter_mut().find(|c| c.topic == topic) {
                if cursor.pending_after.is_some() {
                    cursor.pending_after =
                        messages.last().map(|m| m.position().offset().to_string());
                    if cursor.pending_after.is_none() {
                        debug!(topic = %cursor.topic, "pending entries replayed");
                    }
                }
            }
            batch.extend(messages);
        }

        Ok(batch)
    }
}

impl Consumer for RedisStreamsConsumer {
    #[instrument(skip(self), fields(group = %self.group, consumer = %self.consumer_name), err)]
    fn subscribe(&self, topics: &[&str]) -> Result<(), BrokerError> {
        for topic in topics {
            self.ensure_group(topic)?;
        }

        *lock(&self.cursors) = topics
            .iter()
            .map(|t| StreamCursor {
                topic: (*t).to_string(),
                pending_after: Some("0".to_string()),
            })
            .collect();

        info!(?topics, "subscribed to redis streams");
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<Message>, PollError> {
        if lock(&self.cursors).is_empty() {
            return Err(PollError::Broker(BrokerError::NotSubscribed));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.woken.swap(false, Ordering::SeqCst) {
                return Err(PollError::Woken);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let batch = self
                .read(remaining.min(BLOCK_SLICE))
                .map_err(BrokerError::from)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
        }
    }

    fn commit_async(&self, position: &SourcePosition, on_complete: CommitCallback) {
        let request = AckRequest {
            position: position.clone(),
            on_complete,
        };

        let sent = lock(&self.acks).send(request);
        if let Err(mpsc::SendError(request)) = sent {
            (request.on_complete)(Err(BrokerError::Closed));
        }
    }

    fn wakeup(&self) {
        self.woken.store(true, Ordering::SeqCst);
    }
}

/// Acknowledge every entry `consumer` holds pending on the position's topic
/// with an id up to and including the position's.
fn acknowledge(
    conn: &mut LazyConnection,
    group: &str,
    consumer: &str,
    position: &SourcePosition,
) -> Result<(), RedisStreamsError> {
    let Offset::StreamId(id) = position.offset() else {
        return Err(RedisStreamsError::Command(format!(
            "offset {} is not a stream entry id",
            position.offset()
        )));
    };

    conn.with(|conn| {
        loop {
            let reply: Value = redis::cmd("XPENDING")
                .arg(position.topic())
                .arg(group)
                .arg("-")
                .arg(id)
                .arg(ACK_PAGE)
                .arg(consumer)
                .query(conn)
                .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))?;

            let ids = parse_pending_ids(&reply)?;
            if !ids.is_empty() {
                let acked: u64 = redis::cmd("XACK")
                    .arg(position.topic())
                    .arg(group)
                    .arg(&ids)
                    .query(conn)
                    .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
                debug!(
                    topic = %position.topic(),
                    up_to = %id,
                    acked,
                    "acknowledged pending entries"
                );
            }

            // Acked entries leave the pending list, so the next page starts at `-` again.
            if ids.len() < ACK_PAGE {
                return Ok(());
            }
        }
    })
}

/// Entry ids from an extended `XPENDING` reply.
///
/// Reply shape: `[[id, consumer, idle_ms, deliveries], ...]`.
fn parse_pending_ids(reply: &Value) -> Result<Vec<String>, RedisStreamsError> {
    let entries = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(entries) => entries,
        _ => {
            return Err(RedisStreamsError::Deserialization(
                "invalid XPENDING reply".to_string(),
            ));
        }
    };

    entries
        .iter()
        .map(|entry| match entry {
            Value::Bulk(parts) => match parts.first() {
                Some(id) => text(id, "pending entry id"),
                None => Err(RedisStreamsError::Deserialization(
                    "empty pending entry".to_string(),
                )),
            },
            _ => Err(RedisStreamsError::Deserialization(
                "invalid pending entry".to_string(),
            )),
        })
        .collect()
}

struct SendRequest {
    message: OutgoingMessage,
    on_delivery: DeliveryCallback,
}

/// Stream appender. `send` queues the entry for a background `XADD`.
pub struct RedisStreamsProducer {
    client_id: String,
    requests: Mutex<mpsc::Sender<SendRequest>>,
}

impl RedisStreamsProducer {
    pub fn connect(
        redis_url: &str,
        client_id: impl Into<String>,
        acks: Acks,
        idempotent: bool,
    ) -> Result<Self, RedisStreamsError> {
        let client_id = client_id.into();
        let mut conn = LazyConnection::new(open_client(redis_url)?);

        if acks != Acks::All || !idempotent {
            warn!(
                client_id = %client_id,
                %acks,
                idempotent,
                "redis streams acknowledge every XADD; acks and idempotence settings have no effect"
            );
        }

        let (tx, rx) = mpsc::channel::<SendRequest>();
        thread::Builder::new()
            .name(format!("{client_id}-send"))
            .spawn(move || {
                for request in rx {
                    let result = append(&mut conn, &request.message);
                    (request.on_delivery)(result.map_err(BrokerError::from));
                }
                debug!("redis streams send thread stopped");
            })
            .map_err(|e| {
                RedisStreamsError::Connection(format!("failed to spawn send thread: {e}"))
            })?;

        Ok(Self {
            client_id,
            requests: Mutex::new(tx),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Producer for RedisStreamsProducer {
    fn send(&self, message: OutgoingMessage, on_delivery: DeliveryCallback) {
        let request = SendRequest {
            message,
            on_delivery,
        };

        let sent = lock(&self.requests).send(request);
        if let Err(mpsc::SendError(request)) = sent {
            (request.on_delivery)(Err(BrokerError::Closed));
        }
    }
}

fn append(
    conn: &mut LazyConnection,
    message: &OutgoingMessage,
) -> Result<DeliveryReport, RedisStreamsError> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(&message.topic).arg("*");
    for (field, value) in entry_fields(message) {
        cmd.arg(field).arg(value);
    }

    let id: String = conn.with(|conn| {
        cmd.query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))
    })?;

    Ok(DeliveryReport {
        topic: message.topic.clone(),
        partition: PARTITION,
        offset: Offset::StreamId(id),
    })
}

/// Field/value pairs stored for `message`, in order.
fn entry_fields(message: &OutgoingMessage) -> Vec<(String, Vec<u8>)> {
    let mut fields = Vec::with_capacity(message.headers.len() + 2);
    if let Some(key) = &message.key {
        fields.push((KEY_FIELD.to_string(), key.clone().into_bytes()));
    }
    fields.push((VALUE_FIELD.to_string(), message.value.clone()));
    for header in message.headers.iter() {
        fields.push((format!("{HEADER_PREFIX}{}", header.name), header.value.clone()));
    }
    fields
}

fn bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Data(data) => Some(data),
        Value::Status(s) => Some(s.as_bytes()),
        _ => None,
    }
}

fn text(value: &Value, what: &str) -> Result<String, RedisStreamsError> {
    bytes(value)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| RedisStreamsError::Deserialization(format!("invalid {what}")))
}

/// Parse an `XREADGROUP` reply into `(topic, messages)` pairs.
///
/// Reply shape: `[[topic, [[id, [field, value, ...]], ...]], ...]`, or nil
/// when the block timed out.
fn parse_read_reply(reply: Value) -> Result<Vec<(String, Vec<Message>)>, RedisStreamsError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        _ => {
            return Err(RedisStreamsError::Deserialization(
                "invalid XREADGROUP reply".to_string(),
            ));
        }
    };

    let mut result = Vec::with_capacity(streams.len());
    for stream in streams {
        let Value::Bulk(parts) = stream else {
            return Err(RedisStreamsError::Deserialization("invalid stream entry".to_string()));
        };
        let [name, entries] = parts.as_slice() else {
            return Err(RedisStreamsError::Deserialization("invalid stream entry".to_string()));
        };

        let topic = text(name, "stream name")?;
        let entries = match entries {
            Value::Bulk(entries) => entries.as_slice(),
            Value::Nil => &[],
            _ => {
                return Err(RedisStreamsError::Deserialization(
                    "invalid stream entries".to_string(),
                ));
            }
        };

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            // A pending entry deleted from the stream comes back with nil fields.
            match parse_entry(&topic, entry)? {
                Some(message) => messages.push(message),
                None => warn!(topic = %topic, "skipping deleted pending entry"),
            }
        }
        result.push((topic, messages));
    }

    Ok(result)
}

fn parse_entry(topic: &str, entry: &Value) -> Result<Option<Message>, RedisStreamsError> {
    let Value::Bulk(parts) = entry else {
        return Err(RedisStreamsError::Deserialization("invalid entry format".to_string()));
    };
    let [id, fields] = parts.as_slice() else {
        return Err(RedisStreamsError::Deserialization("entry too short".to_string()));
    };

    let id = text(id, "entry id")?;
    let fields = match fields {
        Value::Bulk(fields) => fields,
        Value::Nil => return Ok(None),
        _ => return Err(RedisStreamsError::Deserialization("invalid fields format".to_string())),
    };

    let mut key = None;
    let mut value = Vec::new();
    let mut headers = Headers::new();

    for pair in fields.chunks(2) {
        let [field, data] = pair else {
            return Err(RedisStreamsError::Deserialization("odd field count".to_string()));
        };
        let field = text(field, "field name")?;
        let data = bytes(data)
            .ok_or_else(|| RedisStreamsError::Deserialization(format!("invalid {field} value")))?;

        if field == KEY_FIELD {
            key = Some(String::from_utf8_lossy(data).into_owned());
        } else if field == VALUE_FIELD {
            value = data.to_vec();
        } else if let Some(name) = field.strip_prefix(HEADER_PREFIX) {
            headers.add(name, data.to_vec());
        }
    }

    Ok(Some(Message::new(
        SourcePosition::new(topic, PARTITION, Offset::StreamId(id)),
        key,
        value,
        headers,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(
                fields
                    .iter()
                    .flat_map(|(f, v)| [data(f), data(v)])
                    .collect(),
            ),
        ])
    }

    #[test]
    fn entry_fields_follow_layout() {
        let mut headers = Headers::new();
        headers.add("retries", "2");
        headers.add("trace", "t");
        let message = OutgoingMessage::new("orders", Some("o1".to_string()), b"{}".to_vec())
            .with_headers(headers);

        let fields: Vec<_> = entry_fields(&message)
            .into_iter()
            .map(|(f, v)| (f, String::from_utf8(v).unwrap()))
            .collect();

        assert_eq!(
            fields,
            vec![
                ("key".to_string(), "o1".to_string()),
                ("value".to_string(), "{}".to_string()),
                ("header:retries".to_string(), "2".to_string()),
                ("header:trace".to_string(), "t".to_string()),
            ]
        );
    }

    #[test]
    fn keyless_message_has_no_key_field() {
        let message = OutgoingMessage::new("orders", None, b"x".to_vec());
        let fields = entry_fields(&message);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].0, "value");
    }

    #[test]
    fn nil_reply_is_an_empty_read() {
        assert!(parse_read_reply(Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn parses_entries_with_headers_in_order() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("orders-retry"),
            Value::Bulk(vec![entry(
                "1700000000000-0",
                &[
                    ("key", "o1"),
                    ("value", "payload"),
                    ("header:retries", "1"),
                    ("header:retries", "2"),
                ],
            )]),
        ])]);

        let streams = parse_read_reply(reply).unwrap();
        assert_eq!(streams.len(), 1);
        let (topic, messages) = &streams[0];
        assert_eq!(topic, "orders-retry");

        let message = &messages[0];
        assert_eq!(message.key(), Some("o1"));
        assert_eq!(message.value(), b"payload");
        assert_eq!(message.headers().len(), 2);
        assert_eq!(message.headers().last("retries"), Some(&b"2"[..]));
        assert_eq!(
            message.position().offset(),
            &Offset::StreamId("1700000000000-0".to_string())
        );
    }

    #[test]
    fn empty_pending_stream_parses_to_no_messages() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![data("orders"), Value::Bulk(vec![])])]);
        let streams = parse_read_reply(reply).unwrap();
        assert_eq!(streams, vec![("orders".to_string(), Vec::new())]);
    }

    #[test]
    fn deleted_pending_entry_is_skipped() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("orders"),
            Value::Bulk(vec![Value::Bulk(vec![data("1-0"), Value::Nil])]),
        ])]);
        let streams = parse_read_reply(reply).unwrap();
        assert!(streams[0].1.is_empty());
    }

    #[test]
    fn malformed_reply_is_rejected() {
        assert!(parse_read_reply(Value::Int(3)).is_err());
        assert!(parse_read_reply(Value::Bulk(vec![Value::Int(1)])).is_err());
    }

    fn pending(id: &str) -> Value {
        Value::Bulk(vec![data(id), data("order-consumer"), Value::Int(1200), Value::Int(1)])
    }

    #[test]
    fn pending_reply_yields_every_id_in_range() {
        // A commit of 3-0 after 1-0 and 2-0 were handed off without a commit.
        let reply = Value::Bulk(vec![pending("1-0"), pending("2-0"), pending("3-0")]);
        assert_eq!(
            parse_pending_ids(&reply).unwrap(),
            vec!["1-0".to_string(), "2-0".to_string(), "3-0".to_string()]
        );
    }

    #[test]
    fn empty_pending_reply_acks_nothing() {
        assert!(parse_pending_ids(&Value::Bulk(vec![])).unwrap().is_empty());
        assert!(parse_pending_ids(&Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn malformed_pending_reply_is_rejected() {
        assert!(parse_pending_ids(&Value::Int(2)).is_err());
        assert!(parse_pending_ids(&Value::Bulk(vec![Value::Int(1)])).is_err());
        assert!(parse_pending_ids(&Value::Bulk(vec![Value::Bulk(vec![])])).is_err());
    }

    #[test]
    fn transport_errors_map_to_broker_errors() {
        assert_eq!(
            BrokerError::from(RedisStreamsError::Connection("refused".to_string())),
            BrokerError::Connection("refused".to_string())
        );
    }
}
