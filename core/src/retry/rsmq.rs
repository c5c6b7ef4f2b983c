use std::{
    error::Error,
    fmt,
    sync::Arc,
    time::Duration,
};

use outpost_helpers::{
    redis::ConnectionWrapper,
    time::{Clock, DefaultClock},
};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;

/// The total length of an RSMQ message ID.
const MESSAGE_ID_LENGTH: usize = 32;
/// The length of the base-36 timestamp prefix of a message ID.
const TIMESTAMP_PREFIX_LENGTH: usize = 10;
/// The fixed prefix used for deterministic, caller-derived message IDs
/// so that duplicates collapse onto the same queue entry.
const DETERMINISTIC_ID_PREFIX: &str = "0000000000";

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Provides a custom error type to be used for failures
/// in interactions with the Redis-backed delay queue.
#[derive(Debug)]
pub enum RsmqError {
    Redis(redis::RedisError),
    MalformedReply(String),
}

impl fmt::Display for RsmqError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RsmqError::Redis(err) => write!(f, "rsmq error: {err}"),
            RsmqError::MalformedReply(reason) => {
                write!(f, "rsmq error: malformed reply: {reason}")
            }
        }
    }
}

impl Error for RsmqError {}

impl From<redis::RedisError> for RsmqError {
    fn from(error: redis::RedisError) -> Self {
        RsmqError::Redis(error)
    }
}

/// A message popped from the delay queue. The message stays invisible
/// until the visibility deadline passes, a consumer that does not delete
/// it in time sees it again on a later receive.
#[derive(Debug, Clone, PartialEq)]
pub struct RsmqMessage {
    pub id: String,
    pub body: String,
    /// How many times the message has been received, starting at 1.
    pub receive_count: u64,
}

/// Options for sending a message onto the delay queue.
#[derive(Debug, Clone, Default)]
pub struct RsmqSendOptions {
    /// A caller-supplied deduplication ID. When set, the message ID is
    /// derived deterministically from it, so a later send with the same
    /// ID overwrites the earlier entry's payload and delay.
    pub dedup_id: Option<String>,
}

/// A Redis Simple Message Queue: a delay queue built from a sorted set
/// indexing message visibility deadlines and a hash holding message
/// bodies and receive counters.
///
/// Queue keys wrap the queue name in hash-tag braces so the index and
/// the body hash land in the same cluster slot.
pub struct Rsmq {
    connection: ConnectionWrapper,
    namespace: String,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for Rsmq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rsmq({namespace})", namespace = self.namespace)
    }
}

impl Rsmq {
    pub fn new(connection: ConnectionWrapper, namespace: String) -> Self {
        Self::with_clock(connection, namespace, Arc::new(DefaultClock::new()))
    }

    pub fn with_clock(
        connection: ConnectionWrapper,
        namespace: String,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            connection,
            namespace,
            clock,
        }
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{namespace}:{{{queue}}}", namespace = self.namespace)
    }

    fn queue_hash_key(&self, queue: &str) -> String {
        format!("{namespace}:{{{queue}}}:Q", namespace = self.namespace)
    }

    /// Records queue metadata, creating the queue is otherwise implicit
    /// in the first send.
    pub async fn create_queue(&self, queue: &str) -> Result<(), RsmqError> {
        let mut connection = self.connection.clone();
        let mut pipeline = redis::pipe();
        pipeline
            .cmd("HSETNX")
            .arg(self.queue_hash_key(queue))
            .arg("created")
            .arg(self.clock.now());
        connection.query_pipeline_async(&mut pipeline).await?;
        Ok(())
    }

    /// Pushes a message with the given delay in seconds of invisibility,
    /// returning the message ID.
    pub async fn send_message(
        &self,
        queue: &str,
        body: &str,
        delay: Duration,
        options: RsmqSendOptions,
    ) -> Result<String, RsmqError> {
        let message_id = match &options.dedup_id {
            Some(dedup_id) => message_id_from_dedup_id(dedup_id),
            None => self.random_message_id(),
        };
        let visible_at_ms = self.clock.now_millis() + delay.as_millis() as u64;

        let mut connection = self.connection.clone();
        let mut pipeline = redis::pipe();
        pipeline
            .atomic()
            .cmd("ZADD")
            .arg(self.queue_key(queue))
            .arg(visible_at_ms)
            .arg(&message_id)
            .cmd("HSET")
            .arg(self.queue_hash_key(queue))
            .arg(&message_id)
            .arg(body);
        connection.query_pipeline_async(&mut pipeline).await?;

        debug!(queue, message_id, delay_ms = delay.as_millis() as u64, "queued message");
        Ok(message_id)
    }

    /// Receives the next visible message, hiding it for the visibility
    /// timeout. Returns `None` when no message is currently visible.
    pub async fn receive_message(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<RsmqMessage>, RsmqError> {
        let now_ms = self.clock.now_millis();
        let invisible_until_ms = now_ms + visibility_timeout.as_millis() as u64;

        let mut connection = self.connection.clone();
        let reply: Vec<String> = connection
            .eval_script(
                include_str!("../../lua-scripts/receive_message.lua"),
                &[&self.queue_key(queue), &self.queue_hash_key(queue)],
                &[&now_ms.to_string(), &invisible_until_ms.to_string()],
            )
            .await?;

        match reply.as_slice() {
            [] => Ok(None),
            [id, body, receive_count] => Ok(Some(RsmqMessage {
                id: id.clone(),
                body: body.clone(),
                receive_count: receive_count.parse().map_err(|_| {
                    RsmqError::MalformedReply(format!(
                        "receive count is not an integer: {receive_count}"
                    ))
                })?,
            })),
            reply => Err(RsmqError::MalformedReply(format!(
                "expected 0 or 3 entries, got {len}",
                len = reply.len()
            ))),
        }
    }

    /// Deletes a message, returning whether it existed.
    pub async fn delete_message(&self, queue: &str, message_id: &str) -> Result<bool, RsmqError> {
        let mut connection = self.connection.clone();
        let removed: i64 = connection
            .eval_script(
                include_str!("../../lua-scripts/delete_message.lua"),
                &[&self.queue_key(queue), &self.queue_hash_key(queue)],
                &[message_id],
            )
            .await?;
        Ok(removed > 0)
    }

    /// Moves the visibility deadline of an in-flight message, returning
    /// whether the message existed.
    pub async fn change_message_visibility(
        &self,
        queue: &str,
        message_id: &str,
        visibility_timeout: Duration,
    ) -> Result<bool, RsmqError> {
        let invisible_until_ms =
            self.clock.now_millis() + visibility_timeout.as_millis() as u64;
        let mut connection = self.connection.clone();
        let changed: i64 = connection
            .eval_script(
                include_str!("../../lua-scripts/change_message_visibility.lua"),
                &[&self.queue_key(queue)],
                &[message_id, &invisible_until_ms.to_string()],
            )
            .await?;
        Ok(changed > 0)
    }

    fn random_message_id(&self) -> String {
        let mut id = base36_padded(self.clock.now_millis() as u128, TIMESTAMP_PREFIX_LENGTH);
        let mut rng = rand::thread_rng();
        for _ in 0..(MESSAGE_ID_LENGTH - TIMESTAMP_PREFIX_LENGTH) {
            let index = rng.gen_range(0..BASE36_ALPHABET.len());
            id.push(BASE36_ALPHABET[index] as char);
        }
        id
    }
}

/// Derives the deterministic 32-character message ID for a caller
/// deduplication ID: a fixed all-zero timestamp prefix followed by the
/// first 22 base-36 characters of the SHA-256 digest of the ID.
/// Duplicates therefore collapse onto the same queue entry.
pub fn message_id_from_dedup_id(dedup_id: &str) -> String {
    let digest = Sha256::digest(dedup_id.as_bytes());
    let mut prefix_bytes = [0u8; 16];
    prefix_bytes.copy_from_slice(&digest[..16]);
    let suffix = base36_padded(
        u128::from_be_bytes(prefix_bytes),
        MESSAGE_ID_LENGTH - TIMESTAMP_PREFIX_LENGTH,
    );
    format!(
        "{DETERMINISTIC_ID_PREFIX}{suffix}",
        suffix = &suffix[..MESSAGE_ID_LENGTH - TIMESTAMP_PREFIX_LENGTH]
    )
}

fn base36_padded(mut value: u128, min_length: usize) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(BASE36_ALPHABET[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    while digits.len() < min_length {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 digits are always valid UTF-8")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_deterministic_message_id_format() {
        let id = message_id_from_dedup_id("evt_1:dst_1");

        assert_eq!(id.len(), 32);
        assert!(id.starts_with("0000000000"));
        assert!(id.bytes().all(|b| BASE36_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_duplicate_dedup_ids_collapse_to_the_same_message_id() {
        assert_eq!(
            message_id_from_dedup_id("evt_1:dst_1"),
            message_id_from_dedup_id("evt_1:dst_1")
        );
        assert_ne!(
            message_id_from_dedup_id("evt_1:dst_1"),
            message_id_from_dedup_id("evt_1:dst_2")
        );
    }

    #[test]
    fn test_base36_pads_to_the_requested_length() {
        assert_eq!(base36_padded(0, 10), "0000000000");
        assert_eq!(base36_padded(35, 4), "000z");
        assert_eq!(base36_padded(36, 1), "10");
    }
}
