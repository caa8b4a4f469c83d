//! Crypto Channel
//!
//! Caller side of the offload protocol. Each request gets a correlation id
//! and a pending slot; a router task resolves slots as responses arrive.
//!
//! - Requests not answered within the timeout fail with
//!   [`ChannelError::Timeout`]; a late response is dropped.
//! - `validate_chain` is debounced: calls within the quiet period collapse
//!   into one execution on the last call's entries, and every caller in the
//!   burst receives that single result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::keys::KeySchedule;
use super::protocol::{EncryptedBlob, OffloadRequest, OffloadResponse, Operation};
use super::worker::CryptoWorker;
use crate::core::clock::SharedClock;
use crate::ledger::Entry;

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// No response within the timeout.
    #[error("offload request timed out")]
    Timeout,
    /// Worker is gone.
    #[error("offload channel closed")]
    Closed,
    /// Worker reported a failure.
    #[error("offload worker error: {0}")]
    Remote(String),
    /// Payload or result could not be (de)serialized.
    #[error("offload codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Channel timing.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Per-request response bound.
    pub timeout: Duration,
    /// Quiet period for `validate_chain`.
    pub debounce: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            debounce: Duration::from_secs(1),
        }
    }
}

type Reply = oneshot::Sender<Result<Value, ChannelError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

#[derive(Default)]
struct Debounce {
    generation: u64,
    latest: Option<Vec<Entry>>,
    waiters: Vec<oneshot::Sender<Result<bool, ChannelError>>>,
}

struct Inner {
    config: ChannelConfig,
    clock: SharedClock,
    next_id: AtomicU64,
    pending: PendingMap,
    requests: mpsc::UnboundedSender<String>,
    debounce: Mutex<Debounce>,
}

/// Handle to the crypto worker. Cheap to clone.
#[derive(Clone)]
pub struct CryptoChannel {
    inner: Arc<Inner>,
}

impl CryptoChannel {
    /// Start a worker thread over `keys` and the router task.
    ///
    /// Must be called inside a Tokio runtime. The worker stops once every
    /// clone of the channel is dropped.
    pub fn spawn(
        keys: KeySchedule,
        clock: SharedClock,
        config: ChannelConfig,
    ) -> std::io::Result<Self> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();

        CryptoWorker::new(keys, clock.clone()).spawn(req_rx, resp_tx)?;
        Ok(Self::from_parts(config, clock, req_tx, resp_rx))
    }

    /// Wire a channel to an already running responder.
    fn from_parts(
        config: ChannelConfig,
        clock: SharedClock,
        requests: mpsc::UnboundedSender<String>,
        responses: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(route_responses(responses, pending.clone()));

        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                next_id: AtomicU64::new(0),
                pending,
                requests,
                debounce: Mutex::new(Debounce::default()),
            }),
        }
    }

    /// A channel whose worker never receives `operation` requests, so those
    /// always time out.
    #[cfg(test)]
    pub(crate) fn spawn_ignoring(
        keys: KeySchedule,
        clock: SharedClock,
        config: ChannelConfig,
        operation: Operation,
    ) -> std::io::Result<Self> {
        let (req_tx, mut filter_rx) = mpsc::unbounded_channel::<String>();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();

        CryptoWorker::new(keys, clock.clone()).spawn(worker_rx, resp_tx)?;
        tokio::spawn(async move {
            while let Some(raw) = filter_rx.recv().await {
                let ignored = OffloadRequest::from_json(&raw)
                    .map(|r| r.operation == operation)
                    .unwrap_or(false);
                if !ignored && worker_tx.send(raw).is_err() {
                    break;
                }
            }
        });

        Ok(Self::from_parts(config, clock, req_tx, resp_rx))
    }

    /// Send one request and wait for its result.
    pub async fn request(&self, operation: Operation, payload: Value) -> Result<Value, ChannelError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = self.inner.config.timeout;
        let request = OffloadRequest {
            id,
            operation,
            payload,
            deadline: Some(self.inner.clock.now_millis() + timeout.as_millis() as u64),
        };
        let raw = request.to_json()?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        if self.inner.requests.send(raw).is_err() {
            self.inner.pending.lock().await.remove(&id);
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                warn!(id, ?operation, "offload request timed out");
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Encrypt a serializable value.
    pub async fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncryptedBlob, ChannelError> {
        let result = self
            .request(Operation::Encrypt, serde_json::to_value(value)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Decrypt a blob. `None` if it is malformed, fails authentication, or
    /// does not decode as `T`.
    pub async fn decrypt<T: DeserializeOwned>(&self, blob: &EncryptedBlob) -> Result<Option<T>, ChannelError> {
        let result = self
            .request(Operation::Decrypt, serde_json::to_value(blob)?)
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(serde_json::from_value(result).ok())
    }

    /// Hex digest of the canonical encoding.
    pub async fn hash<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, ChannelError> {
        let result = self
            .request(Operation::Hash, serde_json::to_value(value)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Validate a chain immediately, bypassing the debounce.
    pub async fn validate_chain_now(&self, entries: &[Entry]) -> Result<bool, ChannelError> {
        let result = self
            .request(Operation::ValidateChain, serde_json::to_value(entries)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Debounced chain validation.
    pub async fn validate_chain(&self, entries: Vec<Entry>) -> Result<bool, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut state = self.inner.debounce.lock().await;
            state.generation += 1;
            state.latest = Some(entries);
            state.waiters.push(tx);
            state.generation
        };

        let channel = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(channel.inner.config.debounce).await;

            let (entries, waiters) = {
                let mut state = channel.inner.debounce.lock().await;
                if state.generation != generation {
                    return;
                }
                (state.latest.take(), std::mem::take(&mut state.waiters))
            };

            debug!(callers = waiters.len(), "running debounced chain validation");
            let result = match entries {
                Some(entries) => channel.validate_chain_now(&entries).await,
                None => Ok(true),
            };
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });

        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Drop the worker's cached derived key and retained seeds.
    pub async fn forget_key(&self) -> Result<(), ChannelError> {
        self.request(Operation::ForgetKey, Value::Null).await?;
        Ok(())
    }

    /// Retire seeds older than `committed`, the epoch of the stored blob.
    /// Returns how many were dropped.
    pub async fn retire_keys(&self, committed: u64) -> Result<usize, ChannelError> {
        let result = self
            .request(Operation::RetireKeys, Value::from(committed))
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

async fn route_responses(mut responses: mpsc::UnboundedReceiver<String>, pending: PendingMap) {
    while let Some(raw) = responses.recv().await {
        let response = match OffloadResponse::from_json(&raw) {
            Ok(r) => r,
            Err(e) => {
                warn!("dropping malformed offload response: {}", e);
                continue;
            }
        };

        let Some(reply) = pending.lock().await.remove(&response.id) else {
            debug!(id = response.id, "dropping late offload response");
            continue;
        };

        let result = if response.success {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(ChannelError::Remote(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        };
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::ledger::entry::tests::draft;
    use crate::ledger::HashChain;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn channel() -> CryptoChannel {
        let keys = KeySchedule::new(Arc::new(MemoryStore::new()), 50);
        CryptoChannel::spawn(keys, Arc::new(SystemClock), ChannelConfig::default()).unwrap()
    }

    fn chain(len: u64) -> Vec<Entry> {
        let mut chain = HashChain::new();
        for id in 1..=len {
            chain.append(draft(id, [1, 2, 3, 4, 5, 10 + id as u8])).unwrap();
        }
        chain.entries().to_vec()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let channel = channel();
        let entries = chain(3);

        let blob = channel.encrypt(&entries).await.unwrap();
        let back: Option<Vec<Entry>> = channel.decrypt(&blob).await.unwrap();
        assert_eq!(back, Some(entries));
    }

    #[tokio::test]
    async fn test_tampered_decrypt_is_none() {
        let channel = channel();
        let mut blob = channel.encrypt(&json!({ "k": "v" })).await.unwrap();
        blob.data[0] ^= 0xff;

        let back: Option<Value> = channel.decrypt(&blob).await.unwrap();
        assert_eq!(back, None);

        blob.iv = vec![0; 4];
        let back: Option<Value> = channel.decrypt(&blob).await.unwrap();
        assert_eq!(back, None);
    }

    #[tokio::test]
    async fn test_hash_is_canonical() {
        let channel = channel();
        let a = channel.hash(&json!({ "a": 1, "b": 2 })).await.unwrap();
        let b = channel.hash(&json!({ "b": 2, "a": 1 })).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate() {
        let channel = channel();
        let values: Vec<Value> = (0..16).map(|i| json!({ "n": i })).collect();

        let hashes = hash_all(&channel, &values).await;
        for (value, hash) in values.iter().zip(hashes) {
            assert_eq!(hash, crate::core::hash::digest_hex(value).unwrap());
        }
    }

    async fn hash_all(channel: &CryptoChannel, values: &[Value]) -> Vec<String> {
        let handles: Vec<_> = values
            .iter()
            .cloned()
            .map(|v| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.hash(&v).await.unwrap() })
            })
            .collect();
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_debounce_returns_trailing_result() {
        let channel = channel();
        let good = chain(3);
        let mut bad = chain(3);
        bad[1].previous_hash = "0".to_string();

        // The bad chain is submitted first but the burst runs once, on the
        // last submission.
        let first = {
            let channel = channel.clone();
            let bad = bad.clone();
            tokio::spawn(async move { channel.validate_chain(bad).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = channel.validate_chain(good).await;

        assert_eq!(second, Ok(true));
        assert_eq!(first.await.unwrap(), Ok(true));

        // Outside a burst each call runs on its own entries.
        assert_eq!(channel.validate_chain(bad).await, Ok(false));
    }

    #[tokio::test]
    async fn test_debounce_single_execution() {
        let channel = channel();
        let before = channel.inner.next_id.load(Ordering::Relaxed);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move { channel.validate_chain(chain(2)).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(true));
        }

        assert_eq!(channel.inner.next_id.load(Ordering::Relaxed), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_worker_silent() {
        // A channel whose worker never answers.
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let (_resp_tx, resp_rx) = mpsc::unbounded_channel();
        let channel = CryptoChannel::from_parts(
            ChannelConfig::default(),
            Arc::new(SystemClock),
            req_tx,
            resp_rx,
        );

        let result = channel.hash(&json!(1)).await;
        assert_eq!(result, Err(ChannelError::Timeout));
        assert!(channel.inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_ignored_operation_times_out_others_answer() {
        let keys = KeySchedule::new(Arc::new(MemoryStore::new()), 50);
        let config = ChannelConfig {
            timeout: Duration::from_millis(200),
            ..ChannelConfig::default()
        };
        let channel =
            CryptoChannel::spawn_ignoring(keys, Arc::new(SystemClock), config, Operation::Encrypt)
                .unwrap();

        assert!(channel.hash(&json!(1)).await.is_ok());
        assert_eq!(channel.encrypt(&json!(1)).await, Err(ChannelError::Timeout));
    }

    #[tokio::test]
    async fn test_closed_when_worker_gone() {
        let (req_tx, req_rx) = mpsc::unbounded_channel::<String>();
        drop(req_rx);
        let (_resp_tx, resp_rx) = mpsc::unbounded_channel();
        let channel = CryptoChannel::from_parts(
            ChannelConfig::default(),
            Arc::new(SystemClock),
            req_tx,
            resp_rx,
        );

        assert_eq!(channel.hash(&json!(1)).await, Err(ChannelError::Closed));
    }
}
