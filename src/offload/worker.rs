//! Crypto Worker
//!
//! The responder side of the offload channel. Runs on its own OS thread,
//! owns the key schedule, and talks to the caller only through JSON strings:
//!
//! ```text
//!   caller ──request json──► [mpsc] ──► CryptoWorker::process
//!   caller ◄─response json── [mpsc] ◄──────────┘
//! ```
//!
//! Requests carry a deadline. Expired requests are answered with an error
//! without doing the work, and chain validation stops mid-scan once the
//! deadline passes, so an abandoned request does not keep the worker busy.

use std::thread::{self, JoinHandle};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::keys::{open, seal, KeyError, KeySchedule};
use super::protocol::{EncryptedBlob, OffloadRequest, OffloadResponse, Operation};
use crate::core::clock::SharedClock;
use crate::core::hash::{digest_hex, EncodingError};
use crate::ledger::{check_entry, Entry};

/// Failures reported back to the caller.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Key schedule failure.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Payload could not be encoded.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Payload could not be (de)serialized.
    #[error("payload codec: {0}")]
    Codec(#[from] serde_json::Error),
    /// The caller's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Isolated crypto responder.
pub struct CryptoWorker {
    keys: KeySchedule,
    clock: SharedClock,
}

impl CryptoWorker {
    /// Create a worker owning `keys`.
    pub fn new(keys: KeySchedule, clock: SharedClock) -> Self {
        Self { keys, clock }
    }

    /// Run on a dedicated thread until the request sender is dropped.
    pub fn spawn(
        self,
        requests: mpsc::UnboundedReceiver<String>,
        responses: mpsc::UnboundedSender<String>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("crypto-offload".to_string())
            .spawn(move || self.run(requests, responses))
    }

    /// Blocking request loop.
    pub fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<String>,
        responses: mpsc::UnboundedSender<String>,
    ) {
        debug!("crypto worker started");

        while let Some(raw) = requests.blocking_recv() {
            let Some(reply) = self.handle(&raw) else {
                continue;
            };
            if responses.send(reply).is_err() {
                break;
            }
        }

        debug!("crypto worker stopped");
    }

    /// Handle one raw request. `None` when the request cannot be parsed
    /// well enough to correlate a reply.
    pub fn handle(&mut self, raw: &str) -> Option<String> {
        let request = match OffloadRequest::from_json(raw) {
            Ok(r) => r,
            Err(e) => {
                warn!("dropping malformed offload request: {}", e);
                return None;
            }
        };

        let response = self.process(request);
        match response.to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(id = response.id, "failed to encode offload response: {}", e);
                None
            }
        }
    }

    /// Execute a request.
    pub fn process(&mut self, request: OffloadRequest) -> OffloadResponse {
        let id = request.id;
        match self.execute(request) {
            Ok(result) => OffloadResponse::ok(id, result),
            Err(e) => {
                debug!(id, operation_error = %e, "offload request failed");
                OffloadResponse::err(id, e.to_string())
            }
        }
    }

    fn execute(&mut self, request: OffloadRequest) -> Result<Value, WorkerError> {
        let deadline = request.deadline;
        if self.expired(deadline) {
            return Err(WorkerError::DeadlineExceeded);
        }

        match request.operation {
            Operation::Encrypt => {
                let plaintext = serde_json::to_vec(&request.payload)?;
                let key = self.keys.key_for_encrypt()?;
                Ok(serde_json::to_value(seal(&key, &plaintext)?)?)
            }
            Operation::Decrypt => {
                let blob: EncryptedBlob = match serde_json::from_value(request.payload) {
                    Ok(blob) => blob,
                    Err(_) => return Ok(Value::Null),
                };
                let plain = self
                    .keys
                    .key_for_epoch(blob.epoch)?
                    .and_then(|key| open(&key, &blob))
                    .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
                Ok(plain.unwrap_or(Value::Null))
            }
            Operation::Hash => Ok(Value::String(digest_hex(&request.payload)?)),
            Operation::ValidateChain => {
                let entries: Vec<Entry> = match serde_json::from_value(request.payload) {
                    Ok(entries) => entries,
                    Err(_) => return Ok(Value::Bool(false)),
                };
                for i in 0..entries.len() {
                    if self.expired(deadline) {
                        return Err(WorkerError::DeadlineExceeded);
                    }
                    if let Some(fault) = check_entry(&entries, i) {
                        debug!(%fault, "chain validation failed");
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Operation::ForgetKey => {
                self.keys.forget()?;
                Ok(Value::Bool(true))
            }
            Operation::RetireKeys => {
                let committed: u64 = serde_json::from_value(request.payload)?;
                Ok(Value::from(self.keys.retire_before(committed)?))
            }
        }
    }

    fn expired(&self, deadline: Option<u64>) -> bool {
        deadline.is_some_and(|d| self.clock.now_millis() > d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::ledger::entry::tests::draft;
    use crate::ledger::HashChain;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    const T0: u64 = 1_700_000_000_000;

    fn worker() -> (CryptoWorker, Arc<ManualClock>) {
        worker_with_rotation(50)
    }

    fn worker_with_rotation(max_operations: u64) -> (CryptoWorker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let keys = KeySchedule::new(Arc::new(MemoryStore::new()), max_operations);
        (CryptoWorker::new(keys, clock.clone()), clock)
    }

    fn request(id: u64, operation: Operation, payload: Value) -> OffloadRequest {
        OffloadRequest {
            id,
            operation,
            payload,
            deadline: None,
        }
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (mut worker, _) = worker();
        let plain = json!([{ "id": 1, "numbers": [1, 2, 3, 4, 5, 6] }]);

        let sealed = worker.process(request(1, Operation::Encrypt, plain.clone()));
        assert!(sealed.success);

        let opened = worker.process(request(2, Operation::Decrypt, sealed.result.unwrap()));
        assert_eq!(opened.id, 2);
        assert_eq!(opened.result, Some(plain));
    }

    #[test]
    fn test_decrypt_uses_blob_epoch_until_retired() {
        let (mut worker, _) = worker_with_rotation(1);
        let plain = json!(["first"]);

        let old = worker.process(request(1, Operation::Encrypt, plain.clone())).result.unwrap();
        let new = worker.process(request(2, Operation::Encrypt, json!(["second"]))).result.unwrap();
        assert_eq!(old["epoch"], 0);
        assert_eq!(new["epoch"], 1);

        let opened = worker.process(request(3, Operation::Decrypt, old.clone()));
        assert_eq!(opened.result, Some(plain));

        let retired = worker.process(request(4, Operation::RetireKeys, json!(1)));
        assert_eq!(retired.result, Some(json!(1)));
        let opened = worker.process(request(5, Operation::Decrypt, old));
        assert_eq!(opened.result, Some(Value::Null));
    }

    #[test]
    fn test_decrypt_malformed_is_null() {
        let (mut worker, _) = worker();
        let resp = worker.process(request(1, Operation::Decrypt, json!({ "data": "nope" })));
        assert!(resp.success);
        assert_eq!(resp.result, Some(Value::Null));
    }

    #[test]
    fn test_hash_matches_digest() {
        let (mut worker, _) = worker();
        let payload = json!({ "b": 1, "a": 2 });
        let resp = worker.process(request(1, Operation::Hash, payload.clone()));
        assert_eq!(resp.result, Some(Value::String(digest_hex(&payload).unwrap())));
    }

    #[test]
    fn test_validate_chain() {
        let (mut worker, _) = worker();
        let mut chain = HashChain::new();
        for id in 1..=3 {
            chain.append(draft(id, [1, 2, 3, 4, 5, id as u8 + 10])).unwrap();
        }
        let mut entries = chain.entries().to_vec();

        let ok = worker.process(request(1, Operation::ValidateChain, json!(entries)));
        assert_eq!(ok.result, Some(Value::Bool(true)));

        entries[2].previous_hash = "f00d".to_string();
        let broken = worker.process(request(2, Operation::ValidateChain, json!(entries)));
        assert_eq!(broken.result, Some(Value::Bool(false)));
    }

    #[test]
    fn test_expired_request_skipped() {
        let (mut worker, clock) = worker();
        let mut req = request(9, Operation::Hash, json!(1));
        req.deadline = Some(T0 + 1_000);

        clock.advance(std::time::Duration::from_secs(2));
        let resp = worker.process(req);
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_malformed_request_dropped() {
        let (mut worker, _) = worker();
        assert!(worker.handle("{not json").is_none());

        let reply = worker.handle(r#"{"id":4,"operation":"hash","payload":[]}"#).unwrap();
        assert_eq!(OffloadResponse::from_json(&reply).unwrap().id, 4);
    }

    #[tokio::test]
    async fn test_thread_stops_when_sender_dropped() {
        let (worker, _) = worker();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        let handle = worker.spawn(req_rx, resp_tx).unwrap();

        req_tx
            .send(request(1, Operation::Hash, json!("x")).to_json().unwrap())
            .unwrap();
        let reply = resp_rx.recv().await.unwrap();
        assert!(OffloadResponse::from_json(&reply).unwrap().success);

        drop(req_tx);
        assert!(resp_rx.recv().await.is_none());
        handle.join().unwrap();
    }
}
