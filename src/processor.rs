//! Validates and dispatches JSON command frames against the storage
//! engine, enforcing idempotency and emitting exactly one replication
//! event per accepted mutation.

use crate::command::{
    Command, Response, Status, MAX_COMMAND_PAYLOAD_BYTES, MAX_MGET_KEYS, MAX_MSET_PAIRS,
};
use crate::entry::{validate_key, Entry, EntryValue};
use crate::error::MerkleError;
use crate::idempotency::IdempotencyCache;
use crate::metrics::Metrics;
use crate::store::persistence::PersistenceLog;
use crate::store::{PutOutcome, StoreEngine};
use log::warn;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_millis() as u64
}

/// Receives every accepted local mutation so it can be turned into a
/// replication event. Implemented by `replication::Publisher`; kept as a
/// trait here so the processor never depends on the transport stack.
pub trait ReplicationSink: Send + Sync {
    fn publish_local(&self, key: &str, entry: &Entry);
}

pub struct CommandProcessor {
    store: Arc<dyn StoreEngine>,
    idempotency: IdempotencyCache,
    sink: Arc<dyn ReplicationSink>,
    node_id: String,
    seq_counter: AtomicU64,
    metrics: Arc<Metrics>,
    persistence: Option<Arc<PersistenceLog>>,
}

impl CommandProcessor {
    /// `seq_counter` is recovered at construction by scanning the store
    /// for the highest `seq` this node has previously written.
    pub fn new(
        store: Arc<dyn StoreEngine>,
        sink: Arc<dyn ReplicationSink>,
        node_id: String,
        metrics: Arc<Metrics>,
        persistence: Option<Arc<PersistenceLog>>,
    ) -> Self {
        let recovered = store.max_seq_for_node(&node_id);
        Self {
            store,
            idempotency: IdempotencyCache::new(),
            sink,
            node_id,
            seq_counter: AtomicU64::new(recovered),
            metrics,
            persistence,
        }
    }

    /// Replication fan-out plus durable append for one accepted local
    /// mutation. Both happen every time a write wins LWW, whether or not
    /// persistence is configured.
    fn record_applied(&self, key: &str, entry: &Entry) {
        self.sink.publish_local(key, entry);
        if let Some(log) = &self.persistence {
            if let Err(e) = log.append(key, entry) {
                warn!("failed to persist local mutation for {key}: {e}");
            }
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Dispatches one command frame. The byte length of the *encoded*
    /// frame must be checked by the caller (router/transport boundary)
    /// against `MAX_COMMAND_PAYLOAD_BYTES`; this function re-validates
    /// bulk cardinality for MGET/MSET regardless.
    pub fn dispatch(&self, command: Command) -> Response {
        let id = command.id().to_string();
        self.metrics.commands_dispatched.increment();

        if !command.is_read() {
            if let Some(cached) = self.idempotency.get(&id) {
                self.metrics.idempotent_hits.increment();
                return cached;
            }
        }

        let response = match self.execute(&command) {
            Ok(response) => response,
            Err(e) => {
                self.metrics.commands_failed.increment();
                Response::err(id.clone(), e.to_string(), e.error_code())
            }
        };

        if !command.is_read() {
            self.idempotency.insert(id, response.clone());
        }
        response
    }

    fn execute(&self, command: &Command) -> crate::error::Result<Response> {
        match command {
            Command::Get { id, key } => self.do_get(id, key),
            Command::Set { id, key, value } => self.do_set(id, key, value),
            Command::Del { id, key } => self.do_del(id, key),
            Command::Incr { id, key, amount } => self.do_incr_decr(id, key, *amount),
            Command::Decr { id, key, amount } => self.do_incr_decr(id, key, -*amount),
            Command::Append { id, key, fragment } => self.do_append_prepend(id, key, fragment, true),
            Command::Prepend { id, key, fragment } => self.do_append_prepend(id, key, fragment, false),
            Command::MGet { id, keys } => self.do_mget(id, keys),
            Command::MSet { id, pairs } => self.do_mset(id, pairs),
        }
    }

    fn current_value(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Some(entry) => match entry.value {
                EntryValue::Value(v) => Some(v),
                EntryValue::Tombstone => None,
            },
            None => None,
        }
    }

    fn write_value(&self, key: &str, value: String) -> crate::error::Result<Entry> {
        validate_key(key)?;
        let entry = Entry::new_value(value, now_ms(), self.node_id.clone(), self.next_seq())?;
        if self.store.put(key, entry.clone())? == PutOutcome::Applied {
            self.record_applied(key, &entry);
        }
        Ok(entry)
    }

    fn do_get(&self, id: &str, key: &str) -> crate::error::Result<Response> {
        validate_key(key)?;
        match self.current_value(key) {
            Some(v) => Ok(Response::ok(id, Some(json!(v)))),
            None => Err(MerkleError::NotFound),
        }
    }

    fn do_set(&self, id: &str, key: &str, value: &str) -> crate::error::Result<Response> {
        self.write_value(key, value.to_string())?;
        Ok(Response::ok(id, None))
    }

    fn do_del(&self, id: &str, key: &str) -> crate::error::Result<Response> {
        validate_key(key)?;
        let entry = Entry::new_tombstone(now_ms(), self.node_id.clone(), self.next_seq());
        if self.store.put(key, entry.clone())? == PutOutcome::Applied {
            self.record_applied(key, &entry);
        }
        // DEL is always ok, even if the key never existed.
        Ok(Response::ok(id, None))
    }

    fn do_incr_decr(&self, id: &str, key: &str, delta: i64) -> crate::error::Result<Response> {
        let current: i64 = match self.current_value(key) {
            Some(v) => v
                .parse()
                .map_err(|_| MerkleError::Validation(format!("value at {key} is not an integer")))?,
            None => 0,
        };
        let updated = current
            .checked_add(delta)
            .ok_or_else(|| MerkleError::Validation("integer overflow".into()))?;
        self.write_value(key, updated.to_string())?;
        Ok(Response::ok(id, Some(json!(updated))))
    }

    fn do_append_prepend(&self, id: &str, key: &str, fragment: &str, append: bool) -> crate::error::Result<Response> {
        let current = self.current_value(key).unwrap_or_default();
        let updated = if append { format!("{current}{fragment}") } else { format!("{fragment}{current}") };
        let len = updated.len();
        self.write_value(key, updated)?;
        Ok(Response::ok(id, Some(json!(len))))
    }

    fn do_mget(&self, id: &str, keys: &[String]) -> crate::error::Result<Response> {
        if keys.len() > MAX_MGET_KEYS {
            return Err(MerkleError::Validation(format!("MGET accepts at most {MAX_MGET_KEYS} keys")));
        }
        let mut map = serde_json::Map::new();
        let mut total = 0usize;
        for key in keys {
            validate_key(key)?;
            let value = self.current_value(key);
            total += key.len() + value.as_ref().map(|v| v.len()).unwrap_or(0);
            map.insert(key.clone(), json!(value));
        }
        if total > MAX_COMMAND_PAYLOAD_BYTES {
            return Err(MerkleError::SizeLimit("MGET result exceeds 512 KiB".into()));
        }
        Ok(Response::ok(id, Some(serde_json::Value::Object(map))))
    }

    fn do_mset(&self, id: &str, pairs: &std::collections::HashMap<String, String>) -> crate::error::Result<Response> {
        if pairs.len() > MAX_MSET_PAIRS {
            return Err(MerkleError::Validation(format!("MSET accepts at most {MAX_MSET_PAIRS} pairs")));
        }
        let total: usize = pairs.iter().map(|(k, v)| k.len() + v.len()).sum();
        if total > MAX_COMMAND_PAYLOAD_BYTES {
            return Err(MerkleError::SizeLimit("MSET payload exceeds 512 KiB".into()));
        }
        let mut results = serde_json::Map::new();
        for (key, value) in pairs {
            match self.write_value(key, value.clone()) {
                Ok(_) => results.insert(key.clone(), json!("ok")),
                Err(e) => results.insert(key.clone(), json!(e.to_string())),
            };
        }
        Ok(Response::ok(id, Some(serde_json::Value::Object(results))))
    }
}
