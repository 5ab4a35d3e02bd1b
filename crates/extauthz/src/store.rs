//! Policy and data store
//!
//! Every check call evaluates inside its own read transaction. The store
//! hands out transactions that snapshot the data document, tracks which are
//! still open, and records whether each was committed or aborted.
//!
//! Policy modules live next to the data. Changing the module set is a
//! recompilation event: every registered trigger fires so that compiled
//! queries built from the old modules are thrown away.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::{ExtAuthzError, Result};

/// A read view into the store, owned by a single check call
#[derive(Debug, Clone)]
pub struct Transaction {
    id: u64,
    data: Arc<Value>,
}

impl Transaction {
    /// Create a transaction over a data snapshot
    pub fn new(id: u64, data: Arc<Value>) -> Self {
        Self { id, data }
    }

    /// Transaction id, unique per store
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Data document visible to this transaction
    pub fn data(&self) -> &Value {
        &self.data
    }
}

/// Transaction provider used by the decision pipeline
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a read transaction scoped to one call
    async fn new_transaction(&self) -> Result<Transaction>;

    /// Close a transaction, aborting it when `abort` is set
    async fn close(&self, txn: Transaction, abort: bool) -> Result<()>;
}

/// Callback fired after the policy module set changes
pub type RecompileTrigger = Box<dyn Fn(u64) + Send + Sync>;

/// In-memory store of policy modules and a JSON data document
pub struct MemoryStore {
    data: RwLock<Arc<Value>>,
    modules: DashMap<String, String>,
    generation: AtomicU64,
    next_txn: AtomicU64,
    open: DashMap<u64, ()>,
    commits: AtomicU64,
    aborts: AtomicU64,
    triggers: RwLock<Vec<RecompileTrigger>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with an empty data document
    pub fn new() -> Self {
        Self::with_data(Value::Object(Default::default()))
    }

    /// Create a store with an initial data document
    pub fn with_data(data: Value) -> Self {
        Self {
            data: RwLock::new(Arc::new(data)),
            modules: DashMap::new(),
            generation: AtomicU64::new(0),
            next_txn: AtomicU64::new(1),
            open: DashMap::new(),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            triggers: RwLock::new(Vec::new()),
        }
    }

    /// Replace the data document
    ///
    /// Open transactions keep the snapshot they started with.
    pub fn set_data(&self, data: Value) {
        *self.data.write() = Arc::new(data);
        debug!("Data document replaced");
    }

    /// Insert or replace a policy module
    pub fn upsert_policy(&self, id: &str, source: &str) {
        self.modules.insert(id.to_string(), source.to_string());
        info!(module = %id, "Policy module updated");
        self.recompiled();
    }

    /// Remove a policy module, returning whether it existed
    pub fn remove_policy(&self, id: &str) -> bool {
        let removed = self.modules.remove(id).is_some();
        if removed {
            info!(module = %id, "Policy module removed");
            self.recompiled();
        }
        removed
    }

    /// Swap the whole module set in one recompilation event
    pub fn replace_policies(&self, modules: BTreeMap<String, String>) {
        self.modules.clear();
        for (id, source) in modules {
            self.modules.insert(id, source);
        }
        info!(modules = self.modules.len(), "Policy modules replaced");
        self.recompiled();
    }

    /// Policy modules ordered by id
    pub fn modules(&self) -> BTreeMap<String, String> {
        self.modules
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Number of recompilation events so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Register a callback for recompilation events
    pub fn register_trigger(&self, trigger: RecompileTrigger) {
        self.triggers.write().push(trigger);
    }

    /// Number of transactions not yet closed
    pub fn open_transactions(&self) -> usize {
        self.open.len()
    }

    /// Number of committed transactions
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of aborted transactions
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    fn recompiled(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        for trigger in self.triggers.read().iter() {
            trigger(generation);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn new_transaction(&self) -> Result<Transaction> {
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().clone();
        self.open.insert(id, ());
        Ok(Transaction::new(id, data))
    }

    async fn close(&self, txn: Transaction, abort: bool) -> Result<()> {
        if self.open.remove(&txn.id).is_none() {
            return Err(ExtAuthzError::store(format!(
                "transaction {} is not open",
                txn.id
            )));
        }
        if abort {
            self.aborts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let store = MemoryStore::new();

        let t1 = store.new_transaction().await.unwrap();
        let t2 = store.new_transaction().await.unwrap();
        assert_ne!(t1.id(), t2.id());
        assert_eq!(store.open_transactions(), 2);

        store.close(t1, false).await.unwrap();
        store.close(t2.clone(), true).await.unwrap();
        assert_eq!(store.open_transactions(), 0);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.aborts(), 1);

        // Closing twice is an error
        assert!(store.close(t2, false).await.is_err());
    }

    #[tokio::test]
    async fn test_transactions_keep_their_snapshot() {
        let store = MemoryStore::with_data(json!({"users": ["alice"]}));
        let before = store.new_transaction().await.unwrap();

        store.set_data(json!({"users": ["alice", "bob"]}));
        let after = store.new_transaction().await.unwrap();

        assert_eq!(before.data(), &json!({"users": ["alice"]}));
        assert_eq!(after.data(), &json!({"users": ["alice", "bob"]}));
    }

    #[test]
    fn test_module_changes_fire_triggers() {
        let store = MemoryStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        store.register_trigger(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.upsert_policy("authz.rego", "package envoy.authz");
        store.replace_policies(BTreeMap::from([(
            "other.rego".to_string(),
            "package other".to_string(),
        )]));
        assert!(!store.remove_policy("authz.rego"));
        assert!(store.remove_policy("other.rego"));

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(store.generation(), 3);
        assert!(store.modules().is_empty());
    }

    #[test]
    fn test_data_changes_do_not_recompile() {
        let store = MemoryStore::new();
        store.set_data(json!({"x": 1}));
        assert_eq!(store.generation(), 0);
    }
}
