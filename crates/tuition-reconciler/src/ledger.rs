//! Processed-Intent Ledger
//!
//! Append-only set of intents already announced to the user as paid. It is
//! the idempotency guard shared by every detection path, persisted as a JSON
//! array of uuids under [`LEDGER_KEY`] so a reload within the same session
//! remembers what was shown.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tuition_core::{IntentId, KeyValueStore};

/// Session store key holding the ledger
pub const LEDGER_KEY: &str = "processedInvoices";

#[derive(Default)]
struct Entries {
    seen: HashSet<IntentId>,
    /// Insertion order, as persisted
    order: Vec<IntentId>,
}

/// Ledger of processed intents backed by a session store
pub struct ProcessedLedger {
    store: Arc<dyn KeyValueStore>,
    entries: Mutex<Entries>,
}

impl ProcessedLedger {
    /// Load whatever the session store already holds
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let mut entries = Entries::default();

        match store.get(LEDGER_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<IntentId>>(&raw) {
                Ok(ids) => {
                    for id in ids {
                        if entries.seen.insert(id.clone()) {
                            entries.order.push(id);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable processed ledger");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not read processed ledger, starting empty");
            }
        }

        tracing::debug!(entries = entries.order.len(), "Processed ledger loaded");

        Self {
            store,
            entries: Mutex::new(entries),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically add `uuid` if absent.
    ///
    /// Returns `true` only for the caller that inserted it.
    pub fn try_mark(&self, uuid: &IntentId) -> bool {
        let mut entries = self.guard();
        if !entries.seen.insert(uuid.clone()) {
            return false;
        }
        entries.order.push(uuid.clone());
        self.persist(&entries.order);
        true
    }

    /// Record `uuid` without announcing it; idempotent
    pub fn mark_processed(&self, uuid: &IntentId) {
        self.try_mark(uuid);
    }

    pub fn is_processed(&self, uuid: &IntentId) -> bool {
        self.guard().seen.contains(uuid)
    }

    /// Snapshot in insertion order
    pub fn snapshot(&self) -> Vec<IntentId> {
        self.guard().order.clone()
    }

    pub fn len(&self) -> usize {
        self.guard().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The in-memory set stays authoritative for this session even if the
    // write fails.
    fn persist(&self, order: &[IntentId]) {
        let result = serde_json::to_string(order)
            .map_err(tuition_core::PaymentError::from)
            .and_then(|raw| self.store.set(LEDGER_KEY, &raw));

        if let Err(e) = result {
            tracing::warn!(error = %e, entries = order.len(), "Failed to persist processed ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuition_core::{MemoryStore, PaymentError, Result};

    struct ReadOnlyStore;

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(PaymentError::Storage("quota exceeded".into()))
        }
    }

    #[test]
    fn test_try_mark_once() {
        let ledger = ProcessedLedger::load(Arc::new(MemoryStore::new()));
        let id = IntentId::from("inv-1");

        assert!(!ledger.is_processed(&id));
        assert!(ledger.try_mark(&id));
        assert!(!ledger.try_mark(&id));
        ledger.mark_processed(&id);

        assert!(ledger.is_processed(&id));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_concurrent_marks_admit_one() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ProcessedLedger::load(store.clone());
        let id = IntentId::from("inv-race");
        let start = std::sync::Barrier::new(8);

        let wins = std::thread::scope(|scope| {
            let racers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        ledger.try_mark(&id)
                    })
                })
                .collect();
            racers
                .into_iter()
                .map(|racer| racer.join().unwrap())
                .filter(|won| *won)
                .count()
        });

        assert_eq!(wins, 1);
        assert_eq!(ledger.snapshot(), vec![id]);
        assert_eq!(store.get(LEDGER_KEY).unwrap().as_deref(), Some(r#"["inv-race"]"#));
    }

    #[test]
    fn test_persists_json_array() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ProcessedLedger::load(store.clone());

        ledger.try_mark(&IntentId::from("a"));
        ledger.try_mark(&IntentId::from("b"));

        assert_eq!(store.get(LEDGER_KEY).unwrap().as_deref(), Some(r#"["a","b"]"#));
    }

    #[test]
    fn test_survives_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        ProcessedLedger::load(store.clone()).try_mark(&IntentId::from("a"));

        let reloaded = ProcessedLedger::load(store);
        assert!(reloaded.is_processed(&IntentId::from("a")));
        assert!(!reloaded.try_mark(&IntentId::from("a")));
    }

    #[test]
    fn test_duplicate_and_corrupt_entries() {
        let store = Arc::new(MemoryStore::new());
        store.set(LEDGER_KEY, r#"["a","a","b"]"#).unwrap();
        assert_eq!(ProcessedLedger::load(store.clone()).len(), 2);

        store.set(LEDGER_KEY, "not json").unwrap();
        assert!(ProcessedLedger::load(store).is_empty());
    }

    #[test]
    fn test_write_failure_keeps_guard() {
        let ledger = ProcessedLedger::load(Arc::new(ReadOnlyStore));
        let id = IntentId::from("inv-9");

        assert!(ledger.try_mark(&id));
        assert!(!ledger.try_mark(&id));
        assert!(ledger.is_processed(&id));
    }
}
