//! Load coalescing.
//!
//! Concurrent loads for the same (table, load key) pair accumulate into
//! an explicit batch. The first task to enqueue becomes the dispatcher:
//! it yields once so concurrently spawned loads can join, then flushes
//! the whole batch through a single fetch. Every waiter for a value gets
//! a clone of that value's rows, or a clone of the batch error.
//!
//! Invalidation discards pending slots with a resubmit signal, so a
//! waiter whose value was invalidated mid-flight re-enqueues into a
//! fresh batch instead of consuming a stale result.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tracing::debug;

use strata_core::{EntityError, EntityResult, EntityRow, LoadKey, LoadValue};

use crate::context::TransactionalQueryContext;

/// Backing fetch for a coalescer: one batched lookup per flush.
#[async_trait]
pub trait BatchFetcher: Send + Sync {
    async fn fetch(
        &self,
        values: Vec<LoadValue>,
    ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>>;
}

/// Lifetime a coalescer is bound to.
#[derive(Clone)]
pub enum CoalescerScope {
    /// Process-wide, for non-transactional loads.
    Global,
    /// Bound to a transactional context. Once the context completes (or
    /// is dropped) the coalescer dispatches empty results instead of
    /// fetching.
    Transaction(Weak<TransactionalQueryContext>),
}

enum SlotOutcome {
    Ready(EntityResult<Vec<EntityRow>>),
    /// The slot was discarded by invalidation; re-enqueue the value.
    Resubmit,
}

struct PendingSlot {
    value: LoadValue,
    encoded: String,
    waiters: Vec<oneshot::Sender<SlotOutcome>>,
}

#[derive(Default)]
struct BatchState {
    pending: Vec<PendingSlot>,
    dispatch_scheduled: bool,
}

/// Accumulates concurrent loads for one (table, load key) pair.
pub struct LoadCoalescer {
    fetcher: Arc<dyn BatchFetcher>,
    scope: CoalescerScope,
    state: Mutex<BatchState>,
}

impl LoadCoalescer {
    pub fn new(fetcher: Arc<dyn BatchFetcher>, scope: CoalescerScope) -> Self {
        Self {
            fetcher,
            scope,
            state: Mutex::new(BatchState::default()),
        }
    }

    fn scope_completed(&self) -> bool {
        match &self.scope {
            CoalescerScope::Global => false,
            CoalescerScope::Transaction(ctx) => match ctx.upgrade() {
                Some(ctx) => ctx.is_completed(),
                None => true,
            },
        }
    }

    /// Load rows for `values`, joining any batch already pending.
    ///
    /// Duplicate values collapse to one slot. The result maps every
    /// requested value to its rows (possibly empty).
    pub async fn load_many(
        &self,
        values: &[LoadValue],
    ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>> {
        let mut results = HashMap::new();
        let mut queue = Vec::new();
        let mut seen = HashSet::new();
        for value in values {
            if seen.insert(value.stable_encode()) {
                queue.push(value.clone());
            }
        }

        while !queue.is_empty() {
            let mut receivers = Vec::with_capacity(queue.len());
            let is_dispatcher = {
                let mut state = self.state.lock().expect("coalescer lock poisoned");
                for value in queue.drain(..) {
                    let (sender, receiver) = oneshot::channel();
                    let encoded = value.stable_encode();
                    match state.pending.iter_mut().find(|slot| slot.encoded == encoded) {
                        Some(slot) => slot.waiters.push(sender),
                        None => state.pending.push(PendingSlot {
                            value: value.clone(),
                            encoded,
                            waiters: vec![sender],
                        }),
                    }
                    receivers.push((value, receiver));
                }
                !std::mem::replace(&mut state.dispatch_scheduled, true)
            };

            if is_dispatcher {
                // Give concurrently spawned loads one scheduling turn to
                // join the batch before it flushes.
                tokio::task::yield_now().await;
                self.flush().await;
            }

            for (value, receiver) in receivers {
                match receiver.await {
                    Ok(SlotOutcome::Ready(Ok(rows))) => {
                        results.insert(value, rows);
                    }
                    Ok(SlotOutcome::Ready(Err(error))) => return Err(error),
                    Ok(SlotOutcome::Resubmit) => queue.push(value),
                    Err(_) => {
                        return Err(EntityError::Internal {
                            reason: "batch dispatch dropped a pending load".to_string(),
                        })
                    }
                }
            }
        }

        Ok(results)
    }

    /// Flush the pending batch through one fetch.
    ///
    /// Public so callers that cannot tolerate the dispatch delay can
    /// force an immediate round-trip.
    pub async fn flush(&self) {
        let batch = {
            let mut state = self.state.lock().expect("coalescer lock poisoned");
            state.dispatch_scheduled = false;
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return;
        }

        // A completed scope must not issue reads: resolve everything as
        // empty.
        if self.scope_completed() {
            debug!(batch_len = batch.len(), "flush on completed scope, resolving empty");
            for slot in batch {
                for waiter in slot.waiters {
                    let _ = waiter.send(SlotOutcome::Ready(Ok(Vec::new())));
                }
            }
            return;
        }

        let values: Vec<LoadValue> = batch.iter().map(|slot| slot.value.clone()).collect();
        debug!(batch_len = values.len(), "flushing coalesced batch");
        match self.fetcher.fetch(values).await {
            Ok(mut fetched) => {
                for slot in batch {
                    let rows = fetched.remove(&slot.value).unwrap_or_default();
                    let mut waiters = slot.waiters.into_iter();
                    let last = waiters.next_back();
                    for waiter in waiters {
                        let _ = waiter.send(SlotOutcome::Ready(Ok(rows.clone())));
                    }
                    if let Some(waiter) = last {
                        let _ = waiter.send(SlotOutcome::Ready(Ok(rows)));
                    }
                }
            }
            Err(error) => {
                for slot in batch {
                    for waiter in slot.waiters {
                        let _ = waiter.send(SlotOutcome::Ready(Err(error.clone())));
                    }
                }
            }
        }
    }

    /// Discard the pending slot for `value`, if any.
    ///
    /// Waiters receive a resubmit signal and re-enqueue; a load already
    /// in flight is unaffected.
    pub fn discard(&self, value: &LoadValue) {
        let slot = {
            let mut state = self.state.lock().expect("coalescer lock poisoned");
            let encoded = value.stable_encode();
            state
                .pending
                .iter()
                .position(|slot| slot.encoded == encoded)
                .map(|index| state.pending.remove(index))
        };
        if let Some(slot) = slot {
            debug!("discarding pending coalescer slot");
            for waiter in slot.waiters {
                let _ = waiter.send(SlotOutcome::Resubmit);
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state.lock().expect("coalescer lock poisoned").pending.len()
    }
}

/// Coalescers keyed by (table, load key), created on first use.
#[derive(Default)]
pub struct CoalescerRegistry {
    inner: DashMap<String, Arc<LoadCoalescer>>,
}

impl CoalescerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry_key(table: &str, key: &LoadKey) -> String {
        format!("{}|{:?}|{}", table, key.load_method_type(), key.serialized())
    }

    /// The coalescer for (table, key), creating it with `make` if absent.
    pub fn get_or_create(
        &self,
        table: &str,
        key: &LoadKey,
        make: impl FnOnce() -> LoadCoalescer,
    ) -> Arc<LoadCoalescer> {
        self.inner
            .entry(Self::registry_key(table, key))
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    /// The coalescer for (table, key), if one exists.
    pub fn get(&self, table: &str, key: &LoadKey) -> Option<Arc<LoadCoalescer>> {
        self.inner
            .get(&Self::registry_key(table, key))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Discard the pending slot for `value` on (table, key), if any.
    pub fn discard(&self, table: &str, key: &LoadKey, value: &LoadValue) {
        if let Some(coalescer) = self.get(table, key) {
            coalescer.discard(value);
        }
    }

    /// Drop every coalescer. Used when the owning scope completes.
    pub fn clear(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_core::FieldValue;

    struct CountingFetcher {
        calls: AtomicUsize,
        values_seen: Mutex<Vec<usize>>,
    }

    impl CountingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                values_seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchFetcher for CountingFetcher {
        async fn fetch(
            &self,
            values: Vec<LoadValue>,
        ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.values_seen
                .lock()
                .expect("test lock")
                .push(values.len());
            Ok(values
                .into_iter()
                .map(|value| {
                    let row = match &value {
                        LoadValue::Single(field_value) => {
                            EntityRow::new().with("id", field_value.clone())
                        }
                        LoadValue::Composite(_) => EntityRow::new().with("id", 1i64),
                    };
                    (value, vec![row])
                })
                .collect())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl BatchFetcher for FailingFetcher {
        async fn fetch(
            &self,
            _values: Vec<LoadValue>,
        ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>> {
            Err(EntityError::Internal {
                reason: "fetch exploded".to_string(),
            })
        }
    }

    fn value(n: i64) -> LoadValue {
        LoadValue::Single(FieldValue::Int(n))
    }

    #[tokio::test]
    async fn single_load_fetches_once() {
        let fetcher = CountingFetcher::new();
        let coalescer =
            LoadCoalescer::new(fetcher.clone() as Arc<dyn BatchFetcher>, CoalescerScope::Global);

        let results = coalescer
            .load_many(&[value(1), value(2)])
            .await
            .expect("load");
        assert_eq!(results.len(), 2);
        assert_eq!(results[&value(1)].len(), 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_loads_coalesce_into_one_fetch() {
        let fetcher = CountingFetcher::new();
        let coalescer = Arc::new(LoadCoalescer::new(
            fetcher.clone() as Arc<dyn BatchFetcher>,
            CoalescerScope::Global,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = Arc::clone(&coalescer);
            handles.push(tokio::spawn(async move {
                coalescer.load_many(&[value(7)]).await
            }));
        }
        for handle in handles {
            let results = handle.await.expect("join").expect("load");
            assert_eq!(results[&value(7)].len(), 1);
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn duplicate_values_collapse_to_one_slot() {
        let fetcher = CountingFetcher::new();
        let coalescer =
            LoadCoalescer::new(fetcher.clone() as Arc<dyn BatchFetcher>, CoalescerScope::Global);

        let results = coalescer
            .load_many(&[value(3), value(3), value(3)])
            .await
            .expect("load");
        assert_eq!(results.len(), 1);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(*fetcher.values_seen.lock().expect("test lock"), vec![1]);
    }

    #[tokio::test]
    async fn fetch_error_reaches_every_waiter() {
        let coalescer = Arc::new(LoadCoalescer::new(
            Arc::new(FailingFetcher),
            CoalescerScope::Global,
        ));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let coalescer = Arc::clone(&coalescer);
            handles.push(tokio::spawn(async move {
                coalescer.load_many(&[value(1)]).await
            }));
        }
        for handle in handles {
            let result = handle.await.expect("join");
            assert!(matches!(result, Err(EntityError::Internal { .. })));
        }
    }

    #[tokio::test]
    async fn discard_resubmits_into_fresh_batch() {
        let fetcher = CountingFetcher::new();
        let coalescer = Arc::new(LoadCoalescer::new(
            fetcher.clone() as Arc<dyn BatchFetcher>,
            CoalescerScope::Global,
        ));

        // Enqueue without dispatching by discarding before the dispatcher
        // task gets a turn: spawn the load, then immediately discard.
        let load = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move { coalescer.load_many(&[value(9)]).await })
        };
        // The spawned task has not run yet on the current-thread runtime,
        // so the slot appears after one yield.
        tokio::task::yield_now().await;
        assert_eq!(coalescer.pending_len(), 1);
        coalescer.discard(&value(9));

        let results = load.await.expect("join").expect("load");
        assert_eq!(results[&value(9)].len(), 1);
        // One fetch for the resubmitted batch; the discarded batch never
        // reached the fetcher with that slot.
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn explicit_flush_resolves_pending_batch() {
        let fetcher = CountingFetcher::new();
        let coalescer = Arc::new(LoadCoalescer::new(
            fetcher.clone() as Arc<dyn BatchFetcher>,
            CoalescerScope::Global,
        ));

        let load = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move { coalescer.load_many(&[value(4)]).await })
        };
        tokio::task::yield_now().await;
        coalescer.flush().await;

        let results = load.await.expect("join").expect("load");
        assert_eq!(results[&value(4)].len(), 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn dropped_scope_resolves_empty_without_fetching() {
        let fetcher = CountingFetcher::new();
        // A Weak that can no longer upgrade stands in for a completed and
        // dropped transaction.
        let coalescer = LoadCoalescer::new(
            fetcher.clone() as Arc<dyn BatchFetcher>,
            CoalescerScope::Transaction(Weak::new()),
        );

        let results = coalescer.load_many(&[value(5)]).await.expect("load");
        assert!(results[&value(5)].is_empty());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn registry_returns_same_coalescer_for_same_key() {
        let registry = CoalescerRegistry::new();
        let key = LoadKey::single("id");
        let fetcher = CountingFetcher::new();

        let first = registry.get_or_create("users", &key, || {
            LoadCoalescer::new(fetcher.clone() as Arc<dyn BatchFetcher>, CoalescerScope::Global)
        });
        let second = registry.get_or_create("users", &key, || {
            LoadCoalescer::new(fetcher.clone() as Arc<dyn BatchFetcher>, CoalescerScope::Global)
        });
        assert!(Arc::ptr_eq(&first, &second));

        let other_table = registry.get_or_create("posts", &key, || {
            LoadCoalescer::new(fetcher.clone() as Arc<dyn BatchFetcher>, CoalescerScope::Global)
        });
        assert!(!Arc::ptr_eq(&first, &other_table));
    }
}
