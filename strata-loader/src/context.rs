//! Query contexts and the transactional context tree.
//!
//! A `QueryContext` is the handle every load and mutation runs under.
//! Transactional contexts form a tree: nested transactions create child
//! contexts, and the data manager fans invalidation out across the whole
//! tree. Commit callbacks are ordered and survive nesting only along the
//! committed path.
//!
//! Everything here runs under single-threaded cooperative scheduling:
//! the child list and callback queues are appended to synchronously and
//! no lock is held across a suspension point.

use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

use strata_core::{EntityError, EntityResult};

use crate::adapter::DatabaseAdapter;
use crate::coalescer::CoalescerRegistry;

/// Async callback run around a commit.
pub type CommitCallback = Box<dyn FnOnce() -> BoxFuture<'static, EntityResult<()>> + Send>;

/// Lifecycle of a transactional context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    /// Terminal states: the scope has exited, successfully or not.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Per-scope transaction configuration.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// When false, loads inside this scope bypass cache and coalescing
    /// and fetch directly from the database adapter. Callers disable
    /// batching when rollback semantics make caching unsafe for the
    /// scope.
    pub batching_enabled: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            batching_enabled: true,
        }
    }
}

impl TransactionConfig {
    /// Scope with per-transaction batching disabled.
    pub fn without_batching() -> Self {
        Self {
            batching_enabled: false,
        }
    }
}

struct PreCommitEntry {
    priority: i32,
    callback: CommitCallback,
}

/// The database scope a call runs under.
#[derive(Clone, Default)]
pub enum QueryContext {
    /// Auto-committing, outside any transaction.
    #[default]
    NonTransactional,
    /// Inside the given transactional scope.
    Transactional(Arc<TransactionalQueryContext>),
}

impl QueryContext {
    /// The transactional scope, if any.
    pub fn transaction(&self) -> Option<&Arc<TransactionalQueryContext>> {
        match self {
            Self::NonTransactional => None,
            Self::Transactional(ctx) => Some(ctx),
        }
    }

    /// Whether this context is inside a transaction.
    pub fn is_transactional(&self) -> bool {
        self.transaction().is_some()
    }
}

/// One node of the transaction tree.
pub struct TransactionalQueryContext {
    transaction_id: Uuid,
    parent: Weak<TransactionalQueryContext>,
    children: Mutex<Vec<Arc<TransactionalQueryContext>>>,
    state: Mutex<TransactionState>,
    pre_commit: Mutex<Vec<PreCommitEntry>>,
    post_commit: Mutex<Vec<CommitCallback>>,
    batching_enabled: bool,
    coalescers: CoalescerRegistry,
}

impl TransactionalQueryContext {
    fn new(parent: Weak<TransactionalQueryContext>, config: &TransactionConfig) -> Arc<Self> {
        Arc::new(Self {
            transaction_id: Uuid::now_v7(),
            parent,
            children: Mutex::new(Vec::new()),
            state: Mutex::new(TransactionState::Active),
            pre_commit: Mutex::new(Vec::new()),
            post_commit: Mutex::new(Vec::new()),
            batching_enabled: config.batching_enabled,
            coalescers: CoalescerRegistry::new(),
        })
    }

    /// Root context for a top-level transaction.
    pub(crate) fn new_root(config: &TransactionConfig) -> Arc<Self> {
        Self::new(Weak::new(), config)
    }

    /// Child context for a nested transaction, registered on the parent.
    pub(crate) fn new_child(
        parent: &Arc<TransactionalQueryContext>,
        config: &TransactionConfig,
    ) -> Arc<Self> {
        let child = Self::new(Arc::downgrade(parent), config);
        parent
            .children
            .lock()
            .expect("transaction tree lock poisoned")
            .push(Arc::clone(&child));
        child
    }

    /// Transaction id used by the adapter and the coalescer registry.
    pub fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        *self.state.lock().expect("transaction state lock poisoned")
    }

    /// Whether the scope has exited (committed or rolled back).
    pub fn is_completed(&self) -> bool {
        self.state().is_completed()
    }

    /// Whether this scope is nested inside another transaction.
    pub fn is_in_nested_transaction(&self) -> bool {
        self.parent.upgrade().is_some()
    }

    /// The enclosing transactional context, if any.
    pub fn parent_query_context(&self) -> Option<Arc<TransactionalQueryContext>> {
        self.parent.upgrade()
    }

    /// Snapshot of this context's direct children.
    pub fn child_query_contexts(&self) -> Vec<Arc<TransactionalQueryContext>> {
        self.children
            .lock()
            .expect("transaction tree lock poisoned")
            .clone()
    }

    /// Whether loads in this scope may be batched and cached.
    pub fn batching_enabled(&self) -> bool {
        self.batching_enabled
    }

    /// This scope's coalescer registry; discarded with the scope.
    pub fn coalescers(&self) -> &CoalescerRegistry {
        &self.coalescers
    }

    /// Register a pre-commit callback with a priority.
    ///
    /// Callbacks run at commit time in ascending priority, registration
    /// order within equal priorities. A failing callback rolls the
    /// owning transaction back.
    pub fn add_pre_commit_callback(
        &self,
        callback: CommitCallback,
        priority: i32,
    ) -> EntityResult<()> {
        if self.is_completed() {
            return Err(EntityError::Transaction {
                reason: "cannot register callbacks on a completed transaction".to_string(),
            });
        }
        self.pre_commit
            .lock()
            .expect("pre-commit lock poisoned")
            .push(PreCommitEntry { priority, callback });
        Ok(())
    }

    /// Register a post-commit callback.
    ///
    /// Runs only after the outermost transaction commits; dropped if
    /// this scope or any enclosing scope rolls back. Errors are logged,
    /// never propagated.
    pub fn add_post_commit_callback(&self, callback: CommitCallback) -> EntityResult<()> {
        if self.is_completed() {
            return Err(EntityError::Transaction {
                reason: "cannot register callbacks on a completed transaction".to_string(),
            });
        }
        self.post_commit
            .lock()
            .expect("post-commit lock poisoned")
            .push(callback);
        Ok(())
    }

    fn set_state(&self, state: TransactionState) {
        *self.state.lock().expect("transaction state lock poisoned") = state;
    }

    /// Drain pre-commit callbacks in run order.
    fn take_pre_commit_sorted(&self) -> Vec<CommitCallback> {
        let mut entries = std::mem::take(
            &mut *self.pre_commit.lock().expect("pre-commit lock poisoned"),
        );
        // sort_by_key is stable: equal priorities keep registration order.
        entries.sort_by_key(|entry| entry.priority);
        entries.into_iter().map(|entry| entry.callback).collect()
    }

    fn take_post_commit(&self) -> Vec<CommitCallback> {
        std::mem::take(&mut *self.post_commit.lock().expect("post-commit lock poisoned"))
    }

    fn adopt_post_commit(&self, callbacks: Vec<CommitCallback>) {
        self.post_commit
            .lock()
            .expect("post-commit lock poisoned")
            .extend(callbacks);
    }

    /// Make the context inert after completion.
    fn retire(&self) {
        self.pre_commit
            .lock()
            .expect("pre-commit lock poisoned")
            .clear();
        self.post_commit
            .lock()
            .expect("post-commit lock poisoned")
            .clear();
        self.coalescers.clear();
    }
}

/// Every context in the tree containing `ctx`: the root, `ctx` itself,
/// and all descendants. Used for invalidation fan-out, since sibling and
/// descendant scopes may hold independently batched entries for the same
/// logical value.
pub fn transaction_tree(
    ctx: &Arc<TransactionalQueryContext>,
) -> Vec<Arc<TransactionalQueryContext>> {
    let mut root = Arc::clone(ctx);
    while let Some(parent) = root.parent_query_context() {
        root = parent;
    }
    let mut all = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        stack.extend(node.child_query_contexts());
        all.push(node);
    }
    all
}

/// Opens query contexts and drives the transaction commit protocol.
///
/// A cheap handle: clones share the same adapter.
pub struct QueryContextProvider<D: DatabaseAdapter> {
    adapter: Arc<D>,
}

impl<D: DatabaseAdapter> Clone for QueryContextProvider<D> {
    fn clone(&self) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<D: DatabaseAdapter> QueryContextProvider<D> {
    /// Create a provider over the given adapter.
    pub fn new(adapter: Arc<D>) -> Self {
        Self { adapter }
    }

    /// The adapter transactions are driven against.
    pub fn adapter(&self) -> &Arc<D> {
        &self.adapter
    }

    /// A non-transactional query context.
    pub fn query_context(&self) -> QueryContext {
        QueryContext::NonTransactional
    }

    /// Run `scope` inside a new top-level transaction.
    ///
    /// On scope success the commit protocol runs: pre-commit callbacks
    /// in priority order (any failure rolls back and surfaces), then the
    /// adapter commit, then post-commit callbacks. On scope failure the
    /// transaction rolls back and the error surfaces.
    pub async fn run_in_transaction<T, F>(
        &self,
        config: TransactionConfig,
        scope: F,
    ) -> EntityResult<T>
    where
        F: for<'a> FnOnce(&'a QueryContext) -> BoxFuture<'a, EntityResult<T>>,
    {
        self.run_transaction_scope(None, config, scope).await
    }

    /// Run `scope` inside a transaction nested under `parent`.
    ///
    /// A nested failure rolls back only the nested scope and returns the
    /// error to the caller; the enclosing transaction stays active and
    /// may still commit.
    pub async fn run_in_nested_transaction<T, F>(
        &self,
        parent: &QueryContext,
        config: TransactionConfig,
        scope: F,
    ) -> EntityResult<T>
    where
        F: for<'a> FnOnce(&'a QueryContext) -> BoxFuture<'a, EntityResult<T>>,
    {
        let parent_ctx = parent
            .transaction()
            .ok_or_else(|| EntityError::Transaction {
                reason: "nested transaction requires an enclosing transaction".to_string(),
            })?;
        if parent_ctx.is_completed() {
            return Err(EntityError::Transaction {
                reason: "cannot nest under a completed transaction".to_string(),
            });
        }
        self.run_transaction_scope(Some(Arc::clone(parent_ctx)), config, scope)
            .await
    }

    async fn run_transaction_scope<T, F>(
        &self,
        parent: Option<Arc<TransactionalQueryContext>>,
        config: TransactionConfig,
        scope: F,
    ) -> EntityResult<T>
    where
        F: for<'a> FnOnce(&'a QueryContext) -> BoxFuture<'a, EntityResult<T>>,
    {
        let ctx = match &parent {
            Some(parent_ctx) => TransactionalQueryContext::new_child(parent_ctx, &config),
            None => TransactionalQueryContext::new_root(&config),
        };
        self.adapter
            .begin_transaction(
                ctx.transaction_id(),
                parent.as_ref().map(|p| p.transaction_id()),
            )
            .await?;
        debug!(
            transaction_id = %ctx.transaction_id(),
            nested = parent.is_some(),
            "transaction opened"
        );

        let query_context = QueryContext::Transactional(Arc::clone(&ctx));
        match scope(&query_context).await {
            Ok(value) => {
                self.commit(&ctx).await?;
                Ok(value)
            }
            Err(error) => {
                self.rollback(&ctx).await;
                Err(error)
            }
        }
    }

    async fn commit(&self, ctx: &Arc<TransactionalQueryContext>) -> EntityResult<()> {
        ctx.set_state(TransactionState::Committing);

        for callback in ctx.take_pre_commit_sorted() {
            if let Err(error) = callback().await {
                warn!(
                    transaction_id = %ctx.transaction_id(),
                    error = %error,
                    "pre-commit callback failed, rolling back"
                );
                self.rollback(ctx).await;
                return Err(error);
            }
        }

        if let Err(error) = self.adapter.commit_transaction(ctx.transaction_id()).await {
            self.rollback(ctx).await;
            return Err(error);
        }
        ctx.set_state(TransactionState::Committed);
        debug!(transaction_id = %ctx.transaction_id(), "transaction committed");

        let callbacks = ctx.take_post_commit();
        match ctx.parent_query_context() {
            // Nested commit: post-commit callbacks only run once the
            // outermost transaction commits, so hoist them to the parent.
            Some(parent) => parent.adopt_post_commit(callbacks),
            None => {
                for callback in callbacks {
                    if let Err(error) = callback().await {
                        warn!(error = %error, "post-commit callback failed");
                    }
                }
            }
        }
        ctx.retire();
        Ok(())
    }

    async fn rollback(&self, ctx: &Arc<TransactionalQueryContext>) {
        ctx.set_state(TransactionState::RollingBack);
        if let Err(error) = self
            .adapter
            .rollback_transaction(ctx.transaction_id())
            .await
        {
            warn!(
                transaction_id = %ctx.transaction_id(),
                error = %error,
                "rollback reported an adapter error"
            );
        }
        ctx.set_state(TransactionState::RolledBack);
        debug!(transaction_id = %ctx.transaction_id(), "transaction rolled back");
        // Dropping the queues here is what guarantees post-commit
        // callbacks of a rolled-back scope never run.
        ctx.retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_adapter::InMemoryDatabaseAdapter;

    #[test]
    fn tree_walk_covers_root_siblings_and_descendants() {
        let config = TransactionConfig::default();
        let root = TransactionalQueryContext::new_root(&config);
        let left = TransactionalQueryContext::new_child(&root, &config);
        let right = TransactionalQueryContext::new_child(&root, &config);
        let grandchild = TransactionalQueryContext::new_child(&left, &config);

        // Starting from any node reaches the whole tree.
        let from_grandchild = transaction_tree(&grandchild);
        assert_eq!(from_grandchild.len(), 4);
        for node in [&root, &left, &right, &grandchild] {
            assert!(from_grandchild
                .iter()
                .any(|ctx| ctx.transaction_id() == node.transaction_id()));
        }

        assert!(!root.is_in_nested_transaction());
        assert!(left.is_in_nested_transaction());
        assert_eq!(root.child_query_contexts().len(), 2);
        assert_eq!(
            grandchild
                .parent_query_context()
                .expect("parent")
                .transaction_id(),
            left.transaction_id()
        );
    }

    #[test]
    fn completed_context_rejects_callback_registration() {
        let ctx = TransactionalQueryContext::new_root(&TransactionConfig::default());
        ctx.set_state(TransactionState::Committed);
        assert!(ctx.is_completed());

        let result = ctx.add_pre_commit_callback(
            Box::new(|| Box::pin(async { Ok(()) })),
            0,
        );
        assert!(matches!(result, Err(EntityError::Transaction { .. })));

        let result = ctx.add_post_commit_callback(Box::new(|| Box::pin(async { Ok(()) })));
        assert!(matches!(result, Err(EntityError::Transaction { .. })));
    }

    #[tokio::test]
    async fn nesting_requires_a_live_enclosing_transaction() {
        let provider = QueryContextProvider::new(Arc::new(InMemoryDatabaseAdapter::new()));

        let result: EntityResult<()> = provider
            .run_in_nested_transaction(
                &QueryContext::NonTransactional,
                TransactionConfig::default(),
                |_qc: &QueryContext| Box::pin(async { Ok(()) }),
            )
            .await;
        assert!(matches!(result, Err(EntityError::Transaction { .. })));

        let completed = provider
            .run_in_transaction(TransactionConfig::default(), |qc: &QueryContext| {
                Box::pin(async move { Ok(qc.clone()) })
            })
            .await
            .expect("transaction");
        let result: EntityResult<()> = provider
            .run_in_nested_transaction(
                &completed,
                TransactionConfig::default(),
                |_qc: &QueryContext| Box::pin(async { Ok(()) }),
            )
            .await;
        assert!(matches!(result, Err(EntityError::Transaction { .. })));
    }

    #[tokio::test]
    async fn failing_pre_commit_rolls_the_transaction_back() {
        let adapter = Arc::new(InMemoryDatabaseAdapter::new());
        let provider = QueryContextProvider::new(Arc::clone(&adapter));

        let result: EntityResult<()> = provider
            .run_in_transaction(TransactionConfig::default(), |qc: &QueryContext| {
                Box::pin(async move {
                    qc.transaction()
                        .expect("transactional")
                        .add_pre_commit_callback(
                            Box::new(|| {
                                Box::pin(async {
                                    Err(EntityError::Transaction {
                                        reason: "precondition failed".to_string(),
                                    })
                                })
                            }),
                            0,
                        )?;
                    Ok(qc.clone())
                })
            })
            .await
            .map(|captured| {
                assert!(captured
                    .transaction()
                    .expect("transactional")
                    .is_completed());
            });
        assert!(matches!(result, Err(EntityError::Transaction { .. })));
    }
}
