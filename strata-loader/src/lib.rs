//! STRATA Loader - Batched Data Access and Authorization
//!
//! The top of the stack: the data manager routes batched point lookups
//! through per-scope coalescers and the read-through cache, mutations
//! fan invalidation out across cache versions and pending batches, the
//! transaction context tree carries commit callbacks and scoped
//! batching, and the construction pipeline turns rows into authorized
//! entities.

pub mod adapter;
pub mod coalescer;
pub mod construction;
pub mod context;
pub mod data_manager;
pub mod memory_adapter;

pub use adapter::{
    DatabaseAdapter, FieldEqualityCondition, OrderBy, OrderDirection, QueryModifiers, RawPredicate,
};
pub use coalescer::{BatchFetcher, CoalescerRegistry, CoalescerScope, LoadCoalescer};
pub use construction::{
    AllowIfInternal, AlwaysAllow, AlwaysDeny, ConstructionPipeline, Entity, PrivacyPolicy,
    PrivacyRule,
};
pub use context::{
    transaction_tree, CommitCallback, QueryContext, QueryContextProvider, TransactionConfig,
    TransactionState, TransactionalQueryContext,
};
pub use data_manager::DataManager;
pub use memory_adapter::InMemoryDatabaseAdapter;
