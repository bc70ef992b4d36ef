//! STRATA Core - Data Types and Contracts
//!
//! Pure data structures and contracts for the STRATA data-access layer.
//! All other crates depend on this. This crate contains the schema
//! descriptor, the load key/value model, the error taxonomy, the viewer
//! context, and the metrics contract - no caching or batching logic.

pub mod authorization;
pub mod config;
pub mod error;
pub mod field;
pub mod load_key;
pub mod metrics;
pub mod viewer;

pub use authorization::{AuthorizationAction, RuleEvaluation};
pub use config::{EntityConfiguration, EntityConfigurationBuilder, FieldDefinition};
pub use error::{
    ensure_single_row_affected, CacheError, ConstraintKind, DatabaseError, EntityError,
    EntityResult,
};
pub use field::{EntityRow, FieldValue};
pub use load_key::{LoadKey, LoadMethodType, LoadValue};
pub use metrics::{
    LoadEvent, LoadRoute, MetricsAdapter, MutationEvent, MutationKind, NoOpMetricsAdapter,
};
pub use viewer::ViewerContext;
