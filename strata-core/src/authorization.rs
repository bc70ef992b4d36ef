//! Authorization enums shared across the data-access layer.

use serde::{Deserialize, Serialize};

/// The action a privacy policy is evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthorizationAction {
    Read,
    Create,
    Update,
    Delete,
}

/// Outcome of evaluating one privacy rule.
///
/// Rules are evaluated in declared order; the first `Allow` or `Deny` is
/// decisive and short-circuits the rest. `Skip` defers to the next rule.
/// A chain with no decisive rule fails closed (deny).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleEvaluation {
    Allow,
    Deny,
    Skip,
}

impl RuleEvaluation {
    /// Whether this evaluation ends the rule chain.
    pub fn is_decisive(&self) -> bool {
        !matches!(self, Self::Skip)
    }
}
