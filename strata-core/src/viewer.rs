//! Viewer context for authorization decisions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who is asking.
///
/// Every construct-and-authorize call carries a viewer; privacy rules
/// decide per entity whether that viewer may see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewerContext {
    /// Unauthenticated caller.
    Anonymous,
    /// Authenticated end user.
    User { user_id: Uuid },
    /// Trusted internal caller (jobs, migrations); bypass-capable by policy.
    Internal,
}

impl ViewerContext {
    /// Viewer for an authenticated user.
    pub fn user(user_id: Uuid) -> Self {
        Self::User { user_id }
    }

    /// Whether this viewer is an authenticated user.
    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// Whether this viewer is the trusted internal principal.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal)
    }

    /// The user id, when authenticated.
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::User { user_id } => Some(*user_id),
            _ => None,
        }
    }
}
