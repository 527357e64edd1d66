//! Workspace scoping types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pre-authorized operation context supplied by the request layer.
///
/// Membership and role checks already happened upstream; the engine only
/// uses this to scope lookups to the tenant boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkspaceContext {
    /// Workspace the operation runs in
    pub workspace_id: Uuid,
    /// Authenticated actor performing the operation
    pub actor_id: Uuid,
}

impl WorkspaceContext {
    /// Create a new context
    pub fn new(workspace_id: Uuid, actor_id: Uuid) -> Self {
        Self {
            workspace_id,
            actor_id,
        }
    }
}
