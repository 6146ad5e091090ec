//! Store directory: users and permissions in the backing document store
//!
//! The broker never holds the store's master credential in request paths. It
//! only asks the directory to look up users, create missing users/permissions at
//! bootstrap, and mint short-lived tokens from an existing permission.

mod error;
mod memory;

use std::fmt::Debug;

use async_trait::async_trait;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryDirectory;

use crate::types::{AccessMode, KnownPrincipal, PrincipalId, Scope, ScopedAccessToken};

/// Scoped authorization attached to a store user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePermission {
    pub id: String,
    pub scope: Scope,
    pub mode: AccessMode,
}

impl StorePermission {
    /// Permission a known principal is provisioned with inside `database`.
    #[must_use]
    pub fn for_principal(principal: &KnownPrincipal, database: &str) -> Self {
        Self {
            id: principal.permission.clone(),
            scope: principal.scope(database),
            mode: principal.mode,
        }
    }

    /// Same name, scope and mode.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self == other
    }
}

/// Store record keyed by principal id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUser {
    pub id: PrincipalId,
    pub permissions: Vec<StorePermission>,
}

impl StoreUser {
    #[must_use]
    pub fn permission(&self, id: &str) -> Option<&StorePermission> {
        self.permissions.iter().find(|p| p.id == id)
    }

    /// Permission used when the caller does not name one
    #[must_use]
    pub fn default_permission(&self) -> Option<&StorePermission> {
        self.permissions.first()
    }
}

/// Operations the broker requires of the backing store
///
/// Implementations are shared by every connection handler and must be safe
/// for concurrent use.
#[async_trait]
pub trait StoreDirectory: Send + Sync + Debug {
    /// Look up a user and its permissions. `StoreError::NotFound` when absent.
    async fn get_user(&self, principal: &PrincipalId) -> StoreResult<StoreUser>;

    /// Create a user with one permission. `StoreError::Conflict` when the user exists.
    async fn create_user_with_permission(
        &self,
        principal: &PrincipalId,
        permission: &StorePermission,
    ) -> StoreResult<StoreUser>;

    /// Attach a permission to an existing user. `StoreError::Conflict` when a
    /// permission with the same id exists.
    async fn create_permission(
        &self,
        principal: &PrincipalId,
        permission: &StorePermission,
    ) -> StoreResult<StorePermission>;

    /// Mint a fresh token from one of the user's permissions.
    async fn mint_token(&self, user: &StoreUser, permission: &str)
    -> StoreResult<ScopedAccessToken>;
}
