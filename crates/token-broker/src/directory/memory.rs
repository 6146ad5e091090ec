//! In-process store directory for local development and tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::{StoreDirectory, StorePermission, StoreUser};
use crate::types::{PrincipalId, ScopedAccessToken};

/// Thread-safe in-memory directory
///
/// Tokens are random opaque strings that expire `token_ttl` after minting.
/// Nothing validates them afterwards; the directory only models the
/// user/permission lifecycle the broker depends on.
#[derive(Clone)]
pub struct InMemoryDirectory {
    users: Arc<RwLock<HashMap<PrincipalId, StoreUser>>>,
    token_ttl: Duration,
}

impl std::fmt::Debug for InMemoryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDirectory")
            .field("token_ttl", &self.token_ttl)
            .field("user_count", &self.users.read().len())
            .finish()
    }
}

impl InMemoryDirectory {
    pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

    #[must_use]
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            token_ttl: Self::DEFAULT_TOKEN_TTL,
        }
    }

    #[must_use]
    pub const fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    #[must_use]
    pub fn permission_count(&self) -> usize {
        self.users.read().values().map(|u| u.permissions.len()).sum()
    }

    /// Remove a permission out of band, as an operator or another tool might.
    pub fn remove_permission(&self, principal: &PrincipalId, permission: &str) -> bool {
        let mut users = self.users.write();
        users.get_mut(principal).is_some_and(|user| {
            let before = user.permissions.len();
            user.permissions.retain(|p| p.id != permission);
            user.permissions.len() != before
        })
    }

    /// Replace a permission's record out of band.
    pub fn replace_permission(&self, principal: &PrincipalId, permission: StorePermission) -> bool {
        let mut users = self.users.write();
        let Some(user) = users.get_mut(principal) else {
            return false;
        };
        user.permissions.retain(|p| p.id != permission.id);
        user.permissions.push(permission);
        true
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreDirectory for InMemoryDirectory {
    async fn get_user(&self, principal: &PrincipalId) -> StoreResult<StoreUser> {
        self.users
            .read()
            .get(principal)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("users/{principal}")))
    }

    async fn create_user_with_permission(
        &self,
        principal: &PrincipalId,
        permission: &StorePermission,
    ) -> StoreResult<StoreUser> {
        let mut users = self.users.write();
        if users.contains_key(principal) {
            return Err(StoreError::Conflict(format!("users/{principal}")));
        }

        let user = StoreUser {
            id: principal.clone(),
            permissions: vec![permission.clone()],
        };
        users.insert(principal.clone(), user.clone());
        drop(users);

        Ok(user)
    }

    async fn create_permission(
        &self,
        principal: &PrincipalId,
        permission: &StorePermission,
    ) -> StoreResult<StorePermission> {
        let mut users = self.users.write();
        let user = users
            .get_mut(principal)
            .ok_or_else(|| StoreError::NotFound(format!("users/{principal}")))?;

        if user.permission(&permission.id).is_some() {
            return Err(StoreError::Conflict(format!(
                "users/{principal}/permissions/{}",
                permission.id
            )));
        }

        user.permissions.push(permission.clone());
        Ok(permission.clone())
    }

    async fn mint_token(
        &self,
        user: &StoreUser,
        permission: &str,
    ) -> StoreResult<ScopedAccessToken> {
        // Authority is the stored record, not the caller's snapshot.
        let stored = {
            let users = self.users.read();
            users
                .get(&user.id)
                .and_then(|u| u.permission(permission))
                .cloned()
        };

        let stored = stored.ok_or_else(|| {
            StoreError::NotFound(format!("users/{}/permissions/{permission}", user.id))
        })?;

        let ttl = chrono::Duration::from_std(self.token_ttl)
            .map_err(|e| StoreError::Other(format!("invalid token ttl: {e}")))?;

        Ok(ScopedAccessToken {
            token: format!("type=resource&ver=1.0&sig={}", Uuid::new_v4().simple()),
            permission: stored.id,
            scope: stored.scope,
            mode: stored.mode,
            expires_at: Utc::now() + ttl,
        })
    }
}
