//! Startup reconciliation of known principals into the store

use crate::directory::{StoreDirectory, StoreError, StorePermission, StoreUser};
use crate::types::KnownPrincipal;
use crate::{Error, Result};

/// What reconciliation did for one principal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapAction {
    /// User and permission were created
    Created,
    /// User existed; its missing permission was added
    Healed,
    /// Already provisioned as configured
    Unchanged,
    /// Permission exists with a different scope or mode and was left alone
    Drifted,
}

impl BootstrapAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Healed => "healed",
            Self::Unchanged => "unchanged",
            Self::Drifted => "drifted",
        }
    }
}

/// Per-action principal counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub created: usize,
    pub healed: usize,
    pub unchanged: usize,
    pub drifted: usize,
}

impl BootstrapReport {
    fn count(&mut self, action: BootstrapAction) {
        match action {
            BootstrapAction::Created => self.created += 1,
            BootstrapAction::Healed => self.healed += 1,
            BootstrapAction::Unchanged => self.unchanged += 1,
            BootstrapAction::Drifted => self.drifted += 1,
        }
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.created + self.healed + self.unchanged + self.drifted
    }

    /// True when the run changed nothing in the store
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.created == 0 && self.healed == 0
    }
}

/// Ensure every known principal has a store user carrying its permission.
///
/// Idempotent and non-destructive: existing records are never modified or
/// removed, and principals missing from `principals` are left in place. The
/// first store error other than a lost creation race aborts the run.
pub async fn configure_permissions(
    directory: &dyn StoreDirectory,
    database: &str,
    principals: &[KnownPrincipal],
) -> Result<BootstrapReport> {
    let mut report = BootstrapReport::default();

    for principal in principals {
        let desired = StorePermission::for_principal(principal, database);
        let action = reconcile(directory, principal, &desired)
            .await
            .map_err(|source| Error::Bootstrap {
                principal: principal.id.clone(),
                source,
            })?;

        tracing::debug!(
            principal = %principal.id,
            permission = %desired.id,
            scope = %desired.scope,
            action = action.as_str(),
            "Principal reconciled"
        );
        #[cfg(feature = "metrics")]
        crate::observability::record_bootstrap(action.as_str());

        report.count(action);
    }

    tracing::info!(
        created = report.created,
        healed = report.healed,
        unchanged = report.unchanged,
        drifted = report.drifted,
        "Bootstrap complete"
    );
    Ok(report)
}

async fn reconcile(
    directory: &dyn StoreDirectory,
    principal: &KnownPrincipal,
    desired: &StorePermission,
) -> std::result::Result<BootstrapAction, StoreError> {
    let user = match directory.get_user(&principal.id).await {
        Ok(user) => user,
        Err(StoreError::NotFound(_)) => {
            match directory
                .create_user_with_permission(&principal.id, desired)
                .await
            {
                Ok(_) => return Ok(BootstrapAction::Created),
                // Another instance created it first
                Err(StoreError::Conflict(_)) => directory.get_user(&principal.id).await?,
                Err(e) => return Err(e),
            }
        }
        Err(e) => return Err(e),
    };

    reconcile_permission(directory, &user, desired).await
}

async fn reconcile_permission(
    directory: &dyn StoreDirectory,
    user: &StoreUser,
    desired: &StorePermission,
) -> std::result::Result<BootstrapAction, StoreError> {
    match user.permission(&desired.id) {
        Some(existing) if existing.matches(desired) => Ok(BootstrapAction::Unchanged),
        Some(existing) => {
            tracing::warn!(
                principal = %user.id,
                permission = %desired.id,
                configured_scope = %desired.scope,
                configured_mode = %desired.mode,
                stored_scope = %existing.scope,
                stored_mode = %existing.mode,
                "Stored permission differs from configuration, leaving it unchanged"
            );
            Ok(BootstrapAction::Drifted)
        }
        None => match directory.create_permission(&user.id, desired).await {
            Ok(_) => Ok(BootstrapAction::Healed),
            Err(StoreError::Conflict(_)) => Ok(BootstrapAction::Unchanged),
            Err(e) => Err(e),
        },
    }
}
