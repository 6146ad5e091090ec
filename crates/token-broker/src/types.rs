//! Domain types shared by the broker components

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a store record identifier
pub const MAX_ID_LEN: usize = 255;

/// Maximum length of a permission name
pub const MAX_PERMISSION_NAME_LEN: usize = 32;

/// Verified caller identity (the `sub` claim of a validated bearer token)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Create a principal id, rejecting values the store cannot key a user by.
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.is_empty() {
            return Err("principal id must not be empty".into());
        }
        if id.len() > MAX_ID_LEN {
            return Err(format!("principal id exceeds {MAX_ID_LEN} characters"));
        }
        if let Some(c) = id
            .chars()
            .find(|c| matches!(c, '/' | '\\' | '?' | '#') || c.is_control() || c.is_whitespace())
        {
            return Err(format!("principal id contains forbidden character {c:?}"));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PrincipalId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PrincipalId> for String {
    fn from(id: PrincipalId) -> Self {
        id.0
    }
}

impl AsRef<str> for PrincipalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Access mode granted by a store permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Read,
    All,
}

impl AccessMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::All => "all",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" | "ro" => Ok(Self::Read),
            "all" | "rw" | "write" => Ok(Self::All),
            other => Err(format!("unknown access mode: {other}")),
        }
    }
}

/// Resource a permission grants access to: one collection, optionally narrowed
/// to a single partition key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

impl Scope {
    #[must_use]
    pub fn collection(database: &str, collection: &str) -> Self {
        Self {
            resource: format!("dbs/{database}/colls/{collection}"),
            partition_key: None,
        }
    }

    #[must_use]
    pub fn with_partition_key(mut self, key: Option<String>) -> Self {
        self.partition_key = key;
        self
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition_key {
            Some(key) => write!(f, "{}[{key}]", self.resource),
            None => f.write_str(&self.resource),
        }
    }
}

/// Short-lived credential minted by the store for one permission
#[derive(Clone, PartialEq, Eq)]
pub struct ScopedAccessToken {
    pub token: String,
    pub permission: String,
    pub scope: Scope,
    pub mode: AccessMode,
    pub expires_at: DateTime<Utc>,
}

// Token material never reaches logs
impl fmt::Debug for ScopedAccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedAccessToken")
            .field("permission", &self.permission)
            .field("scope", &self.scope)
            .field("mode", &self.mode)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl ScopedAccessToken {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token is still valid for at least `margin` after `now`.
    #[must_use]
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin < self.expires_at
    }
}

/// A principal the broker serves, reconciled into the store at startup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KnownPrincipal {
    pub id: PrincipalId,
    pub permission: String,
    pub collection: String,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub mode: AccessMode,
}

impl KnownPrincipal {
    pub fn new(
        id: PrincipalId,
        permission: impl Into<String>,
        collection: impl Into<String>,
    ) -> Result<Self, String> {
        let principal = Self {
            id,
            permission: permission.into(),
            collection: collection.into(),
            partition_key: None,
            mode: AccessMode::Read,
        };
        principal.validate()?;
        Ok(principal)
    }

    #[must_use]
    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Scope this principal is confined to inside `database`
    #[must_use]
    pub fn scope(&self, database: &str) -> Scope {
        Scope::collection(database, &self.collection).with_partition_key(self.partition_key.clone())
    }

    /// True when both principals could reach the same documents.
    /// An unkeyed principal covers every partition of its collection.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.collection == other.collection
            && match (&self.partition_key, &other.partition_key) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_permission_name(&self.permission)?;
        if self.collection.is_empty() || self.collection.contains('/') {
            return Err(format!(
                "principal {}: invalid collection name {:?}",
                self.id, self.collection
            ));
        }
        Ok(())
    }
}

/// Parses `id:permission:collection[:mode[:partition-key]]`
impl FromStr for KnownPrincipal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        if !(3..=5).contains(&parts.len()) {
            return Err(format!(
                "expected id:permission:collection[:mode[:partition]], got {s:?}"
            ));
        }

        let id = PrincipalId::new(parts[0])?;
        let mut principal = Self::new(id, parts[1], parts[2])?;

        if let Some(mode) = parts.get(3).filter(|m| !m.is_empty()) {
            principal = principal.with_mode(mode.parse()?);
        }
        if let Some(key) = parts.get(4).filter(|k| !k.is_empty()) {
            principal = principal.with_partition_key(*key);
        }

        Ok(principal)
    }
}

/// Permission names are lowercase identifiers: `[a-z][a-z0-9-]*`, at most 32 chars.
pub fn validate_permission_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid_head = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid_head && valid_tail && name.len() <= MAX_PERMISSION_NAME_LEN {
        Ok(())
    } else {
        Err(format!("invalid permission name: {name:?}"))
    }
}
