//! Client principals and access scopes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Permission level of an authenticated client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    User,
    Provider,
    Admin,
}

/// A pre-validated principal.
///
/// Identity is the name; two clients with the same name are the same
/// principal regardless of how they were constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    pub permission: Permission,
}

impl Client {
    pub fn new(name: impl Into<String>, permission: Permission) -> Self {
        Self {
            name: name.into(),
            permission,
        }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self::new(name, Permission::Admin)
    }

    pub fn provider(name: impl Into<String>) -> Self {
        Self::new(name, Permission::Provider)
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::new(name, Permission::User)
    }

    pub fn is_admin(&self) -> bool {
        self.permission == Permission::Admin
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Client {}

impl std::hash::Hash for Client {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Who may use (or provide nodes to) a node source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    /// Any authenticated client.
    #[default]
    All,
    /// The client that owns the source, or an admin.
    OwnerOnly,
    /// Admins only.
    AdminOnly,
}

impl AccessType {
    /// Whether `client` is allowed by this scope on a source owned by `owner`.
    pub fn permits(self, client: &Client, owner: &Client) -> bool {
        match self {
            AccessType::All => true,
            AccessType::OwnerOnly => client.is_admin() || client == owner,
            AccessType::AdminOnly => client.is_admin(),
        }
    }
}

impl FromStr for AccessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(AccessType::All),
            "owner_only" | "owner" | "me" => Ok(AccessType::OwnerOnly),
            "admin_only" | "admin" => Ok(AccessType::AdminOnly),
            other => Err(format!("unknown access type: {other}")),
        }
    }
}
