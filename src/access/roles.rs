use crate::data_store::Scope;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    ReadDocuments,
    WriteDocuments,
    MonitorCluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Read,
    ReadWrite,
    ReadWriteAnyDatabase,
    ClusterMonitor,
}

const READ_PERMISSIONS: &[Permission] = &[Permission::ReadDocuments];
const READ_WRITE_PERMISSIONS: &[Permission] =
    &[Permission::ReadDocuments, Permission::WriteDocuments];
const MONITOR_PERMISSIONS: &[Permission] = &[Permission::MonitorCluster];

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Read,
        Role::ReadWrite,
        Role::ReadWriteAnyDatabase,
        Role::ClusterMonitor,
    ];

    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Role::Read => READ_PERMISSIONS,
            Role::ReadWrite | Role::ReadWriteAnyDatabase => READ_WRITE_PERMISSIONS,
            Role::ClusterMonitor => MONITOR_PERMISSIONS,
        }
    }

    /// Cluster-wide roles apply to every scope and can only be bound in the admin scope.
    pub fn is_cluster_wide(&self) -> bool {
        matches!(self, Role::ReadWriteAnyDatabase | Role::ClusterMonitor)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Read => "read",
            Role::ReadWrite => "readWrite",
            Role::ReadWriteAnyDatabase => "readWriteAnyDatabase",
            Role::ClusterMonitor => "clusterMonitor",
        }
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| StoreError::invalid(format!("unknown role {}", s)))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role granted within a scope, e.g. `readWrite@jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleBinding {
    pub role: Role,
    pub scope: Scope,
}

impl RoleBinding {
    pub fn new(role: Role, scope: Scope) -> Self {
        Self { role, scope }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.role.is_cluster_wide() && !self.scope.is_admin() {
            return Err(StoreError::invalid(format!(
                "role {} can only be bound in the {} scope, not {}",
                self.role,
                Scope::ADMIN,
                self.scope
            )));
        }
        Ok(())
    }

    pub fn grants(&self, permission: Permission, target: &Scope) -> bool {
        self.role.permissions().contains(&permission)
            && (self.role.is_cluster_wide() || &self.scope == target)
    }
}

impl fmt::Display for RoleBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.role, self.scope)
    }
}

impl FromStr for RoleBinding {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, scope) = s
            .split_once('@')
            .ok_or_else(|| StoreError::invalid(format!("expected role@scope, got {}", s)))?;
        Ok(RoleBinding::new(role.parse()?, scope.parse()?))
    }
}
