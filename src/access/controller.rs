use super::{HashCost, Permission, RoleBinding, Secret, SecretHasher};
use crate::data_store::{DataStore, PrincipalRecord, Scope};
use crate::error::{StoreError, StoreResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `ensure_principal` does when the principal is already there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExistingPrincipalPolicy {
    /// Leave it untouched and report `AlreadyPresent`.
    #[default]
    Ignore,
    /// Fail with `PrincipalExists`.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalOutcome {
    Created,
    AlreadyPresent,
}

pub struct AccessController {
    store: Arc<dyn DataStore>,
    policy: ExistingPrincipalPolicy,
    hasher: SecretHasher,
    hash_cost: HashCost,
}

impl AccessController {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            policy: ExistingPrincipalPolicy::default(),
            hasher: SecretHasher::Argon2,
            hash_cost: HashCost::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExistingPrincipalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_hash_cost(mut self, hash_cost: HashCost) -> Self {
        self.hash_cost = hash_cost;
        self
    }

    fn validate(name: &str, secret: &Secret, roles: &[RoleBinding]) -> StoreResult<()> {
        if name.trim().is_empty() {
            return Err(StoreError::invalid("principal name cannot be empty"));
        }
        if secret.is_empty() {
            return Err(StoreError::invalid(format!(
                "secret for principal {} cannot be empty",
                name
            )));
        }
        if roles.is_empty() {
            return Err(StoreError::invalid(format!(
                "principal {} needs at least one role",
                name
            )));
        }
        roles.iter().try_for_each(RoleBinding::validate)
    }

    /// Creates the principal with the given roles unless one with the same name already
    /// exists in `scope`. An existing principal is never modified.
    pub fn ensure_principal(
        &self,
        scope: &Scope,
        name: &str,
        secret: &Secret,
        roles: &[RoleBinding],
    ) -> StoreResult<PrincipalOutcome> {
        Self::validate(name, secret, roles)?;

        if self.store.get_principal(scope, name)?.is_some() {
            return self.already_present(scope, name);
        }

        let digest = self.hasher.digest(secret, self.hash_cost)?;
        if !self.store.create_principal(scope, name, &digest, roles)? {
            // Lost a race with another bootstrapper.
            return self.already_present(scope, name);
        }

        info!(
            "Created principal {} in {} with roles [{}]",
            name,
            scope,
            roles
                .iter()
                .map(RoleBinding::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(PrincipalOutcome::Created)
    }

    fn already_present(&self, scope: &Scope, name: &str) -> StoreResult<PrincipalOutcome> {
        match self.policy {
            ExistingPrincipalPolicy::Ignore => {
                warn!("Principal {} already exists in {}, leaving it as is", name, scope);
                Ok(PrincipalOutcome::AlreadyPresent)
            }
            ExistingPrincipalPolicy::Fail => Err(StoreError::PrincipalExists {
                scope: scope.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// False for a wrong secret and for an unknown principal alike.
    pub fn verify_secret(&self, scope: &Scope, name: &str, secret: &Secret) -> StoreResult<bool> {
        match self.store.principal_digest(scope, name)? {
            Some(digest) => digest.matches(secret),
            None => {
                debug!("No principal {} in {} to verify", name, scope);
                Ok(false)
            }
        }
    }

    pub fn principal(&self, scope: &Scope, name: &str) -> StoreResult<Option<PrincipalRecord>> {
        self.store.get_principal(scope, name)
    }

    pub fn list_principals(&self, scope: &Scope) -> StoreResult<Vec<PrincipalRecord>> {
        self.store.list_principals(scope)
    }

    /// Whether the principal may exercise `permission` on documents of `target`.
    pub fn authorize(
        &self,
        scope: &Scope,
        name: &str,
        permission: Permission,
        target: &Scope,
    ) -> StoreResult<bool> {
        Ok(self
            .store
            .get_principal(scope, name)?
            .is_some_and(|record| {
                record
                    .roles
                    .iter()
                    .any(|binding| binding.grants(permission, target))
            }))
    }
}
