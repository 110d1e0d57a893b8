//! Deployment-time setup of a scope: principals first, then the schema.

use crate::access::{
    AccessController, ExistingPrincipalPolicy, HashCost, PrincipalOutcome, Role, RoleBinding,
    Secret,
};
use crate::data_store::{DataStore, Scope};
use crate::error::StoreResult;
use crate::schema::{SchemaProvisioner, SchemaReport};
use std::sync::Arc;
use tracing::info;

/// Scope the administrative principal gets read access to besides the admin scope.
pub const LOCAL_SCOPE: &str = "local";

#[derive(Debug, Clone)]
pub struct PrincipalSpec {
    pub name: String,
    pub secret: Secret,
}

#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    pub app_scope: Scope,
    pub admin: PrincipalSpec,
    pub app: PrincipalSpec,
    pub policy: ExistingPrincipalPolicy,
    pub hash_cost: HashCost,
}

impl BootstrapPlan {
    pub fn admin_roles(&self) -> StoreResult<Vec<RoleBinding>> {
        Ok(vec![
            RoleBinding::new(Role::ReadWriteAnyDatabase, Scope::admin()),
            RoleBinding::new(Role::ClusterMonitor, Scope::admin()),
            RoleBinding::new(Role::Read, Scope::new(LOCAL_SCOPE)?),
        ])
    }

    pub fn app_roles(&self) -> Vec<RoleBinding> {
        vec![RoleBinding::new(Role::ReadWrite, self.app_scope.clone())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub admin: PrincipalOutcome,
    pub app: PrincipalOutcome,
    pub schema: SchemaReport,
}

impl BootstrapReport {
    /// One line for the operator.
    pub fn summary(&self, plan: &BootstrapPlan) -> String {
        let outcome = |o: PrincipalOutcome| match o {
            PrincipalOutcome::Created => "created",
            PrincipalOutcome::AlreadyPresent => "present",
        };
        format!(
            "bootstrapped {}: admin {} {}, app {} {}, {} containers and {} indexes created",
            plan.app_scope,
            plan.admin.name,
            outcome(self.admin),
            plan.app.name,
            outcome(self.app),
            self.schema.created_containers.len(),
            self.schema.created_indexes.len()
        )
    }
}

/// Ensures the admin principal, the application principal and the schema, in that
/// order. Stops at the first failure; every step is idempotent so a rerun resumes.
pub fn run(store: Arc<dyn DataStore>, plan: &BootstrapPlan) -> StoreResult<BootstrapReport> {
    let access = AccessController::new(store.clone())
        .with_policy(plan.policy)
        .with_hash_cost(plan.hash_cost);

    let admin = access.ensure_principal(
        &Scope::admin(),
        &plan.admin.name,
        &plan.admin.secret,
        &plan.admin_roles()?,
    )?;
    let app = access.ensure_principal(
        &plan.app_scope,
        &plan.app.name,
        &plan.app.secret,
        &plan.app_roles(),
    )?;
    let schema = SchemaProvisioner::new(store).ensure_schema(&plan.app_scope)?;

    let report = BootstrapReport { admin, app, schema };
    info!("{}", report.summary(plan));
    Ok(report)
}
