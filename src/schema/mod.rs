//! Containers and indexes the job scheduler expects in its scope.

use crate::data_store::{DataStore, IndexSpec, Scope};
use crate::error::{StoreError, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const JOBS_CONTAINER: &str = "jobs";
pub const CRONS_CONTAINER: &str = "crons";
pub const CRON_UPDATES_CONTAINER: &str = "cron_updates";

pub struct ContainerSchema {
    pub name: &'static str,
    pub indexes: Vec<IndexSpec>,
}

/// Declared layout, in creation order.
pub fn declared_schema() -> Vec<ContainerSchema> {
    vec![
        ContainerSchema {
            name: JOBS_CONTAINER,
            indexes: vec![
                IndexSpec::ascending("name"),
                IndexSpec::ascending("result"),
                IndexSpec::ascending("expiry_time").expire_after(Duration::ZERO),
            ],
        },
        ContainerSchema {
            name: CRONS_CONTAINER,
            indexes: vec![
                IndexSpec::ascending("name"),
                IndexSpec::ascending("disabled"),
            ],
        },
        ContainerSchema {
            name: CRON_UPDATES_CONTAINER,
            indexes: vec![],
        },
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub created_containers: Vec<String>,
    /// `container.index` for every index created by this run.
    pub created_indexes: Vec<String>,
}

impl SchemaReport {
    pub fn is_noop(&self) -> bool {
        self.created_containers.is_empty() && self.created_indexes.is_empty()
    }
}

pub struct SchemaProvisioner {
    store: Arc<dyn DataStore>,
    containers: Vec<ContainerSchema>,
}

impl SchemaProvisioner {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self::with_schema(store, declared_schema())
    }

    pub fn with_schema(store: Arc<dyn DataStore>, containers: Vec<ContainerSchema>) -> Self {
        Self { store, containers }
    }

    /// Checks every declared index against what already exists, without creating
    /// anything.
    pub fn preflight(&self, scope: &Scope) -> StoreResult<()> {
        for container in &self.containers {
            for index in &container.indexes {
                index.validate()?;
            }
            if !self.store.container_exists(scope, container.name)? {
                continue;
            }
            let existing = self.store.list_indexes(scope, container.name)?;
            for index in &container.indexes {
                if let Some(detail) = existing.iter().find_map(|e| index.conflict_with(e)) {
                    return Err(StoreError::SchemaConflict {
                        container: format!("{}.{}", scope, container.name),
                        index: index.name.clone(),
                        detail,
                    });
                }
            }
        }
        Ok(())
    }

    /// Creates whatever part of the declared layout is missing. Running it again is
    /// a no-op; an incompatible existing index fails the call before any change.
    pub fn ensure_schema(&self, scope: &Scope) -> StoreResult<SchemaReport> {
        self.preflight(scope)?;

        let mut report = SchemaReport::default();
        for container in &self.containers {
            if self.store.create_container(scope, container.name)? {
                report.created_containers.push(container.name.to_string());
            } else {
                debug!("Container {}.{} already present", scope, container.name);
            }
            for index in &container.indexes {
                if self.store.create_index(scope, container.name, index)? {
                    report
                        .created_indexes
                        .push(format!("{}.{}", container.name, index.name));
                }
            }
        }

        if report.is_noop() {
            info!("Schema of {} already up to date", scope);
        } else {
            info!(
                "Provisioned {}: containers [{}], indexes [{}]",
                scope,
                report.created_containers.join(", "),
                report.created_indexes.join(", ")
            );
        }
        Ok(report)
    }
}
