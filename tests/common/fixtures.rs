use super::constants::*;
use dock_schedule_store::access::{ExistingPrincipalPolicy, HashCost, Secret};
use dock_schedule_store::bootstrap::{self, BootstrapPlan, PrincipalSpec};
use dock_schedule_store::clock::FakeClock;
use dock_schedule_store::crons::CronStore;
use dock_schedule_store::jobs::JobStore;
use dock_schedule_store::{Scope, SqliteDataStore, StoreOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// An on-disk store in a temporary directory, removed on drop.
pub struct TestStore {
    pub store: Arc<SqliteDataStore>,
    pub scope: Scope,
    pub clock: FakeClock,
    pub db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestStore {
    pub fn empty() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("store.db");
        let store = SqliteDataStore::open(&db_path, StoreOptions::default())
            .expect("Failed to open test store");
        Self {
            store: Arc::new(store),
            scope: Scope::new(APP_SCOPE).unwrap(),
            clock: FakeClock::new(),
            db_path,
            _temp_dir: temp_dir,
        }
    }

    pub fn bootstrapped() -> Self {
        let test_store = Self::empty();
        bootstrap::run(test_store.store.clone(), &test_store.plan(ExistingPrincipalPolicy::Ignore))
            .expect("Failed to bootstrap test store");
        test_store
    }

    pub fn plan(&self, policy: ExistingPrincipalPolicy) -> BootstrapPlan {
        BootstrapPlan {
            app_scope: self.scope.clone(),
            admin: PrincipalSpec {
                name: ADMIN_USER.to_string(),
                secret: Secret::new(ADMIN_PASS),
            },
            app: PrincipalSpec {
                name: APP_USER.to_string(),
                secret: Secret::new(APP_PASS),
            },
            policy,
            hash_cost: HashCost::minimal(),
        }
    }

    /// Job store reading time from the fixture's fake clock.
    pub fn jobs(&self) -> JobStore {
        JobStore::new(self.store.clone(), self.scope.clone()).with_clock(Arc::new(self.clock.clone()))
    }

    pub fn crons(&self) -> CronStore {
        CronStore::new(self.store.clone(), self.scope.clone()).with_clock(Arc::new(self.clock.clone()))
    }
}
