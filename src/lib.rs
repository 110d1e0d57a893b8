//! Dock Schedule Store
//!
//! Data layer of the dock scheduler: principals, the job and cron containers and
//! their indexes, the job and cron stores, and expiry of finished jobs.

pub mod access;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod crons;
pub mod data_store;
pub mod error;
pub mod expiry;
pub mod jobs;
pub mod schema;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use access::{AccessController, ExistingPrincipalPolicy, PrincipalOutcome, Secret};
pub use data_store::{DataStore, Scope, SqliteDataStore, StoreOptions};
pub use error::{StoreError, StoreResult};
pub use expiry::{ExpiryReaper, DEFAULT_REAP_INTERVAL};
pub use schema::SchemaProvisioner;
