//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestStore, APP_SCOPE};
//!
//! #[test]
//! fn test_bootstrap() {
//!     let test_store = TestStore::bootstrapped();
//!     assert!(test_store.store.container_exists(&test_store.scope, "jobs").unwrap());
//! }
//! ```

mod constants;
mod fixtures;

pub use constants::*;
pub use fixtures::TestStore;
