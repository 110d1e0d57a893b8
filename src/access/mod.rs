mod controller;
pub mod roles;
pub mod secret;

pub use controller::{AccessController, ExistingPrincipalPolicy, PrincipalOutcome};
pub use roles::{Permission, Role, RoleBinding};
pub use secret::{HashCost, Secret, SecretDigest, SecretHasher};
