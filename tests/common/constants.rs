//! Shared names and credentials for end-to-end tests

pub const APP_SCOPE: &str = "dock";

pub const ADMIN_USER: &str = "dock-admin";
pub const ADMIN_PASS: &str = "admin-secret-1";

pub const APP_USER: &str = "dock-scheduler";
pub const APP_PASS: &str = "app-secret-2";
