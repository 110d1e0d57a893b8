mod cron_store;
pub mod models;

pub use cron_store::{CronQuery, CronStore};
pub use models::{Cron, CronSchedule, Frequency, JobKind, JobTemplate};
