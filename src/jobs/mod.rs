mod job_store;
pub mod models;

pub use job_store::{JobQuery, JobStore};
pub use models::{Job, JobId, JobStatus, CRON_JOB_TTL_DAYS};
