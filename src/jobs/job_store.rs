use super::models::{Job, JobId, CRON_JOB_TTL_DAYS};
use crate::clock::{Clock, SystemClock};
use crate::crons::Cron;
use crate::data_store::{
    DataStore, Document, DocumentQuery, Filter, FindOptions, NotExpired, Scope,
    DEFAULT_PAGE_SIZE,
};
use crate::error::{StoreError, StoreResult};
use crate::schema::JOBS_CONTAINER;
use chrono::Duration;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

const EXPIRY_FIELD: &str = "expiry_time";

pub type JobQuery = DocumentQuery<Job>;

/// Jobs of one scope. Every read hides jobs whose `expiry_time` has passed, even
/// before the expiry reaper has removed them.
pub struct JobStore {
    store: Arc<dyn DataStore>,
    scope: Scope,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl JobStore {
    pub fn new(store: Arc<dyn DataStore>, scope: Scope) -> Self {
        Self {
            store,
            scope,
            clock: Arc::new(SystemClock),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn live(&self, filter: Filter) -> Filter {
        filter.gt(EXPIRY_FIELD, self.now_millis())
    }

    fn query(&self, filter: Filter) -> JobQuery {
        DocumentQuery::new(self.store.clone(), self.scope.clone(), JOBS_CONTAINER, filter)
            .not_expired(NotExpired {
                field: EXPIRY_FIELD,
                clock: self.clock.clone(),
            })
            .page_size(self.page_size)
    }

    fn insert(
        &self,
        name: &str,
        payload: JsonValue,
        ttl: Duration,
        cron: Option<&str>,
    ) -> StoreResult<JobId> {
        if name.trim().is_empty() {
            return Err(StoreError::invalid("job name cannot be empty"));
        }
        if ttl <= Duration::zero() {
            return Err(StoreError::invalid(format!(
                "job ttl must be positive, got {}",
                ttl
            )));
        }
        let now = self.clock.now();
        let expiry_time = now
            .checked_add_signed(ttl)
            .ok_or_else(|| StoreError::invalid(format!("job ttl {} is out of range", ttl)))?;

        let job = Job {
            id: JobId::generate(),
            name: name.to_string(),
            payload,
            result: None,
            error: None,
            cron: cron.map(str::to_string),
            created_at: now,
            expiry_time,
        };
        let JsonValue::Object(document) = serde_json::to_value(&job)? else {
            return Err(StoreError::invalid("job did not serialize to an object"));
        };
        self.store.insert(&self.scope, JOBS_CONTAINER, &document)?;
        debug!("Enqueued job {} ({}) expiring at {}", job.id, name, expiry_time);
        Ok(job.id)
    }

    /// Creates a pending job that expires `ttl` from now.
    pub fn enqueue(&self, name: &str, payload: JsonValue, ttl: Duration) -> StoreResult<JobId> {
        self.insert(name, payload, ttl, None)
    }

    /// Creates a job from the cron's template, named after the cron and kept for a week.
    pub fn enqueue_for_cron(&self, cron: &Cron) -> StoreResult<JobId> {
        if cron.disabled {
            return Err(StoreError::invalid(format!("cron {} is disabled", cron.name)));
        }
        let payload = serde_json::to_value(&cron.job)?;
        self.insert(
            &cron.name,
            payload,
            Duration::days(CRON_JOB_TTL_DAYS),
            Some(&cron.name),
        )
    }

    fn set_fields(&self, job_id: &JobId, fields: Document) -> StoreResult<()> {
        let matched = self.store.update(
            &self.scope,
            JOBS_CONTAINER,
            &self.live(Filter::by_id(job_id.as_str())),
            &fields,
        )?;
        if matched == 0 {
            return Err(StoreError::not_found("job", job_id.as_str()));
        }
        Ok(())
    }

    /// Sets the result of a live job; the last writer wins. `NotFound` when the job
    /// never existed, was deleted or has expired.
    pub fn record_result(&self, job_id: &JobId, result: JsonValue) -> StoreResult<()> {
        if result.is_null() {
            return Err(StoreError::invalid("job result cannot be null"));
        }
        let mut fields = Document::new();
        fields.insert("result".to_string(), result);
        fields.insert("error".to_string(), JsonValue::Null);
        self.set_fields(job_id, fields)
    }

    pub fn record_error(&self, job_id: &JobId, error: &str) -> StoreResult<()> {
        let mut fields = Document::new();
        fields.insert("error".to_string(), JsonValue::String(error.to_string()));
        self.set_fields(job_id, fields)
    }

    pub fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        let found = self.store.find(
            &self.scope,
            JOBS_CONTAINER,
            &self.live(Filter::by_id(job_id.as_str())),
            FindOptions {
                after_seq: None,
                limit: Some(1),
            },
        )?;
        found
            .into_iter()
            .next()
            .map(|doc| -> StoreResult<Job> {
                Ok(serde_json::from_value(JsonValue::Object(doc.body))?)
            })
            .transpose()
    }

    /// Removes a live job. Returns false when there was nothing to remove.
    pub fn delete(&self, job_id: &JobId) -> StoreResult<bool> {
        let removed = self.store.delete(
            &self.scope,
            JOBS_CONTAINER,
            &self.live(Filter::by_id(job_id.as_str())),
        )?;
        Ok(removed > 0)
    }

    /// Live jobs called `name`, oldest first. Evaluated on iteration.
    pub fn find_by_name(&self, name: &str) -> JobQuery {
        self.query(Filter::new().eq("name", name))
    }

    /// Live jobs whose result equals `result`, oldest first. `null` selects jobs
    /// without a result.
    pub fn find_by_result(&self, result: impl Into<JsonValue>) -> JobQuery {
        self.query(Filter::new().eq("result", result))
    }
}
