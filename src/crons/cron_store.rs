use super::models::{Cron, CronSchedule, JobTemplate};
use crate::clock::{Clock, SystemClock};
use crate::data_store::{
    DataStore, Document, DocumentQuery, Filter, FindOptions, ReplaceOutcome, Scope, ID_FIELD,
};
use crate::error::{StoreError, StoreResult};
use crate::schema::{CRONS_CONTAINER, CRON_UPDATES_CONTAINER};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// `_id` of the single document in `cron_updates`.
const UPDATE_MARKER_ID: &str = "cron_update";

pub type CronQuery = DocumentQuery<Cron>;

/// Recurring schedule definitions of one scope, keyed by name.
pub struct CronStore {
    store: Arc<dyn DataStore>,
    scope: Scope,
    clock: Arc<dyn Clock>,
}

impl CronStore {
    pub fn new(store: Arc<dyn DataStore>, scope: Scope) -> Self {
        Self {
            store,
            scope,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn by_name(name: &str) -> Filter {
        Filter::new().eq("name", name)
    }

    fn validate_name(name: &str) -> StoreResult<()> {
        if name.trim().is_empty() {
            return Err(StoreError::invalid("cron name cannot be empty"));
        }
        Ok(())
    }

    fn mark_changed(&self) -> StoreResult<()> {
        let mut marker = Document::new();
        marker.insert(ID_FIELD.to_string(), json!(UPDATE_MARKER_ID));
        marker.insert("changed".to_string(), JsonValue::Bool(true));
        marker.insert(
            "updated_at".to_string(),
            json!(self.clock.now().timestamp_millis()),
        );
        self.store.replace_one(
            &self.scope,
            CRON_UPDATES_CONTAINER,
            &Filter::by_id(UPDATE_MARKER_ID),
            &marker,
            true,
        )?;
        Ok(())
    }

    /// Creates the cron or replaces its whole definition, schedule and job template alike.
    pub fn upsert(
        &self,
        name: &str,
        schedule: CronSchedule,
        job: JobTemplate,
        disabled: bool,
    ) -> StoreResult<()> {
        Self::validate_name(name)?;
        schedule.validate()?;
        job.validate()?;

        let cron = Cron {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            disabled,
            schedule,
            job,
            updated_at: self.clock.now(),
        };
        let JsonValue::Object(document) = serde_json::to_value(&cron)? else {
            return Err(StoreError::invalid("cron did not serialize to an object"));
        };
        let outcome = self.store.replace_one(
            &self.scope,
            CRONS_CONTAINER,
            &Self::by_name(name),
            &document,
            true,
        )?;
        match outcome {
            ReplaceOutcome::Inserted => info!("Created cron {}", name),
            _ => info!("Replaced cron {}", name),
        }
        self.mark_changed()
    }

    pub fn get(&self, name: &str) -> StoreResult<Option<Cron>> {
        let found = self.store.find(
            &self.scope,
            CRONS_CONTAINER,
            &Self::by_name(name),
            FindOptions {
                after_seq: None,
                limit: Some(1),
            },
        )?;
        found
            .into_iter()
            .next()
            .map(|doc| -> StoreResult<Cron> {
                Ok(serde_json::from_value(JsonValue::Object(doc.body))?)
            })
            .transpose()
    }

    fn set_disabled(&self, name: &str, disabled: bool) -> StoreResult<()> {
        let mut fields = Document::new();
        fields.insert("disabled".to_string(), JsonValue::Bool(disabled));
        fields.insert(
            "updated_at".to_string(),
            json!(self.clock.now().timestamp_millis()),
        );
        let matched = self
            .store
            .update(&self.scope, CRONS_CONTAINER, &Self::by_name(name), &fields)?;
        if matched == 0 {
            return Err(StoreError::not_found("cron", name));
        }
        debug!("Cron {} disabled={}", name, disabled);
        self.mark_changed()
    }

    pub fn disable(&self, name: &str) -> StoreResult<()> {
        self.set_disabled(name, true)
    }

    pub fn enable(&self, name: &str) -> StoreResult<()> {
        self.set_disabled(name, false)
    }

    pub fn delete(&self, name: &str) -> StoreResult<()> {
        let removed = self
            .store
            .delete(&self.scope, CRONS_CONTAINER, &Self::by_name(name))?;
        if removed == 0 {
            return Err(StoreError::not_found("cron", name));
        }
        info!("Deleted cron {}", name);
        self.mark_changed()
    }

    pub fn list_enabled(&self) -> CronQuery {
        DocumentQuery::new(
            self.store.clone(),
            self.scope.clone(),
            CRONS_CONTAINER,
            Filter::new().eq("disabled", false),
        )
    }

    pub fn list_all(&self) -> CronQuery {
        DocumentQuery::new(
            self.store.clone(),
            self.scope.clone(),
            CRONS_CONTAINER,
            Filter::new(),
        )
    }

    /// True when definitions changed since the last call. Clears the flag.
    pub fn take_schedule_changed(&self) -> StoreResult<bool> {
        let mut fields = Document::new();
        fields.insert("changed".to_string(), JsonValue::Bool(false));
        let matched = self.store.update(
            &self.scope,
            CRON_UPDATES_CONTAINER,
            &Filter::by_id(UPDATE_MARKER_ID).eq("changed", true),
            &fields,
        )?;
        Ok(matched > 0)
    }
}
