use crate::error::{StoreError, StoreResult};
use crate::data_store::Document;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Second,
    Minute,
    Hour,
    Day,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Second => "second",
            Frequency::Minute => "minute",
            Frequency::Hour => "hour",
            Frequency::Day => "day",
        }
    }

    /// Accepted `at` layouts, e.g. `:SS` for every minute.
    fn at_formats(&self) -> &'static [&'static str] {
        match self {
            Frequency::Second => &[],
            Frequency::Minute => &[":SS"],
            Frequency::Hour => &["MM:SS", ":MM"],
            Frequency::Day => &["HH:MM", "HH:MM:SS"],
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `:` where the layout has one, a digit everywhere else.
fn matches_layout(at: &str, layout: &str) -> bool {
    at.len() == layout.len()
        && at.bytes().zip(layout.bytes()).all(|(c, l)| {
            if l == b':' {
                c == b':'
            } else {
                c.is_ascii_digit()
            }
        })
}

/// When a cron fires: every `interval` units of `frequency`, or once per
/// `frequency` at a fixed `at` offset (which wins when both are set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl CronSchedule {
    pub fn every(interval: u32, frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: Some(interval),
            at: None,
            timezone: None,
        }
    }

    pub fn at(frequency: Frequency, at: impl Into<String>) -> Self {
        Self {
            frequency,
            interval: None,
            at: Some(at.into()),
            timezone: None,
        }
    }

    pub fn in_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.interval.is_none() && self.at.is_none() {
            return Err(StoreError::invalid(
                "schedule needs an interval or an at time",
            ));
        }
        if self.interval == Some(0) {
            return Err(StoreError::invalid("schedule interval must be positive"));
        }
        if let Some(at) = &self.at {
            let formats = self.frequency.at_formats();
            if formats.is_empty() {
                return Err(StoreError::invalid(format!(
                    "frequency {} cannot be combined with an at time",
                    self.frequency
                )));
            }
            if !formats.iter().any(|layout| matches_layout(at, layout)) {
                return Err(StoreError::invalid(format!(
                    "invalid at time {:?} for frequency {} (expected {})",
                    at,
                    self.frequency,
                    formats.join(" or ")
                )));
            }
        }
        if let Some(timezone) = &self.timezone {
            if timezone.parse::<Tz>().is_err() {
                return Err(StoreError::invalid(format!(
                    "unknown timezone {:?}, expected an IANA name such as UTC or Europe/Rome",
                    timezone
                )));
            }
        }
        Ok(())
    }
}

/// Runner that executes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Ansible,
    Python3,
    Bash,
    Php,
    Node,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ansible => "ansible",
            JobKind::Python3 => "python3",
            JobKind::Bash => "bash",
            JobKind::Php => "php",
            JobKind::Node => "node",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a cron runs. Every job the cron produces starts from a copy of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    #[serde(rename = "type")]
    pub kind: JobKind,
    /// Playbook or script file name.
    pub run: String,
    /// Only passed to non-ansible runners.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub host_inventory: Document,
    #[serde(default)]
    pub extra_vars: Document,
}

impl JobTemplate {
    pub fn new(kind: JobKind, run: impl Into<String>) -> Self {
        Self {
            kind,
            run: run.into(),
            args: Vec::new(),
            host_inventory: Document::new(),
            extra_vars: Document::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_host(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.host_inventory
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    pub fn with_extra_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_vars
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.run.trim().is_empty() {
            return Err(StoreError::invalid(format!(
                "{} job needs a file to run",
                self.kind
            )));
        }
        if self.kind != JobKind::Ansible
            && !(self.host_inventory.is_empty() && self.extra_vars.is_empty())
        {
            return Err(StoreError::invalid(format!(
                "host inventory and extra vars only apply to ansible jobs, not {}",
                self.kind
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cron {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub disabled: bool,
    pub schedule: CronSchedule,
    #[serde(flatten)]
    pub job: JobTemplate,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}
