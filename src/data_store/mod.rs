//! The document store interface every component is written against, plus the
//! SQLite-backed implementation shipped with the crate.

mod query;
mod sqlite_data_store;

pub use query::{DocumentIter, DocumentQuery, NotExpired, DEFAULT_PAGE_SIZE};
pub use sqlite_data_store::{SqliteDataStore, StoreOptions, DEFAULT_STORE_TIMEOUT};

use crate::access::{RoleBinding, SecretDigest};
use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A JSON object stored in a container. Every stored document carries a string `_id`.
pub type Document = serde_json::Map<String, JsonValue>;

pub const ID_FIELD: &str = "_id";

lazy_static! {
    static ref NAME_PATTERN: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,63}$").unwrap();
    static ref FIELD_PATTERN: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap();
    static ref INDEX_NAME_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap();
}

/// Validates a scope or container name.
pub fn validate_name(kind: &str, name: &str) -> StoreResult<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::invalid(format!("invalid {} name {:?}", kind, name)))
    }
}

pub fn validate_field(field: &str) -> StoreResult<()> {
    if FIELD_PATTERN.is_match(field) {
        Ok(())
    } else {
        Err(StoreError::invalid(format!("invalid field name {:?}", field)))
    }
}

/// The administrative boundary (a database) containers and role bindings live in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope(String);

impl Scope {
    pub const ADMIN: &'static str = "admin";

    pub fn new(name: impl Into<String>) -> StoreResult<Self> {
        let name = name.into();
        validate_name("scope", &name)?;
        Ok(Scope(name))
    }

    pub fn admin() -> Self {
        Scope(Self::ADMIN.to_string())
    }

    pub fn is_admin(&self) -> bool {
        self.0 == Self::ADMIN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Scope {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::new(s)
    }
}

impl TryFrom<String> for Scope {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Scope::new(value)
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Eq,
    Gt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: String,
    pub comparison: Comparison,
    pub value: JsonValue,
}

/// Conjunction of comparisons over top-level document fields. An empty filter matches
/// every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq(ID_FIELD, JsonValue::String(id.into()))
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.clauses.push(Clause {
            field: field.into(),
            comparison: Comparison::Eq,
            value: value.into(),
        });
        self
    }

    pub fn gt(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.clauses.push(Clause {
            field: field.into(),
            comparison: Comparison::Gt,
            value: value.into(),
        });
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub unique: bool,
    /// Makes this a TTL index: documents are removed once the (single) key field,
    /// an epoch-millisecond timestamp, is older than this.
    pub expire_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
    pub options: IndexOptions,
}

impl IndexSpec {
    /// Single ascending key, named like `field_1`.
    pub fn ascending(field: &str) -> Self {
        IndexSpec {
            name: format!("{}_1", field),
            keys: vec![IndexKey {
                field: field.to_string(),
                order: SortOrder::Asc,
            }],
            options: IndexOptions::default(),
        }
    }

    pub fn expire_after(mut self, after: Duration) -> Self {
        self.options.expire_after = Some(after);
        self
    }

    pub fn unique(mut self) -> Self {
        self.options.unique = true;
        self
    }

    pub fn is_ttl(&self) -> bool {
        self.options.expire_after.is_some()
    }

    pub fn validate(&self) -> StoreResult<()> {
        if !INDEX_NAME_PATTERN.is_match(&self.name) {
            return Err(StoreError::invalid(format!(
                "invalid index name {:?}",
                self.name
            )));
        }
        if self.keys.is_empty() {
            return Err(StoreError::invalid(format!(
                "index {} has no keys",
                self.name
            )));
        }
        for key in &self.keys {
            validate_field(&key.field)?;
        }
        if self.is_ttl() && self.keys.len() != 1 {
            return Err(StoreError::invalid(format!(
                "TTL index {} must have exactly one key",
                self.name
            )));
        }
        // The catalog records whole seconds.
        if let Some(after) = self.options.expire_after {
            if after.subsec_nanos() != 0 {
                return Err(StoreError::invalid(format!(
                    "TTL index {} must expire after whole seconds, got {:?}",
                    self.name, after
                )));
            }
        }
        Ok(())
    }

    /// Same keys and options; the name does not matter.
    pub fn is_equivalent(&self, other: &IndexSpec) -> bool {
        self.keys == other.keys && self.options == other.options
    }

    /// Describes why `existing` prevents creating `self`, if it does.
    pub fn conflict_with(&self, existing: &IndexSpec) -> Option<String> {
        if self.name == existing.name && !self.is_equivalent(existing) {
            return Some(format!(
                "index {} already exists with a different definition (existing {:?} {:?}, requested {:?} {:?})",
                existing.name, existing.keys, existing.options, self.keys, self.options
            ));
        }
        if self.name != existing.name
            && self.keys == existing.keys
            && self.options != existing.options
        {
            return Some(format!(
                "index {} already covers the same keys with different options (existing {:?}, requested {:?})",
                existing.name, existing.options, self.options
            ));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Only documents inserted after this sequence number.
    pub after_seq: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Insertion sequence, strictly increasing within a container.
    pub seq: i64,
    pub body: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    Inserted,
    NotMatched,
}

/// A principal as reported by the store. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalRecord {
    pub scope: Scope,
    pub name: String,
    pub roles: Vec<RoleBinding>,
    pub created: DateTime<Utc>,
}

pub trait DataStore: Send + Sync {
    // Containers and indexes
    fn container_exists(&self, scope: &Scope, container: &str) -> StoreResult<bool>;
    /// Returns true when the container was created by this call.
    fn create_container(&self, scope: &Scope, container: &str) -> StoreResult<bool>;
    fn list_containers(&self, scope: &Scope) -> StoreResult<Vec<String>>;
    fn list_indexes(&self, scope: &Scope, container: &str) -> StoreResult<Vec<IndexSpec>>;
    /// Returns true when created, false when an equivalent index already exists.
    /// Fails with `SchemaConflict` when an incompatible index is in the way.
    fn create_index(&self, scope: &Scope, container: &str, spec: &IndexSpec) -> StoreResult<bool>;

    // Principals
    fn get_principal(&self, scope: &Scope, name: &str) -> StoreResult<Option<PrincipalRecord>>;
    fn principal_digest(&self, scope: &Scope, name: &str) -> StoreResult<Option<SecretDigest>>;
    /// Returns false, without touching the existing principal, when it already exists.
    fn create_principal(
        &self,
        scope: &Scope,
        name: &str,
        digest: &SecretDigest,
        roles: &[RoleBinding],
    ) -> StoreResult<bool>;
    fn list_principals(&self, scope: &Scope) -> StoreResult<Vec<PrincipalRecord>>;

    // Documents
    /// Inserts a document with a string `_id` and returns its sequence number.
    fn insert(&self, scope: &Scope, container: &str, document: &Document) -> StoreResult<i64>;
    /// Sets the given top-level fields on every matching document. Returns the match count.
    fn update(
        &self,
        scope: &Scope,
        container: &str,
        filter: &Filter,
        set: &Document,
    ) -> StoreResult<usize>;
    /// Replaces the first matching document, keeping its `_id`, or inserts when
    /// `upsert` is set and nothing matches.
    fn replace_one(
        &self,
        scope: &Scope,
        container: &str,
        filter: &Filter,
        document: &Document,
        upsert: bool,
    ) -> StoreResult<ReplaceOutcome>;
    /// Matching documents in insertion order.
    fn find(
        &self,
        scope: &Scope,
        container: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<StoredDocument>>;
    fn delete(&self, scope: &Scope, container: &str, filter: &Filter) -> StoreResult<usize>;

    /// Removes every document whose TTL-indexed field is older than its index allows.
    fn reap_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}
