use super::{
    validate_field, validate_name, Comparison, DataStore, Document, Filter, FindOptions,
    IndexKey, IndexOptions, IndexSpec, PrincipalRecord, ReplaceOutcome, Scope, SortOrder,
    StoredDocument, ID_FIELD,
};
use crate::access::{RoleBinding, SecretDigest};
use crate::error::{StoreError, StoreResult};
use crate::sqlite_column;
use crate::sqlite_persistence::{
    open_versioned, Column, ForeignKey, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};
use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension,
    TransactionBehavior,
};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Upper bound on waiting for the database; exceeded calls fail with `Timeout`.
    pub timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

// =============================================================================
// Catalog version 1
// =============================================================================

const CONTAINERS_TABLE_V1: Table = Table {
    name: "store_containers",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("scope", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[&["scope", "name"]],
};

const INDEXES_TABLE_V1: Table = Table {
    name: "store_indexes",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("scope", &SqlType::Text, non_null = true),
        sqlite_column!("container", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("keys", &SqlType::Text, non_null = true),
        sqlite_column!("is_unique", &SqlType::Integer, non_null = true),
        sqlite_column!("expire_after_secs", &SqlType::Integer),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_store_indexes_ttl", "expire_after_secs")],
    unique_constraints: &[&["scope", "container", "name"]],
};

const PRINCIPALS_TABLE_V1: Table = Table {
    name: "store_principals",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("scope", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("hasher", &SqlType::Text, non_null = true),
        sqlite_column!("salt", &SqlType::Text, non_null = true),
        sqlite_column!("hash", &SqlType::Text, non_null = true),
        sqlite_column!(
            "created",
            &SqlType::Integer,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[&["scope", "name"]],
};

const PRINCIPAL_ROLES_TABLE_V1: Table = Table {
    name: "store_principal_roles",
    columns: &[
        sqlite_column!(
            "principal_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "store_principals",
                foreign_column: "id",
                cascade_on_delete: true,
            })
        ),
        sqlite_column!("role", &SqlType::Text, non_null = true),
        sqlite_column!("role_scope", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["principal_id", "role", "role_scope"]],
};

pub const CATALOG_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        CONTAINERS_TABLE_V1,
        INDEXES_TABLE_V1,
        PRINCIPALS_TABLE_V1,
        PRINCIPAL_ROLES_TABLE_V1,
    ],
    migration: None,
}];

// =============================================================================
// SQL rendering helpers
// =============================================================================

/// Documents of `scope.container` live in a table named after the namespace.
fn collection_table(scope: &Scope, container: &str) -> StoreResult<String> {
    validate_name("container", container)?;
    Ok(format!("\"{}.{}\"", scope, container))
}

fn index_sql_name(scope: &Scope, container: &str, index: &str) -> String {
    format!("\"{}.{}.{}\"", scope, container, index)
}

fn field_expr(field: &str) -> StoreResult<String> {
    if field == ID_FIELD {
        return Ok("id".to_string());
    }
    validate_field(field)?;
    Ok(format!("json_extract(body, '$.{}')", field))
}

fn type_expr(field: &str) -> String {
    format!("json_type(body, '$.{}')", field)
}

/// The SQL value `json_extract` yields for a JSON value.
fn sql_value(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        JsonValue::Array(_) | JsonValue::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Equality on a document field. `json_extract` alone conflates `true` with `1`
/// and a JSON string with the object it spells, so the JSON type is matched too.
fn eq_condition(field: &str, expr: &str, value: &JsonValue) -> (String, Option<SqlValue>) {
    if field == ID_FIELD {
        return (format!("{} = ?", expr), Some(sql_value(value)));
    }
    let json_type = type_expr(field);
    match value {
        JsonValue::Null => (format!("{} IS NULL", expr), None),
        JsonValue::Bool(true) => (format!("{} = 'true'", json_type), None),
        JsonValue::Bool(false) => (format!("{} = 'false'", json_type), None),
        JsonValue::Number(_) => (
            format!("{} IN ('integer', 'real') AND {} = ?", json_type, expr),
            Some(sql_value(value)),
        ),
        JsonValue::String(_) => (
            format!("{} = 'text' AND {} = ?", json_type, expr),
            Some(sql_value(value)),
        ),
        JsonValue::Array(_) => (
            format!("{} = 'array' AND {} = json(?)", json_type, expr),
            Some(sql_value(value)),
        ),
        JsonValue::Object(_) => (
            format!("{} = 'object' AND {} = json(?)", json_type, expr),
            Some(sql_value(value)),
        ),
    }
}

/// Ordering is only defined between numbers and between strings.
fn gt_condition(field: &str, expr: &str, value: &JsonValue) -> StoreResult<(String, SqlValue)> {
    if field == ID_FIELD {
        return Ok((format!("{} > ?", expr), sql_value(value)));
    }
    let json_type = type_expr(field);
    let guard = match value {
        JsonValue::Number(_) => format!("{} IN ('integer', 'real')", json_type),
        JsonValue::String(_) => format!("{} = 'text'", json_type),
        _ => {
            return Err(StoreError::invalid(format!(
                "cannot compare {} greater than {}",
                field, value
            )))
        }
    };
    Ok((format!("{} AND {} > ?", guard, expr), sql_value(value)))
}

/// Renders a filter as a WHERE fragment (always non-empty) plus its parameters.
fn where_clause(filter: &Filter) -> StoreResult<(String, Vec<SqlValue>)> {
    let mut conditions = Vec::with_capacity(filter.clauses().len());
    let mut values = Vec::new();
    for clause in filter.clauses() {
        let expr = field_expr(&clause.field)?;
        match clause.comparison {
            Comparison::Eq => {
                let (condition, value) = eq_condition(&clause.field, &expr, &clause.value);
                conditions.push(condition);
                values.extend(value);
            }
            Comparison::Gt => {
                let (condition, value) = gt_condition(&clause.field, &expr, &clause.value)?;
                conditions.push(condition);
                values.push(value);
            }
        }
    }
    if conditions.is_empty() {
        conditions.push("1".to_string());
    }
    Ok((conditions.join(" AND "), values))
}

fn document_id(document: &Document) -> StoreResult<&str> {
    document
        .get(ID_FIELD)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::invalid("document has no string _id"))
}

fn from_unix_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

// =============================================================================
// Store
// =============================================================================

/// `DataStore` on an embedded SQLite database. Containers are tables of JSON
/// documents, indexes are expression indexes over document fields.
#[derive(Clone)]
pub struct SqliteDataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDataStore {
    pub fn open<P: AsRef<Path>>(db_path: P, options: StoreOptions) -> StoreResult<Self> {
        let path = db_path.as_ref();
        info!("Opening document store at {:?}", path);
        Self::with_connection(Connection::open(path)?, options)
    }

    pub fn open_in_memory(options: StoreOptions) -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, options)
    }

    fn with_connection(mut conn: Connection, options: StoreOptions) -> StoreResult<Self> {
        conn.busy_timeout(options.timeout)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        let version = open_versioned(&mut conn, CATALOG_VERSIONED_SCHEMAS)?;
        debug!("Store catalog at version {}", version);
        Ok(SqliteDataStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_container(conn: &Connection, scope: &Scope, container: &str) -> StoreResult<()> {
        if Self::container_row_exists(conn, scope, container)? {
            Ok(())
        } else {
            Err(StoreError::not_found(
                "container",
                format!("{}.{}", scope, container),
            ))
        }
    }

    fn container_row_exists(conn: &Connection, scope: &Scope, container: &str) -> StoreResult<bool> {
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM store_containers WHERE scope = ?1 AND name = ?2)",
            params![scope.as_str(), container],
            |row| row.get(0),
        )?)
    }

    fn row_to_index_spec(row: &rusqlite::Row) -> rusqlite::Result<(String, String, bool, Option<i64>)> {
        Ok((
            row.get("name")?,
            row.get("keys")?,
            row.get::<_, i64>("is_unique")? != 0,
            row.get("expire_after_secs")?,
        ))
    }

    fn load_indexes(conn: &Connection, scope: &Scope, container: &str) -> StoreResult<Vec<IndexSpec>> {
        let mut stmt = conn.prepare(
            "SELECT name, keys, is_unique, expire_after_secs FROM store_indexes
             WHERE scope = ?1 AND container = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![scope.as_str(), container], Self::row_to_index_spec)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(name, keys, unique, expire_after_secs)| {
                Ok(IndexSpec {
                    name,
                    keys: serde_json::from_str::<Vec<IndexKey>>(&keys)?,
                    options: IndexOptions {
                        unique,
                        expire_after: expire_after_secs
                            .map(|secs| Duration::from_secs(secs.max(0) as u64)),
                    },
                })
            })
            .collect()
    }

    fn load_roles(conn: &Connection, principal_id: i64) -> StoreResult<Vec<RoleBinding>> {
        let mut stmt = conn.prepare(
            "SELECT role, role_scope FROM store_principal_roles
             WHERE principal_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![principal_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(role, role_scope)| Ok(RoleBinding::new(role.parse()?, role_scope.parse()?)))
            .collect()
    }

    fn load_principal(
        conn: &Connection,
        scope: &Scope,
        name: &str,
    ) -> StoreResult<Option<PrincipalRecord>> {
        let row = conn
            .query_row(
                "SELECT id, created FROM store_principals WHERE scope = ?1 AND name = ?2",
                params![scope.as_str(), name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;
        let Some((id, created)) = row else {
            return Ok(None);
        };
        Ok(Some(PrincipalRecord {
            scope: scope.clone(),
            name: name.to_string(),
            roles: Self::load_roles(conn, id)?,
            created: from_unix_secs(created.unwrap_or_default()),
        }))
    }

    fn insert_document(conn: &Connection, table: &str, document: &Document) -> StoreResult<i64> {
        let id = document_id(document)?;
        let body = serde_json::to_string(document)?;
        match conn.execute(
            &format!("INSERT INTO {} (id, body) VALUES (?1, ?2)", table),
            params![id, body],
        ) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(err) if is_constraint_violation(&err) => Err(StoreError::invalid(format!(
                "document {} violates a unique constraint of {}",
                id, table
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn parse_body(body: &str) -> StoreResult<Document> {
        match serde_json::from_str::<JsonValue>(body)? {
            JsonValue::Object(document) => Ok(document),
            other => Err(StoreError::invalid(format!(
                "stored body is not an object: {}",
                other
            ))),
        }
    }
}

impl DataStore for SqliteDataStore {
    fn container_exists(&self, scope: &Scope, container: &str) -> StoreResult<bool> {
        validate_name("container", container)?;
        Self::container_row_exists(&self.conn(), scope, container)
    }

    fn create_container(&self, scope: &Scope, container: &str) -> StoreResult<bool> {
        let table = collection_table(scope, container)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO store_containers (scope, name) VALUES (?1, ?2)
             ON CONFLICT(scope, name) DO NOTHING",
            params![scope.as_str(), container],
        )?;
        tx.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    body TEXT NOT NULL
                )",
                table
            ),
            [],
        )?;
        tx.commit()?;
        if inserted > 0 {
            info!("Created container {}.{}", scope, container);
        }
        Ok(inserted > 0)
    }

    fn list_containers(&self, scope: &Scope) -> StoreResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name FROM store_containers WHERE scope = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![scope.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn list_indexes(&self, scope: &Scope, container: &str) -> StoreResult<Vec<IndexSpec>> {
        validate_name("container", container)?;
        let conn = self.conn();
        Self::require_container(&conn, scope, container)?;
        Self::load_indexes(&conn, scope, container)
    }

    fn create_index(&self, scope: &Scope, container: &str, spec: &IndexSpec) -> StoreResult<bool> {
        spec.validate()?;
        let table = collection_table(scope, container)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::require_container(&tx, scope, container)?;

        let existing = Self::load_indexes(&tx, scope, container)?;
        for index in &existing {
            if let Some(detail) = spec.conflict_with(index) {
                return Err(StoreError::SchemaConflict {
                    container: format!("{}.{}", scope, container),
                    index: spec.name.clone(),
                    detail,
                });
            }
        }
        if let Some(index) = existing.iter().find(|index| spec.is_equivalent(index)) {
            debug!(
                "Index {}.{}.{} already present as {}",
                scope, container, spec.name, index.name
            );
            return Ok(false);
        }

        let columns = spec
            .keys
            .iter()
            .map(|key| {
                let order = match key.order {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                Ok(format!("{} {}", field_expr(&key.field)?, order))
            })
            .collect::<StoreResult<Vec<_>>>()?
            .join(", ");
        tx.execute(
            &format!(
                "CREATE {}INDEX {} ON {} ({})",
                if spec.options.unique { "UNIQUE " } else { "" },
                index_sql_name(scope, container, &spec.name),
                table,
                columns
            ),
            [],
        )?;
        tx.execute(
            "INSERT INTO store_indexes (scope, container, name, keys, is_unique, expire_after_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                scope.as_str(),
                container,
                spec.name,
                serde_json::to_string(&spec.keys)?,
                spec.options.unique,
                spec.options.expire_after.map(|d| d.as_secs() as i64),
            ],
        )?;
        tx.commit()?;
        info!("Created index {}.{}.{}", scope, container, spec.name);
        Ok(true)
    }

    fn get_principal(&self, scope: &Scope, name: &str) -> StoreResult<Option<PrincipalRecord>> {
        Self::load_principal(&self.conn(), scope, name)
    }

    fn principal_digest(&self, scope: &Scope, name: &str) -> StoreResult<Option<SecretDigest>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT hasher, salt, hash FROM store_principals WHERE scope = ?1 AND name = ?2",
                params![scope.as_str(), name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(hasher, salt, hash)| {
            Ok(SecretDigest {
                hasher: hasher.parse()?,
                salt,
                hash,
            })
        })
        .transpose()
    }

    fn create_principal(
        &self,
        scope: &Scope,
        name: &str,
        digest: &SecretDigest,
        roles: &[RoleBinding],
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO store_principals (scope, name, hasher, salt, hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(scope, name) DO NOTHING",
            params![
                scope.as_str(),
                name,
                digest.hasher.to_string(),
                digest.salt,
                digest.hash
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        let principal_id = tx.last_insert_rowid();
        for binding in roles {
            tx.execute(
                "INSERT INTO store_principal_roles (principal_id, role, role_scope)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(principal_id, role, role_scope) DO NOTHING",
                params![principal_id, binding.role.as_str(), binding.scope.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn list_principals(&self, scope: &Scope) -> StoreResult<Vec<PrincipalRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name FROM store_principals WHERE scope = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![scope.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names
            .iter()
            .filter_map(|name| Self::load_principal(&conn, scope, name).transpose())
            .collect()
    }

    fn insert(&self, scope: &Scope, container: &str, document: &Document) -> StoreResult<i64> {
        let table = collection_table(scope, container)?;
        let conn = self.conn();
        Self::require_container(&conn, scope, container)?;
        Self::insert_document(&conn, &table, document)
    }

    fn update(
        &self,
        scope: &Scope,
        container: &str,
        filter: &Filter,
        set: &Document,
    ) -> StoreResult<usize> {
        let table = collection_table(scope, container)?;
        if set.is_empty() {
            return Err(StoreError::invalid("update sets no fields"));
        }
        let mut paths = Vec::with_capacity(set.len());
        let mut values: Vec<SqlValue> = Vec::with_capacity(set.len());
        for (field, value) in set {
            if field == ID_FIELD {
                return Err(StoreError::invalid("_id cannot be updated"));
            }
            validate_field(field)?;
            paths.push(format!("'$.{}', json(?)", field));
            values.push(SqlValue::Text(value.to_string()));
        }
        let (condition, filter_values) = where_clause(filter)?;
        values.extend(filter_values);

        let conn = self.conn();
        Self::require_container(&conn, scope, container)?;
        let matched = conn.execute(
            &format!(
                "UPDATE {} SET body = json_set(body, {}) WHERE {}",
                table,
                paths.join(", "),
                condition
            ),
            params_from_iter(values),
        )?;
        Ok(matched)
    }

    fn replace_one(
        &self,
        scope: &Scope,
        container: &str,
        filter: &Filter,
        document: &Document,
        upsert: bool,
    ) -> StoreResult<ReplaceOutcome> {
        let table = collection_table(scope, container)?;
        let (condition, values) = where_clause(filter)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::require_container(&tx, scope, container)?;

        let current = tx
            .query_row(
                &format!(
                    "SELECT seq, id FROM {} WHERE {} ORDER BY seq LIMIT 1",
                    table, condition
                ),
                params_from_iter(values),
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let outcome = match current {
            Some((seq, id)) => {
                let mut body = document.clone();
                body.insert(ID_FIELD.to_string(), JsonValue::String(id));
                tx.execute(
                    &format!("UPDATE {} SET body = ?1 WHERE seq = ?2", table),
                    params![serde_json::to_string(&body)?, seq],
                )?;
                ReplaceOutcome::Replaced
            }
            None if upsert => {
                Self::insert_document(&tx, &table, document)?;
                ReplaceOutcome::Inserted
            }
            None => ReplaceOutcome::NotMatched,
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn find(
        &self,
        scope: &Scope,
        container: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<StoredDocument>> {
        let table = collection_table(scope, container)?;
        let (mut condition, mut values) = where_clause(filter)?;
        if let Some(after_seq) = options.after_seq {
            condition.push_str(" AND seq > ?");
            values.push(SqlValue::Integer(after_seq));
        }
        let mut sql = format!(
            "SELECT seq, body FROM {} WHERE {} ORDER BY seq ASC",
            table, condition
        );
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn();
        Self::require_container(&conn, scope, container)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(seq, body)| {
                Ok(StoredDocument {
                    seq,
                    body: Self::parse_body(&body)?,
                })
            })
            .collect()
    }

    fn delete(&self, scope: &Scope, container: &str, filter: &Filter) -> StoreResult<usize> {
        let table = collection_table(scope, container)?;
        let (condition, values) = where_clause(filter)?;
        let conn = self.conn();
        Self::require_container(&conn, scope, container)?;
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE {}", table, condition),
            params_from_iter(values),
        )?;
        Ok(removed)
    }

    fn reap_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT scope, container, keys, expire_after_secs FROM store_indexes
             WHERE expire_after_secs IS NOT NULL",
        )?;
        let ttl_indexes = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut removed = 0;
        for (scope, container, keys, expire_after_secs) in ttl_indexes {
            let scope: Scope = scope.parse()?;
            let keys: Vec<IndexKey> = serde_json::from_str(&keys)?;
            let Some(key) = keys.first() else {
                continue;
            };
            let expr = field_expr(&key.field)?;
            let cutoff = now.timestamp_millis() - expire_after_secs * 1000;
            let count = conn.execute(
                &format!(
                    "DELETE FROM {} WHERE json_type(body, '$.{}') IN ('integer', 'real') AND {} <= ?1",
                    collection_table(&scope, &container)?,
                    key.field,
                    expr
                ),
                params![cutoff],
            )?;
            if count > 0 {
                debug!(
                    "Reaped {} expired documents from {}.{}",
                    count, scope, container
                );
            }
            removed += count;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{HashCost, Role, Secret, SecretHasher};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::TempDir;

    struct TestStore {
        store: SqliteDataStore,
        scope: Scope,
        _temp_dir: TempDir, // Keep temp dir alive
    }

    fn create_test_store() -> TestStore {
        let temp_dir = TempDir::new().unwrap();
        let store =
            SqliteDataStore::open(temp_dir.path().join("store.db"), StoreOptions::default())
                .unwrap();
        TestStore {
            store,
            scope: Scope::new("testdb").unwrap(),
            _temp_dir: temp_dir,
        }
    }

    fn doc(value: JsonValue) -> Document {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn create_container_is_idempotent() {
        let test = create_test_store();
        assert!(test.store.create_container(&test.scope, "jobs").unwrap());
        assert!(!test.store.create_container(&test.scope, "jobs").unwrap());
        assert!(test.store.container_exists(&test.scope, "jobs").unwrap());
        assert_eq!(
            test.store.list_containers(&test.scope).unwrap(),
            vec!["jobs".to_string()]
        );
    }

    #[test]
    fn containers_are_isolated_by_scope() {
        let test = create_test_store();
        let other = Scope::new("otherdb").unwrap();
        test.store.create_container(&test.scope, "jobs").unwrap();

        assert!(!test.store.container_exists(&other, "jobs").unwrap());
        let err = test
            .store
            .insert(&other, "jobs", &doc(json!({"_id": "a"})))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn rejects_unsafe_container_names() {
        let test = create_test_store();
        let err = test
            .store
            .create_container(&test.scope, "jobs\" ; DROP TABLE x")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn insert_find_and_delete_documents() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "jobs").unwrap();

        store
            .insert(scope, "jobs", &doc(json!({"_id": "1", "name": "build", "n": 1})))
            .unwrap();
        store
            .insert(scope, "jobs", &doc(json!({"_id": "2", "name": "test", "n": 2})))
            .unwrap();
        store
            .insert(scope, "jobs", &doc(json!({"_id": "3", "name": "build", "n": 3})))
            .unwrap();

        let builds = store
            .find(scope, "jobs", &Filter::new().eq("name", "build"), FindOptions::default())
            .unwrap();
        let ids: Vec<_> = builds.iter().map(|d| d.body["_id"].clone()).collect();
        assert_eq!(ids, vec![json!("1"), json!("3")]);
        assert!(builds[0].seq < builds[1].seq);

        let above_one = store
            .find(scope, "jobs", &Filter::new().gt("n", 1), FindOptions::default())
            .unwrap();
        assert_eq!(above_one.len(), 2);

        assert_eq!(store.delete(scope, "jobs", &Filter::by_id("2")).unwrap(), 1);
        assert_eq!(store.delete(scope, "jobs", &Filter::by_id("2")).unwrap(), 0);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let test = create_test_store();
        test.store.create_container(&test.scope, "jobs").unwrap();
        let document = doc(json!({"_id": "same"}));
        test.store.insert(&test.scope, "jobs", &document).unwrap();

        let err = test.store.insert(&test.scope, "jobs", &document).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn find_pages_by_sequence() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "jobs").unwrap();
        for i in 0..5 {
            store
                .insert(scope, "jobs", &doc(json!({"_id": i.to_string()})))
                .unwrap();
        }

        let first = store
            .find(
                scope,
                "jobs",
                &Filter::new(),
                FindOptions {
                    after_seq: None,
                    limit: Some(2),
                },
            )
            .unwrap();
        assert_eq!(first.len(), 2);
        let rest = store
            .find(
                scope,
                "jobs",
                &Filter::new(),
                FindOptions {
                    after_seq: Some(first[1].seq),
                    limit: None,
                },
            )
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].body["_id"], json!("2"));
    }

    #[test]
    fn filters_match_typed_json_values() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "things").unwrap();
        store
            .insert(scope, "things", &doc(json!({"_id": "a", "flag": false, "result": null})))
            .unwrap();
        store
            .insert(
                scope,
                "things",
                &doc(json!({"_id": "b", "flag": true, "result": {"code": 0}})),
            )
            .unwrap();

        let find = |filter: Filter| {
            store
                .find(scope, "things", &filter, FindOptions::default())
                .unwrap()
                .into_iter()
                .map(|d| d.body["_id"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(find(Filter::new().eq("flag", false)), vec!["a"]);
        assert_eq!(find(Filter::new().eq("result", JsonValue::Null)), vec!["a"]);
        assert_eq!(find(Filter::new().eq("result", json!({"code": 0}))), vec!["b"]);
    }

    #[test]
    fn equality_never_matches_across_json_types() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "things").unwrap();
        for (id, result) in [
            ("bool", json!(true)),
            ("int", json!(1)),
            ("object", json!({"code": 0})),
            ("text", json!("{\"code\":0}")),
            ("array", json!([1, 2])),
        ] {
            store
                .insert(scope, "things", &doc(json!({"_id": id, "result": result})))
                .unwrap();
        }

        let find = |value: JsonValue| {
            store
                .find(scope, "things", &Filter::new().eq("result", value), FindOptions::default())
                .unwrap()
                .into_iter()
                .map(|d| d.body["_id"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(find(json!(true)), vec!["bool"]);
        assert_eq!(find(json!(1)), vec!["int"]);
        assert_eq!(find(json!({"code": 0})), vec!["object"]);
        assert_eq!(find(json!("{\"code\":0}")), vec!["text"]);
        assert_eq!(find(json!([1, 2])), vec!["array"]);
        assert_eq!(find(json!("[1,2]")), Vec::<String>::new());
        assert_eq!(find(json!(false)), Vec::<String>::new());
    }

    #[test]
    fn greater_than_only_compares_like_types() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "things").unwrap();
        store
            .insert(scope, "things", &doc(json!({"_id": "num", "n": 5})))
            .unwrap();
        store
            .insert(scope, "things", &doc(json!({"_id": "text", "n": "5"})))
            .unwrap();

        let above = store
            .find(scope, "things", &Filter::new().gt("n", 1), FindOptions::default())
            .unwrap();
        assert_eq!(above.len(), 1);
        assert_eq!(above[0].body["_id"], json!("num"));

        let err = store
            .find(scope, "things", &Filter::new().gt("n", true), FindOptions::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn update_sets_fields_and_reports_matches() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "jobs").unwrap();
        store
            .insert(scope, "jobs", &doc(json!({"_id": "1", "result": null})))
            .unwrap();

        let matched = store
            .update(scope, "jobs", &Filter::by_id("1"), &doc(json!({"result": {"ok": true}})))
            .unwrap();
        assert_eq!(matched, 1);
        let found = store
            .find(scope, "jobs", &Filter::by_id("1"), FindOptions::default())
            .unwrap();
        assert_eq!(found[0].body["result"], json!({"ok": true}));

        let matched = store
            .update(scope, "jobs", &Filter::by_id("nope"), &doc(json!({"result": 1})))
            .unwrap();
        assert_eq!(matched, 0);

        let err = store
            .update(scope, "jobs", &Filter::by_id("1"), &doc(json!({"_id": "2"})))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn replace_one_replaces_whole_document() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "crons").unwrap();
        let by_name = Filter::new().eq("name", "nightly");

        let outcome = store
            .replace_one(scope, "crons", &by_name, &doc(json!({"_id": "c1", "name": "nightly", "a": 1})), true)
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome::Inserted);

        let outcome = store
            .replace_one(scope, "crons", &by_name, &doc(json!({"_id": "c2", "name": "nightly", "b": 2})), true)
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome::Replaced);

        let found = store
            .find(scope, "crons", &by_name, FindOptions::default())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].body, doc(json!({"_id": "c1", "name": "nightly", "b": 2})));

        let outcome = store
            .replace_one(scope, "crons", &Filter::new().eq("name", "other"), &doc(json!({"_id": "c3"})), false)
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome::NotMatched);
    }

    #[test]
    fn create_index_is_idempotent_and_listed() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "jobs").unwrap();
        let spec = IndexSpec::ascending("expiry_time").expire_after(Duration::ZERO);

        assert!(store.create_index(scope, "jobs", &spec).unwrap());
        assert!(!store.create_index(scope, "jobs", &spec).unwrap());
        assert_eq!(store.list_indexes(scope, "jobs").unwrap(), vec![spec]);
    }

    #[test]
    fn conflicting_index_is_rejected() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "jobs").unwrap();
        store
            .create_index(
                scope,
                "jobs",
                &IndexSpec::ascending("expiry_time").expire_after(Duration::from_secs(3600)),
            )
            .unwrap();

        let err = store
            .create_index(
                scope,
                "jobs",
                &IndexSpec::ascending("expiry_time").expire_after(Duration::ZERO),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaConflict { .. }));
        assert_eq!(store.list_indexes(scope, "jobs").unwrap().len(), 1);
    }

    #[test]
    fn create_index_on_missing_container_is_not_found() {
        let test = create_test_store();
        let err = test
            .store
            .create_index(&test.scope, "jobs", &IndexSpec::ascending("name"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn unique_index_is_enforced() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "crons").unwrap();
        store
            .create_index(scope, "crons", &IndexSpec::ascending("name").unique())
            .unwrap();
        store
            .insert(scope, "crons", &doc(json!({"_id": "1", "name": "x"})))
            .unwrap();

        let err = store
            .insert(scope, "crons", &doc(json!({"_id": "2", "name": "x"})))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn reap_removes_only_expired_documents() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "jobs").unwrap();
        store
            .create_index(
                scope,
                "jobs",
                &IndexSpec::ascending("expiry_time").expire_after(Duration::ZERO),
            )
            .unwrap();

        let now = Utc::now();
        let past = (now - ChronoDuration::seconds(1)).timestamp_millis();
        let future = (now + ChronoDuration::seconds(60)).timestamp_millis();
        store
            .insert(scope, "jobs", &doc(json!({"_id": "old", "expiry_time": past})))
            .unwrap();
        store
            .insert(scope, "jobs", &doc(json!({"_id": "new", "expiry_time": future})))
            .unwrap();
        store
            .insert(scope, "jobs", &doc(json!({"_id": "odd", "expiry_time": "yesterday"})))
            .unwrap();
        store.insert(scope, "jobs", &doc(json!({"_id": "none"}))).unwrap();

        assert_eq!(store.reap_expired(now).unwrap(), 1);
        let left: Vec<_> = store
            .find(scope, "jobs", &Filter::new(), FindOptions::default())
            .unwrap()
            .into_iter()
            .map(|d| d.body["_id"].clone())
            .collect();
        assert_eq!(left, vec![json!("new"), json!("odd"), json!("none")]);
    }

    #[test]
    fn reap_honours_grace_period() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "sessions").unwrap();
        store
            .create_index(
                scope,
                "sessions",
                &IndexSpec::ascending("seen").expire_after(Duration::from_secs(60)),
            )
            .unwrap();
        let now = Utc::now();
        let seen = (now - ChronoDuration::seconds(30)).timestamp_millis();
        store
            .insert(scope, "sessions", &doc(json!({"_id": "s", "seen": seen})))
            .unwrap();

        assert_eq!(store.reap_expired(now).unwrap(), 0);
        assert_eq!(
            store.reap_expired(now + ChronoDuration::seconds(31)).unwrap(),
            1
        );
    }

    #[test]
    fn principals_are_created_once_with_roles() {
        let test = create_test_store();
        let admin = Scope::admin();
        let digest = SecretHasher::Argon2
            .digest(&Secret::new("pw"), HashCost::minimal())
            .unwrap();
        let roles = vec![
            RoleBinding::new(Role::ReadWriteAnyDatabase, Scope::admin()),
            RoleBinding::new(Role::Read, Scope::new("local").unwrap()),
        ];

        assert!(test.store.create_principal(&admin, "root", &digest, &roles).unwrap());
        assert!(!test.store.create_principal(&admin, "root", &digest, &[]).unwrap());

        let record = test.store.get_principal(&admin, "root").unwrap().unwrap();
        assert_eq!(record.roles, roles);
        assert!(test.store.get_principal(&test.scope, "root").unwrap().is_none());

        let stored = test.store.principal_digest(&admin, "root").unwrap().unwrap();
        assert!(stored.matches(&Secret::new("pw")).unwrap());
        assert_eq!(test.store.list_principals(&admin).unwrap(), vec![record]);
    }

    #[test]
    fn reopening_keeps_catalog_and_documents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");
        let scope = Scope::new("testdb").unwrap();
        {
            let store = SqliteDataStore::open(&path, StoreOptions::default()).unwrap();
            store.create_container(&scope, "jobs").unwrap();
            store
                .create_index(&scope, "jobs", &IndexSpec::ascending("name"))
                .unwrap();
            store
                .insert(&scope, "jobs", &doc(json!({"_id": "1", "name": "a"})))
                .unwrap();
        }

        let store = SqliteDataStore::open(&path, StoreOptions::default()).unwrap();
        assert!(store.container_exists(&scope, "jobs").unwrap());
        assert_eq!(store.list_indexes(&scope, "jobs").unwrap().len(), 1);
        assert_eq!(
            store
                .find(&scope, "jobs", &Filter::new(), FindOptions::default())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn concurrent_handles_merge_identical_schema_changes() {
        use std::sync::Barrier;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");
        let scope = Scope::new("testdb").unwrap();
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (path, scope, barrier) = (path.clone(), scope.clone(), barrier.clone());
                std::thread::spawn(move || -> StoreResult<(bool, bool)> {
                    barrier.wait();
                    let store = SqliteDataStore::open(&path, StoreOptions::default())?;
                    let created_container = store.create_container(&scope, "jobs")?;
                    let created_index = store.create_index(
                        &scope,
                        "jobs",
                        &IndexSpec::ascending("expiry_time").expire_after(Duration::ZERO),
                    )?;
                    Ok((created_container, created_index))
                })
            })
            .collect();
        let outcomes: Vec<(bool, bool)> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();

        assert_eq!(outcomes.iter().filter(|(container, _)| *container).count(), 1);
        assert_eq!(outcomes.iter().filter(|(_, index)| *index).count(), 1);
        let store = SqliteDataStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.list_containers(&scope).unwrap(), vec!["jobs"]);
        assert_eq!(store.list_indexes(&scope, "jobs").unwrap().len(), 1);
    }

    #[test]
    fn sub_second_ttl_index_is_rejected() {
        let test = create_test_store();
        let (store, scope) = (&test.store, &test.scope);
        store.create_container(scope, "jobs").unwrap();

        let err = store
            .create_index(
                scope,
                "jobs",
                &IndexSpec::ascending("expiry_time").expire_after(Duration::from_millis(500)),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(store.list_indexes(scope, "jobs").unwrap().is_empty());
    }

    #[test]
    fn locked_database_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");
        let scope = Scope::new("testdb").unwrap();
        let options = StoreOptions {
            timeout: Duration::from_millis(50),
        };
        let store = SqliteDataStore::open(&path, options).unwrap();
        store.create_container(&scope, "jobs").unwrap();

        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let err = store
            .insert(&scope, "jobs", &doc(json!({"_id": "1"})))
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout));
        assert!(err.is_retryable());

        blocker.execute_batch("ROLLBACK;").unwrap();
        store
            .insert(&scope, "jobs", &doc(json!({"_id": "1"})))
            .unwrap();
    }
}
