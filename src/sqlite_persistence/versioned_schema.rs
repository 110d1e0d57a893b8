use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection, TransactionBehavior};

pub const DEFAULT_TIMESTAMP: &str = "(cast(strftime('%s','now') as int))";

/// Offset applied to `PRAGMA user_version` so that a foreign SQLite file (version 0)
/// is never mistaken for one of ours.
pub const BASE_DB_VERSION: usize = 77000;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // Only mutated when optional field assignments are passed
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
                foreign_key: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
        }
    }

    fn parse(declared: &str) -> Option<&'static SqlType> {
        match declared {
            "TEXT" => Some(&SqlType::Text),
            "INTEGER" => Some(&SqlType::Integer),
            _ => None,
        }
    }
}

pub struct ForeignKey {
    pub foreign_table: &'static str,
    pub foreign_column: &'static str,
    /// Rows referencing a deleted parent are deleted too.
    pub cascade_on_delete: bool,
}

pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<&'static str>,
    pub foreign_key: Option<&'static ForeignKey>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indices: &'static [(&'static str, &'static str)],
    pub unique_constraints: &'static [&'static [&'static str]],
}

impl Table {
    fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut def = format!("{} {}", column.name, column.sql_type.as_sql());
                if column.is_primary_key {
                    def.push_str(" PRIMARY KEY");
                }
                if column.non_null {
                    def.push_str(" NOT NULL");
                }
                if let Some(default_value) = column.default_value {
                    def.push_str(&format!(" DEFAULT {}", default_value));
                }
                if let Some(fk) = column.foreign_key {
                    def.push_str(&format!(
                        " REFERENCES {}({}) ON DELETE {}",
                        fk.foreign_table,
                        fk.foreign_column,
                        if fk.cascade_on_delete {
                            "CASCADE"
                        } else {
                            "NO ACTION"
                        }
                    ));
                }
                def
            })
            .collect();
        for unique_constraint in self.unique_constraints {
            parts.push(format!("UNIQUE ({})", unique_constraint.join(", ")));
        }
        format!("CREATE TABLE {} ({});", self.name, parts.join(", "))
    }

    pub fn create(&self, conn: &Connection) -> StoreResult<()> {
        conn.execute(&self.create_sql(), params![])?;
        for (index_name, columns) in self.indices {
            conn.execute(
                &format!("CREATE INDEX {} ON {}({});", index_name, self.name, columns),
                params![],
            )?;
        }
        Ok(())
    }

    fn validate(&self, conn: &Connection) -> StoreResult<()> {
        let mismatch = |detail: String| -> StoreResult<()> {
            Err(StoreError::IncompatibleCatalog(format!(
                "table {}: {}",
                self.name, detail
            )))
        };

        struct ActualColumn {
            name: String,
            sql_type: String,
            non_null: bool,
            is_primary_key: bool,
        }

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual: Vec<ActualColumn> = stmt
            .query_map([], |row| {
                Ok(ActualColumn {
                    name: row.get(1)?,
                    sql_type: row.get(2)?,
                    non_null: row.get::<_, i32>(3)? == 1,
                    is_primary_key: row.get::<_, i32>(5)? > 0,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        if actual.len() != self.columns.len() {
            return mismatch(format!(
                "has {} columns ({}), expected {}",
                actual.len(),
                actual
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                self.columns.len()
            ));
        }

        for (actual, expected) in actual.iter().zip(self.columns) {
            if actual.name != expected.name {
                return mismatch(format!(
                    "column name mismatch: expected {}, got {}",
                    expected.name, actual.name
                ));
            }
            if SqlType::parse(&actual.sql_type) != Some(expected.sql_type) {
                return mismatch(format!(
                    "column {} type mismatch: expected {:?}, got {}",
                    expected.name, expected.sql_type, actual.sql_type
                ));
            }
            if actual.non_null != expected.non_null {
                return mismatch(format!(
                    "column {} non-null mismatch: expected {}",
                    expected.name, expected.non_null
                ));
            }
            if actual.is_primary_key != expected.is_primary_key {
                return mismatch(format!(
                    "column {} primary key mismatch: expected {}",
                    expected.name, expected.is_primary_key
                ));
            }
        }

        for (index_name, _) in self.indices {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1 AND tbl_name=?2)",
                params![index_name, self.name],
                |row| row.get(0),
            )?;
            if !exists {
                return mismatch(format!("missing index '{}'", index_name));
            }
        }

        if !self.unique_constraints.is_empty() {
            let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", self.name))?;
            let unique_indices: Vec<String> = stmt
                .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i32>(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .filter(|(_, is_unique)| *is_unique == 1)
                .map(|(name, _)| name)
                .collect();

            let mut unique_column_sets: Vec<Vec<String>> = Vec::new();
            for index_name in &unique_indices {
                let mut stmt = conn.prepare(&format!("PRAGMA index_info({})", index_name))?;
                let mut columns: Vec<String> = stmt
                    .query_map([], |row| row.get::<_, String>(2))?
                    .collect::<rusqlite::Result<_>>()?;
                columns.sort();
                unique_column_sets.push(columns);
            }

            for expected in self.unique_constraints {
                let mut expected: Vec<&str> = expected.to_vec();
                expected.sort();
                let found = unique_column_sets
                    .iter()
                    .any(|actual| actual.iter().map(String::as_str).eq(expected.iter().copied()));
                if !found {
                    return mismatch(format!(
                        "missing unique constraint on ({})",
                        expected.join(", ")
                    ));
                }
            }
        }

        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> StoreResult<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> StoreResult<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> StoreResult<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

/// Brings `conn` to the last schema of `schemas`: creates it on an empty database,
/// otherwise validates the recorded version and runs the pending migrations. The
/// version is read inside the same immediate transaction that writes the catalog,
/// so concurrent openers of a new database wait for the first one instead of
/// creating the tables twice. Returns the resulting version.
pub fn open_versioned(conn: &mut Connection, schemas: &[VersionedSchema]) -> StoreResult<usize> {
    let latest = schemas
        .last()
        .ok_or_else(|| StoreError::IncompatibleCatalog("no schema versions declared".into()))?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let raw_version: i64 = tx.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if raw_version == 0 {
        latest.create(&tx)?;
        tx.commit()?;
        return Ok(latest.version);
    }

    let db_version = raw_version - BASE_DB_VERSION as i64;
    let current = schemas
        .iter()
        .position(|s| s.version as i64 == db_version)
        .ok_or_else(|| {
            StoreError::IncompatibleCatalog(format!("unknown catalog version {}", raw_version))
        })?;
    schemas[current].validate(&tx)?;

    let mut reached = schemas[current].version;
    for schema in &schemas[current + 1..] {
        tracing::info!(
            "Migrating store catalog from version {} to {}",
            reached,
            schema.version
        );
        if let Some(migration) = schema.migration {
            migration(&tx)?;
        }
        reached = schema.version;
    }
    if reached != schemas[current].version {
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + reached),
            [],
        )?;
    }
    tx.commit()?;
    Ok(reached)
}
