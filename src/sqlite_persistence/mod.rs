mod versioned_schema;

pub use versioned_schema::{
    open_versioned, Column, ForeignKey, SqlType, Table, VersionedSchema, BASE_DB_VERSION,
    DEFAULT_TIMESTAMP,
};
