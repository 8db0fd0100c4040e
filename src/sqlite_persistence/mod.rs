mod versioned_schema;

pub use versioned_schema::{
    read_schema_version, Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, UniqueIndex,
    VersionedSchema, BASE_DB_VERSION,
};
