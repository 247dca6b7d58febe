use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of a tenant's `schema_migrations` ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    /// SHA-256 of the script body, hex encoded
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// One column of one relation inside a tenant namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ColumnShape {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: String,
    pub ordinal_position: i32,
}
