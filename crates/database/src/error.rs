use medrec_models::InvalidTenantId;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    InvalidTenantIdentifier(#[from] InvalidTenantId),

    #[error("Failed to acquire database connection: {source}")]
    ConnectionAcquisition {
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to create namespace {namespace}: {source}")]
    NamespaceCreation {
        namespace: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration {version} ({}) failed for tenant {tenant_id}: {source}", path.display())]
    MigrationApplication {
        tenant_id: String,
        version: i64,
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration {version} ({}) changed after it was applied to tenant {tenant_id}", path.display())]
    MigrationChecksumMismatch {
        tenant_id: String,
        version: i64,
        path: PathBuf,
    },

    #[error(
        "Migration {version} ({}) is older than version {current} already applied to tenant {tenant_id}",
        path.display()
    )]
    MigrationOutOfOrder {
        tenant_id: String,
        version: i64,
        path: PathBuf,
        current: i64,
    },

    #[error("Cannot read migrations from {}: {source}", path.display())]
    MigrationDiscovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Duplicate migration version {version}: {} and {}", first.display(), second.display())]
    DuplicateMigrationVersion {
        version: i64,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Failed to bind connection to tenant {tenant_id}: {source}")]
    NamespaceBinding {
        tenant_id: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Namespace {namespace} does not exist")]
    UnknownNamespace { namespace: String },

    #[error("No tenant-scoped connection is bound to this operation")]
    MissingTenantContext,

    #[error("Operation is bound to tenant {bound}, cannot scope it to tenant {requested}")]
    TenantContextConflict { bound: String, requested: String },

    #[error("Operation cancelled during {operation}")]
    Cancelled { operation: &'static str },

    #[error("Deadline exceeded during {operation}")]
    DeadlineExceeded { operation: &'static str },

    #[error("Database error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl DatabaseError {
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{} with id {} not found", entity, id))
    }

    /// Failed because the caller gave up, not because the database did
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_names_version_and_path() {
        let err = DatabaseError::MigrationApplication {
            tenant_id: "sup_ab12".to_string(),
            version: 3,
            path: PathBuf::from("migrations/tenant/0003_add_indexes.sql"),
            source: sqlx::Error::RowNotFound,
        };
        let message = err.to_string();
        assert!(message.contains("Migration 3"));
        assert!(message.contains("0003_add_indexes.sql"));
        assert!(message.contains("sup_ab12"));
    }

    #[test]
    fn test_out_of_order_error_names_version_path_and_current() {
        let err = DatabaseError::MigrationOutOfOrder {
            tenant_id: "sup_ab12".to_string(),
            version: 2,
            path: PathBuf::from("migrations/tenant/0002_late.sql"),
            current: 3,
        };
        let message = err.to_string();
        assert!(message.contains("Migration 2"));
        assert!(message.contains("0002_late.sql"));
        assert!(message.contains("version 3"));
    }

    #[test]
    fn test_invalid_identifier_converts() {
        let err: DatabaseError = medrec_models::TenantId::new("a;b").unwrap_err().into();
        assert!(matches!(err, DatabaseError::InvalidTenantIdentifier(_)));
    }

    #[test]
    fn test_is_interrupted() {
        assert!(DatabaseError::Cancelled { operation: "acquire" }.is_interrupted());
        assert!(DatabaseError::DeadlineExceeded { operation: "acquire" }.is_interrupted());
        assert!(!DatabaseError::MissingTenantContext.is_interrupted());
    }
}
