use thiserror::Error;

pub type Result<T> = std::result::Result<T, TenantError>;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid tenant identifier: {0}")]
    InvalidTenantId(#[from] medrec_models::InvalidTenantId),

    #[error("Database error: {0}")]
    Database(#[from] medrec_database::DatabaseError),
}
