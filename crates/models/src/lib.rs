// Core modules
pub mod migration;
pub mod patient;
pub mod tenant;

// Re-export commonly used types
pub use migration::{AppliedMigration, ColumnShape};
pub use patient::{Encounter, NewEncounter, NewPatient, Patient};
pub use tenant::{
    quote_ident, CreateTenant, InvalidTenantId, TenantId, NAMESPACE_PREFIX, TENANT_ID_MAX_LEN,
};
