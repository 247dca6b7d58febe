pub mod connection;
pub mod context;
pub mod error;
pub mod migrations;
pub mod provisioner;
pub mod repositories;
pub mod tenant_router;

pub use connection::{Database, DatabaseConfig};
pub use context::{Interrupt, OperationContext, TenantSession};
pub use error::{DatabaseError, Result};
pub use migrations::{MigrationFile, MigrationRegistry, MigrationScript};
pub use provisioner::{
    NamespaceStatus, ProvisionReport, ProvisionerConfig, SchemaProvisioner, LEDGER_TABLE,
};
pub use repositories::{encounters::EncounterRepository, patients::PatientRepository};
pub use tenant_router::{RouterConfig, TenantConnectionRouter, TenantRouterStats};
