// Tenant onboarding and offboarding on top of the schema provisioner

pub mod context;
pub mod error;
pub mod service;

pub use context::TenantContext;
pub use error::{Result, TenantError};
pub use service::TenantService;
