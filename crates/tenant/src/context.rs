// Tenant context handed back to the onboarding caller

use medrec_models::TenantId;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub name: Option<String>,
    /// Highest applied migration version
    pub schema_version: Option<i64>,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, schema_version: Option<i64>) -> Self {
        Self {
            tenant_id,
            name: None,
            schema_version,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn namespace(&self) -> String {
        self.tenant_id.namespace()
    }
}
