use crate::context::TenantContext;
use crate::error::Result;
use medrec_database::{
    NamespaceStatus, OperationContext, ProvisionReport, SchemaProvisioner, TenantConnectionRouter,
};
use medrec_models::{CreateTenant, TenantId};
use std::path::{Path, PathBuf};
use validator::Validate;

/// Length of the random suffix appended to a tenant prefix
const SUFFIX_LEN: usize = 8;

/// Tenant lifecycle: onboarding, upgrades and offboarding
#[derive(Clone)]
pub struct TenantService {
    provisioner: SchemaProvisioner,
    router: TenantConnectionRouter,
    migrations_dir: PathBuf,
}

impl TenantService {
    pub fn new(
        provisioner: SchemaProvisioner,
        router: TenantConnectionRouter,
        migrations_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provisioner,
            router,
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Router for tenant-scoped work once a tenant is onboarded
    pub fn router(&self) -> &TenantConnectionRouter {
        &self.router
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Onboard a new tenant under a freshly generated id.
    ///
    /// The random suffix keeps ids globally unique, so no two onboarding
    /// calls ever provision the same namespace.
    pub async fn onboard(&self, ctx: &OperationContext, request: &CreateTenant) -> Result<TenantContext> {
        request.validate()?;

        let tenant_id = generate_tenant_id(&request.prefix)?;
        let report = self
            .provisioner
            .create_tenant_namespace(ctx, &tenant_id, &self.migrations_dir)
            .await?;

        tracing::info!(
            "Onboarded tenant {} ({}) at version {:?}",
            request.name,
            tenant_id,
            report.current_version
        );

        Ok(TenantContext::new(tenant_id, report.current_version).with_name(request.name.clone()))
    }

    /// Apply migrations added since the tenant was last provisioned
    pub async fn upgrade(&self, ctx: &OperationContext, tenant_id: &TenantId) -> Result<ProvisionReport> {
        Ok(self
            .provisioner
            .create_tenant_namespace(ctx, tenant_id, &self.migrations_dir)
            .await?)
    }

    pub async fn status(&self, tenant_id: &TenantId) -> Result<NamespaceStatus> {
        Ok(self.provisioner.status(tenant_id, &self.migrations_dir).await?)
    }

    /// Remove the tenant and all of its data. Failures are logged only.
    pub async fn offboard(&self, ctx: &OperationContext, tenant_id: &TenantId) {
        tracing::info!("Offboarding tenant {}", tenant_id);
        self.provisioner.drop_tenant_namespace(ctx, tenant_id).await;
    }
}

/// `<prefix>_<8 hex chars>`
pub fn generate_tenant_id(prefix: &str) -> Result<TenantId> {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Ok(TenantId::new(&format!("{}_{}", prefix, &suffix[..SUFFIX_LEN]))?)
}
