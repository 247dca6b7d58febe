//! Schema Provisioner
//!
//! Creates tenant namespaces, brings them up to the newest migration and
//! tears them down again. Every namespace carries a `schema_migrations`
//! ledger, so provisioning an existing tenant only applies the versions it
//! is missing.
//!
//! Namespace lifecycle:
//!
//! ```text
//! absent ──create──► provisioning ──all committed──► ready@N ──create──► ready@M (M > N)
//!   ▲                     │                             │
//!   │                     └──migration K fails──► ready@K-1
//!   └─────────────────────────────drop──────────────────┘
//! ```

use crate::context::{Interrupt, OperationContext, ScopedConnection};
use crate::error::{DatabaseError, Result};
use crate::migrations::{MigrationFile, MigrationRegistry, MigrationScript};
use medrec_models::{quote_ident, AppliedMigration, ColumnShape, TenantId, NAMESPACE_PREFIX};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection, PgPool};
use std::path::Path;

/// Ledger table created inside every tenant namespace
pub const LEDGER_TABLE: &str = "schema_migrations";

/// Configuration for the schema provisioner
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Fail when an applied migration's script no longer matches its ledger checksum
    pub verify_checksums: bool,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

/// Outcome of one provisioning run
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub tenant_id: TenantId,
    pub namespace: String,
    /// Versions applied by this run, ascending
    pub applied: Vec<i64>,
    /// Versions that were already in the ledger
    pub skipped: usize,
    /// Highest version in the ledger after the run
    pub current_version: Option<i64>,
}

/// Where a tenant namespace stands relative to a migration directory
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStatus {
    pub tenant_id: TenantId,
    pub namespace: String,
    pub exists: bool,
    pub current_version: Option<i64>,
    pub pending: Vec<i64>,
}

impl NamespaceStatus {
    pub fn is_current(&self) -> bool {
        self.exists && self.pending.is_empty()
    }
}

#[derive(Clone)]
pub struct SchemaProvisioner {
    pool: PgPool,
    config: ProvisionerConfig,
}

impl SchemaProvisioner {
    pub fn new(pool: PgPool, config: ProvisionerConfig) -> Self {
        Self { pool, config }
    }

    /// Create the tenant namespace if absent and apply every migration in
    /// `migrations_dir` that its ledger does not record yet.
    ///
    /// Each migration runs in its own transaction. On failure the run stops
    /// and the namespace stays at the last committed version.
    pub async fn create_tenant_namespace(
        &self,
        ctx: &OperationContext,
        tenant_id: &TenantId,
        migrations_dir: &Path,
    ) -> Result<ProvisionReport> {
        let registry = MigrationRegistry::scan(migrations_dir).await?;
        let interrupt = ctx.interrupt();

        let conn = interrupt
            .run("acquire connection", async {
                self.pool
                    .acquire()
                    .await
                    .map_err(|source| DatabaseError::ConnectionAcquisition { source })
            })
            .await?;
        // Closed unless the lock is released cleanly; closing the session
        // drops the advisory lock along with it
        let mut conn = ScopedConnection::new(conn, &self.pool);

        let namespace = tenant_id.namespace();
        let pid: i32 = interrupt
            .run("lock namespace", async {
                Ok(sqlx::query_scalar("SELECT pg_backend_pid()")
                    .fetch_one(&mut *conn)
                    .await?)
            })
            .await?;
        conn.set_backend_pid(pid);

        interrupt
            .run("lock namespace", async {
                sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
                    .bind(&namespace)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
            .await?;

        let result = self
            .provision_locked(&mut conn, tenant_id, &registry, &interrupt)
            .await;

        if !result.as_ref().err().is_some_and(DatabaseError::is_interrupted) {
            match sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(&namespace)
                .execute(&mut *conn)
                .await
            {
                Ok(_) => conn.mark_reusable(),
                Err(e) => tracing::warn!("Failed to unlock {}, closing connection: {}", namespace, e),
            }
        }

        result
    }

    async fn provision_locked(
        &self,
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        registry: &MigrationRegistry,
        interrupt: &Interrupt,
    ) -> Result<ProvisionReport> {
        let namespace = tenant_id.namespace();
        let quoted = tenant_id.quoted_namespace();

        interrupt
            .run("create namespace", async {
                sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted))
                    .execute(&mut *conn)
                    .await
                    .map_err(|source| DatabaseError::NamespaceCreation {
                        namespace: namespace.clone(),
                        source,
                    })?;

                sqlx::raw_sql(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {}.{} (
                        version    BIGINT PRIMARY KEY,
                        name       TEXT NOT NULL,
                        checksum   TEXT NOT NULL,
                        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    )
                    "#,
                    quoted,
                    quote_ident(LEDGER_TABLE)
                ))
                .execute(&mut *conn)
                .await
                .map_err(|source| DatabaseError::NamespaceCreation {
                    namespace: namespace.clone(),
                    source,
                })?;

                Ok(())
            })
            .await?;

        let ledger = interrupt
            .run("read migration ledger", Self::read_ledger(&mut *conn, tenant_id))
            .await?;

        // A version missing from the ledger but older than what it records
        // would run after newer migrations
        let recorded_versions: Vec<i64> = ledger.iter().map(|m| m.version).collect();
        if let Some(current) = recorded_versions.iter().copied().max() {
            let late = registry.pending(&recorded_versions).find(|m| m.version < current);
            if let Some(late) = late {
                return Err(DatabaseError::MigrationOutOfOrder {
                    tenant_id: tenant_id.to_string(),
                    version: late.version,
                    path: late.path.clone(),
                    current,
                });
            }
        }

        let mut applied = Vec::new();
        let mut skipped = 0;

        for migration in registry.migrations() {
            let script = migration.load().await?;

            if let Some(recorded) = ledger.iter().find(|m| m.version == migration.version) {
                if self.config.verify_checksums && recorded.checksum != script.checksum {
                    return Err(DatabaseError::MigrationChecksumMismatch {
                        tenant_id: tenant_id.to_string(),
                        version: migration.version,
                        path: migration.path.clone(),
                    });
                }
                skipped += 1;
                continue;
            }

            interrupt
                .run(
                    "apply migration",
                    Self::apply_migration(&mut *conn, tenant_id, migration, &script),
                )
                .await?;

            tracing::info!(
                "Applied migration {} ({}) to {}",
                migration.version,
                migration.name,
                namespace
            );
            applied.push(migration.version);
        }

        let current_version = ledger
            .iter()
            .map(|m| m.version)
            .chain(applied.iter().copied())
            .max();

        tracing::info!(
            "Provisioned {}: {} applied, {} already present, version {:?}",
            namespace,
            applied.len(),
            skipped,
            current_version
        );

        Ok(ProvisionReport {
            tenant_id: tenant_id.clone(),
            namespace,
            applied,
            skipped,
            current_version,
        })
    }

    /// Run one migration and record it in the ledger, atomically
    async fn apply_migration(
        conn: &mut PgConnection,
        tenant_id: &TenantId,
        migration: &MigrationFile,
        script: &MigrationScript,
    ) -> Result<()> {
        let failed = |source| DatabaseError::MigrationApplication {
            tenant_id: tenant_id.to_string(),
            version: migration.version,
            path: migration.path.clone(),
            source,
        };

        let mut tx = conn.begin().await.map_err(failed)?;

        // Transaction-local: the pooled connection keeps its own search_path
        sqlx::query("SELECT set_config('search_path', $1, true)")
            .bind(tenant_id.search_path())
            .execute(&mut *tx)
            .await
            .map_err(failed)?;

        sqlx::raw_sql(&script.sql)
            .execute(&mut *tx)
            .await
            .map_err(failed)?;

        sqlx::query(&format!(
            "INSERT INTO {}.{} (version, name, checksum) VALUES ($1, $2, $3)",
            tenant_id.quoted_namespace(),
            quote_ident(LEDGER_TABLE)
        ))
        .bind(migration.version)
        .bind(&migration.name)
        .bind(&script.checksum)
        .execute(&mut *tx)
        .await
        .map_err(failed)?;

        tx.commit().await.map_err(failed)
    }

    async fn read_ledger(conn: &mut PgConnection, tenant_id: &TenantId) -> Result<Vec<AppliedMigration>> {
        let ledger = sqlx::query_as::<_, AppliedMigration>(&format!(
            "SELECT version, name, checksum, applied_at FROM {}.{} ORDER BY version",
            tenant_id.quoted_namespace(),
            quote_ident(LEDGER_TABLE)
        ))
        .fetch_all(conn)
        .await?;

        Ok(ledger)
    }

    /// Irreversibly drop the tenant namespace and everything in it.
    ///
    /// Best effort: failures are logged, never returned, so cleanup paths
    /// cannot fail the operation they clean up after.
    pub async fn drop_tenant_namespace(&self, ctx: &OperationContext, tenant_id: &TenantId) {
        if let Err(e) = self.try_drop_tenant_namespace(ctx, tenant_id).await {
            tracing::error!(
                "Failed to drop namespace {}, reconcile it manually: {}",
                tenant_id.namespace(),
                e
            );
        }
    }

    /// Fallible form of [`Self::drop_tenant_namespace`]
    pub async fn try_drop_tenant_namespace(&self, ctx: &OperationContext, tenant_id: &TenantId) -> Result<()> {
        let interrupt = ctx.interrupt();
        let conn = interrupt
            .run("acquire connection", async {
                self.pool
                    .acquire()
                    .await
                    .map_err(|source| DatabaseError::ConnectionAcquisition { source })
            })
            .await?;
        let mut conn = ScopedConnection::new(conn, &self.pool);

        interrupt
            .run("drop namespace", async {
                let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
                    .fetch_one(&mut *conn)
                    .await?;
                conn.set_backend_pid(pid);

                sqlx::raw_sql(&format!(
                    "DROP SCHEMA IF EXISTS {} CASCADE",
                    tenant_id.quoted_namespace()
                ))
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
            .await?;
        conn.mark_reusable();

        tracing::info!("Dropped namespace {}", tenant_id.namespace());
        Ok(())
    }

    pub async fn namespace_exists(&self, tenant_id: &TenantId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                .bind(tenant_id.namespace())
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    /// Ledger rows of an existing namespace, ascending by version
    pub async fn applied_migrations(&self, tenant_id: &TenantId) -> Result<Vec<AppliedMigration>> {
        if !self.ledger_exists(tenant_id).await? {
            return Ok(Vec::new());
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|source| DatabaseError::ConnectionAcquisition { source })?;
        Self::read_ledger(&mut conn, tenant_id).await
    }

    async fn ledger_exists(&self, tenant_id: &TenantId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
            "#,
        )
        .bind(tenant_id.namespace())
        .bind(LEDGER_TABLE)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Compare a namespace with the migrations in `migrations_dir`
    pub async fn status(&self, tenant_id: &TenantId, migrations_dir: &Path) -> Result<NamespaceStatus> {
        let registry = MigrationRegistry::scan(migrations_dir).await?;
        let exists = self.namespace_exists(tenant_id).await?;
        let applied: Vec<i64> = if exists {
            self.applied_migrations(tenant_id)
                .await?
                .into_iter()
                .map(|m| m.version)
                .collect()
        } else {
            Vec::new()
        };

        Ok(NamespaceStatus {
            tenant_id: tenant_id.clone(),
            namespace: tenant_id.namespace(),
            exists,
            current_version: applied.iter().copied().max(),
            pending: registry.pending(&applied).map(|m| m.version).collect(),
        })
    }

    /// Every column of every relation in the namespace, in a stable order
    pub async fn namespace_structure(&self, tenant_id: &TenantId) -> Result<Vec<ColumnShape>> {
        let columns = sqlx::query_as::<_, ColumnShape>(
            r#"
            SELECT table_name::text AS table_name,
                   column_name::text AS column_name,
                   data_type::text AS data_type,
                   is_nullable::text AS is_nullable,
                   ordinal_position::int4 AS ordinal_position
            FROM information_schema.columns
            WHERE table_schema = $1
            ORDER BY table_name, ordinal_position
            "#,
        )
        .bind(tenant_id.namespace())
        .fetch_all(&self.pool)
        .await?;

        Ok(columns)
    }

    /// Tenant ids of every `tenant_*` namespace in the database
    pub async fn list_tenant_namespaces(&self) -> Result<Vec<TenantId>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT nspname::text FROM pg_namespace WHERE starts_with(nspname, $1) ORDER BY nspname",
        )
        .bind(NAMESPACE_PREFIX)
        .fetch_all(&self.pool)
        .await?;

        Ok(names
            .iter()
            .filter_map(|name| name.strip_prefix(NAMESPACE_PREFIX))
            .filter_map(|id| match TenantId::new(id) {
                Ok(tenant_id) if tenant_id.as_str() == id => Some(tenant_id),
                _ => {
                    tracing::warn!("Ignoring namespace {}{} with a non-canonical tenant id", NAMESPACE_PREFIX, id);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Provisioner over a pool that can never connect
    fn unreachable_provisioner() -> SchemaProvisioner {
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("nobody")
            .database("nowhere");
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy_with(options);
        SchemaProvisioner::new(pool, ProvisionerConfig::default())
    }

    #[test]
    fn test_config_defaults() {
        assert!(ProvisionerConfig::default().verify_checksums);
    }

    #[test]
    fn test_status_is_current() {
        let tenant_id = TenantId::new("sup_ab12").unwrap();
        let mut status = NamespaceStatus {
            namespace: tenant_id.namespace(),
            tenant_id,
            exists: true,
            current_version: Some(3),
            pending: Vec::new(),
        };
        assert!(status.is_current());

        status.pending.push(4);
        assert!(!status.is_current());

        status.pending.clear();
        status.exists = false;
        assert!(!status.is_current());
    }

    #[tokio::test]
    async fn test_drop_honours_cancellation() {
        let provisioner = unreachable_provisioner();
        let tenant_id = TenantId::new("sup_ab12").unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = provisioner
            .try_drop_tenant_namespace(&OperationContext::new().with_cancellation(token), &tenant_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Cancelled { operation: "acquire connection" }
        ));
    }
}
