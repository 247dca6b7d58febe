//! Tenant Connection Router
//!
//! Runs a unit of work on one pooled connection whose `search_path` is
//! pinned to the tenant namespace:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  TenantConnectionRouter                          │
//! │                                                                  │
//! │   acquire ──► set search_path ──► bind ──► work(ctx) ──► release │
//! │      │        "tenant_<id>",       into        │          RESET  │
//! │      │         public              ctx         │        or close │
//! │  ┌───┴──────────────────────────────────────┐  │                 │
//! │  │  Shared PgPool (all tenants)             │  ▼                 │
//! │  └──────────────────────────────────────────┘ repositories use   │
//! │                                               ctx.session()       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `search_path` is session state, so it is only ever set on the one
//! borrowed connection and is reset before that connection goes back to the
//! pool. A connection whose work was cancelled, or whose scope was dropped
//! before release, is closed instead.

use crate::context::{BoundScope, Interrupt, OperationContext, ScopedConnection, TenantSession};
use crate::error::{DatabaseError, Result};
use futures::future::BoxFuture;
use medrec_models::TenantId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Configuration for the tenant router
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Refuse to bind to a namespace that does not exist. Without this check
    /// unqualified names would silently fall through to `public`.
    pub verify_namespace: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            verify_namespace: true,
        }
    }
}

/// Tenant Connection Router
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct TenantConnectionRouter {
    pool: PgPool,
    config: RouterConfig,
}

impl TenantConnectionRouter {
    pub fn new(pool: PgPool, config: RouterConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `work` with `ctx` bound to a connection scoped to `tenant_id`.
    ///
    /// Every call to [`OperationContext::session`] inside `work` returns the
    /// same physical connection. If `ctx` is already bound to this tenant
    /// the existing connection is reused; binding it to a second tenant is
    /// an error. The connection is released whether `work` succeeds or not,
    /// and `ctx` is unbound even if this future is dropped part way through.
    pub async fn with_tenant_connection<T, F>(
        &self,
        ctx: &mut OperationContext,
        tenant_id: &TenantId,
        work: F,
    ) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut OperationContext) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let interrupt = ctx.interrupt();

        if let Some(bound) = ctx.bound_tenant() {
            if bound != tenant_id {
                return Err(DatabaseError::TenantContextConflict {
                    bound: bound.to_string(),
                    requested: tenant_id.to_string(),
                });
            }
            tracing::trace!("Reusing bound connection for tenant {}", tenant_id);
            return interrupt.run("tenant work", work(ctx)).await;
        }

        let conn = interrupt
            .run("acquire connection", async {
                self.pool
                    .acquire()
                    .await
                    .map_err(|source| DatabaseError::ConnectionAcquisition { source })
            })
            .await?;
        let mut session = TenantSession::new(tenant_id.clone(), ScopedConnection::new(conn, &self.pool));
        self.bind_namespace(&mut session, &interrupt).await?;

        let mut scope = BoundScope::bind(ctx, session);
        let result = interrupt.run("tenant work", work(scope.context())).await;

        if let Some(session) = scope.finish() {
            let interrupted = result
                .as_ref()
                .err()
                .is_some_and(DatabaseError::is_interrupted);
            self.release(session, interrupted).await;
        }

        result
    }

    /// Pin the session's `search_path` to the tenant namespace
    async fn bind_namespace(&self, session: &mut TenantSession, interrupt: &Interrupt) -> Result<()> {
        let tenant_id = session.tenant_id().clone();
        let namespace = tenant_id.namespace();
        let binding = |source| DatabaseError::NamespaceBinding {
            tenant_id: tenant_id.to_string(),
            source,
        };
        let conn = session.scoped_connection();

        interrupt
            .run("bind tenant namespace", async {
                if self.config.verify_namespace {
                    let exists: bool = sqlx::query_scalar(
                        "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)",
                    )
                    .bind(&namespace)
                    .fetch_one(&mut **conn)
                    .await
                    .map_err(binding)?;

                    if !exists {
                        // Nothing was set on the connection yet
                        conn.mark_reusable();
                        return Err(DatabaseError::UnknownNamespace {
                            namespace: namespace.clone(),
                        });
                    }
                }

                // Session level (is_local = false): outlives any transaction the work opens
                let (_, pid): (String, i32) =
                    sqlx::query_as("SELECT set_config('search_path', $1, false), pg_backend_pid()")
                        .bind(tenant_id.search_path())
                        .fetch_one(&mut **conn)
                        .await
                        .map_err(binding)?;
                conn.set_backend_pid(pid);

                Ok(())
            })
            .await?;

        tracing::debug!("Bound connection to {}", namespace);
        Ok(())
    }

    /// Reset the session and let its connection return to the pool. An
    /// interrupted session, or one that cannot be reset, is closed instead.
    async fn release(&self, mut session: TenantSession, interrupted: bool) {
        if interrupted {
            tracing::debug!("Closing connection abandoned by an interrupted operation");
            return;
        }

        match sqlx::query("RESET search_path")
            .execute(session.connection())
            .await
        {
            Ok(_) => session.scoped_connection().mark_reusable(),
            Err(e) => tracing::warn!("Failed to reset search_path, closing connection: {}", e),
        }
    }

    /// Get router statistics
    pub fn stats(&self) -> TenantRouterStats {
        TenantRouterStats {
            pool_size: self.pool.size(),
            idle_connections: self.pool.num_idle(),
            max_connections: self.pool.options().get_max_connections(),
        }
    }
}

/// Router statistics
#[derive(Debug, Clone, Serialize)]
pub struct TenantRouterStats {
    pub pool_size: u32,
    pub idle_connections: usize,
    pub max_connections: u32,
}
