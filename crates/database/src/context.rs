//! Operation-scoped handle and tenant-bound sessions.
//!
//! An [`OperationContext`] travels with one logical unit of work. While the
//! [`TenantConnectionRouter`](crate::TenantConnectionRouter) runs that work it
//! holds exactly one [`TenantSession`]: a pooled connection whose
//! `search_path` points at the tenant namespace. Repositories take
//! `&mut TenantSession`, so a repository call can only be written where a
//! session exists; [`OperationContext::session`] is the lookup for code that
//! only has the handle.

use crate::error::{DatabaseError, Result};
use medrec_models::TenantId;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline applied to every blocking step of an operation
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Interrupt {
    pub fn new(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { token, deadline }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive `fut` unless the operation is cancelled or runs past its deadline.
    ///
    /// On interruption `fut` is dropped, which abandons any in-flight
    /// statement; callers must not hand the connection it used back to the pool.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(DatabaseError::Cancelled { operation }),
            _ = deadline => Err(DatabaseError::DeadlineExceeded { operation }),
            result = fut => result,
        }
    }
}

/// Pooled connection that is closed, not recycled, unless marked reusable.
///
/// Dropping it unmarked also terminates its server backend, so a statement
/// or transaction abandoned by a dropped future is rolled back promptly and
/// releases its locks.
pub(crate) struct ScopedConnection {
    conn: PoolConnection<Postgres>,
    pool: PgPool,
    backend_pid: Option<i32>,
    reusable: bool,
}

impl ScopedConnection {
    pub(crate) fn new(conn: PoolConnection<Postgres>, pool: &PgPool) -> Self {
        Self {
            conn,
            pool: pool.clone(),
            backend_pid: None,
            reusable: false,
        }
    }

    pub(crate) fn set_backend_pid(&mut self, pid: i32) {
        self.backend_pid = Some(pid);
    }

    /// Session state is clean; hand the connection back to the pool on drop
    pub(crate) fn mark_reusable(&mut self) {
        self.reusable = true;
    }
}

impl Deref for ScopedConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.conn
    }
}

impl DerefMut for ScopedConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if self.reusable {
            return;
        }
        self.conn.close_on_drop();

        let (Some(pid), Ok(runtime)) = (self.backend_pid, Handle::try_current()) else {
            return;
        };
        let pool = self.pool.clone();
        runtime.spawn(async move {
            // An idle backend has nothing to roll back and is already closing
            if let Err(e) = sqlx::query(
                r#"
                SELECT pg_terminate_backend(pid) FROM pg_stat_activity
                WHERE pid = $1 AND state <> 'idle' AND pid <> pg_backend_pid()
                "#,
            )
            .bind(pid)
            .execute(&pool)
            .await
            {
                tracing::warn!("Failed to terminate abandoned backend {}: {}", pid, e);
            }
        });
    }
}

/// One pooled connection pinned to one tenant namespace
pub struct TenantSession {
    tenant_id: TenantId,
    conn: ScopedConnection,
}

impl std::fmt::Debug for TenantSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSession")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl TenantSession {
    pub(crate) fn new(tenant_id: TenantId, conn: ScopedConnection) -> Self {
        Self { tenant_id, conn }
    }

    pub(crate) fn scoped_connection(&mut self) -> &mut ScopedConnection {
        &mut self.conn
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn namespace(&self) -> String {
        self.tenant_id.namespace()
    }

    /// The bound connection; unqualified names resolve inside the tenant namespace
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    /// Start a transaction on the bound connection
    pub async fn begin(&mut self) -> Result<Transaction<'_, Postgres>> {
        Ok(Connection::begin(&mut *self.conn).await?)
    }
}

/// Handle for one logical operation
#[derive(Debug, Default)]
pub struct OperationContext {
    interrupt: Interrupt,
    session: Option<TenantSession>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort blocking steps once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.interrupt.token = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.interrupt.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.interrupt.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.interrupt.deadline
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Tenant the operation is currently scoped to, if any
    pub fn bound_tenant(&self) -> Option<&TenantId> {
        self.session.as_ref().map(TenantSession::tenant_id)
    }

    /// The session bound by the enclosing `with_tenant_connection` call.
    ///
    /// Fails with [`DatabaseError::MissingTenantContext`] outside a scope
    /// instead of falling back to an unscoped connection.
    pub fn session(&mut self) -> Result<&mut TenantSession> {
        self.session
            .as_mut()
            .ok_or(DatabaseError::MissingTenantContext)
    }

    pub(crate) fn bind(&mut self, session: TenantSession) {
        debug_assert!(self.session.is_none(), "operation already bound");
        self.session = Some(session);
    }

    pub(crate) fn unbind(&mut self) -> Option<TenantSession> {
        self.session.take()
    }
}

/// Keeps a session bound for the lifetime of one router scope.
///
/// If the scope's future is dropped before it releases the session, the
/// guard unbinds it on drop, so the context never outlives its scope holding
/// a connection and the abandoned connection is closed.
pub(crate) struct BoundScope<'a> {
    ctx: &'a mut OperationContext,
}

impl<'a> BoundScope<'a> {
    pub(crate) fn bind(ctx: &'a mut OperationContext, session: TenantSession) -> Self {
        ctx.bind(session);
        Self { ctx }
    }

    pub(crate) fn context(&mut self) -> &mut OperationContext {
        self.ctx
    }

    /// End the scope normally, handing the session back for release
    pub(crate) fn finish(mut self) -> Option<TenantSession> {
        self.ctx.unbind()
    }
}

impl Drop for BoundScope<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.ctx.unbind() {
            tracing::debug!(
                "Scope for tenant {} ended without release, closing its connection",
                session.tenant_id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_outside_scope_is_missing_context() {
        let mut ctx = OperationContext::new();
        assert!(ctx.bound_tenant().is_none());
        assert!(matches!(
            ctx.session(),
            Err(DatabaseError::MissingTenantContext)
        ));
    }

    #[tokio::test]
    async fn test_interrupt_passes_result_through() {
        let interrupt = Interrupt::default();
        let value = interrupt.run("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_interrupt_cancelled_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let interrupt = Interrupt::new(token, None);

        let err = interrupt
            .run("acquire connection", async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Cancelled { operation: "acquire connection" }
        ));
    }

    #[tokio::test]
    async fn test_interrupt_deadline() {
        let ctx = OperationContext::new().with_timeout(Duration::from_millis(50));
        let err = ctx
            .interrupt()
            .run("slow statement", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::DeadlineExceeded { .. }));
    }
}
