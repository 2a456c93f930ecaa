// Permission checks
use crate::context::{Permission, RequestContext};
use crate::error::{CaskError, CaskResult};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use std::collections::HashMap;

/// Decides whether an actor may read or write a path.
///
/// Implementations may return `Ok(false)` or raise
/// [`CaskError::AccessDenied`] themselves; [`require`] treats both as a
/// denial.
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn can_read(&self, conn: &mut SqliteConnection, ctx: &RequestContext) -> CaskResult<bool>;

    async fn can_write(&self, conn: &mut SqliteConnection, ctx: &RequestContext) -> CaskResult<bool>;
}

/// Check `permission` and turn a refusal into `AccessDenied`.
pub async fn require(
    gate: &dyn AccessGate,
    conn: &mut SqliteConnection,
    ctx: &RequestContext,
    permission: Permission,
) -> CaskResult<()> {
    let allowed = match permission {
        Permission::Read => gate.can_read(conn, ctx).await?,
        Permission::Write => gate.can_write(conn, ctx).await?,
    };
    if allowed {
        Ok(())
    } else {
        tracing::info!(
            trace_id = %ctx.trace_id,
            actor = %ctx.actor,
            path = %ctx.path,
            %permission,
            "Access denied"
        );
        Err(CaskError::AccessDenied {
            actor: ctx.actor.clone(),
            path: ctx.path.clone(),
            permission,
        })
    }
}

/// Grants everything. Used when no ACL engine is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessGate for AllowAll {
    async fn can_read(&self, _conn: &mut SqliteConnection, _ctx: &RequestContext) -> CaskResult<bool> {
        Ok(true)
    }

    async fn can_write(&self, _conn: &mut SqliteConnection, _ctx: &RequestContext) -> CaskResult<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct Grant {
    prefix: String,
    permission: Permission,
}

/// In-memory grants: actor -> (path prefix, permission).
///
/// A write grant implies read on the same prefix.
#[derive(Debug, Clone, Default)]
pub struct StaticAcl {
    grants: HashMap<String, Vec<Grant>>,
}

impl StaticAcl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, actor: &str, prefix: &str, permission: Permission) -> Self {
        self.grants.entry(actor.to_string()).or_default().push(Grant {
            prefix: crate::context::normalize_path(prefix),
            permission,
        });
        self
    }

    fn allows(&self, ctx: &RequestContext, wanted: Permission) -> bool {
        let Some(grants) = self.grants.get(&ctx.actor) else {
            return false;
        };
        grants.iter().any(|g| {
            let covers = g.prefix == "/"
                || ctx.path == g.prefix
                || ctx.path.starts_with(&format!("{}/", g.prefix));
            covers && (g.permission == wanted || g.permission == Permission::Write)
        })
    }
}

#[async_trait]
impl AccessGate for StaticAcl {
    async fn can_read(&self, _conn: &mut SqliteConnection, ctx: &RequestContext) -> CaskResult<bool> {
        Ok(self.allows(ctx, Permission::Read))
    }

    async fn can_write(&self, _conn: &mut SqliteConnection, ctx: &RequestContext) -> CaskResult<bool> {
        Ok(self.allows(ctx, Permission::Write))
    }
}
