// Directory tree resolution
use crate::context::{normalize_path, segments};
use crate::db::ROOT_DIRECTORY_ID;
use crate::error::CaskResult;
use async_trait::async_trait;
use sqlx::SqliteConnection;

/// Resolves directory paths to catalog ids.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Return the id of `dir_path`, creating any missing ancestors inside
    /// the caller's transaction.
    async fn ensure_path(&self, conn: &mut SqliteConnection, dir_path: &str) -> CaskResult<i64>;
}

/// Directory chain stored in the catalog's `directories` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlDirectories;

#[async_trait]
impl DirectoryService for SqlDirectories {
    async fn ensure_path(&self, conn: &mut SqliteConnection, dir_path: &str) -> CaskResult<i64> {
        let mut parent = ROOT_DIRECTORY_ID;
        let mut current = String::new();

        for name in segments(&normalize_path(dir_path)) {
            current.push('/');
            current.push_str(name);

            // Concurrent writers may race to create the same directory
            sqlx::query("INSERT OR IGNORE INTO directories (parent_id, name, path) VALUES (?, ?, ?)")
                .bind(parent)
                .bind(name)
                .bind(&current)
                .execute(&mut *conn)
                .await?;

            parent = sqlx::query_scalar("SELECT id FROM directories WHERE path = ?")
                .bind(&current)
                .fetch_one(&mut *conn)
                .await?;
        }

        Ok(parent)
    }
}
