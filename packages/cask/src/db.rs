// SQLite metadata catalog
use crate::error::{CaskError, CaskResult};
use crate::hash::DigestSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS directories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER REFERENCES directories(id),
        name TEXT NOT NULL,
        path TEXT NOT NULL UNIQUE
    )",
    "INSERT OR IGNORE INTO directories (id, parent_id, name, path) VALUES (1, NULL, '', '/')",
    "CREATE TABLE IF NOT EXISTS files (
        id TEXT PRIMARY KEY,
        directory_id INTEGER NOT NULL REFERENCES directories(id),
        filename TEXT NOT NULL,
        content_address TEXT NOT NULL,
        digests TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        mime_type TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        partition_keys TEXT NOT NULL DEFAULT '[]',
        bucket TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL,
        UNIQUE (directory_id, filename)
    )",
    "CREATE INDEX IF NOT EXISTS idx_files_content_address ON files (content_address)",
];

const FILE_COLUMNS: &str = "f.id, f.directory_id, d.path AS directory, f.filename, \
     f.content_address, f.digests, f.size_bytes, f.mime_type, f.resource_type, \
     f.partition_keys, f.bucket, f.metadata, f.created_at, f.modified_at";

/// Id of the root directory row.
pub const ROOT_DIRECTORY_ID: i64 = 1;

/// What kind of resource a file record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Rdf,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::File => "file",
            ResourceType::Rdf => "rdf",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = CaskError;

    fn from_str(s: &str) -> CaskResult<Self> {
        match s {
            "file" => Ok(ResourceType::File),
            "rdf" => Ok(ResourceType::Rdf),
            other => Err(CaskError::config(format!("unknown resource type: {}", other))),
        }
    }
}

/// A catalog row: one named file pointing at one content address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: String,
    pub directory_id: i64,
    /// Path of the containing directory (filled from the join on reads).
    pub directory: String,
    pub filename: String,
    pub content_address: String,
    pub digests: DigestSet,
    pub size_bytes: u64,
    pub mime_type: String,
    pub resource_type: ResourceType,
    pub partition_keys: Vec<String>,
    pub bucket: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl FileRecord {
    /// Full logical path of the file.
    pub fn path(&self) -> String {
        if self.directory == "/" {
            format!("/{}", self.filename)
        } else {
            format!("{}/{}", self.directory, self.filename)
        }
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: String,
    directory_id: i64,
    directory: String,
    filename: String,
    content_address: String,
    digests: String,
    size_bytes: i64,
    mime_type: String,
    resource_type: String,
    partition_keys: String,
    bucket: Option<String>,
    metadata: String,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = CaskError;

    fn try_from(row: FileRow) -> CaskResult<Self> {
        Ok(FileRecord {
            file_id: row.id,
            directory_id: row.directory_id,
            directory: row.directory,
            filename: row.filename,
            content_address: row.content_address,
            digests: serde_json::from_str(&row.digests)?,
            size_bytes: row.size_bytes.max(0) as u64,
            mime_type: row.mime_type,
            resource_type: row.resource_type.parse()?,
            partition_keys: serde_json::from_str(&row.partition_keys)?,
            bucket: row.bucket,
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: row.created_at,
            modified_at: row.modified_at,
        })
    }
}

/// Bind value for [`execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    Int(i64),
    Null,
}

/// Metadata database wrapper
///
/// Owns the pool; every query helper below takes an explicit connection
/// (a transaction or a dedicated pooled connection) so callers always
/// know which transaction a statement runs in.
#[derive(Clone)]
pub struct MetadataDb {
    pool: Pool<Sqlite>,
}

impl MetadataDb {
    /// Create or open the database at path
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> CaskResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::debug!(path = %path.display(), "Opened metadata catalog");
        Ok(db)
    }

    async fn migrate(&self) -> CaskResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Run a parameterized statement, returning the number of affected rows.
pub async fn execute(conn: &mut SqliteConnection, sql: &str, params: &[Param]) -> CaskResult<u64> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            Param::Text(s) => query.bind(s.clone()),
            Param::Int(i) => query.bind(*i),
            Param::Null => query.bind(Option::<String>::None),
        };
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

pub async fn get_file(conn: &mut SqliteConnection, file_id: &str) -> CaskResult<Option<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files f JOIN directories d ON d.id = f.directory_id WHERE f.id = ?",
        FILE_COLUMNS
    );
    let row = sqlx::query_as::<_, FileRow>(&sql)
        .bind(file_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(FileRecord::try_from).transpose()
}

/// Look a file up by directory path and filename.
pub async fn get_file_by_path(
    conn: &mut SqliteConnection,
    directory: &str,
    filename: &str,
) -> CaskResult<Option<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files f JOIN directories d ON d.id = f.directory_id \
         WHERE d.path = ? AND f.filename = ?",
        FILE_COLUMNS
    );
    let row = sqlx::query_as::<_, FileRow>(&sql)
        .bind(directory)
        .bind(filename)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(FileRecord::try_from).transpose()
}

pub async fn file_exists(
    conn: &mut SqliteConnection,
    directory: &str,
    filename: &str,
) -> CaskResult<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM files f JOIN directories d ON d.id = f.directory_id \
         WHERE d.path = ? AND f.filename = ?)",
    )
    .bind(directory)
    .bind(filename)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Insert a new record. A clash on `(directory_id, filename)` becomes
/// [`CaskError::DuplicateFile`].
pub async fn insert_file(conn: &mut SqliteConnection, record: &FileRecord) -> CaskResult<()> {
    let result = sqlx::query(
        "INSERT INTO files (id, directory_id, filename, content_address, digests, size_bytes, \
         mime_type, resource_type, partition_keys, bucket, metadata, created_at, modified_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.file_id)
    .bind(record.directory_id)
    .bind(&record.filename)
    .bind(&record.content_address)
    .bind(serde_json::to_string(&record.digests)?)
    .bind(record.size_bytes as i64)
    .bind(&record.mime_type)
    .bind(record.resource_type.as_str())
    .bind(serde_json::to_string(&record.partition_keys)?)
    .bind(&record.bucket)
    .bind(serde_json::to_string(&record.metadata)?)
    .bind(record.created_at)
    .bind(record.modified_at)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(CaskError::DuplicateFile {
                path: record.path(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Overwrite every mutable column of an existing record (used by replace).
pub async fn update_file_record(conn: &mut SqliteConnection, record: &FileRecord) -> CaskResult<()> {
    let affected = sqlx::query(
        "UPDATE files SET content_address = ?, digests = ?, size_bytes = ?, mime_type = ?, \
         resource_type = ?, partition_keys = ?, bucket = ?, metadata = ?, modified_at = ? \
         WHERE id = ?",
    )
    .bind(&record.content_address)
    .bind(serde_json::to_string(&record.digests)?)
    .bind(record.size_bytes as i64)
    .bind(&record.mime_type)
    .bind(record.resource_type.as_str())
    .bind(serde_json::to_string(&record.partition_keys)?)
    .bind(&record.bucket)
    .bind(serde_json::to_string(&record.metadata)?)
    .bind(record.modified_at)
    .bind(&record.file_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 0 {
        return Err(CaskError::missing(record.path()));
    }
    Ok(())
}

/// Replace metadata and/or partition keys of a record.
pub async fn patch_file(
    conn: &mut SqliteConnection,
    file_id: &str,
    metadata: Option<&serde_json::Value>,
    partition_keys: Option<&[String]>,
    modified_at: DateTime<Utc>,
) -> CaskResult<()> {
    let metadata = metadata.map(serde_json::to_string).transpose()?;
    let partition_keys = partition_keys.map(serde_json::to_string).transpose()?;

    let affected = sqlx::query(
        "UPDATE files SET metadata = COALESCE(?, metadata), \
         partition_keys = COALESCE(?, partition_keys), modified_at = ? WHERE id = ?",
    )
    .bind(metadata)
    .bind(partition_keys)
    .bind(modified_at)
    .bind(file_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 0 {
        return Err(CaskError::missing(file_id.to_string()));
    }
    Ok(())
}

/// Delete a record; returns whether it existed.
pub async fn delete_file(conn: &mut SqliteConnection, file_id: &str) -> CaskResult<bool> {
    let affected = sqlx::query("DELETE FROM files WHERE id = ?")
        .bind(file_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(affected > 0)
}

/// Number of records pointing at `address`.
pub async fn count_references(conn: &mut SqliteConnection, address: &str) -> CaskResult<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE content_address = ?")
        .bind(address)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count.max(0) as u64)
}

/// Every record pointing at `address`, oldest first.
pub async fn references_to(conn: &mut SqliteConnection, address: &str) -> CaskResult<Vec<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files f JOIN directories d ON d.id = f.directory_id \
         WHERE f.content_address = ? ORDER BY f.created_at, f.id",
        FILE_COLUMNS
    );
    let rows = sqlx::query_as::<_, FileRow>(&sql)
        .bind(address)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(FileRecord::try_from).collect()
}

/// Drop every file and directory row (root directory excepted).
pub async fn clear(conn: &mut SqliteConnection) -> CaskResult<()> {
    sqlx::query("DELETE FROM files").execute(&mut *conn).await?;
    sqlx::query("DELETE FROM directories WHERE id != ?")
        .bind(ROOT_DIRECTORY_ID)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hash::{digest_bytes, Algorithm};
    use sqlx::Connection;
    use tempfile::TempDir;

    pub(crate) async fn test_db() -> (MetadataDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = MetadataDb::open(dir.path().join("catalog.db"), 2).await.unwrap();
        (db, dir)
    }

    pub(crate) fn record(filename: &str, content: &[u8]) -> FileRecord {
        let digests = digest_bytes(&[Algorithm::Sha256], content).unwrap();
        let now = Utc::now();
        FileRecord {
            file_id: uuid::Uuid::new_v4().to_string(),
            directory_id: ROOT_DIRECTORY_ID,
            directory: "/".to_string(),
            filename: filename.to_string(),
            content_address: digests.content_address().to_string(),
            digests,
            size_bytes: content.len() as u64,
            mime_type: "text/plain".to_string(),
            resource_type: ResourceType::File,
            partition_keys: vec!["p1".to_string()],
            bucket: None,
            metadata: serde_json::json!({"k": "v"}),
            created_at: now,
            modified_at: now,
        }
    }

    #[tokio::test]
    async fn test_db_creation() {
        let (db, _dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        assert!(!file_exists(&mut conn, "/", "missing.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (db, _dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let rec = record("a.txt", b"hello");

        insert_file(&mut conn, &rec).await.unwrap();

        let loaded = get_file(&mut conn, &rec.file_id).await.unwrap().unwrap();
        assert_eq!(loaded.filename, "a.txt");
        assert_eq!(loaded.directory, "/");
        assert_eq!(loaded.digests, rec.digests);
        assert_eq!(loaded.partition_keys, vec!["p1".to_string()]);
        assert_eq!(loaded.path(), "/a.txt");

        let by_path = get_file_by_path(&mut conn, "/", "a.txt").await.unwrap();
        assert_eq!(by_path.map(|r| r.file_id), Some(rec.file_id));
    }

    #[tokio::test]
    async fn test_duplicate_insert_maps_to_duplicate_file() {
        let (db, _dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        insert_file(&mut conn, &record("dup.txt", b"one")).await.unwrap();
        let err = insert_file(&mut conn, &record("dup.txt", b"two"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaskError::DuplicateFile { path } if path == "/dup.txt"));
    }

    #[tokio::test]
    async fn test_reference_counting_queries() {
        let (db, _dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let a = record("a.txt", b"same");
        let b = record("b.txt", b"same");
        insert_file(&mut conn, &a).await.unwrap();
        insert_file(&mut conn, &b).await.unwrap();

        assert_eq!(count_references(&mut conn, &a.content_address).await.unwrap(), 2);
        assert!(delete_file(&mut conn, &a.file_id).await.unwrap());
        assert!(!delete_file(&mut conn, &a.file_id).await.unwrap());

        let remaining = references_to(&mut conn, &a.content_address).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].filename, "b.txt");
    }

    #[tokio::test]
    async fn test_rolled_back_insert_is_invisible() {
        let (db, _dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let rec = record("tx.txt", b"tx");

        let mut tx = conn.begin().await.unwrap();
        insert_file(&mut tx, &rec).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(get_file(&mut conn, &rec.file_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_and_patch() {
        let (db, _dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut rec = record("u.txt", b"v1");
        insert_file(&mut conn, &rec).await.unwrap();

        let fresh = record("u.txt", b"v2");
        rec.content_address = fresh.content_address.clone();
        rec.digests = fresh.digests.clone();
        update_file_record(&mut conn, &rec).await.unwrap();

        patch_file(
            &mut conn,
            &rec.file_id,
            Some(&serde_json::json!({"k": "patched"})),
            None,
            Utc::now(),
        )
        .await
        .unwrap();

        let loaded = get_file(&mut conn, &rec.file_id).await.unwrap().unwrap();
        assert_eq!(loaded.content_address, fresh.content_address);
        assert_eq!(loaded.metadata["k"], "patched");
        assert_eq!(loaded.partition_keys, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_generic_execute() {
        let (db, _dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let affected = execute(
            &mut conn,
            "INSERT INTO directories (parent_id, name, path) VALUES (?, ?, ?)",
            &[Param::Int(ROOT_DIRECTORY_ID), Param::Text("x".into()), Param::Text("/x".into())],
        )
        .await
        .unwrap();
        assert_eq!(affected, 1);
    }
}
