//! SQLite cache backend. Buckets survive restarts.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::{now_millis, CacheBackend, CacheEntry, StoreError};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Backend storing buckets in a single SQLite database.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("creating {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened cache database");
        Self::init(conn)
    }

    /// Database that lives only as long as this backend.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )?;

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool, keeping SQLite
    /// I/O off the async workers.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Backend("cache database lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("cache database task failed: {}", e)))?
    }
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            cache_id INTEGER NOT NULL REFERENCES caches(id) ON DELETE CASCADE,
            url TEXT NOT NULL,
            method TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_id, url)
        );
        "#,
    )?;
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, now_millis() as i64],
    )?;
    debug!(version = SCHEMA_VERSION, "Cache database schema created");
    Ok(())
}

fn cache_id(conn: &Connection, name: &str) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row("SELECT id FROM caches WHERE name = ?1", params![name], |row| {
            row.get(0)
        })
        .optional()?)
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?1, ?2)",
                params![name, now_millis() as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| Ok(cache_id(conn, &name)?.is_some()))
            .await
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM caches WHERE name = ?1", params![name])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY id")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn get(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let (name, key) = (name.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT e.url, e.method, e.status, e.headers, e.body, e.cached_at
                     FROM entries e JOIN caches c ON c.id = e.cache_id
                     WHERE c.name = ?1 AND e.url = ?2",
                    params![name, key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u16>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Vec<u8>>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((url, method, status, headers, body, cached_at)) => Ok(Some(CacheEntry {
                    url,
                    method,
                    status,
                    headers: serde_json::from_str(&headers)?,
                    body: Bytes::from(body),
                    cached_at: cached_at as u64,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let id = cache_id(&tx, &name)?.ok_or_else(|| StoreError::CacheNotFound(name.clone()))?;
            for entry in &entries {
                // REPLACE deletes the old row first, so the key moves to the end.
                tx.execute(
                    "INSERT OR REPLACE INTO entries (cache_id, url, method, status, headers, body, cached_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id,
                        entry.url,
                        entry.method,
                        entry.status,
                        serde_json::to_string(&entry.headers)?,
                        entry.body.as_ref(),
                        entry.cached_at as i64,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, name: &str, key: &str) -> Result<bool, StoreError> {
        let (name, key) = (name.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM entries WHERE url = ?2
                 AND cache_id = (SELECT id FROM caches WHERE name = ?1)",
                params![name, key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let id = cache_id(conn, &name)?.ok_or_else(|| StoreError::CacheNotFound(name.clone()))?;
            let mut stmt = conn.prepare("SELECT url FROM entries WHERE cache_id = ?1 ORDER BY rowid")?;
            let keys = stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheStorage;
    use http::StatusCode;
    use std::sync::Arc;
    use swcache_net::{Request, Response};
    use url::Url;

    fn entry(url: &str, body: &'static [u8]) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: vec![("content-type".to_string(), b"text/plain".to_vec())],
            body: Bytes::from_static(body),
            cached_at: 42,
        }
    }

    #[tokio::test]
    async fn test_entry_roundtrip() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.open("v1").await.unwrap();
        backend.put("v1", vec![entry("https://example.com/", b"home")]).await.unwrap();

        let stored = backend.get("v1", "https://example.com/").await.unwrap().unwrap();
        assert_eq!(stored, entry("https://example.com/", b"home"));
        assert!(backend.get("v2", "https://example.com/").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_ascii_header_survives_storage() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.open("v1").await.unwrap();
        let mut stored = entry("https://example.com/relatorio", b"pdf");
        stored.headers.push((
            "content-disposition".to_string(),
            "attachment; filename=\"relatório.pdf\"".as_bytes().to_vec(),
        ));
        backend.put("v1", vec![stored.clone()]).await.unwrap();

        let loaded = backend.get("v1", "https://example.com/relatorio").await.unwrap().unwrap();
        assert_eq!(loaded.headers, stored.headers);
    }

    #[tokio::test]
    async fn test_names_in_creation_order() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.open("money-app-v1").await.unwrap();
        backend.open("money-app-v99").await.unwrap();
        backend.open("money-app-v1").await.unwrap();

        assert_eq!(
            backend.names().await.unwrap(),
            vec!["money-app-v1", "money-app-v99"]
        );
    }

    #[tokio::test]
    async fn test_delete_cascades_entries() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.open("v1").await.unwrap();
        backend.put("v1", vec![entry("a", b"1"), entry("b", b"2")]).await.unwrap();

        assert!(backend.delete("v1").await.unwrap());
        assert!(!backend.has("v1").await.unwrap());

        backend.open("v1").await.unwrap();
        assert!(backend.keys("v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_moves_key_to_end() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.open("v1").await.unwrap();
        backend.put("v1", vec![entry("a", b"1"), entry("b", b"2")]).await.unwrap();
        backend.put("v1", vec![entry("a", b"3")]).await.unwrap();

        assert_eq!(backend.keys("v1").await.unwrap(), vec!["b", "a"]);
        assert!(backend.remove("v1", "b").await.unwrap());
        assert!(!backend.remove("v1", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_into_missing_bucket_fails() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(matches!(
            backend.put("nope", vec![entry("a", b"1")]).await,
            Err(StoreError::CacheNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_puts_on_worker_threads() {
        let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
        backend.open("v1").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let backend = Arc::clone(&backend);
            tasks.push(tokio::spawn(async move {
                let url = format!("https://example.com/{}", i);
                backend.put("v1", vec![entry(&url, b"x")]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(backend.keys("v1").await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("caches.sqlite3");
        let url = Url::parse("http://localhost:8501/index.html").unwrap();

        {
            let caches = CacheStorage::new(Arc::new(SqliteBackend::open(&path).unwrap()));
            let cache = caches.open("money-app-v99").await.unwrap();
            let request = Request::get(url.clone());
            let response = Response::new(url.clone(), StatusCode::OK, http::HeaderMap::new(), "<html/>");
            cache.put(&request, response).await.unwrap();
        }

        let caches = CacheStorage::new(Arc::new(SqliteBackend::open(&path).unwrap()));
        assert_eq!(caches.keys().await.unwrap(), vec!["money-app-v99"]);
        let hit = caches.match_request(&Request::get(url)).await.unwrap().unwrap();
        assert_eq!(hit.text().await.unwrap(), "<html/>");
    }
}
