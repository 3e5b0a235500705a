//! Opening store handles with pragma configuration.
//!
//! This module handles opening the SQLite database and applying the pragmas
//! every pooled handle needs: WAL journaling, incremental auto-vacuum, the
//! lock-wait timeout, the memory-map window and the page ceiling derived from
//! the configured maximum size.

use crate::Error;
use crate::config::CacheConfig;
use tokio_rusqlite::Connection;

/// Open one handle for `config`, creating the file if needed.
pub async fn open(config: &CacheConfig) -> Result<Connection, Error> {
    let conn = if config.is_in_memory() {
        Connection::open_in_memory().await.map_err(Error::from)?
    } else {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::InvalidInput(format!("cannot create {}: {e}", parent.display())))?;
        }
        Connection::open(&config.path).await.map_err(Error::from)?
    };

    let busy_timeout = config.busy_timeout();
    let mmap_size = config.mmap_size_bytes;
    let max_size = config.max_size_bytes;

    conn.call(move |conn| -> Result<(), Error> {
        // auto_vacuum only takes effect before the first table is created.
        conn.execute_batch(&format!(
            "PRAGMA auto_vacuum=INCREMENTAL;
             PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;
             PRAGMA mmap_size={mmap_size};"
        ))?;
        conn.busy_timeout(busy_timeout)?;

        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let max_pages = (max_size as i64 / page_size.max(1)).max(1);
        conn.execute_batch(&format!("PRAGMA max_page_count={max_pages};"))?;
        Ok(())
    })
    .await
    .map_err(Error::from)?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let conn = open(&CacheConfig::in_memory()).await.unwrap();
        let version = conn
            .call(|conn| conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0)))
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn test_page_ceiling_follows_max_size() {
        let config = CacheConfig { max_size_bytes: 64 * 1024, ..CacheConfig::in_memory() };
        let conn = open(&config).await.unwrap();
        let (pages, page_size): (i64, i64) = conn
            .call(|conn| {
                let pages = conn.query_row("PRAGMA max_page_count", [], |row| row.get(0))?;
                let page_size = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>((pages, page_size))
            })
            .await
            .unwrap();
        assert_eq!(pages * page_size, 64 * 1024);
    }

    #[tokio::test]
    async fn test_busy_timeout_is_applied() {
        let config = CacheConfig { busy_timeout_ms: 1234, ..CacheConfig::in_memory() };
        let conn = open(&config).await.unwrap();
        let timeout: i64 = conn
            .call(|conn| conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(timeout, 1234);
    }

    #[tokio::test]
    async fn test_open_file_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::at(dir.path().join("nested").join("cache.db"));
        let conn = open(&config).await.unwrap();
        let mode: String = conn
            .call(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
