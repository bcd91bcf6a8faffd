//! Persistent part-level download state.
//!
//! One SQLite file per manifest, created next to it. Three tables: per-part
//! rows for regular files and symlink chunks, plus one record per symlink
//! file carrying the whole-file checksum and content URL. The store is the
//! resume log: a part with `bytes_fetched == size` is never downloaded
//! again, and progress reporting is a handful of aggregate queries.
//!
//! The workload is small, so the store runs one connection and serializes
//! every access through one async mutex. The single concession to write
//! volume is the updater's batched commit, ten part completions per
//! transaction.

mod part;

pub use part::{
    local_path, CompletedPart, Part, PartKind, RegularPart, SymlinkPart, SymlinkRecord,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;

/// SQLite busy timeout.
const BUSY_TIMEOUT_MS: u32 = 60_000;

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// Any database-level failure.
    #[error("state store error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Aggregate progress numbers, summed across both part tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Total number of parts.
    pub total_parts: u64,
    /// Total number of bytes.
    pub total_bytes: u64,
    /// Parts with `bytes_fetched == size`.
    pub parts_complete: u64,
    /// Bytes in completed parts.
    pub bytes_complete: u64,
    /// Bytes completed inside the sampling window.
    pub bytes_in_window: u64,
}

/// Returns the state-store path companion to a manifest file.
#[must_use]
pub fn store_path(manifest_path: &Path) -> PathBuf {
    let mut path = manifest_path.as_os_str().to_os_string();
    path.push(".stats.db");
    PathBuf::from(path)
}

/// Current wall-clock time in Unix nanoseconds.
#[must_use]
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[derive(Debug, sqlx::FromRow)]
struct SymlinkPartJoined {
    file_id: String,
    project: String,
    name: String,
    folder: String,
    part_id: i64,
    offset: i64,
    size: i64,
    bytes_fetched: i64,
    done_time_ns: i64,
    url: String,
}

/// Single-writer embedded state store.
///
/// Cloning is cheap and shares the connection and the writer mutex.
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    /// Opens (or creates) the store file and applies the connection
    /// pragmas. The schema is only created by [`StateStore::create_schema`];
    /// an existing file is trusted to match the manifest it was created
    /// for.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the file cannot be opened.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Opens an in-memory store. Test use.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the connection fails.
    pub async fn open_in_memory() -> Result<Self, StateError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self {
            pool,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Creates the three tables. Called exactly once, on a fresh store.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if any DDL statement fails, including when
    /// the tables already exist.
    pub async fn create_schema(&self) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;

        sqlx::query(
            r"CREATE TABLE regular_parts (
                file_id text,
                project text,
                name text,
                folder text,
                part_id integer,
                offset integer,
                size integer,
                md5 text,
                bytes_fetched integer,
                done_time_ns integer,
                PRIMARY KEY (file_id, part_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE TABLE symlink_parts (
                file_id text,
                project text,
                name text,
                folder text,
                part_id integer,
                offset integer,
                size integer,
                bytes_fetched integer,
                done_time_ns integer,
                PRIMARY KEY (file_id, part_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE TABLE symlinks (
                file_id text PRIMARY KEY,
                folder text,
                project text,
                name text,
                size integer,
                url text,
                md5 text
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts the planned rows in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if any insert fails.
    pub async fn insert_rows(
        &self,
        regular: &[RegularPart],
        symlink_parts: &[SymlinkPart],
        symlinks: &[SymlinkRecord],
    ) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for part in regular {
            sqlx::query(
                r"INSERT INTO regular_parts VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&part.file_id)
            .bind(&part.project)
            .bind(&part.name)
            .bind(&part.folder)
            .bind(part.part_id)
            .bind(part.offset)
            .bind(part.size)
            .bind(&part.md5)
            .bind(part.bytes_fetched)
            .bind(part.done_time_ns)
            .execute(&mut *tx)
            .await?;
        }

        for part in symlink_parts {
            sqlx::query(r"INSERT INTO symlink_parts VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)")
                .bind(&part.file_id)
                .bind(&part.project)
                .bind(&part.name)
                .bind(&part.folder)
                .bind(part.part_id)
                .bind(part.offset)
                .bind(part.size)
                .bind(part.bytes_fetched)
                .bind(part.done_time_ns)
                .execute(&mut *tx)
                .await?;
        }

        for record in symlinks {
            sqlx::query(r"INSERT INTO symlinks VALUES (?, ?, ?, ?, ?, ?, ?)")
                .bind(&record.file_id)
                .bind(&record.folder)
                .bind(&record.project)
                .bind(&record.name)
                .bind(record.size)
                .bind(&record.url)
                .bind(&record.md5)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Returns every part still missing bytes, in (file, part) order.
    /// Symlink chunks come with the content URL from their record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if a query fails.
    pub async fn incomplete_parts(&self) -> Result<Vec<Part>, StateError> {
        let _guard = self.lock.lock().await;

        let regular = sqlx::query_as::<_, RegularPart>(
            r"SELECT * FROM regular_parts
              WHERE bytes_fetched != size
              ORDER BY file_id, part_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let symlink = sqlx::query_as::<_, SymlinkPartJoined>(
            r"SELECT p.file_id, p.project, p.name, p.folder, p.part_id,
                     p.offset, p.size, p.bytes_fetched, p.done_time_ns, s.url
              FROM symlink_parts p
              JOIN symlinks s ON p.file_id = s.file_id
              WHERE p.bytes_fetched != p.size
              ORDER BY p.file_id, p.part_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut parts: Vec<Part> = regular.into_iter().map(Part::Regular).collect();
        parts.extend(symlink.into_iter().map(|row| Part::Symlink {
            part: SymlinkPart {
                file_id: row.file_id,
                project: row.project,
                name: row.name,
                folder: row.folder,
                part_id: row.part_id,
                offset: row.offset,
                size: row.size,
                bytes_fetched: row.bytes_fetched,
                done_time_ns: row.done_time_ns,
            },
            url: row.url,
        }));
        Ok(parts)
    }

    /// Marks a batch of parts complete in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the transaction fails; none of the batch
    /// is applied in that case.
    pub async fn mark_complete(&self, batch: &[CompletedPart]) -> Result<(), StateError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for done in batch {
            let table = match done.kind {
                PartKind::Regular => "regular_parts",
                PartKind::Symlink => "symlink_parts",
            };
            sqlx::query(&format!(
                "UPDATE {table} SET bytes_fetched = ?, done_time_ns = ? \
                 WHERE file_id = ? AND part_id = ?"
            ))
            .bind(done.size)
            .bind(done.done_time_ns)
            .bind(&done.file_id)
            .bind(done.part_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Resets one regular part to not-downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the update fails.
    pub async fn reset_regular_part(&self, file_id: &str, part_id: i64) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        sqlx::query(
            r"UPDATE regular_parts SET bytes_fetched = 0, done_time_ns = 0
              WHERE file_id = ? AND part_id = ?",
        )
        .bind(file_id)
        .bind(part_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resets every part of a file to not-downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the update fails.
    pub async fn reset_file(&self, file_id: &str, kind: PartKind) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        let table = match kind {
            PartKind::Regular => "regular_parts",
            PartKind::Symlink => "symlink_parts",
        };
        sqlx::query(&format!(
            "UPDATE {table} SET bytes_fetched = 0, done_time_ns = 0 WHERE file_id = ?"
        ))
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns every completed regular part, for verification.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the query fails.
    pub async fn completed_regular_parts(&self) -> Result<Vec<RegularPart>, StateError> {
        let _guard = self.lock.lock().await;
        let rows = sqlx::query_as::<_, RegularPart>(
            r"SELECT * FROM regular_parts
              WHERE bytes_fetched = size
              ORDER BY file_id, part_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Returns all symlink records.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the query fails.
    pub async fn symlink_records(&self) -> Result<Vec<SymlinkRecord>, StateError> {
        let _guard = self.lock.lock().await;
        let rows =
            sqlx::query_as::<_, SymlinkRecord>(r"SELECT * FROM symlinks ORDER BY file_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// True when every chunk of a symlink file has been fetched.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the query fails.
    pub async fn symlink_complete(&self, file_id: &str) -> Result<bool, StateError> {
        let _guard = self.lock.lock().await;
        let missing: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM symlink_parts
              WHERE file_id = ? AND bytes_fetched != size",
        )
        .bind(file_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(missing == 0)
    }

    /// Bytes still to download, summed across both part tables.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the query fails.
    pub async fn remaining_bytes(&self) -> Result<u64, StateError> {
        let _guard = self.lock.lock().await;
        let remaining: i64 = sqlx::query_scalar(
            r"SELECT COALESCE((SELECT SUM(size - bytes_fetched) FROM regular_parts), 0)
                   + COALESCE((SELECT SUM(size - bytes_fetched) FROM symlink_parts), 0)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(remaining.max(0) as u64)
    }

    /// Aggregate progress, with throughput sampled over `window`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if a query fails.
    pub async fn snapshot(&self, window: Duration) -> Result<ProgressSnapshot, StateError> {
        let _guard = self.lock.lock().await;
        let window_floor = now_ns() - window.as_nanos() as i64;

        let total_parts: i64 = sqlx::query_scalar(
            r"SELECT (SELECT COUNT(*) FROM regular_parts)
                   + (SELECT COUNT(*) FROM symlink_parts)",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_bytes: i64 = sqlx::query_scalar(
            r"SELECT COALESCE((SELECT SUM(size) FROM regular_parts), 0)
                   + COALESCE((SELECT SUM(size) FROM symlink_parts), 0)",
        )
        .fetch_one(&self.pool)
        .await?;

        let parts_complete: i64 = sqlx::query_scalar(
            r"SELECT (SELECT COUNT(*) FROM regular_parts WHERE bytes_fetched = size)
                   + (SELECT COUNT(*) FROM symlink_parts WHERE bytes_fetched = size)",
        )
        .fetch_one(&self.pool)
        .await?;

        let bytes_complete: i64 = sqlx::query_scalar(
            r"SELECT COALESCE(
                  (SELECT SUM(bytes_fetched) FROM regular_parts WHERE bytes_fetched = size), 0)
                   + COALESCE(
                  (SELECT SUM(bytes_fetched) FROM symlink_parts WHERE bytes_fetched = size), 0)",
        )
        .fetch_one(&self.pool)
        .await?;

        let bytes_in_window: i64 = sqlx::query_scalar(
            r"SELECT COALESCE(
                  (SELECT SUM(bytes_fetched) FROM regular_parts WHERE done_time_ns > ?), 0)
                   + COALESCE(
                  (SELECT SUM(bytes_fetched) FROM symlink_parts WHERE done_time_ns > ?), 0)",
        )
        .bind(window_floor)
        .bind(window_floor)
        .fetch_one(&self.pool)
        .await?;

        Ok(ProgressSnapshot {
            total_parts: total_parts.max(0) as u64,
            total_bytes: total_bytes.max(0) as u64,
            parts_complete: parts_complete.max(0) as u64,
            bytes_complete: bytes_complete.max(0) as u64,
            bytes_in_window: bytes_in_window.max(0) as u64,
        })
    }

    /// Closes the store. Pending WAL content is checkpointed by SQLite.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn regular(file_id: &str, part_id: i64, offset: i64, size: i64, md5: &str) -> RegularPart {
        RegularPart {
            file_id: file_id.to_string(),
            project: "project-1".to_string(),
            name: "blob".to_string(),
            folder: "/data".to_string(),
            part_id,
            offset,
            size,
            md5: md5.to_string(),
            bytes_fetched: 0,
            done_time_ns: 0,
        }
    }

    fn symlink_chunk(file_id: &str, part_id: i64, offset: i64, size: i64) -> SymlinkPart {
        SymlinkPart {
            file_id: file_id.to_string(),
            project: "project-1".to_string(),
            name: "linked".to_string(),
            folder: "/data".to_string(),
            part_id,
            offset,
            size,
            bytes_fetched: 0,
            done_time_ns: 0,
        }
    }

    fn symlink_record(file_id: &str, size: i64) -> SymlinkRecord {
        SymlinkRecord {
            file_id: file_id.to_string(),
            folder: "/data".to_string(),
            project: "project-1".to_string(),
            name: "linked".to_string(),
            size,
            url: "https://mirror.example.com/linked".to_string(),
            md5: "ff".to_string(),
        }
    }

    async fn seeded_store() -> StateStore {
        let store = StateStore::open_in_memory().await.unwrap();
        store.create_schema().await.unwrap();
        store
            .insert_rows(
                &[
                    regular("file-0001", 1, 0, 100, "aa"),
                    regular("file-0001", 2, 100, 50, "bb"),
                ],
                &[
                    symlink_chunk("file-0002", 1, 0, 80),
                    symlink_chunk("file-0002", 2, 80, 20),
                ],
                &[symlink_record("file-0002", 100)],
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn store_path_appends_suffix() {
        assert_eq!(
            store_path(Path::new("runs/manifest.json.bz2")),
            PathBuf::from("runs/manifest.json.bz2.stats.db")
        );
    }

    #[tokio::test]
    async fn incomplete_parts_cover_both_tables() {
        let store = seeded_store().await;
        let parts = store.incomplete_parts().await.unwrap();
        assert_eq!(parts.len(), 4);

        let symlink_urls: Vec<&str> = parts
            .iter()
            .filter_map(|p| match p {
                Part::Symlink { url, .. } => Some(url.as_str()),
                Part::Regular(_) => None,
            })
            .collect();
        assert_eq!(
            symlink_urls,
            vec![
                "https://mirror.example.com/linked",
                "https://mirror.example.com/linked"
            ]
        );
    }

    #[tokio::test]
    async fn mark_complete_batch_is_atomic_and_idempotent() {
        let store = seeded_store().await;
        let now = now_ns();
        store
            .mark_complete(&[
                CompletedPart {
                    kind: PartKind::Regular,
                    file_id: "file-0001".to_string(),
                    part_id: 1,
                    size: 100,
                    done_time_ns: now,
                },
                CompletedPart {
                    kind: PartKind::Symlink,
                    file_id: "file-0002".to_string(),
                    part_id: 2,
                    size: 20,
                    done_time_ns: now,
                },
            ])
            .await
            .unwrap();

        let parts = store.incomplete_parts().await.unwrap();
        assert_eq!(parts.len(), 2);

        let snapshot = store.snapshot(Duration::from_secs(120)).await.unwrap();
        assert_eq!(snapshot.total_parts, 4);
        assert_eq!(snapshot.parts_complete, 2);
        assert_eq!(snapshot.bytes_complete, 120);
        assert_eq!(snapshot.bytes_in_window, 120);
        assert_eq!(snapshot.total_bytes, 250);
    }

    #[tokio::test]
    async fn completion_invariant_holds() {
        // done_time_ns > 0 exactly when bytes_fetched == size.
        let store = seeded_store().await;
        store
            .mark_complete(&[CompletedPart {
                kind: PartKind::Regular,
                file_id: "file-0001".to_string(),
                part_id: 2,
                size: 50,
                done_time_ns: now_ns(),
            }])
            .await
            .unwrap();

        let rows = store.completed_regular_parts().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].part_id, 2);
        assert_eq!(rows[0].bytes_fetched, rows[0].size);
        assert!(rows[0].done_time_ns > 0);

        store.reset_regular_part("file-0001", 2).await.unwrap();
        let rows = store.completed_regular_parts().await.unwrap();
        assert!(rows.is_empty());

        let parts = store.incomplete_parts().await.unwrap();
        for part in parts {
            if let Part::Regular(p) = part {
                assert_eq!(p.bytes_fetched, 0);
                assert_eq!(p.done_time_ns, 0);
            }
        }
    }

    #[tokio::test]
    async fn reset_file_touches_only_that_file() {
        let store = seeded_store().await;
        let now = now_ns();
        store
            .mark_complete(&[
                CompletedPart {
                    kind: PartKind::Regular,
                    file_id: "file-0001".to_string(),
                    part_id: 1,
                    size: 100,
                    done_time_ns: now,
                },
                CompletedPart {
                    kind: PartKind::Symlink,
                    file_id: "file-0002".to_string(),
                    part_id: 1,
                    size: 80,
                    done_time_ns: now,
                },
            ])
            .await
            .unwrap();

        store.reset_file("file-0002", PartKind::Symlink).await.unwrap();

        assert!(!store.symlink_complete("file-0002").await.unwrap());
        let regular_done = store.completed_regular_parts().await.unwrap();
        assert_eq!(regular_done.len(), 1, "regular file must be untouched");
    }

    #[tokio::test]
    async fn symlink_complete_flips_when_all_chunks_land() {
        let store = seeded_store().await;
        assert!(!store.symlink_complete("file-0002").await.unwrap());

        let now = now_ns();
        store
            .mark_complete(&[
                CompletedPart {
                    kind: PartKind::Symlink,
                    file_id: "file-0002".to_string(),
                    part_id: 1,
                    size: 80,
                    done_time_ns: now,
                },
                CompletedPart {
                    kind: PartKind::Symlink,
                    file_id: "file-0002".to_string(),
                    part_id: 2,
                    size: 20,
                    done_time_ns: now,
                },
            ])
            .await
            .unwrap();
        assert!(store.symlink_complete("file-0002").await.unwrap());
    }

    #[tokio::test]
    async fn remaining_bytes_shrinks_as_parts_complete() {
        let store = seeded_store().await;
        assert_eq!(store.remaining_bytes().await.unwrap(), 250);

        store
            .mark_complete(&[CompletedPart {
                kind: PartKind::Regular,
                file_id: "file-0001".to_string(),
                part_id: 1,
                size: 100,
                done_time_ns: now_ns(),
            }])
            .await
            .unwrap();
        assert_eq!(store.remaining_bytes().await.unwrap(), 150);
    }

    #[tokio::test]
    async fn empty_store_snapshot_is_zero() {
        let store = StateStore::open_in_memory().await.unwrap();
        store.create_schema().await.unwrap();
        let snapshot = store.snapshot(Duration::from_secs(60)).await.unwrap();
        assert_eq!(snapshot, ProgressSnapshot::default());
        assert_eq!(store.remaining_bytes().await.unwrap(), 0);
    }
}
