// src/store/mod.rs
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::fsutil;
use crate::media::MediaFile;

/// Persistent record for one indexed file.
///
/// The file-derived half mirrors `MediaFile`; the user-authored half
/// (`label`, `description`, `mark`, `rating`, `flag`, `option`) is only
/// ever written by clients and survives any re-observation of the file.
#[derive(Debug, Clone, Serialize)]
pub struct MetaData {
    pub id: i64,
    pub path: String,
    pub ext: String,
    pub title: String,
    pub category: String,
    pub length: i64,
    pub date: i64,
    pub duration: f64,
    pub label: String,
    pub description: String,
    pub mark: i64,
    pub rating: i64,
    pub flag: i64,
    pub option: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MetaData {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            path: row.try_get("path")?,
            ext: row.try_get("ext")?,
            title: row.try_get("title")?,
            category: row.try_get("category")?,
            length: row.try_get("length")?,
            date: row.try_get("date")?,
            duration: row.try_get("duration")?,
            label: row.try_get("label")?,
            description: row.try_get("description")?,
            mark: row.try_get("mark")?,
            rating: row.try_get("rating")?,
            flag: row.try_get("flag")?,
            option: row.try_get("option")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, path, ext, title, category, length, date, duration, \
     label, description, mark, rating, flag, option, created_at, updated_at";

/// SQLite-backed metadata store keyed by file path.
///
/// Safe to call from any task; the pool serializes writes. Journaling is
/// WAL with relaxed sync, matching the durability the index needs (a
/// crash is repaired by startup reconciliation anyway).
pub struct MetaDataStore {
    pool: SqlitePool,
}

impl MetaDataStore {
    /// Open (or create) the store at `db_path` and run schema setup.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", fsutil::to_slash(db_path));
        let pool = SqlitePool::connect(&database_url)
            .await
            .with_context(|| format!("failed to open store at {}", db_path.display()))?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// In-memory store for tests. Pinned to one connection: every pooled
    /// connection would otherwise see its own empty `:memory:` database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT UNIQUE NOT NULL,
                ext TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                length INTEGER NOT NULL DEFAULT 0,
                date INTEGER NOT NULL DEFAULT 0,
                duration REAL NOT NULL DEFAULT 0,
                label TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                mark INTEGER NOT NULL DEFAULT 0,
                rating INTEGER NOT NULL DEFAULT 0,
                flag INTEGER NOT NULL DEFAULT 0,
                option TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metadata_category ON metadata(category)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metadata_flag ON metadata(flag)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metadata_created_at ON metadata(created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metadata_updated_at ON metadata(updated_at)")
            .execute(&self.pool)
            .await?;

        // Any row mutation bumps updated_at; explicit writes to the column
        // itself are left alone.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS metadata_touch_updated_at
            AFTER UPDATE ON metadata
            FOR EACH ROW
            WHEN NEW.updated_at = OLD.updated_at
            BEGIN
                UPDATE metadata SET updated_at = strftime('%s', 'now') WHERE id = NEW.id;
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a record for `file`, or on a path conflict refresh only the
    /// file-derived columns, leaving the user-authored ones untouched.
    pub async fn upsert(&self, file: &MediaFile) -> Result<()> {
        let path = fsutil::to_slash(&file.path);
        sqlx::query(
            r#"
            INSERT INTO metadata (path, ext, title, category, length, date, duration)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                ext = excluded.ext,
                title = excluded.title,
                category = excluded.category,
                length = excluded.length,
                date = excluded.date,
                duration = excluded.duration
            "#,
        )
        .bind(&path)
        .bind(&file.ext)
        .bind(&file.title)
        .bind(&file.category)
        .bind(file.length as i64)
        .bind(file.date)
        .bind(file.duration)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert {}", path))?;
        Ok(())
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<MetaData>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(MetaData::from_row).transpose()
    }

    pub async fn get_by_path(&self, path: &Path) -> Result<Option<MetaData>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata WHERE path = ?"
        ))
        .bind(fsutil::to_slash(path))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(MetaData::from_row).transpose()
    }

    pub async fn get_by_paths(&self, paths: &[PathBuf]) -> Result<Vec<MetaData>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = paths.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM metadata WHERE path IN ({placeholders}) ORDER BY path"
        );
        let mut query = sqlx::query(&sql);
        for path in paths {
            query = query.bind(fsutil::to_slash(path));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(MetaData::from_row).collect()
    }

    pub async fn get_all(&self) -> Result<Vec<MetaData>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata ORDER BY path"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(MetaData::from_row).collect()
    }

    pub async fn get_by_flag(&self, flag: i64) -> Result<Vec<MetaData>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata WHERE flag = ? ORDER BY path"
        ))
        .bind(flag)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(MetaData::from_row).collect()
    }

    pub async fn get_by_rating(&self, min: i64) -> Result<Vec<MetaData>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata WHERE rating >= ? ORDER BY rating DESC, path"
        ))
        .bind(min)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(MetaData::from_row).collect()
    }

    /// Substring match on the user-authored label.
    pub async fn search_by_label(&self, needle: &str) -> Result<Vec<MetaData>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata WHERE label LIKE ? ORDER BY path"
        ))
        .bind(format!("%{needle}%"))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(MetaData::from_row).collect()
    }

    pub async fn get_created_since(&self, since: i64) -> Result<Vec<MetaData>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata WHERE created_at >= ? ORDER BY created_at, id"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(MetaData::from_row).collect()
    }

    pub async fn get_updated_since(&self, since: i64) -> Result<Vec<MetaData>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata WHERE updated_at >= ? ORDER BY updated_at, id"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(MetaData::from_row).collect()
    }

    /// Remove the record at `path`. Returns whether a row was deleted.
    pub async fn delete(&self, path: &Path) -> Result<bool> {
        let result = sqlx::query("DELETE FROM metadata WHERE path = ?")
            .bind(fsutil::to_slash(path))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_many(&self, paths: &[PathBuf]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let placeholders = paths.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM metadata WHERE path IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for path in paths {
            query = query.bind(fsutil::to_slash(path));
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    /// Atomically move a record to a new path, optionally retitling it.
    ///
    /// A missing record for `old_path` is a no-op (the rename may race
    /// startup reconciliation); returns whether a row moved. The update
    /// trigger bumps `updated_at`.
    pub async fn update_path(
        &self,
        old_path: &Path,
        new_path: &Path,
        new_title: Option<&str>,
    ) -> Result<bool> {
        let old = fsutil::to_slash(old_path);
        let new = fsutil::to_slash(new_path);
        let result = match new_title {
            Some(title) => {
                sqlx::query("UPDATE metadata SET path = ?, title = ? WHERE path = ?")
                    .bind(&new)
                    .bind(title)
                    .bind(&old)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("UPDATE metadata SET path = ? WHERE path = ?")
                    .bind(&new)
                    .bind(&old)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    /// Distinct categories currently present, sorted.
    pub async fn categories(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT category FROM metadata ORDER BY category")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("category").map_err(Into::into))
            .collect()
    }

    /// Set a user-authored field group on a record (client edits).
    pub async fn update_user_fields(
        &self,
        path: &Path,
        label: &str,
        description: &str,
        mark: i64,
        rating: i64,
        flag: i64,
        option: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE metadata SET label = ?, description = ?, mark = ?, rating = ?, flag = ?, option = ? WHERE path = ?",
        )
        .bind(label)
        .bind(description)
        .bind(mark)
        .bind(rating)
        .bind(flag)
        .bind(option)
        .bind(fsutil::to_slash(path))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flush and close the pool. Safe to call more than once.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
