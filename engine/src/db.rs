// --- Persistence (SQLite) -------------------------------------------------
//
// Playlists, schedules and the active backend live in one SQLite file.
// rusqlite is synchronous, so every call runs on the blocking pool with its
// own short-lived connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::adapter::BackendKind;
use crate::error::StoreError;

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS playlists (
            name          TEXT PRIMARY KEY,
            loop_enabled  INTEGER NOT NULL,
            shuffle       INTEGER NOT NULL,
            auto_advance  INTEGER NOT NULL,
            created_at    INTEGER NOT NULL,
            updated_at    INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playlist_items (
            playlist_name     TEXT NOT NULL,
            position          INTEGER NOT NULL,
            file_ref          TEXT NOT NULL,
            duration_seconds  REAL NOT NULL,
            transition        TEXT NOT NULL,
            PRIMARY KEY (playlist_name, position)
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            name           TEXT NOT NULL,
            playlist_name  TEXT NOT NULL,
            start_time     TEXT NOT NULL,
            end_time       TEXT NOT NULL,
            days           TEXT NOT NULL,
            enabled        INTEGER NOT NULL,
            created_at     INTEGER NOT NULL,
            updated_at     INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_schedules_playlist ON schedules(playlist_name);

        CREATE TABLE IF NOT EXISTS player_config (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            active_backend  TEXT NOT NULL
        );
        "#,
    )
}

#[derive(Clone)]
pub struct Db {
    path: Arc<PathBuf>,
}

impl Db {
    /// Open (and create if needed) the database file and its schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("failed to create db directory {}: {e}", dir.display());
            }
        }
        let db = Self { path: Arc::new(path) };
        db.call(|conn| Ok(db_init(conn)?)).await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against a fresh connection on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(path.as_path())?;
            conn.busy_timeout(Duration::from_secs(2))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn load_active_backend(&self) -> Result<Option<BackendKind>, StoreError> {
        let raw: Option<String> = self
            .call(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT active_backend FROM player_config WHERE id = 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        Ok(match raw {
            Some(s) => match s.parse::<BackendKind>() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    warn!("ignoring unknown persisted backend '{s}'");
                    None
                }
            },
            None => None,
        })
    }

    pub async fn save_active_backend(&self, kind: BackendKind) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO player_config (id, active_backend) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET active_backend = excluded.active_backend",
                params![kind.as_str()],
            )?;
            Ok(())
        })
        .await
    }
}
