//! Named playlists and their SQLite-backed store.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::Db;
use crate::error::StoreError;
use crate::media::MediaLibrary;
use crate::status::unix_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    #[default]
    None,
    Fade,
    Slide,
}

impl Transition {
    fn as_str(self) -> &'static str {
        match self {
            Transition::None => "none",
            Transition::Fade => "fade",
            Transition::Slide => "slide",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "fade" => Transition::Fade,
            "slide" => Transition::Slide,
            _ => Transition::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub file: String,
    /// Display time for stills; 0 plays the file for its natural length.
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub transition: Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSettings {
    #[serde(rename = "loop", default)]
    pub looping: bool,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default = "default_true")]
    pub auto_advance: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PlaylistSettings {
    fn default() -> Self {
        Self { looping: false, shuffle: false, auto_advance: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Playlist {
    pub name: String,
    pub items: Vec<PlaylistItem>,
    pub settings: PlaylistSettings,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Body of a create/replace request.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistInput {
    pub name: String,
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
    #[serde(default)]
    pub settings: PlaylistSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub playlist: Playlist,
    pub created: bool,
    /// Items whose file is not in the media library right now.
    pub warnings: Vec<String>,
}

pub(crate) fn validate_name(name: &str) -> Result<String, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::Invalid("playlist name is empty".into()));
    }
    if name.chars().count() > 128 {
        return Err(StoreError::Invalid("playlist name is longer than 128 characters".into()));
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(StoreError::Invalid(format!("playlist name '{name}' contains forbidden characters")));
    }
    Ok(name.to_string())
}

fn validate_items(items: &[PlaylistItem]) -> Result<(), StoreError> {
    for (i, item) in items.iter().enumerate() {
        if item.file.trim().is_empty() {
            return Err(StoreError::Invalid(format!("item {i} has an empty file reference")));
        }
        if !item.duration_seconds.is_finite() || item.duration_seconds < 0.0 {
            return Err(StoreError::Invalid(format!(
                "item {i} has an invalid duration {}",
                item.duration_seconds
            )));
        }
    }
    Ok(())
}

pub(crate) fn playlist_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM playlists WHERE name = ?1", params![name], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
}

fn load_playlist(conn: &Connection, name: &str) -> rusqlite::Result<Option<Playlist>> {
    let head = conn
        .query_row(
            "SELECT name, loop_enabled, shuffle, auto_advance, created_at, updated_at
             FROM playlists WHERE name = ?1",
            params![name],
            |row| {
                Ok(Playlist {
                    name: row.get(0)?,
                    items: Vec::new(),
                    settings: PlaylistSettings {
                        looping: row.get::<_, i64>(1)? != 0,
                        shuffle: row.get::<_, i64>(2)? != 0,
                        auto_advance: row.get::<_, i64>(3)? != 0,
                    },
                    created_at: row.get::<_, i64>(4)? as u64,
                    updated_at: row.get::<_, i64>(5)? as u64,
                })
            },
        )
        .optional()?;

    let Some(mut playlist) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT file_ref, duration_seconds, transition FROM playlist_items
         WHERE playlist_name = ?1 ORDER BY position ASC",
    )?;
    let items = stmt.query_map(params![name], |row| {
        Ok(PlaylistItem {
            file: row.get(0)?,
            duration_seconds: row.get(1)?,
            transition: Transition::from_db(&row.get::<_, String>(2)?),
        })
    })?;
    for item in items {
        playlist.items.push(item?);
    }
    Ok(Some(playlist))
}

fn write_items(tx: &Transaction<'_>, name: &str, items: &[PlaylistItem]) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM playlist_items WHERE playlist_name = ?1", params![name])?;
    for (position, item) in items.iter().enumerate() {
        tx.execute(
            "INSERT INTO playlist_items (playlist_name, position, file_ref, duration_seconds, transition)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                position as i64,
                item.file.trim(),
                item.duration_seconds,
                item.transition.as_str()
            ],
        )?;
    }
    Ok(())
}

fn schedules_referencing(
    conn: &Connection,
    playlist: &str,
    enabled_only: bool,
) -> rusqlite::Result<Vec<String>> {
    let sql = if enabled_only {
        "SELECT name FROM schedules WHERE playlist_name = ?1 AND enabled = 1 ORDER BY id"
    } else {
        "SELECT name FROM schedules WHERE playlist_name = ?1 ORDER BY id"
    };
    let mut stmt = conn.prepare(sql)?;
    let names = stmt.query_map(params![playlist], |row| row.get(0))?;
    names.collect()
}

#[derive(Clone)]
pub struct PlaylistStore {
    db: Db,
    media: MediaLibrary,
}

impl PlaylistStore {
    pub fn new(db: Db, media: MediaLibrary) -> Self {
        Self { db, media }
    }

    pub fn media(&self) -> &MediaLibrary {
        &self.media
    }

    pub async fn get(&self, name: &str) -> Result<Option<Playlist>, StoreError> {
        let name = name.to_string();
        self.db.call(move |conn| Ok(load_playlist(conn, &name)?)).await
    }

    pub async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.db.call(move |conn| Ok(playlist_exists(conn, &name)?)).await
    }

    pub async fn list(&self) -> Result<Vec<Playlist>, StoreError> {
        self.db
            .call(|conn| {
                let names: Vec<String> = {
                    let mut stmt = conn.prepare("SELECT name FROM playlists ORDER BY name ASC")?;
                    let rows = stmt.query_map([], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    if let Some(p) = load_playlist(conn, &name)? {
                        out.push(p);
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Create or replace a playlist. Missing media is reported, not refused:
    /// files can disappear later anyway and playback skips them.
    pub async fn upsert(&self, input: PlaylistInput) -> Result<UpsertOutcome, StoreError> {
        let name = validate_name(&input.name)?;
        validate_items(&input.items)?;

        let warnings: Vec<String> = input
            .items
            .iter()
            .filter(|item| !self.media.exists(&item.file))
            .map(|item| format!("media file not found: {}", item.file.trim()))
            .collect();
        for w in &warnings {
            warn!("playlist '{name}': {w}");
        }

        let items = input.items;
        let settings = input.settings;
        let (playlist, created) = self
            .db
            .call(move |conn| {
                let now = unix_ms() as i64;
                let tx = conn.transaction()?;
                let created = !playlist_exists(&tx, &name)?;
                tx.execute(
                    "INSERT INTO playlists (name, loop_enabled, shuffle, auto_advance, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(name) DO UPDATE SET
                       loop_enabled=excluded.loop_enabled,
                       shuffle=excluded.shuffle,
                       auto_advance=excluded.auto_advance,
                       updated_at=excluded.updated_at",
                    params![
                        name,
                        settings.looping as i64,
                        settings.shuffle as i64,
                        settings.auto_advance as i64,
                        now
                    ],
                )?;
                write_items(&tx, &name, &items)?;
                tx.commit()?;

                let playlist = load_playlist(conn, &name)?
                    .ok_or_else(|| StoreError::NotFound(format!("playlist '{name}'")))?;
                Ok((playlist, created))
            })
            .await?;

        info!(
            "playlist {} '{}' ({} item(s))",
            if created { "created" } else { "updated" },
            playlist.name,
            playlist.items.len()
        );
        Ok(UpsertOutcome { playlist, created, warnings })
    }

    /// Delete a playlist. Refused while an enabled schedule points at it.
    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                if !playlist_exists(&tx, &name)? {
                    return Err(StoreError::NotFound(format!("playlist '{name}'")));
                }
                let blocking = schedules_referencing(&tx, &name, true)?;
                if !blocking.is_empty() {
                    return Err(StoreError::Referenced { playlist: name, schedules: blocking });
                }
                tx.execute("DELETE FROM playlist_items WHERE playlist_name = ?1", params![name])?;
                tx.execute("DELETE FROM playlists WHERE name = ?1", params![name])?;
                tx.commit()?;
                info!("playlist deleted '{name}'");
                Ok(())
            })
            .await
    }

    /// Rename a playlist. Names are frozen once any schedule refers to them.
    pub async fn rename(&self, old: &str, new: &str) -> Result<Playlist, StoreError> {
        let old = old.to_string();
        let new = validate_name(new)?;
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                if !playlist_exists(&tx, &old)? {
                    return Err(StoreError::NotFound(format!("playlist '{old}'")));
                }
                if old == new {
                    drop(tx);
                    return load_playlist(conn, &old)?
                        .ok_or_else(|| StoreError::NotFound(format!("playlist '{old}'")));
                }
                if playlist_exists(&tx, &new)? {
                    return Err(StoreError::AlreadyExists(format!("playlist '{new}'")));
                }
                let referencing = schedules_referencing(&tx, &old, false)?;
                if !referencing.is_empty() {
                    return Err(StoreError::Referenced { playlist: old, schedules: referencing });
                }
                let now = unix_ms() as i64;
                tx.execute(
                    "UPDATE playlists SET name = ?2, updated_at = ?3 WHERE name = ?1",
                    params![old, new, now],
                )?;
                tx.execute(
                    "UPDATE playlist_items SET playlist_name = ?2 WHERE playlist_name = ?1",
                    params![old, new],
                )?;
                tx.commit()?;
                info!("playlist renamed '{old}' -> '{new}'");
                load_playlist(conn, &new)?.ok_or_else(|| StoreError::NotFound(format!("playlist '{new}'")))
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn input(name: &str, files: &[&str]) -> PlaylistInput {
        PlaylistInput {
            name: name.into(),
            items: files
                .iter()
                .map(|f| PlaylistItem {
                    file: f.to_string(),
                    duration_seconds: 0.0,
                    transition: Transition::None,
                })
                .collect(),
            settings: PlaylistSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::input;
    use super::*;
    use crate::db::testing::temp_db;
    use crate::schedule::{ScheduleInput, ScheduleStore};

    async fn store() -> (PlaylistStore, tempfile::TempDir, tempfile::TempDir) {
        let (db, db_dir) = temp_db().await;
        let media_dir = tempfile::tempdir().unwrap();
        std::fs::write(media_dir.path().join("a.mp4"), b"x").unwrap();
        std::fs::write(media_dir.path().join("b.jpg"), b"x").unwrap();
        (PlaylistStore::new(db, MediaLibrary::new(media_dir.path())), db_dir, media_dir)
    }

    fn schedule_for(playlist: &str, enabled: bool) -> ScheduleInput {
        ScheduleInput {
            name: format!("{playlist} slot"),
            playlist_name: playlist.into(),
            start_time: "09:00".into(),
            end_time: "17:00".into(),
            days: vec![1, 2, 3, 4, 5],
            enabled,
            conflict_behavior: None,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_item_order_and_settings() {
        let (store, _d, _m) = store().await;
        let mut inp = input("Lobby", &["b.jpg", "a.mp4"]);
        inp.items[0].duration_seconds = 8.0;
        inp.items[0].transition = Transition::Fade;
        inp.settings.looping = true;

        let out = store.upsert(inp).await.unwrap();
        assert!(out.created);
        assert!(out.warnings.is_empty());

        let got = store.get("Lobby").await.unwrap().unwrap();
        let files: Vec<_> = got.items.iter().map(|i| i.file.as_str()).collect();
        assert_eq!(files, vec!["b.jpg", "a.mp4"]);
        assert_eq!(got.items[0].transition, Transition::Fade);
        assert_eq!(got.items[0].duration_seconds, 8.0);
        assert!(got.settings.looping);
        assert!(got.settings.auto_advance);
    }

    #[tokio::test]
    async fn replacing_keeps_created_at_and_reports_missing_media() {
        let (store, _d, _m) = store().await;
        let first = store.upsert(input("Lobby", &["a.mp4"])).await.unwrap();

        let second = store.upsert(input("Lobby", &["a.mp4", "gone.mp4"])).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.playlist.created_at, first.playlist.created_at);
        assert_eq!(second.playlist.items.len(), 2);
        assert_eq!(second.warnings, vec!["media file not found: gone.mp4".to_string()]);
    }

    #[tokio::test]
    async fn rejects_bad_names_and_durations() {
        let (store, _d, _m) = store().await;
        assert!(matches!(store.upsert(input("  ", &[])).await, Err(StoreError::Invalid(_))));
        assert!(matches!(store.upsert(input("a/b", &[])).await, Err(StoreError::Invalid(_))));

        let mut inp = input("Lobby", &["a.mp4"]);
        inp.items[0].duration_seconds = -1.0;
        assert!(matches!(store.upsert(inp).await, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn delete_fails_while_an_enabled_schedule_references_it() {
        let (store, _d, _m) = store().await;
        store.upsert(input("Ads", &["a.mp4"])).await.unwrap();
        let schedules = ScheduleStore::new(store.db.clone());
        let sched = schedules.create(schedule_for("Ads", true)).await.unwrap();

        match store.delete("Ads").await {
            Err(StoreError::Referenced { playlist, schedules }) => {
                assert_eq!(playlist, "Ads");
                assert_eq!(schedules, vec!["Ads slot".to_string()]);
            }
            other => panic!("expected Referenced, got {other:?}"),
        }
        assert!(store.exists("Ads").await.unwrap());

        // Disabling the schedule lifts the block.
        schedules.set_enabled(sched.id, false).await.unwrap();
        store.delete("Ads").await.unwrap();
        assert!(!store.exists("Ads").await.unwrap());
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let (store, _d, _m) = store().await;
        assert!(matches!(store.delete("nope").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn rename_is_refused_once_a_schedule_refers_to_the_playlist() {
        let (store, _d, _m) = store().await;
        store.upsert(input("Ads", &["a.mp4"])).await.unwrap();
        store.upsert(input("Free", &["b.jpg"])).await.unwrap();
        let schedules = ScheduleStore::new(store.db.clone());
        schedules.create(schedule_for("Ads", false)).await.unwrap();

        assert!(matches!(
            store.rename("Ads", "Promos").await,
            Err(StoreError::Referenced { .. })
        ));
        assert!(matches!(
            store.rename("Free", "Ads").await,
            Err(StoreError::AlreadyExists(_))
        ));

        let renamed = store.rename("Free", "Gallery").await.unwrap();
        assert_eq!(renamed.name, "Gallery");
        assert_eq!(renamed.items.len(), 1);
        assert!(!store.exists("Free").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_sorted_by_name() {
        let (store, _d, _m) = store().await;
        store.upsert(input("Zeta", &[])).await.unwrap();
        store.upsert(input("Alpha", &["a.mp4"])).await.unwrap();
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Alpha", "Zeta"]);
    }
}
