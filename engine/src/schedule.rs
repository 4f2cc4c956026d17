//! Weekly schedule records: window arithmetic and the SQLite store.
//!
//! A window is `[start, end)` in local wall-clock time. When `end < start`
//! the window runs past midnight and the tail belongs to the following
//! weekday, so "Fri 22:00-02:00" covers Saturday 01:30 but not Friday 01:30.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Duration, PrimitiveDateTime, Time};
use tracing::info;

use crate::db::Db;
use crate::error::{ScheduleError, StoreError};
use crate::playlist::playlist_exists;
use crate::status::unix_ms;

time::serde::format_description!(hhmm, Time, "[hour]:[minute]");

const MINUTES_PER_DAY: u32 = 24 * 60;
const MINUTES_PER_WEEK: u32 = 7 * MINUTES_PER_DAY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub playlist_name: String,
    #[serde(with = "hhmm")]
    pub start_time: Time,
    #[serde(with = "hhmm")]
    pub end_time: Time,
    /// Weekday numbers, 0 = Sunday.
    pub days: BTreeSet<u8>,
    pub enabled: bool,
    pub created_at: u64,
    /// Strictly increasing across the table; doubles as a modification order.
    pub updated_at: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleInput {
    pub name: String,
    pub playlist_name: String,
    pub start_time: String,
    pub end_time: String,
    pub days: Vec<u8>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// `"ignore"` (the default) saves overlapping windows and reports them;
    /// anything else refuses the save.
    #[serde(default)]
    pub conflict_behavior: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleInput {
    fn rejects_conflicts(&self) -> bool {
        self.conflict_behavior
            .as_deref()
            .is_some_and(|b| !b.trim().eq_ignore_ascii_case("ignore"))
    }
}

/// Another enabled schedule whose window overlaps the one just saved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub schedule_id: i64,
    pub schedule_name: String,
    pub playlist_name: String,
}

/// A schedule as shown on listings.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleView {
    #[serde(flatten)]
    pub schedule: Schedule,
    pub active: bool,
    /// Next window start in local time, `YYYY-MM-DD HH:MM`.
    pub next_start: Option<String>,
}

fn minute_of_day(t: Time) -> u32 {
    t.hour() as u32 * 60 + t.minute() as u32
}

pub fn parse_hhmm(s: &str) -> Result<Time, ScheduleError> {
    Time::parse(s.trim(), format_description!("[hour]:[minute]"))
        .map_err(|_| ScheduleError::InvalidTime(s.to_string()))
}

fn format_hhmm(t: Time) -> String {
    format!("{:02}:{:02}", t.hour(), t.minute())
}

pub fn format_local(dt: PrimitiveDateTime) -> String {
    format!(
        "{} {:02}:{:02}",
        dt.date(),
        dt.time().hour(),
        dt.time().minute()
    )
}

impl Schedule {
    pub fn contains(&self, now: PrimitiveDateTime) -> bool {
        let today = now.weekday().number_days_from_sunday();
        let yesterday = (today + 6) % 7;
        let m = minute_of_day(now.time());
        let start = minute_of_day(self.start_time);
        let end = minute_of_day(self.end_time);

        if start < end {
            self.days.contains(&today) && m >= start && m < end
        } else {
            (self.days.contains(&today) && m >= start) || (self.days.contains(&yesterday) && m < end)
        }
    }

    /// `[from, to)` minute-of-week intervals, Sunday 00:00 = 0.
    fn week_intervals(&self) -> Vec<(u32, u32)> {
        let start = minute_of_day(self.start_time);
        let end = minute_of_day(self.end_time);
        let mut out = Vec::new();
        for &day in &self.days {
            let base = day as u32 * MINUTES_PER_DAY;
            let from = base + start;
            let to = if start < end { base + end } else { base + MINUTES_PER_DAY + end };
            if to > MINUTES_PER_WEEK {
                out.push((from, MINUTES_PER_WEEK));
                out.push((0, to - MINUTES_PER_WEEK));
            } else {
                out.push((from, to));
            }
        }
        out
    }

    pub fn overlaps(&self, other: &Schedule) -> bool {
        let mine = self.week_intervals();
        let theirs = other.week_intervals();
        mine.iter()
            .any(|(a0, a1)| theirs.iter().any(|(b0, b1)| a0 < b1 && b0 < a1))
    }

    /// First window start strictly after `now`.
    pub fn next_start(&self, now: PrimitiveDateTime) -> Option<PrimitiveDateTime> {
        (0..=7).find_map(|offset| {
            let date = now.date().checked_add(Duration::days(offset))?;
            let candidate = PrimitiveDateTime::new(date, self.start_time);
            let day = date.weekday().number_days_from_sunday();
            (self.days.contains(&day) && candidate > now).then_some(candidate)
        })
    }

    pub fn view(self, now: PrimitiveDateTime) -> ScheduleView {
        let active = self.enabled && self.contains(now);
        let next_start = if self.enabled { self.next_start(now).map(format_local) } else { None };
        ScheduleView { schedule: self, active, next_start }
    }
}

struct Validated {
    name: String,
    playlist_name: String,
    start_time: Time,
    end_time: Time,
    days: BTreeSet<u8>,
    enabled: bool,
    reject_conflicts: bool,
}

impl Validated {
    /// The schedule as it would be stored under `id`, for overlap checks.
    fn candidate(&self, id: i64) -> Schedule {
        Schedule {
            id,
            name: self.name.clone(),
            playlist_name: self.playlist_name.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            days: self.days.clone(),
            enabled: self.enabled,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn conflicts(&self, conn: &Connection, id: i64) -> Result<Vec<Conflict>, StoreError> {
        if !self.reject_conflicts {
            return Ok(Vec::new());
        }
        Ok(conflicts_among(&self.candidate(id), load_where(conn, "WHERE enabled = 1")?))
    }
}

fn conflicts_among(schedule: &Schedule, others: Vec<Schedule>) -> Vec<Conflict> {
    if !schedule.enabled {
        return Vec::new();
    }
    others
        .into_iter()
        .filter(|o| o.id != schedule.id && o.overlaps(schedule))
        .map(|o| Conflict {
            schedule_id: o.id,
            schedule_name: o.name,
            playlist_name: o.playlist_name,
        })
        .collect()
}

fn validate(input: &ScheduleInput) -> Result<Validated, ScheduleError> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(StoreError::Invalid("schedule name is empty".into()).into());
    }
    let playlist_name = input.playlist_name.trim();
    if playlist_name.is_empty() {
        return Err(ScheduleError::PlaylistNotFound(String::new()));
    }

    let start_time = parse_hhmm(&input.start_time)?;
    let end_time = parse_hhmm(&input.end_time)?;
    if start_time == end_time {
        return Err(ScheduleError::InvalidWindow(format!(
            "start and end are both {}",
            format_hhmm(start_time)
        )));
    }

    if input.days.is_empty() {
        return Err(ScheduleError::InvalidDays("at least one day is required".into()));
    }
    if let Some(bad) = input.days.iter().find(|d| **d > 6) {
        return Err(ScheduleError::InvalidDays(format!("{bad} is not a weekday number (0-6)")));
    }

    Ok(Validated {
        name: name.to_string(),
        playlist_name: playlist_name.to_string(),
        start_time,
        end_time,
        days: input.days.iter().copied().collect(),
        enabled: input.enabled,
        reject_conflicts: input.rejects_conflicts(),
    })
}

type RawRow = (i64, String, String, String, String, String, i64, i64, i64);

const SELECT_COLUMNS: &str = "SELECT id, name, playlist_name, start_time, end_time, days, enabled, \
                              created_at, updated_at FROM schedules";

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn from_raw(raw: RawRow) -> Result<Schedule, StoreError> {
    let (id, name, playlist_name, start, end, days, enabled, created_at, updated_at) = raw;
    let parse = |s: &str| {
        parse_hhmm(s).map_err(|_| StoreError::Invalid(format!("schedule {id} has bad time '{s}'")))
    };
    Ok(Schedule {
        id,
        name,
        playlist_name,
        start_time: parse(&start)?,
        end_time: parse(&end)?,
        days: serde_json::from_str(&days)?,
        enabled: enabled != 0,
        created_at: created_at as u64,
        updated_at: updated_at as u64,
    })
}

fn load_one(conn: &Connection, id: i64) -> Result<Option<Schedule>, StoreError> {
    let raw = conn
        .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![id], read_raw)
        .optional()?;
    raw.map(from_raw).transpose()
}

fn load_where(conn: &Connection, filter: &str) -> Result<Vec<Schedule>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} {filter} ORDER BY id ASC"))?;
    let raws = stmt.query_map([], read_raw)?.collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(from_raw).collect()
}

/// Next modification stamp: wall-clock millis, bumped past the newest row so
/// two edits in the same millisecond still order.
fn next_stamp(conn: &Connection) -> rusqlite::Result<i64> {
    let newest: i64 =
        conn.query_row("SELECT COALESCE(MAX(updated_at), 0) FROM schedules", [], |r| r.get(0))?;
    Ok((unix_ms() as i64).max(newest + 1))
}

enum Write {
    Saved(Schedule),
    MissingPlaylist(String),
    MissingSchedule,
    Conflicts(Vec<Conflict>),
}

fn finish(id: i64, w: Write) -> Result<Schedule, ScheduleError> {
    match w {
        Write::Saved(s) => Ok(s),
        Write::MissingPlaylist(p) => Err(ScheduleError::PlaylistNotFound(p)),
        Write::MissingSchedule => Err(ScheduleError::NotFound(id)),
        Write::Conflicts(c) => Err(ScheduleError::Conflicts(c)),
    }
}

#[derive(Clone)]
pub struct ScheduleStore {
    db: Db,
}

impl ScheduleStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> Result<Vec<Schedule>, ScheduleError> {
        Ok(self.db.call(|conn| load_where(conn, "")).await?)
    }

    pub async fn list_enabled(&self) -> Result<Vec<Schedule>, ScheduleError> {
        Ok(self.db.call(|conn| load_where(conn, "WHERE enabled = 1")).await?)
    }

    pub async fn get(&self, id: i64) -> Result<Schedule, ScheduleError> {
        self.db
            .call(move |conn| load_one(conn, id))
            .await?
            .ok_or(ScheduleError::NotFound(id))
    }

    pub async fn create(&self, input: ScheduleInput) -> Result<Schedule, ScheduleError> {
        let v = validate(&input)?;
        let w = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                if !playlist_exists(&tx, &v.playlist_name)? {
                    return Ok(Write::MissingPlaylist(v.playlist_name));
                }
                let conflicts = v.conflicts(&tx, 0)?;
                if !conflicts.is_empty() {
                    return Ok(Write::Conflicts(conflicts));
                }
                let now = next_stamp(&tx)?;
                tx.execute(
                    "INSERT INTO schedules (name, playlist_name, start_time, end_time, days, enabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        v.name,
                        v.playlist_name,
                        format_hhmm(v.start_time),
                        format_hhmm(v.end_time),
                        serde_json::to_string(&v.days)?,
                        v.enabled as i64,
                        now
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(load_one(conn, id)?.map_or(Write::MissingSchedule, Write::Saved))
            })
            .await?;
        let s = finish(0, w)?;
        info!("schedule created #{} '{}' -> '{}'", s.id, s.name, s.playlist_name);
        Ok(s)
    }

    pub async fn update(&self, id: i64, input: ScheduleInput) -> Result<Schedule, ScheduleError> {
        let v = validate(&input)?;
        let w = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                if load_one(&tx, id)?.is_none() {
                    return Ok(Write::MissingSchedule);
                }
                if !playlist_exists(&tx, &v.playlist_name)? {
                    return Ok(Write::MissingPlaylist(v.playlist_name));
                }
                let conflicts = v.conflicts(&tx, id)?;
                if !conflicts.is_empty() {
                    return Ok(Write::Conflicts(conflicts));
                }
                let now = next_stamp(&tx)?;
                tx.execute(
                    "UPDATE schedules SET name = ?2, playlist_name = ?3, start_time = ?4, end_time = ?5,
                       days = ?6, enabled = ?7, updated_at = ?8
                     WHERE id = ?1",
                    params![
                        id,
                        v.name,
                        v.playlist_name,
                        format_hhmm(v.start_time),
                        format_hhmm(v.end_time),
                        serde_json::to_string(&v.days)?,
                        v.enabled as i64,
                        now
                    ],
                )?;
                tx.commit()?;
                Ok(load_one(conn, id)?.map_or(Write::MissingSchedule, Write::Saved))
            })
            .await?;
        let s = finish(id, w)?;
        info!("schedule updated #{} '{}'", s.id, s.name);
        Ok(s)
    }

    pub async fn delete(&self, id: i64) -> Result<(), ScheduleError> {
        let n = self
            .db
            .call(move |conn| Ok(conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?))
            .await?;
        if n == 0 {
            return Err(ScheduleError::NotFound(id));
        }
        info!("schedule deleted #{id}");
        Ok(())
    }

    /// Enabling re-checks the playlist, which may have been deleted while
    /// the schedule was off.
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<Schedule, ScheduleError> {
        let w = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(current) = load_one(&tx, id)? else {
                    return Ok(Write::MissingSchedule);
                };
                if current.enabled == enabled {
                    return Ok(Write::Saved(current));
                }
                if enabled && !playlist_exists(&tx, &current.playlist_name)? {
                    return Ok(Write::MissingPlaylist(current.playlist_name));
                }
                let now = next_stamp(&tx)?;
                tx.execute(
                    "UPDATE schedules SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, enabled as i64, now],
                )?;
                tx.commit()?;
                Ok(load_one(conn, id)?.map_or(Write::MissingSchedule, Write::Saved))
            })
            .await?;
        let s = finish(id, w)?;
        info!("schedule #{} {}", s.id, if s.enabled { "enabled" } else { "disabled" });
        Ok(s)
    }

    pub async fn toggle(&self, id: i64) -> Result<Schedule, ScheduleError> {
        let current = self.get(id).await?;
        self.set_enabled(id, !current.enabled).await
    }

    /// Enabled schedules (other than `schedule` itself) whose windows overlap it.
    pub async fn conflicts_for(&self, schedule: &Schedule) -> Result<Vec<Conflict>, ScheduleError> {
        if !schedule.enabled {
            return Ok(Vec::new());
        }
        Ok(conflicts_among(schedule, self.list_enabled().await?))
    }
}
