//! Schedule engine: on every tick, pick the schedule that owns "now" and make
//! the player match it.
//!
//! The engine only acts on changes. It remembers which playlist it put on
//! screen and stays quiet while that is still the right answer, even if a
//! user has since loaded something else by hand.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{Datelike, Timelike};
use serde::Serialize;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::controller::{LoadOrigin, PlayerController};
use crate::playlist::PlaylistStore;
use crate::schedule::{format_local, Schedule, ScheduleStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveSchedule {
    pub id: i64,
    pub name: String,
}

/// Scheduler status panel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineTelemetry {
    pub ticks: u64,
    /// Local time of the last evaluation, `YYYY-MM-DD HH:MM`.
    pub last_tick: Option<String>,
    pub current_playlist: Option<String>,
    pub active_schedule: Option<ActiveSchedule>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing scheduled and nothing of ours playing.
    Idle,
    Loaded { schedule_id: i64, playlist: String },
    Unchanged { playlist: String },
    Stopped,
    Failed(String),
}

/// The playlist the engine itself last put on screen.
#[derive(Default)]
struct EngineState {
    current: Option<String>,
}

pub struct ScheduleEngine {
    controller: Arc<PlayerController>,
    schedules: ScheduleStore,
    playlists: PlaylistStore,
    clock: LocalClock,
    tick: Duration,
    state: Mutex<EngineState>,
    telemetry: RwLock<EngineTelemetry>,
}

/// Most recently modified first; the higher id breaks exact ties.
fn by_precedence(a: &&Schedule, b: &&Schedule) -> std::cmp::Ordering {
    b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id))
}

/// Where "now" comes from when matching schedule windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalClock {
    /// The host's time zone, re-read on every call so DST changes apply
    /// without a restart.
    Host,
    /// A fixed offset from UTC, for hosts whose zone is wrong or unset.
    Fixed(UtcOffset),
}

impl LocalClock {
    pub fn now(&self) -> PrimitiveDateTime {
        match self {
            LocalClock::Host => wall_clock(&chrono::Local::now()).unwrap_or_else(|| {
                warn!("scheduler: host time is out of range, falling back to UTC");
                LocalClock::Fixed(UtcOffset::UTC).now()
            }),
            LocalClock::Fixed(offset) => {
                let now = OffsetDateTime::now_utc().to_offset(*offset);
                PrimitiveDateTime::new(now.date(), now.time())
            }
        }
    }
}

impl fmt::Display for LocalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalClock::Host => f.write_str("host local time"),
            LocalClock::Fixed(offset) => write!(f, "UTC{offset}"),
        }
    }
}

/// Wall-clock reading of a zoned instant, at second precision.
pub fn wall_clock<Tz: chrono::TimeZone>(at: &chrono::DateTime<Tz>) -> Option<PrimitiveDateTime> {
    let local = at.naive_local();
    let month = Month::try_from(local.month() as u8).ok()?;
    let date = Date::from_calendar_date(local.year(), month, local.day() as u8).ok()?;
    let time = Time::from_hms(local.hour() as u8, local.minute() as u8, local.second() as u8).ok()?;
    Some(PrimitiveDateTime::new(date, time))
}

impl ScheduleEngine {
    pub fn new(
        controller: Arc<PlayerController>,
        schedules: ScheduleStore,
        playlists: PlaylistStore,
        clock: LocalClock,
        tick: Duration,
    ) -> Self {
        Self {
            controller,
            schedules,
            playlists,
            clock,
            tick,
            state: Mutex::new(EngineState::default()),
            telemetry: RwLock::new(EngineTelemetry::default()),
        }
    }

    pub fn clock(&self) -> LocalClock {
        self.clock
    }

    pub fn now(&self) -> PrimitiveDateTime {
        self.clock.now()
    }

    pub fn telemetry(&self) -> EngineTelemetry {
        self.telemetry.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, f: impl FnOnce(&mut EngineTelemetry)) {
        let mut t = self.telemetry.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut t);
    }

    fn fail(&self, msg: String) -> TickOutcome {
        warn!("scheduler: {msg}");
        self.record(|t| t.last_error = Some(msg.clone()));
        TickOutcome::Failed(msg)
    }

    /// A stored playlist changed; reload it on the next tick if it is ours.
    pub async fn invalidate(&self, playlist: &str) {
        let mut st = self.state.lock().await;
        if st.current.as_deref() == Some(playlist) {
            debug!("scheduler: '{playlist}' changed, will reload");
            st.current = None;
        }
    }

    /// Evaluate the schedules at local time `now` and act on the result.
    pub async fn tick_at(&self, now: PrimitiveDateTime) -> TickOutcome {
        self.record(|t| {
            t.ticks += 1;
            t.last_tick = Some(format_local(now));
        });

        let enabled = match self.schedules.list_enabled().await {
            Ok(s) => s,
            Err(e) => return self.fail(format!("loading schedules failed: {e}")),
        };

        let mut candidates: Vec<&Schedule> = enabled.iter().filter(|s| s.contains(now)).collect();
        candidates.sort_by(by_precedence);

        let mut winner = None;
        for c in candidates {
            match self.playlists.exists(&c.playlist_name).await {
                Ok(true) => {
                    winner = Some(c);
                    break;
                }
                Ok(false) => warn!(
                    "scheduler: schedule #{} '{}' points at missing playlist '{}', skipping",
                    c.id, c.name, c.playlist_name
                ),
                Err(e) => return self.fail(format!("checking playlist '{}' failed: {e}", c.playlist_name)),
            }
        }

        let mut st = self.state.lock().await;
        let outcome = match winner {
            Some(s) if st.current.as_deref() == Some(s.playlist_name.as_str()) => {
                TickOutcome::Unchanged { playlist: s.playlist_name.clone() }
            }
            Some(s) => match self.controller.load_playlist(&s.playlist_name, LoadOrigin::Schedule).await {
                Ok(_) => {
                    info!("scheduler: schedule #{} '{}' -> playlist '{}'", s.id, s.name, s.playlist_name);
                    st.current = Some(s.playlist_name.clone());
                    TickOutcome::Loaded { schedule_id: s.id, playlist: s.playlist_name.clone() }
                }
                Err(e) => return self.fail(format!("loading '{}' failed: {e}", s.playlist_name)),
            },
            None if st.current.is_some() => match self.controller.stop_scheduled().await {
                Ok(stopped) => {
                    info!(
                        "scheduler: window over for '{}'{}",
                        st.current.as_deref().unwrap_or_default(),
                        if stopped { "" } else { " (user playback left running)" }
                    );
                    st.current = None;
                    TickOutcome::Stopped
                }
                Err(e) => return self.fail(format!("stopping scheduled playback failed: {e}")),
            },
            None => TickOutcome::Idle,
        };

        let current = st.current.clone();
        let active = winner.map(|s| ActiveSchedule { id: s.id, name: s.name.clone() });
        self.record(|t| {
            t.current_playlist = current;
            t.active_schedule = active;
            t.last_error = None;
        });
        outcome
    }

    /// Tick forever. Each tick stands alone; failures are retried next time.
    pub async fn run(self: Arc<Self>) {
        info!("scheduler: ticking every {:?} on {}", self.tick, self.clock);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = self.tick_at(self.clock.now()).await;
            debug!("scheduler: tick -> {outcome:?}");
        }
    }
}
