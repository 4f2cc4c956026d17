//! Canonical playback status and the polling cache in front of the backends.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapter::{bounded, Adapters, BackendKind};
use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub state: PlayState,
    pub current_item: Option<String>,
    pub position_seconds: f64,
    /// 0 means unknown.
    pub duration_seconds: f64,
    pub volume_percent: u8,
    pub backend: BackendKind,
    /// Unix millis when the backend was sampled; `None` if it never was.
    pub timestamp: Option<u64>,
    pub stale: bool,
}

impl PlaybackStatus {
    pub fn unknown(backend: BackendKind) -> Self {
        Self {
            state: PlayState::Unknown,
            current_item: None,
            position_seconds: 0.0,
            duration_seconds: 0.0,
            volume_percent: 0,
            backend,
            timestamp: None,
            stale: false,
        }
    }

    /// Stamp with the current time and enforce the value invariants.
    pub fn sampled_now(mut self) -> Self {
        self.timestamp = Some(unix_ms());
        self.normalized()
    }

    pub fn normalized(mut self) -> Self {
        let clean = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        self.duration_seconds = clean(self.duration_seconds);
        self.position_seconds = clean(self.position_seconds);
        if self.duration_seconds > 0.0 && self.position_seconds > self.duration_seconds {
            self.position_seconds = self.duration_seconds;
        }
        self.volume_percent = self.volume_percent.min(100);
        self
    }
}

pub(crate) fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Operator-facing poll health, one per backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStats {
    pub polls: u64,
    pub last_success_ms: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct CacheEntry {
    last_good: Option<PlaybackStatus>,
    good_at: Option<Instant>,
    last_poll_failed: bool,
    stats: PollStats,
}

/// Last known status per backend, refreshed by a background poll of the
/// active backend. Reads never touch the network.
pub struct StatusCache {
    adapters: Adapters,
    active: watch::Receiver<BackendKind>,
    interval: Duration,
    timeout: Duration,
    entries: RwLock<HashMap<BackendKind, CacheEntry>>,
}

impl StatusCache {
    pub fn new(
        adapters: Adapters,
        active: watch::Receiver<BackendKind>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            adapters,
            active,
            interval,
            timeout,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Latest cached status of the active backend.
    pub fn get_status(&self) -> PlaybackStatus {
        let backend = *self.active.borrow();
        self.status_for(backend)
    }

    pub fn status_for(&self, backend: BackendKind) -> PlaybackStatus {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get(&backend) else {
            return PlaybackStatus::unknown(backend);
        };
        let Some(good) = entry.last_good.as_ref() else {
            return PlaybackStatus::unknown(backend);
        };

        let too_old = entry
            .good_at
            .map(|at| at.elapsed() > self.interval * 2)
            .unwrap_or(true);

        let mut status = good.clone();
        status.stale = entry.last_poll_failed || too_old;
        status
    }

    pub fn stats(&self) -> HashMap<BackendKind, PollStats> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|(k, e)| (*k, e.stats.clone())).collect()
    }

    /// Poll the active backend once and record the outcome.
    pub async fn poll_once(&self) -> Result<(), AdapterError> {
        let backend = *self.active.borrow();
        let Some(adapter) = self.adapters.get(backend) else {
            warn!("status poll: no adapter registered for {backend}");
            return Ok(());
        };

        let res = bounded(self.timeout, adapter.query_status()).await;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(backend).or_default();
        entry.stats.polls += 1;

        match res {
            Ok(mut status) => {
                if entry.stats.consecutive_failures > 0 {
                    info!(
                        "status poll: {backend} answering again after {} failed poll(s)",
                        entry.stats.consecutive_failures
                    );
                }
                status.backend = backend;
                status.stale = false;
                entry.stats.last_success_ms = status.timestamp.or_else(|| Some(unix_ms()));
                entry.stats.last_error = None;
                entry.stats.consecutive_failures = 0;
                entry.last_good = Some(status);
                entry.good_at = Some(Instant::now());
                entry.last_poll_failed = false;
                Ok(())
            }
            Err(e) => {
                entry.last_poll_failed = true;
                entry.stats.consecutive_failures += 1;
                entry.stats.last_error = Some(e.to_string());

                // A dead backend fails every tick; keep the log readable.
                let n = entry.stats.consecutive_failures;
                if n == 1 || n % 20 == 0 {
                    warn!("status poll: {backend} failed ({n} in a row): {e}");
                } else {
                    debug!("status poll: {backend} failed ({n} in a row): {e}");
                }
                Err(e)
            }
        }
    }

    /// Poll forever. Failures are recorded and retried on the next tick.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let _ = self.poll_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{Behavior, FakeAdapter};
    use crate::adapter::PlayerAdapter;

    const POLL: Duration = Duration::from_millis(2500);
    const TIMEOUT: Duration = Duration::from_secs(2);

    fn cache_with(fake: Arc<FakeAdapter>) -> (StatusCache, watch::Sender<BackendKind>) {
        let (tx, rx) = watch::channel(fake.kind());
        let adapters = Adapters::new().with(fake);
        (StatusCache::new(adapters, rx, POLL, TIMEOUT), tx)
    }

    #[test]
    fn normalized_clamps_position_and_volume() {
        let s = PlaybackStatus {
            position_seconds: 90.0,
            duration_seconds: 60.0,
            volume_percent: 140,
            ..PlaybackStatus::unknown(BackendKind::Vlc)
        }
        .normalized();
        assert_eq!(s.position_seconds, 60.0);
        assert_eq!(s.volume_percent, 100);

        let s = PlaybackStatus {
            position_seconds: 90.0,
            duration_seconds: f64::NAN,
            ..PlaybackStatus::unknown(BackendKind::Vlc)
        }
        .normalized();
        assert_eq!(s.duration_seconds, 0.0);
        assert_eq!(s.position_seconds, 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_before_first_poll() {
        let fake = FakeAdapter::new(BackendKind::Mpv);
        let (cache, _tx) = cache_with(fake);
        let s = cache.get_status();
        assert_eq!(s.state, PlayState::Unknown);
        assert_eq!(s.backend, BackendKind::Mpv);
        assert!(s.timestamp.is_none());
        assert!(!s.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn three_timeouts_keep_last_good_value_marked_stale() {
        let fake = FakeAdapter::new(BackendKind::Vlc);
        let (cache, _tx) = cache_with(fake.clone());

        cache.poll_once().await.unwrap();
        let good = cache.get_status();
        assert_eq!(good.state, PlayState::Playing);
        assert!(!good.stale);

        fake.set_status_behavior(Behavior::Hang);
        for _ in 0..3 {
            let err = cache.poll_once().await.unwrap_err();
            assert_eq!(err, AdapterError::Timeout(TIMEOUT));
        }

        let s = cache.get_status();
        assert!(s.stale);
        assert_eq!(s.current_item, good.current_item);
        assert_eq!(s.timestamp, good.timestamp);
        assert_eq!(cache.stats()[&BackendKind::Vlc].consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_age_into_staleness_without_failures() {
        let fake = FakeAdapter::new(BackendKind::Vlc);
        let (cache, _tx) = cache_with(fake);
        cache.poll_once().await.unwrap();

        tokio::time::advance(POLL * 2 + Duration::from_millis(1)).await;
        assert!(cache.get_status().stale);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_clears_the_stale_flag() {
        let fake = FakeAdapter::new(BackendKind::Vlc);
        let (cache, _tx) = cache_with(fake.clone());

        fake.set_status_behavior(Behavior::Fail(AdapterError::Unreachable("refused".into())));
        assert!(cache.poll_once().await.is_err());
        assert_eq!(cache.get_status().state, PlayState::Unknown);

        fake.set_status_behavior(Behavior::Succeed);
        cache.poll_once().await.unwrap();
        let s = cache.get_status();
        assert!(!s.stale);
        assert_eq!(cache.stats()[&BackendKind::Vlc].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_do_not_wait_for_a_hung_poll() {
        let fake = FakeAdapter::new(BackendKind::Mpv);
        let (cache, _tx) = cache_with(fake.clone());
        let cache = Arc::new(cache);
        cache.poll_once().await.unwrap();

        fake.set_status_behavior(Behavior::Hang);
        let poller = tokio::spawn({
            let cache = cache.clone();
            async move { cache.poll_once().await }
        });
        tokio::task::yield_now().await;

        // The poll is parked inside the adapter; the read still answers.
        let s = cache.get_status();
        assert_eq!(s.state, PlayState::Playing);
        assert!(!poller.is_finished());

        assert!(poller.await.unwrap().is_err());
        assert!(cache.get_status().stale);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_active_backend() {
        let vlc = FakeAdapter::new(BackendKind::Vlc);
        let mpv = FakeAdapter::new(BackendKind::Mpv);
        let (tx, rx) = watch::channel(BackendKind::Vlc);
        let adapters = Adapters::new().with(vlc.clone()).with(mpv.clone());
        let cache = StatusCache::new(adapters, rx, POLL, TIMEOUT);

        cache.poll_once().await.unwrap();
        tx.send_replace(BackendKind::Mpv);
        assert_eq!(cache.get_status().state, PlayState::Unknown);

        cache.poll_once().await.unwrap();
        assert_eq!(cache.get_status().backend, BackendKind::Mpv);
        assert_eq!(vlc.status_calls(), 1);
        assert_eq!(mpv.status_calls(), 1);
    }
}
