//! Player backends behind one command/status contract.
//!
//! Each backend speaks its own wire protocol (VLC: HTTP + XML, mpv: JSON IPC
//! on a unix socket). The rest of the engine only sees [`PlayerAdapter`],
//! [`Command`] and the canonical [`PlaybackStatus`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, ControllerError};
use crate::status::PlaybackStatus;

pub mod mpv;
pub mod vlc;

pub use mpv::MpvAdapter;
pub use vlc::VlcAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vlc,
    Mpv,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Vlc => "vlc",
            BackendKind::Mpv => "mpv",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vlc" => Ok(BackendKind::Vlc),
            "mpv" => Ok(BackendKind::Mpv),
            _ => Err(ControllerError::UnknownBackend(s.to_string())),
        }
    }
}

/// One entry of a playlist, already resolved to a file on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadItem {
    pub path: PathBuf,
    /// 0 means "play the file for its natural length".
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Seek(f64),
    SetVolume(u8),
    /// Replace the backend playlist with these items (does not start playback).
    LoadPlaylist(Vec<LoadItem>),
    /// Add one item at the end of the backend playlist.
    AppendItem(LoadItem),
    /// Empty the backend playlist.
    ClearPlaylist,
    SetLoop(bool),
    SetShuffle(bool),
    SetFullscreen(bool),
    /// When false the backend holds the last frame of each item instead of
    /// moving on.
    SetAutoAdvance(bool),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Play => "play",
            Command::Pause => "pause",
            Command::Stop => "stop",
            Command::Next => "next",
            Command::Previous => "previous",
            Command::Seek(_) => "seek",
            Command::SetVolume(_) => "set_volume",
            Command::LoadPlaylist(_) => "load_playlist",
            Command::AppendItem(_) => "append_item",
            Command::ClearPlaylist => "clear_playlist",
            Command::SetLoop(_) => "set_loop",
            Command::SetShuffle(_) => "set_shuffle",
            Command::SetFullscreen(_) => "set_fullscreen",
            Command::SetAutoAdvance(_) => "set_auto_advance",
        }
    }
}

/// What a backend can do beyond plain transport control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub seek: bool,
    pub volume: bool,
    pub looping: bool,
    pub shuffle: bool,
    pub fullscreen: bool,
    /// Honors `LoadItem::duration_seconds` (image/still display time).
    pub item_durations: bool,
    pub auto_advance: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        seek: true,
        volume: true,
        looping: true,
        shuffle: true,
        fullscreen: true,
        item_durations: true,
        auto_advance: true,
    };

    pub fn supports(&self, cmd: &Command) -> bool {
        match cmd {
            Command::Play
            | Command::Pause
            | Command::Stop
            | Command::Next
            | Command::Previous
            | Command::LoadPlaylist(_)
            | Command::AppendItem(_)
            | Command::ClearPlaylist => true,
            Command::Seek(_) => self.seek,
            Command::SetVolume(_) => self.volume,
            Command::SetLoop(_) => self.looping,
            Command::SetShuffle(_) => self.shuffle,
            Command::SetFullscreen(_) => self.fullscreen,
            Command::SetAutoAdvance(_) => self.auto_advance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub backend: BackendKind,
    pub command: &'static str,
}

#[async_trait]
pub trait PlayerAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// Apply one command. Implementations validate everything they can before
    /// the first byte goes out.
    async fn send_command(&self, cmd: &Command) -> Result<Ack, AdapterError>;

    async fn query_status(&self) -> Result<PlaybackStatus, AdapterError>;
}

/// The set of configured backends, keyed by kind.
#[derive(Clone, Default)]
pub struct Adapters {
    inner: HashMap<BackendKind, Arc<dyn PlayerAdapter>>,
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn PlayerAdapter>) -> Self {
        self.inner.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn PlayerAdapter>> {
        self.inner.get(&kind).cloned()
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.inner.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.inner.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

/// Run an adapter call under a hard deadline; a deadline miss is a typed
/// `Timeout`, never a hang.
pub async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AdapterError::Timeout(limit))?
}

/// Reject values no backend can act on, before any request goes out.
pub(crate) fn validate_command(cmd: &Command) -> Result<(), AdapterError> {
    match cmd {
        Command::Seek(pos) if !pos.is_finite() || *pos < 0.0 => {
            Err(AdapterError::Rejected(format!("invalid seek position {pos}")))
        }
        Command::SetVolume(p) if *p > 100 => {
            Err(AdapterError::Rejected(format!("volume {p} is outside 0-100")))
        }
        Command::LoadPlaylist(items) if items.is_empty() => {
            Err(AdapterError::Rejected("nothing to load".into()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory adapter used by controller, cache and scheduler tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::sync::watch;

    use super::*;
    use crate::status::PlayState;

    #[derive(Debug, Clone)]
    pub enum Behavior {
        Succeed,
        Fail(AdapterError),
        Hang,
    }

    pub struct FakeAdapter {
        kind: BackendKind,
        caps: Capabilities,
        commands: Mutex<Vec<Command>>,
        command_behavior: Mutex<Behavior>,
        status_behavior: Mutex<Behavior>,
        delay: Mutex<Duration>,
        observer: Mutex<Option<watch::Receiver<BackendKind>>>,
        mid_command_changes: AtomicUsize,
        status_calls: AtomicUsize,
    }

    impl FakeAdapter {
        pub fn new(kind: BackendKind) -> Arc<Self> {
            Arc::new(Self::with_capabilities(kind, Capabilities::ALL))
        }

        pub fn with_capabilities(kind: BackendKind, caps: Capabilities) -> Self {
            Self {
                kind,
                caps,
                commands: Mutex::new(Vec::new()),
                command_behavior: Mutex::new(Behavior::Succeed),
                status_behavior: Mutex::new(Behavior::Succeed),
                delay: Mutex::new(Duration::ZERO),
                observer: Mutex::new(None),
                mid_command_changes: AtomicUsize::new(0),
                status_calls: AtomicUsize::new(0),
            }
        }

        pub fn commands(&self) -> Vec<Command> {
            self.commands.lock().unwrap().clone()
        }

        pub fn command_names(&self) -> Vec<&'static str> {
            self.commands().iter().map(Command::name).collect()
        }

        pub fn clear(&self) {
            self.commands.lock().unwrap().clear();
        }

        pub fn set_command_behavior(&self, b: Behavior) {
            *self.command_behavior.lock().unwrap() = b;
        }

        pub fn set_status_behavior(&self, b: Behavior) {
            *self.status_behavior.lock().unwrap() = b;
        }

        pub fn set_delay(&self, d: Duration) {
            *self.delay.lock().unwrap() = d;
        }

        /// Watch the controller's active backend while commands are in flight.
        pub fn observe(&self, rx: watch::Receiver<BackendKind>) {
            *self.observer.lock().unwrap() = Some(rx);
        }

        pub fn mid_command_changes(&self) -> usize {
            self.mid_command_changes.load(Ordering::SeqCst)
        }

        pub fn status_calls(&self) -> usize {
            self.status_calls.load(Ordering::SeqCst)
        }
    }

    async fn act(behavior: Behavior) -> Result<(), AdapterError> {
        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(e) => Err(e),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    #[async_trait]
    impl PlayerAdapter for FakeAdapter {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        async fn send_command(&self, cmd: &Command) -> Result<Ack, AdapterError> {
            self.commands.lock().unwrap().push(cmd.clone());
            let before = self.observer.lock().unwrap().as_ref().map(|rx| *rx.borrow());

            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let behavior = self.command_behavior.lock().unwrap().clone();
            act(behavior).await?;

            let after = self.observer.lock().unwrap().as_ref().map(|rx| *rx.borrow());
            if before != after {
                self.mid_command_changes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Ack { backend: self.kind, command: cmd.name() })
        }

        async fn query_status(&self) -> Result<PlaybackStatus, AdapterError> {
            let n = self.status_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.status_behavior.lock().unwrap().clone();
            act(behavior).await?;
            Ok(PlaybackStatus {
                state: PlayState::Playing,
                current_item: Some(format!("clip-{n}.mp4")),
                position_seconds: 10.0,
                duration_seconds: 60.0,
                volume_percent: 80,
                ..PlaybackStatus::unknown(self.kind)
            }
            .sampled_now())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("VLC".parse::<BackendKind>().unwrap(), BackendKind::Vlc);
        assert_eq!(" mpv ".parse::<BackendKind>().unwrap(), BackendKind::Mpv);
        assert!(matches!(
            "omxplayer".parse::<BackendKind>(),
            Err(ControllerError::UnknownBackend(s)) if s == "omxplayer"
        ));
    }

    #[test]
    fn capabilities_gate_optional_commands_only() {
        let caps = Capabilities { seek: false, item_durations: false, ..Capabilities::ALL };
        assert!(caps.supports(&Command::Play));
        assert!(caps.supports(&Command::LoadPlaylist(Vec::new())));
        assert!(!caps.supports(&Command::Seek(3.0)));
        assert!(caps.supports(&Command::SetVolume(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_turns_a_hang_into_timeout() {
        let limit = Duration::from_secs(2);
        let res: Result<(), AdapterError> = bounded(limit, std::future::pending()).await;
        assert_eq!(res, Err(AdapterError::Timeout(limit)));
    }
}
