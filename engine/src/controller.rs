//! The single place that talks to the active backend.
//!
//! Every mutating path (HTTP commands, backend switches, schedule loads) goes
//! through one async mutex, so the active backend never changes underneath a
//! command and user actions never interleave with schedule transitions.
//! Observers (status cache, API) read watch-channel mirrors instead of the
//! mutex.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::adapter::{bounded, Ack, Adapters, BackendKind, Capabilities, Command, LoadItem, PlayerAdapter};
use crate::db::Db;
use crate::error::{AdapterError, ControllerError};
use crate::playlist::PlaylistStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchPhase {
    Idle,
    Stopping,
    Switching,
    Resuming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOrigin {
    User,
    Schedule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedPlaylist {
    pub name: String,
    pub origin: LoadOrigin,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchOutcome {
    pub from: BackendKind,
    pub to: BackendKind,
    /// Non-fatal problems: the old backend ignoring stop, a failed resume.
    pub warnings: Vec<String>,
    pub resumed: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub name: String,
    pub already_loaded: bool,
    /// Items whose media file could not be found.
    pub skipped: Vec<String>,
}

struct Inner {
    active: BackendKind,
    loaded: Option<LoadedPlaylist>,
}

/// Returns the phase to Idle however the switch ends.
struct PhaseReset<'a>(&'a watch::Sender<SwitchPhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.send_replace(SwitchPhase::Idle);
    }
}

pub struct PlayerController {
    adapters: Adapters,
    playlists: PlaylistStore,
    db: Db,
    timeout: Duration,
    inner: Mutex<Inner>,
    active_tx: watch::Sender<BackendKind>,
    phase_tx: watch::Sender<SwitchPhase>,
    loaded_tx: watch::Sender<Option<LoadedPlaylist>>,
}

impl PlayerController {
    pub fn new(
        adapters: Adapters,
        playlists: PlaylistStore,
        db: Db,
        initial: BackendKind,
        timeout: Duration,
    ) -> Result<Self, ControllerError> {
        if !adapters.contains(initial) {
            return Err(ControllerError::UnknownBackend(initial.to_string()));
        }
        Ok(Self {
            adapters,
            playlists,
            db,
            timeout,
            inner: Mutex::new(Inner { active: initial, loaded: None }),
            active_tx: watch::channel(initial).0,
            phase_tx: watch::channel(SwitchPhase::Idle).0,
            loaded_tx: watch::channel(None).0,
        })
    }

    pub fn active_backend(&self) -> BackendKind {
        *self.active_tx.borrow()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<BackendKind> {
        self.active_tx.subscribe()
    }

    pub fn phase(&self) -> SwitchPhase {
        *self.phase_tx.borrow()
    }

    pub fn loaded(&self) -> Option<LoadedPlaylist> {
        self.loaded_tx.borrow().clone()
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        self.adapters.kinds()
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.adapters.get(self.active_backend()).map(|a| a.capabilities())
    }

    fn set_loaded(&self, inner: &mut Inner, loaded: Option<LoadedPlaylist>) {
        inner.loaded = loaded.clone();
        self.loaded_tx.send_replace(loaded);
    }

    fn adapter_for(&self, kind: BackendKind) -> Result<std::sync::Arc<dyn PlayerAdapter>, ControllerError> {
        self.adapters
            .get(kind)
            .ok_or_else(|| ControllerError::UnknownBackend(kind.to_string()))
    }

    async fn send(&self, adapter: &dyn PlayerAdapter, cmd: &Command) -> Result<Ack, AdapterError> {
        if !adapter.capabilities().supports(cmd) {
            return Err(AdapterError::Unsupported {
                command: cmd.name(),
                backend: adapter.kind().as_str(),
            });
        }
        bounded(self.timeout, adapter.send_command(cmd)).await
    }

    /// Forward one command to the active backend. No retries: a dead backend
    /// is reported as such.
    pub async fn execute(&self, cmd: Command) -> Result<Ack, ControllerError> {
        let mut inner = self.inner.lock().await;
        let adapter = self.adapter_for(inner.active)?;
        let ack = self.send(adapter.as_ref(), &cmd).await?;
        if matches!(
            cmd,
            Command::Stop | Command::LoadPlaylist(_) | Command::AppendItem(_) | Command::ClearPlaylist
        ) {
            self.set_loaded(&mut inner, None);
        }
        Ok(ack)
    }

    /// Move playback to another backend: stop the old one, persist the
    /// choice, then optionally reload what was playing.
    pub async fn switch_backend(&self, target: &str, resume: bool) -> Result<SwitchOutcome, ControllerError> {
        let target: BackendKind = target.parse()?;
        if !self.adapters.contains(target) {
            return Err(ControllerError::UnknownBackend(target.to_string()));
        }

        let claimed = self.phase_tx.send_if_modified(|phase| {
            if *phase == SwitchPhase::Idle {
                *phase = SwitchPhase::Stopping;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ControllerError::AlreadySwitching);
        }
        let _reset = PhaseReset(&self.phase_tx);

        let mut inner = self.inner.lock().await;
        let from = inner.active;
        if from == target {
            info!("switch: {target} is already active");
            return Ok(SwitchOutcome { from, to: target, warnings: Vec::new(), resumed: None });
        }

        info!("switch: {from} -> {target} (resume={resume})");
        let mut warnings = Vec::new();
        let old = self.adapter_for(from)?;
        if let Err(e) = self.send(old.as_ref(), &Command::Stop).await {
            warn!("switch: stopping {from} failed: {e}");
            warnings.push(format!("stopping {from} failed: {e}"));
        }

        self.phase_tx.send_replace(SwitchPhase::Switching);
        self.db.save_active_backend(target).await?;
        inner.active = target;
        self.active_tx.send_replace(target);

        self.phase_tx.send_replace(SwitchPhase::Resuming);
        let previous = inner.loaded.clone();
        self.set_loaded(&mut inner, None);

        let mut resumed = None;
        if let (true, Some(prev)) = (resume, previous) {
            match self.load_locked(&mut inner, &prev.name, prev.origin).await {
                Ok(_) => resumed = Some(prev.name),
                Err(e) => {
                    warn!("switch: resuming '{}' on {target} failed: {e}", prev.name);
                    warnings.push(format!("resuming '{}' failed: {e}", prev.name));
                }
            }
        }

        info!("switch: {target} active");
        Ok(SwitchOutcome { from, to: target, warnings, resumed })
    }

    /// Load and start a stored playlist. Loading the playlist that is already
    /// loaded sends nothing.
    pub async fn load_playlist(&self, name: &str, origin: LoadOrigin) -> Result<LoadOutcome, ControllerError> {
        let mut inner = self.inner.lock().await;
        if let Some(current) = inner.loaded.as_ref().filter(|l| l.name == name) {
            // An explicit user load takes ownership from the schedule.
            if origin == LoadOrigin::User && current.origin == LoadOrigin::Schedule {
                let name = current.name.clone();
                self.set_loaded(&mut inner, Some(LoadedPlaylist { name, origin }));
            }
            return Ok(LoadOutcome { name: name.to_string(), already_loaded: true, skipped: Vec::new() });
        }
        self.load_locked(&mut inner, name, origin).await
    }

    async fn load_locked(
        &self,
        inner: &mut Inner,
        name: &str,
        origin: LoadOrigin,
    ) -> Result<LoadOutcome, ControllerError> {
        let playlist = self
            .playlists
            .get(name)
            .await?
            .ok_or_else(|| ControllerError::PlaylistNotFound(name.to_string()))?;

        let adapter = self.adapter_for(inner.active)?;
        let caps = adapter.capabilities();

        let media = self.playlists.media();
        let mut items = Vec::with_capacity(playlist.items.len());
        let mut skipped = Vec::new();
        for item in &playlist.items {
            match media.resolve(&item.file) {
                Some(path) => items.push(LoadItem {
                    path,
                    duration_seconds: if caps.item_durations { item.duration_seconds } else { 0.0 },
                }),
                None => skipped.push(item.file.clone()),
            }
        }
        if !skipped.is_empty() {
            warn!("playlist '{name}': skipping missing media {skipped:?}");
        }
        if items.is_empty() {
            return Err(ControllerError::EmptyPlaylist(name.to_string()));
        }

        let settings = playlist.settings;
        let mut steps = vec![
            Command::LoadPlaylist(items),
            Command::SetLoop(settings.looping),
            Command::SetShuffle(settings.shuffle),
        ];
        if caps.auto_advance {
            steps.push(Command::SetAutoAdvance(settings.auto_advance));
        }
        steps.push(Command::Play);

        // Whatever was loaded is gone as soon as the first step goes out.
        self.set_loaded(inner, None);
        for (i, step) in steps.iter().enumerate() {
            if !caps.supports(step) {
                continue;
            }
            if let Err(e) = self.send(adapter.as_ref(), step).await {
                if i > 0 {
                    if let Err(stop_err) = self.send(adapter.as_ref(), &Command::Stop).await {
                        warn!("load '{name}': stop after failed {} also failed: {stop_err}", step.name());
                    }
                }
                return Err(e.into());
            }
        }

        info!("loaded playlist '{name}' on {} ({origin:?})", inner.active);
        self.set_loaded(inner, Some(LoadedPlaylist { name: name.to_string(), origin }));
        Ok(LoadOutcome { name: name.to_string(), already_loaded: false, skipped })
    }

    /// Play one media file outside any playlist.
    pub async fn play_file(&self, file_ref: &str) -> Result<Ack, ControllerError> {
        let path = self
            .playlists
            .media()
            .resolve(file_ref)
            .ok_or_else(|| ControllerError::MediaNotFound(file_ref.to_string()))?;

        let mut inner = self.inner.lock().await;
        let adapter = self.adapter_for(inner.active)?;
        self.set_loaded(&mut inner, None);

        let item = LoadItem { path, duration_seconds: 0.0 };
        self.send(adapter.as_ref(), &Command::LoadPlaylist(vec![item])).await?;
        Ok(self.send(adapter.as_ref(), &Command::Play).await?)
    }

    /// Queue one media file after whatever the backend is playing.
    pub async fn append_file(&self, file_ref: &str) -> Result<Ack, ControllerError> {
        let path = self
            .playlists
            .media()
            .resolve(file_ref)
            .ok_or_else(|| ControllerError::MediaNotFound(file_ref.to_string()))?;
        self.execute(Command::AppendItem(LoadItem { path, duration_seconds: 0.0 })).await
    }

    /// Stop, but only if what is playing came from the schedule. Returns
    /// whether a stop was sent.
    pub async fn stop_scheduled(&self) -> Result<bool, ControllerError> {
        let mut inner = self.inner.lock().await;
        if !matches!(&inner.loaded, Some(l) if l.origin == LoadOrigin::Schedule) {
            return Ok(false);
        }
        let adapter = self.adapter_for(inner.active)?;
        self.send(adapter.as_ref(), &Command::Stop).await?;
        self.set_loaded(&mut inner, None);
        Ok(true)
    }

    /// Forget the loaded marker when the stored playlist was edited, renamed
    /// or deleted, so the next load really reloads.
    pub async fn playlist_changed(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if inner.loaded.as_ref().is_some_and(|l| l.name == name) {
            self.set_loaded(&mut inner, None);
        }
    }
}
