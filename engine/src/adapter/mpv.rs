//! mpv through its JSON IPC socket (`--input-ipc-server`).
//!
//! One connection per call. Requests are single JSON lines tagged with a
//! `request_id`; mpv interleaves unsolicited `event` lines which are skipped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command as Process};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{validate_command, Ack, BackendKind, Capabilities, Command, LoadItem, PlayerAdapter};
use crate::config::MpvConfig;
use crate::error::AdapterError;
use crate::status::{PlayState, PlaybackStatus};

const SOCKET_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct MpvReply {
    event: Option<String>,
    request_id: Option<u64>,
    error: Option<String>,
    #[serde(default)]
    data: Value,
}

struct IpcConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

fn io_err(socket: &Path, e: std::io::Error) -> AdapterError {
    AdapterError::Unreachable(format!("{}: {e}", socket.display()))
}

impl IpcConn {
    async fn open(socket: &Path) -> Result<Self, AdapterError> {
        let stream = UnixStream::connect(socket).await.map_err(|e| io_err(socket, e))?;
        let (r, w) = stream.into_split();
        Ok(Self { reader: BufReader::new(r), writer: w })
    }

    async fn request(&mut self, id: u64, command: Value) -> Result<Value, AdapterError> {
        let mut line = json!({ "command": command, "request_id": id }).to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AdapterError::Unreachable(format!("mpv write: {e}")))?;

        loop {
            let mut buf = String::new();
            let n = self
                .reader
                .read_line(&mut buf)
                .await
                .map_err(|e| AdapterError::Unreachable(format!("mpv read: {e}")))?;
            if n == 0 {
                return Err(AdapterError::Unreachable("mpv closed the connection".into()));
            }
            let buf = buf.trim();
            if buf.is_empty() {
                continue;
            }

            let reply: MpvReply = serde_json::from_str(buf)
                .map_err(|e| AdapterError::MalformedResponse(format!("{e}: {buf}")))?;
            if reply.event.is_some() {
                continue;
            }
            if reply.request_id.is_some_and(|rid| rid != id) {
                continue;
            }
            return match reply.error.as_deref() {
                Some("success") => Ok(reply.data),
                Some(other) => Err(AdapterError::Rejected(other.to_string())),
                None => Err(AdapterError::MalformedResponse(format!("reply without error field: {buf}"))),
            };
        }
    }
}

pub struct MpvAdapter {
    socket: PathBuf,
    binary: String,
    autostart: bool,
    timeout: Duration,
    next_id: AtomicU64,
    child: Mutex<Option<Child>>,
}

impl MpvAdapter {
    pub fn new(cfg: &MpvConfig, timeout: Duration) -> Self {
        Self {
            socket: cfg.socket_path.clone(),
            binary: cfg.binary.clone(),
            autostart: cfg.autostart,
            timeout,
            next_id: AtomicU64::new(1),
            child: Mutex::new(None),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(&self, conn: &mut IpcConn, command: Value) -> Result<Value, AdapterError> {
        debug!("mpv: {command}");
        conn.request(self.id(), command).await
    }

    /// `None` when mpv says the property has no value right now (e.g. `path`
    /// while idle).
    async fn get_property(&self, conn: &mut IpcConn, name: &str) -> Result<Option<Value>, AdapterError> {
        match self.call(conn, json!(["get_property", name])).await {
            Ok(v) => Ok(Some(v)),
            Err(AdapterError::Rejected(e)) if e == "property unavailable" => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_property(&self, conn: &mut IpcConn, name: &str, value: Value) -> Result<(), AdapterError> {
        self.call(conn, json!(["set_property", name, value])).await.map(|_| ())
    }

    /// Connect, starting a local mpv first if allowed and nothing listens.
    async fn connect_for_command(&self) -> Result<IpcConn, AdapterError> {
        match IpcConn::open(&self.socket).await {
            Ok(conn) => Ok(conn),
            Err(AdapterError::Unreachable(e)) if self.autostart => {
                warn!("mpv: socket unavailable ({e}); starting {}", self.binary);
                self.start_player().await?;
                self.wait_for_socket().await
            }
            Err(e) => Err(e),
        }
    }

    async fn start_player(&self) -> Result<(), AdapterError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                // Still starting up from an earlier attempt.
                return Ok(());
            }
        }

        let mut cmd = Process::new(&self.binary);
        cmd.arg("--idle=yes");
        cmd.arg(format!("--input-ipc-server={}", self.socket.display()));
        cmd.arg("--fullscreen");
        cmd.arg("--no-terminal");
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|e| AdapterError::Unreachable(format!("failed to start {}: {e}", self.binary)))?;
        info!("mpv: started pid {:?}", child.id());
        *guard = Some(child);
        Ok(())
    }

    async fn wait_for_socket(&self) -> Result<IpcConn, AdapterError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match IpcConn::open(&self.socket).await {
                Ok(conn) => return Ok(conn),
                Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
                Err(_) => tokio::time::sleep(SOCKET_POLL).await,
            }
        }
    }

    fn loadfile(item: &LoadItem, replace: bool) -> Value {
        let path = item.path.to_string_lossy();
        let flags = if replace { "replace" } else { "append" };
        if item.duration_seconds > 0.0 {
            json!({
                "name": "loadfile",
                "url": path,
                "flags": flags,
                "options": { "image-display-duration": item.duration_seconds.to_string() },
            })
        } else {
            json!(["loadfile", path, flags])
        }
    }

    async fn load(&self, conn: &mut IpcConn, items: &[LoadItem]) -> Result<(), AdapterError> {
        for (i, item) in items.iter().enumerate() {
            if let Err(e) = self.call(conn, Self::loadfile(item, i == 0)).await {
                if i > 0 {
                    // Leave nothing half-loaded on screen.
                    if let Err(stop_err) = self.call(conn, json!(["stop"])).await {
                        warn!("mpv: stop after failed load also failed: {stop_err}");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

fn as_f64(v: Option<Value>) -> f64 {
    v.and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn as_bool(v: Option<Value>) -> bool {
    v.and_then(|v| v.as_bool()).unwrap_or(false)
}

#[async_trait]
impl PlayerAdapter for MpvAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Mpv
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn send_command(&self, cmd: &Command) -> Result<Ack, AdapterError> {
        validate_command(cmd)?;
        let mut conn = self.connect_for_command().await?;
        let c = &mut conn;

        match cmd {
            Command::Play => {
                // After a stop mpv sits idle on the kept playlist; unpausing alone
                // would not start anything.
                if as_bool(self.get_property(c, "idle-active").await?) {
                    let pos = self
                        .get_property(c, "playlist-current-pos")
                        .await?
                        .and_then(|v| v.as_i64())
                        .filter(|p| *p >= 0)
                        .unwrap_or(0);
                    self.call(c, json!(["playlist-play-index", pos])).await?;
                }
                self.set_property(c, "pause", json!(false)).await?
            }
            Command::Pause => self.set_property(c, "pause", json!(true)).await?,
            Command::Stop => {
                self.call(c, json!(["stop", "keep-playlist"])).await?;
            }
            Command::Next => {
                self.call(c, json!(["playlist-next"])).await?;
            }
            Command::Previous => {
                self.call(c, json!(["playlist-prev"])).await?;
            }
            Command::Seek(pos) => {
                self.call(c, json!(["seek", pos, "absolute"])).await?;
            }
            Command::SetVolume(p) => self.set_property(c, "volume", json!(p)).await?,
            Command::LoadPlaylist(items) => self.load(c, items).await?,
            Command::AppendItem(item) => {
                self.call(c, Self::loadfile(item, false)).await?;
            }
            Command::ClearPlaylist => {
                self.call(c, json!(["playlist-clear"])).await?;
            }
            Command::SetLoop(on) => {
                let v = if *on { "inf" } else { "no" };
                self.set_property(c, "loop-playlist", json!(v)).await?
            }
            Command::SetShuffle(on) => {
                let name = if *on { "playlist-shuffle" } else { "playlist-unshuffle" };
                self.call(c, json!([name])).await?;
            }
            Command::SetFullscreen(on) => self.set_property(c, "fullscreen", json!(on)).await?,
            Command::SetAutoAdvance(on) => {
                let v = if *on { "no" } else { "always" };
                self.set_property(c, "keep-open", json!(v)).await?
            }
        }
        Ok(Ack { backend: BackendKind::Mpv, command: cmd.name() })
    }

    async fn query_status(&self) -> Result<PlaybackStatus, AdapterError> {
        let mut conn = IpcConn::open(&self.socket).await?;
        let c = &mut conn;

        let idle = as_bool(self.get_property(c, "idle-active").await?);
        let paused = as_bool(self.get_property(c, "pause").await?);
        let path = self.get_property(c, "path").await?;
        let position = as_f64(self.get_property(c, "playback-time").await?);
        let duration = as_f64(self.get_property(c, "duration").await?);
        let volume = as_f64(self.get_property(c, "volume").await?);

        let state = if idle {
            PlayState::Stopped
        } else if paused {
            PlayState::Paused
        } else {
            PlayState::Playing
        };
        let current_item = path
            .as_ref()
            .and_then(Value::as_str)
            .filter(|_| !idle)
            .map(|p| {
                Path::new(p)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| p.to_string())
            });

        Ok(PlaybackStatus {
            state,
            current_item,
            position_seconds: position,
            duration_seconds: duration,
            volume_percent: volume.round().clamp(0.0, 100.0) as u8,
            ..PlaybackStatus::unknown(BackendKind::Mpv)
        }
        .sampled_now())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};

    use tokio::net::UnixListener;

    use super::*;

    #[derive(Default)]
    struct FakeMpv {
        commands: Vec<Value>,
        props: HashMap<String, Value>,
        fail: Option<&'static str>,
    }

    impl FakeMpv {
        fn handle(&mut self, cmd: &Value) -> (String, Value) {
            let name = cmd
                .get(0)
                .or_else(|| cmd.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            if name == "get_property" {
                let prop = cmd[1].as_str().unwrap_or_default();
                return match self.props.get(prop) {
                    Some(v) => ("success".into(), v.clone()),
                    None => ("property unavailable".into(), Value::Null),
                };
            }

            self.commands.push(cmd.clone());
            if self.fail.is_some_and(|f| cmd.to_string().contains(f)) {
                return ("error running command".into(), Value::Null);
            }
            match name.as_str() {
                "set_property" => {
                    if let Some(prop) = cmd[1].as_str() {
                        self.props.insert(prop.to_string(), cmd[2].clone());
                    }
                }
                "stop" => {
                    self.props.insert("idle-active".into(), json!(true));
                }
                "playlist-play-index" => {
                    self.props.insert("idle-active".into(), json!(false));
                    self.props.insert("playlist-current-pos".into(), cmd[1].clone());
                }
                _ => {}
            }
            ("success".into(), Value::Null)
        }
    }

    type Shared = Arc<StdMutex<FakeMpv>>;

    fn spawn_fake(listener: UnixListener, st: Shared) {
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let st = st.clone();
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut lines = BufReader::new(r).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let req: Value = serde_json::from_str(&line).unwrap();
                        let (error, data) = st.lock().unwrap().handle(&req["command"]);
                        let reply = json!({ "request_id": req["request_id"], "error": error, "data": data });
                        let out = format!("{{\"event\":\"property-change\",\"id\":1}}\n{reply}\n");
                        if w.write_all(out.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
    }

    fn config(socket: PathBuf, autostart: bool, binary: &str) -> MpvConfig {
        MpvConfig { socket_path: socket, binary: binary.into(), autostart }
    }

    fn with_fake() -> (MpvAdapter, Shared, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("mpv.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let st = Shared::default();
        spawn_fake(listener, st.clone());
        let mpv = MpvAdapter::new(&config(socket, false, "mpv"), Duration::from_secs(2));
        (mpv, st, dir)
    }

    fn item(path: &str, secs: f64) -> LoadItem {
        LoadItem { path: path.into(), duration_seconds: secs }
    }

    #[tokio::test]
    async fn status_reads_properties_and_skips_events() {
        let (mpv, st, _dir) = with_fake();
        {
            let mut s = st.lock().unwrap();
            s.props.insert("idle-active".into(), json!(false));
            s.props.insert("pause".into(), json!(true));
            s.props.insert("path".into(), json!("/media/promo.mp4"));
            s.props.insert("playback-time".into(), json!(12.5));
            s.props.insert("duration".into(), json!(30.0));
            s.props.insert("volume".into(), json!(55.0));
        }

        let status = mpv.query_status().await.unwrap();
        assert_eq!(status.state, PlayState::Paused);
        assert_eq!(status.current_item.as_deref(), Some("promo.mp4"));
        assert_eq!(status.position_seconds, 12.5);
        assert_eq!(status.duration_seconds, 30.0);
        assert_eq!(status.volume_percent, 55);
        assert_eq!(status.backend, BackendKind::Mpv);
    }

    #[tokio::test]
    async fn idle_player_reports_stopped() {
        let (mpv, st, _dir) = with_fake();
        st.lock().unwrap().props.insert("idle-active".into(), json!(true));

        let status = mpv.query_status().await.unwrap();
        assert_eq!(status.state, PlayState::Stopped);
        assert_eq!(status.current_item, None);
        assert_eq!(status.duration_seconds, 0.0);
    }

    #[tokio::test]
    async fn load_replaces_then_appends_with_display_durations() {
        let (mpv, st, _dir) = with_fake();
        mpv.send_command(&Command::LoadPlaylist(vec![item("/m/a.mp4", 0.0), item("/m/b.jpg", 8.0)]))
            .await
            .unwrap();

        assert_eq!(
            st.lock().unwrap().commands,
            vec![
                json!(["loadfile", "/m/a.mp4", "replace"]),
                json!({
                    "name": "loadfile",
                    "url": "/m/b.jpg",
                    "flags": "append",
                    "options": { "image-display-duration": "8" }
                }),
            ]
        );
    }

    #[tokio::test]
    async fn settings_map_to_mpv_properties() {
        let (mpv, st, _dir) = with_fake();
        for cmd in [
            Command::SetLoop(true),
            Command::SetShuffle(false),
            Command::SetAutoAdvance(false),
            Command::SetFullscreen(true),
            Command::SetVolume(40),
            Command::Seek(5.0),
            Command::Play,
        ] {
            mpv.send_command(&cmd).await.unwrap();
        }

        let s = st.lock().unwrap();
        assert_eq!(s.props["loop-playlist"], json!("inf"));
        assert_eq!(s.props["keep-open"], json!("always"));
        assert_eq!(s.props["fullscreen"], json!(true));
        assert_eq!(s.props["volume"], json!(40));
        assert_eq!(s.props["pause"], json!(false));
        assert!(s.commands.contains(&json!(["playlist-unshuffle"])));
        assert!(s.commands.contains(&json!(["seek", 5.0, "absolute"])));
    }

    #[tokio::test]
    async fn mpv_errors_are_rejections_and_half_loads_are_stopped() {
        let (mpv, st, _dir) = with_fake();
        st.lock().unwrap().fail = Some("playlist-next");
        assert_eq!(
            mpv.send_command(&Command::Next).await,
            Err(AdapterError::Rejected("error running command".into()))
        );

        // Second item fails: the first one must not keep playing.
        st.lock().unwrap().fail = Some("b.jpg");
        st.lock().unwrap().commands.clear();
        let res = mpv
            .send_command(&Command::LoadPlaylist(vec![item("/m/a.mp4", 0.0), item("/m/b.jpg", 8.0)]))
            .await;
        assert!(matches!(res, Err(AdapterError::Rejected(_))));
        let commands = st.lock().unwrap().commands.clone();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[2], json!(["stop"]));
    }

    #[tokio::test]
    async fn play_after_stop_restarts_the_kept_playlist() {
        let (mpv, st, _dir) = with_fake();
        {
            let mut s = st.lock().unwrap();
            s.props.insert("idle-active".into(), json!(false));
            s.props.insert("playlist-current-pos".into(), json!(1));
        }

        mpv.send_command(&Command::Stop).await.unwrap();
        mpv.send_command(&Command::Play).await.unwrap();

        let s = st.lock().unwrap();
        assert_eq!(
            s.commands,
            vec![
                json!(["stop", "keep-playlist"]),
                json!(["playlist-play-index", 1]),
                json!(["set_property", "pause", false]),
            ]
        );
        assert_eq!(s.props["idle-active"], json!(false));
    }

    #[tokio::test]
    async fn play_while_playing_only_unpauses() {
        let (mpv, st, _dir) = with_fake();
        st.lock().unwrap().props.insert("idle-active".into(), json!(false));

        mpv.send_command(&Command::Play).await.unwrap();
        assert_eq!(st.lock().unwrap().commands, vec![json!(["set_property", "pause", false])]);
    }

    #[tokio::test]
    async fn append_and_clear_edit_the_playlist_in_place() {
        let (mpv, st, _dir) = with_fake();
        mpv.send_command(&Command::AppendItem(item("/m/c.png", 5.0))).await.unwrap();
        mpv.send_command(&Command::ClearPlaylist).await.unwrap();

        assert_eq!(
            st.lock().unwrap().commands,
            vec![
                json!({
                    "name": "loadfile",
                    "url": "/m/c.png",
                    "flags": "append",
                    "options": { "image-display-duration": "5" }
                }),
                json!(["playlist-clear"]),
            ]
        );
    }

    #[tokio::test]
    async fn missing_socket_is_unreachable_without_autostart() {
        let dir = tempfile::tempdir().unwrap();
        let mpv = MpvAdapter::new(&config(dir.path().join("none.sock"), false, "mpv"), Duration::from_secs(2));
        assert!(matches!(mpv.send_command(&Command::Play).await, Err(AdapterError::Unreachable(_))));
        assert!(matches!(mpv.query_status().await, Err(AdapterError::Unreachable(_))));
    }

    #[tokio::test]
    async fn autostart_reports_a_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mpv = MpvAdapter::new(
            &config(dir.path().join("none.sock"), true, "/definitely/not/mpv"),
            Duration::from_secs(2),
        );
        match mpv.send_command(&Command::Play).await {
            Err(AdapterError::Unreachable(msg)) => assert!(msg.contains("failed to start")),
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }
}
