//! VLC through its HTTP interface (`vlc --extraintf http`).
//!
//! Every request hits `/requests/status.xml`, with the command in the query
//! string, and VLC answers with the full status document. Auth is HTTP basic
//! with an empty user name.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{validate_command, Ack, BackendKind, Capabilities, Command, LoadItem, PlayerAdapter};
use crate::config::VlcConfig;
use crate::error::AdapterError;
use crate::status::{PlayState, PlaybackStatus};

/// VLC's volume scale: 256 is 100%.
const VLC_VOLUME_FULL: f64 = 256.0;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VlcStatusXml {
    state: String,
    time: f64,
    length: f64,
    volume: f64,
    #[serde(rename = "loop")]
    looping: String,
    random: String,
    fullscreen: String,
    information: VlcInformation,
}

#[derive(Debug, Default, Deserialize)]
struct VlcInformation {
    #[serde(default)]
    category: Vec<VlcCategory>,
}

#[derive(Debug, Deserialize)]
struct VlcCategory {
    #[serde(rename = "@name")]
    name: String,
    #[serde(default)]
    info: Vec<VlcInfo>,
}

#[derive(Debug, Deserialize)]
struct VlcInfo {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "$text", default)]
    value: String,
}

/// VLC writes booleans as `true`/`false` or `1`/`0` depending on version.
fn xml_flag(s: &str) -> bool {
    matches!(s.trim(), "true" | "1")
}

impl VlcStatusXml {
    fn meta(&self, key: &str) -> Option<String> {
        self.information
            .category
            .iter()
            .filter(|c| c.name == "meta")
            .flat_map(|c| c.info.iter())
            .find(|i| i.name == key && !i.value.trim().is_empty())
            .map(|i| i.value.trim().to_string())
    }

    fn into_status(self) -> PlaybackStatus {
        let state = match self.state.trim() {
            "playing" => PlayState::Playing,
            "paused" => PlayState::Paused,
            "stopped" => PlayState::Stopped,
            _ => PlayState::Unknown,
        };
        let volume = (self.volume / VLC_VOLUME_FULL * 100.0).round().clamp(0.0, 100.0) as u8;
        PlaybackStatus {
            state,
            current_item: self.meta("filename").or_else(|| self.meta("title")),
            position_seconds: self.time,
            duration_seconds: self.length,
            volume_percent: volume,
            ..PlaybackStatus::unknown(BackendKind::Vlc)
        }
        .sampled_now()
    }
}

fn parse_status(body: &str) -> Result<VlcStatusXml, AdapterError> {
    quick_xml::de::from_str(body).map_err(|e| AdapterError::MalformedResponse(e.to_string()))
}

pub struct VlcAdapter {
    client: reqwest::Client,
    status_url: String,
    password: String,
    timeout: Duration,
}

impl VlcAdapter {
    pub fn new(cfg: &VlcConfig, timeout: Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            status_url: format!("{}/requests/status.xml", cfg.base_url.trim_end_matches('/')),
            password: cfg.password.clone(),
            timeout,
        })
    }

    fn map_http(&self, e: reqwest::Error) -> AdapterError {
        if e.is_timeout() {
            AdapterError::Timeout(self.timeout)
        } else if e.is_connect() {
            AdapterError::Unreachable(e.to_string())
        } else if e.is_decode() || e.is_body() {
            AdapterError::MalformedResponse(e.to_string())
        } else {
            AdapterError::Unreachable(e.to_string())
        }
    }

    async fn request(&self, query: &[(&str, String)]) -> Result<VlcStatusXml, AdapterError> {
        let resp = self
            .client
            .get(&self.status_url)
            .basic_auth("", Some(&self.password))
            .query(query)
            .send()
            .await
            .map_err(|e| self.map_http(e))?;

        let code = resp.status();
        if !code.is_success() {
            return Err(AdapterError::Rejected(format!("vlc answered HTTP {code}")));
        }
        let body = resp.text().await.map_err(|e| self.map_http(e))?;
        parse_status(&body)
    }

    async fn simple(&self, command: &str) -> Result<(), AdapterError> {
        debug!("vlc: {command}");
        self.request(&[("command", command.to_string())]).await.map(|_| ())
    }

    /// VLC only exposes toggles for these flags, so read first and flip only
    /// when the current value differs.
    async fn ensure_flag(
        &self,
        toggle: &str,
        want: bool,
        read: fn(&VlcStatusXml) -> bool,
    ) -> Result<(), AdapterError> {
        let current = self.request(&[]).await?;
        if read(&current) != want {
            self.simple(toggle).await?;
        }
        Ok(())
    }

    async fn enqueue(&self, item: &LoadItem) -> Result<(), AdapterError> {
        let input = item.path.to_string_lossy().to_string();
        debug!("vlc: in_enqueue {input}");
        self.request(&[("command", "in_enqueue".to_string()), ("input", input)])
            .await
            .map(|_| ())
    }

    async fn load(&self, items: &[LoadItem]) -> Result<(), AdapterError> {
        self.simple("pl_empty").await?;
        for item in items {
            if let Err(e) = self.enqueue(item).await {
                // Leave nothing half-loaded on screen.
                if let Err(stop_err) = self.simple("pl_stop").await {
                    warn!("vlc: stop after failed load also failed: {stop_err}");
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PlayerAdapter for VlcAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Vlc
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { item_durations: false, auto_advance: false, ..Capabilities::ALL }
    }

    async fn send_command(&self, cmd: &Command) -> Result<Ack, AdapterError> {
        if !self.capabilities().supports(cmd) {
            return Err(AdapterError::Unsupported { command: cmd.name(), backend: "vlc" });
        }
        validate_command(cmd)?;

        match cmd {
            Command::Play => self.simple("pl_play").await?,
            Command::Pause => self.simple("pl_forcepause").await?,
            Command::Stop => self.simple("pl_stop").await?,
            Command::Next => self.simple("pl_next").await?,
            Command::Previous => self.simple("pl_previous").await?,
            Command::Seek(pos) => {
                let secs = pos.round() as u64;
                self.request(&[("command", "seek".into()), ("val", secs.to_string())]).await?;
            }
            Command::SetVolume(p) => {
                let val = (*p as f64 * VLC_VOLUME_FULL / 100.0).round() as u32;
                self.request(&[("command", "volume".into()), ("val", val.to_string())]).await?;
            }
            Command::LoadPlaylist(items) => self.load(items).await?,
            Command::AppendItem(item) => self.enqueue(item).await?,
            Command::ClearPlaylist => self.simple("pl_empty").await?,
            Command::SetLoop(on) => self.ensure_flag("pl_loop", *on, |s| xml_flag(&s.looping)).await?,
            Command::SetShuffle(on) => {
                self.ensure_flag("pl_random", *on, |s| xml_flag(&s.random)).await?
            }
            Command::SetFullscreen(on) => {
                self.ensure_flag("fullscreen", *on, |s| xml_flag(&s.fullscreen)).await?
            }
            Command::SetAutoAdvance(_) => {
                return Err(AdapterError::Unsupported { command: cmd.name(), backend: "vlc" })
            }
        }
        Ok(Ack { backend: BackendKind::Vlc, command: cmd.name() })
    }

    async fn query_status(&self) -> Result<PlaybackStatus, AdapterError> {
        Ok(self.request(&[]).await?.into_status())
    }
}
