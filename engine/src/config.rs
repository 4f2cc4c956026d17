use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use time::macros::format_description;
use time::UtcOffset;
use tracing::warn;

use crate::adapter::BackendKind;

// --- Configuration -----------------------------------------------------------
//
// Everything is read from SIGNAGE_* environment variables once at startup.
// Invalid values are logged and replaced by the default so a typo never keeps
// the player from coming up.

#[derive(Debug, Clone)]
pub struct VlcConfig {
    /// Base URL of the VLC HTTP interface, e.g. http://127.0.0.1:8080
    pub base_url: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct MpvConfig {
    pub socket_path: PathBuf,
    pub binary: String,
    /// Spawn mpv in idle mode when the socket is missing on a command.
    pub autostart: bool,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    pub vlc: VlcConfig,
    pub mpv: MpvConfig,
    pub default_backend: BackendKind,
    /// Hard bound for every single adapter call.
    pub adapter_timeout: Duration,
    pub poll_interval: Duration,
    pub schedule_tick: Duration,
    /// Fixed offset for schedule windows. `None` follows the host time zone,
    /// DST included.
    pub utc_offset: Option<UtcOffset>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            db_path: PathBuf::from("/opt/signage/data/signage.db"),
            media_dir: PathBuf::from("/opt/signage/media"),
            vlc: VlcConfig {
                base_url: "http://127.0.0.1:8080".into(),
                password: "signage".into(),
            },
            mpv: MpvConfig {
                socket_path: PathBuf::from("/tmp/mpv-socket"),
                binary: "mpv".into(),
                autostart: true,
            },
            default_backend: BackendKind::Mpv,
            adapter_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(2500),
            schedule_tick: Duration::from_secs(30),
            utc_offset: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("SIGNAGE_BIND") {
            cfg.bind = parse_or(&v, "SIGNAGE_BIND", cfg.bind);
        }
        if let Some(v) = get("SIGNAGE_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("SIGNAGE_MEDIA_DIR") {
            cfg.media_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SIGNAGE_VLC_URL") {
            cfg.vlc.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("SIGNAGE_VLC_PASSWORD") {
            cfg.vlc.password = v;
        }
        if let Some(v) = get("SIGNAGE_MPV_SOCKET") {
            cfg.mpv.socket_path = PathBuf::from(v);
        }
        if let Some(v) = get("SIGNAGE_MPV_BIN") {
            cfg.mpv.binary = v;
        }
        if let Some(v) = get("SIGNAGE_MPV_AUTOSTART") {
            cfg.mpv.autostart = parse_flag(&v, "SIGNAGE_MPV_AUTOSTART", cfg.mpv.autostart);
        }
        if let Some(v) = get("SIGNAGE_DEFAULT_BACKEND") {
            match v.parse::<BackendKind>() {
                Ok(kind) => cfg.default_backend = kind,
                Err(e) => warn!("ignoring SIGNAGE_DEFAULT_BACKEND={v}: {e}"),
            }
        }
        if let Some(v) = get("SIGNAGE_ADAPTER_TIMEOUT_MS") {
            cfg.adapter_timeout = Duration::from_millis(parse_nonzero(
                &v,
                "SIGNAGE_ADAPTER_TIMEOUT_MS",
                cfg.adapter_timeout.as_millis() as u64,
            ));
        }
        if let Some(v) = get("SIGNAGE_POLL_MS") {
            cfg.poll_interval = Duration::from_millis(parse_nonzero(
                &v,
                "SIGNAGE_POLL_MS",
                cfg.poll_interval.as_millis() as u64,
            ));
        }
        if let Some(v) = get("SIGNAGE_SCHEDULE_TICK_S") {
            cfg.schedule_tick = Duration::from_secs(parse_nonzero(
                &v,
                "SIGNAGE_SCHEDULE_TICK_S",
                cfg.schedule_tick.as_secs(),
            ));
        }
        if let Some(v) = get("SIGNAGE_UTC_OFFSET") {
            match parse_utc_offset(&v) {
                Some(offset) => cfg.utc_offset = Some(offset),
                None => warn!("ignoring SIGNAGE_UTC_OFFSET={v}: expected +HH:MM or -HH:MM"),
            }
        }

        cfg
    }
}

fn parse_or<T: FromStr>(raw: &str, key: &str, default: T) -> T {
    raw.parse().unwrap_or_else(|_| {
        warn!("ignoring {key}={raw}: invalid value");
        default
    })
}

fn parse_nonzero(raw: &str, key: &str, default: u64) -> u64 {
    match raw.parse::<u64>() {
        Ok(v) if v > 0 => v,
        _ => {
            warn!("ignoring {key}={raw}: expected a positive integer");
            default
        }
    }
}

fn parse_flag(raw: &str, key: &str, default: bool) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!("ignoring {key}={raw}: expected a boolean");
            default
        }
    }
}

pub fn parse_utc_offset(raw: &str) -> Option<UtcOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("utc") || raw.eq_ignore_ascii_case("z") {
        return Some(UtcOffset::UTC);
    }
    UtcOffset::parse(
        raw,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg_from(pairs: &[(&str, &str)]) -> EngineConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = cfg_from(&[]);
        assert_eq!(cfg.bind, SocketAddr::from(([127, 0, 0, 1], 3000)));
        assert_eq!(cfg.adapter_timeout, Duration::from_secs(2));
        assert_eq!(cfg.default_backend, BackendKind::Mpv);
        assert!(cfg.utc_offset.is_none());
    }

    #[test]
    fn reads_overrides() {
        let cfg = cfg_from(&[
            ("SIGNAGE_BIND", "0.0.0.0:8081"),
            ("SIGNAGE_VLC_URL", "http://10.0.0.5:8080/"),
            ("SIGNAGE_DEFAULT_BACKEND", "vlc"),
            ("SIGNAGE_POLL_MS", "1000"),
            ("SIGNAGE_MPV_AUTOSTART", "off"),
            ("SIGNAGE_UTC_OFFSET", "+02:00"),
        ]);
        assert_eq!(cfg.bind.port(), 8081);
        assert_eq!(cfg.vlc.base_url, "http://10.0.0.5:8080");
        assert_eq!(cfg.default_backend, BackendKind::Vlc);
        assert_eq!(cfg.poll_interval, Duration::from_millis(1000));
        assert!(!cfg.mpv.autostart);
        assert_eq!(cfg.utc_offset, UtcOffset::from_hms(2, 0, 0).ok());
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = cfg_from(&[
            ("SIGNAGE_BIND", "not-an-address"),
            ("SIGNAGE_POLL_MS", "0"),
            ("SIGNAGE_DEFAULT_BACKEND", "winamp"),
            ("SIGNAGE_UTC_OFFSET", "two hours"),
        ]);
        assert_eq!(cfg.bind.port(), 3000);
        assert_eq!(cfg.poll_interval, Duration::from_millis(2500));
        assert_eq!(cfg.default_backend, BackendKind::Mpv);
        assert!(cfg.utc_offset.is_none());
    }

    #[test]
    fn parses_negative_offsets() {
        assert_eq!(parse_utc_offset("-05:30"), UtcOffset::from_hms(-5, -30, 0).ok());
        assert_eq!(parse_utc_offset("UTC"), Some(UtcOffset::UTC));
    }
}
