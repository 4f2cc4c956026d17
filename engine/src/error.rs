use std::time::Duration;

use thiserror::Error;

use crate::schedule::Conflict;

/// Failures talking to one concrete player backend.
///
/// Adapters never panic on a bad backend: every transport or decoding problem
/// ends up as one of these variants so the caller can decide what to do.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
    /// The backend answered but refused the request (HTTP error, IPC error code).
    #[error("backend rejected the request: {0}")]
    Rejected(String),
    #[error("command '{command}' is not supported by the {backend} backend")]
    Unsupported { command: &'static str, backend: &'static str },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a backend switch is already in progress")]
    AlreadySwitching,
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("playlist not found: {0}")]
    PlaylistNotFound(String),
    #[error("playlist '{0}' has no playable items")]
    EmptyPlaylist(String),
    #[error("media file not found: {0}")]
    MediaNotFound(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("playlist not found: {0}")]
    PlaylistNotFound(String),
    #[error("invalid schedule window: {0}")]
    InvalidWindow(String),
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("invalid days: {0}")]
    InvalidDays(String),
    #[error("schedule {0} not found")]
    NotFound(i64),
    /// The window overlaps these enabled schedules and the caller asked for
    /// overlaps to be refused.
    #[error("overlaps {} enabled schedule(s)", .0.len())]
    Conflicts(Vec<Conflict>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("playlist '{playlist}' is referenced by schedule(s): {}", schedules.join(", "))]
    Referenced { playlist: String, schedules: Vec<String> },
    #[error("invalid value: {0}")]
    Invalid(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Join(String),
}
