use std::path::PathBuf;

use magic_rules::RulesError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MagicError {
    #[error("{0}")]
    Compile(RulesError),

    #[error("Incompatible magic database '{}': {reason}", path.display())]
    IncompatibleDatabase { path: PathBuf, reason: String },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No magic database loaded")]
    NotLoaded,

    #[error("Invalid flags 0x{0:x}")]
    InvalidFlags(u32),

    #[error("Invalid value {value} for parameter {name}")]
    InvalidParam { name: &'static str, value: usize },
}

/// Coarse classification of a [`MagicError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Compile,
    IncompatibleDatabase,
    Io,
    NotLoaded,
    InvalidFlag,
    InvalidParam,
}

impl MagicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Compile(_) => ErrorKind::Compile,
            Self::IncompatibleDatabase { .. } => ErrorKind::IncompatibleDatabase,
            Self::Io { .. } => ErrorKind::Io,
            Self::NotLoaded => ErrorKind::NotLoaded,
            Self::InvalidFlags(_) => ErrorKind::InvalidFlag,
            Self::InvalidParam { .. } => ErrorKind::InvalidParam,
        }
    }

    /// Raw OS error number behind an I/O failure.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            Self::Compile(
                RulesError::Read { source, .. }
                | RulesError::Write { source, .. }
                | RulesError::Io(source),
            ) => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach `path` to a database read failure.
    pub(crate) fn from_load(path: PathBuf, err: RulesError) -> Self {
        match err {
            RulesError::Read { path, source } | RulesError::Write { path, source } => {
                Self::Io { path, source }
            }
            e if e.is_incompatible() => Self::IncompatibleDatabase {
                path,
                reason: e.to_string(),
            },
            e => Self::Compile(e),
        }
    }
}

impl From<RulesError> for MagicError {
    fn from(err: RulesError) -> Self {
        match err {
            RulesError::Read { path, source } | RulesError::Write { path, source } => {
                Self::Io { path, source }
            }
            e => Self::Compile(e),
        }
    }
}

/// Snapshot of the most recent failure of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub os_code: Option<i32>,
}

impl From<&MagicError> for LastError {
    fn from(err: &MagicError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            os_code: err.os_code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MagicError>;
