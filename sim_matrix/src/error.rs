//! Errors raised by the catalog, pair store, merge, freeze and query code.
//!
//! Every variant that concerns a fragment carries the offending key so callers can report it
//! as-is instead of a generic failure.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A fragment reference, either by identifier or by the raw index used inside a file.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Label(String),
    Index(u32),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Label(label) => write!(f, "{}", label),
            Key::Index(index) => write!(f, "#{}", index),
        }
    }
}

impl From<&str> for Key {
    fn from(label: &str) -> Self {
        Key::Label(label.to_string())
    }
}

impl From<u32> for Key {
    fn from(index: u32) -> Self {
        Key::Index(index)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Reference to a fragment the relevant catalog does not contain
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(Key),

    /// Lookup of a fragment (query or resolve) that is not present
    #[error("not found: {0}")]
    NotFound(Key),

    /// Same unordered pair inserted twice with different scores
    #[error("duplicate pair ({a}, {b}) with conflicting scores: existing {existing}, incoming {incoming}")]
    DuplicateRecord {
        a: String,
        b: String,
        existing: f64,
        incoming: f64,
    },

    /// Label count and score array shape disagree
    #[error("dimension mismatch: {labels} labels, {rows} rows, {columns} columns")]
    DimensionMismatch {
        labels: usize,
        rows: usize,
        columns: usize,
    },

    #[error("IO failure: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed row in a raw import file
    #[error("parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("invalid identifier {0:?}: must be ASCII and at most 64 bytes")]
    InvalidIdentifier(String),

    #[error("score {0} is outside [0, 1]")]
    ScoreOutOfRange(f64),

    #[error("score precision mismatch: {expected} vs {found}")]
    PrecisionMismatch { expected: u16, found: u16 },

    /// Mutation attempted on a store opened read-only
    #[error("read-only: {}", .0.display())]
    ReadOnly(PathBuf),

    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("corrupt file {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn corrupt<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Error::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn parse<S: Into<String>>(line: usize, reason: S) -> Self {
        Error::Parse {
            line,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
