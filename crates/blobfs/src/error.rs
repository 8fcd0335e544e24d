//! Error types for blob store operations

use std::error::Error as StdError;
use std::fmt;

/// Broad classification used by retry and recovery logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttling, unavailability, timeouts, flaky I/O. Safe to retry.
    Transient,
    /// `NotFound` / `AlreadyExists`: a concurrent rename or create happened.
    Structural,
    /// Object exists but is shorter than a well-formed payload.
    Corruption,
    /// Everything else.
    Fatal,
}

/// Which flavour of transient failure the store reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Throttled,
    Unavailable,
    Timeout,
    Io,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransientKind::Throttled => "throttled",
            TransientKind::Unavailable => "unavailable",
            TransientKind::Timeout => "timeout",
            TransientKind::Io => "io",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob already exists: {0}")]
    AlreadyExists(String),

    #[error("Conditional update lost a race on {0}")]
    Conflict(String),

    #[error("Invalid append range on {path}: expected offset {expected}, got {actual}")]
    InvalidRange {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Transient store failure ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Object store error: {0}")]
    Store(#[source] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BlobError {
    pub fn not_found<S: AsRef<str>>(path: S) -> Self {
        BlobError::NotFound(path.as_ref().to_string())
    }

    pub fn already_exists<S: AsRef<str>>(path: S) -> Self {
        BlobError::AlreadyExists(path.as_ref().to_string())
    }

    pub fn transient<S: Into<String>>(kind: TransientKind, message: S) -> Self {
        BlobError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            BlobError::Transient { .. } => ErrorClass::Transient,
            BlobError::NotFound(_) | BlobError::AlreadyExists(_) => ErrorClass::Structural,
            BlobError::Io(e) if transient_io(e.kind()) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, BlobError::AlreadyExists(_))
    }
}

fn transient_io(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        TimedOut | Interrupted | ConnectionReset | ConnectionAborted | BrokenPipe | WouldBlock
    )
}

/// Recognize throttling and availability failures from a backend message.
///
/// Backends surface HTTP status codes only as text inside `Generic`.
pub fn classify_message(message: &str) -> Option<TransientKind> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("too many requests") || lower.contains("slowdown")
        || lower.contains("throttl")
    {
        Some(TransientKind::Throttled)
    } else if lower.contains("503")
        || lower.contains("service unavailable")
        || lower.contains("server busy")
        || lower.contains("500 internal")
    {
        Some(TransientKind::Unavailable)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        Some(TransientKind::Timeout)
    } else if lower.contains("connection reset") || lower.contains("broken pipe") {
        Some(TransientKind::Io)
    } else {
        None
    }
}

fn classify_source(source: &(dyn StdError + 'static)) -> Option<TransientKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(source);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return Some(TransientKind::Timeout);
            }
            if transient_io(io.kind()) {
                return Some(TransientKind::Io);
            }
        }
        if let Some(kind) = classify_message(&err.to_string()) {
            return Some(kind);
        }
        current = err.source();
    }
    None
}

impl From<object_store::Error> for BlobError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BlobError::NotFound(path),
            object_store::Error::AlreadyExists { path, .. } => BlobError::AlreadyExists(path),
            object_store::Error::Precondition { path, .. } => BlobError::Conflict(path),
            object_store::Error::Generic { store, source } => {
                match classify_source(source.as_ref()) {
                    Some(kind) => BlobError::transient(kind, format!("{store}: {source}")),
                    None => BlobError::Store(object_store::Error::Generic { store, source }),
                }
            }
            other => BlobError::Store(other),
        }
    }
}
