//! Shared error facade for the trackpads tracking core.
//!
//! Every fallible path in the core reports a [`TrackError`]: a stable
//! machine-readable [`ErrorCode`], a human-readable message, optional
//! key/value context and an optional source error. Constructor macros tag
//! each error with the responsible party so callers can decide whether to
//! surface, downgrade or retry.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;

/// Result alias used across the tracking core.
pub type TrackResult<T> = Result<T, TrackError>;

/// Who is responsible for the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// The caller misused the API or supplied invalid input.
    Usage,
    /// The process environment failed us (I/O, missing files, locks).
    Environment,
    /// The tracked target (or its logger chain) failed.
    Target,
    /// An internal invariant was broken.
    Internal,
}

/// Stable error codes surfaced to embedders and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    InvalidMapping,
    InvalidConfig,
    UnknownTarget,
    WrappingUnsupported,
    LoggerNotFound,
    LoggerFailure,
    TargetFailure,
    DependencyMissing,
    NoActiveRun,
    AlreadyActive,
    BackendUnavailable,
    SerializationFailed,
    Io,
    Unknown,
}

impl ErrorCode {
    /// Stable string form used in structured logs and tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMapping => "ERR_INVALID_MAPPING",
            ErrorCode::InvalidConfig => "ERR_INVALID_CONFIG",
            ErrorCode::UnknownTarget => "ERR_UNKNOWN_TARGET",
            ErrorCode::WrappingUnsupported => "ERR_WRAPPING_UNSUPPORTED",
            ErrorCode::LoggerNotFound => "ERR_LOGGER_NOT_FOUND",
            ErrorCode::LoggerFailure => "ERR_LOGGER_FAILURE",
            ErrorCode::TargetFailure => "ERR_TARGET_FAILURE",
            ErrorCode::DependencyMissing => "ERR_DEPENDENCY_MISSING",
            ErrorCode::NoActiveRun => "ERR_NO_ACTIVE_RUN",
            ErrorCode::AlreadyActive => "ERR_ALREADY_ACTIVE",
            ErrorCode::BackendUnavailable => "ERR_BACKEND_UNAVAILABLE",
            ErrorCode::SerializationFailed => "ERR_SERIALIZATION_FAILED",
            ErrorCode::Io => "ERR_IO",
            ErrorCode::Unknown => "ERR_UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type carried by every fallible operation in the core.
#[derive(Debug)]
pub struct TrackError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    message: Cow<'static, str>,
    /// Ordered key/value payload attached via [`TrackError::with_context`].
    pub context: Vec<(Cow<'static, str>, String)>,
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl TrackError {
    pub fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    /// Human-readable message without context or source.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attach a key/value pair to the error. Later pairs with the same key
    /// are kept; readers see them in attachment order.
    pub fn with_context(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Borrow the underlying cause, if any.
    pub fn source_ref(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            write!(f, " (")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", key, value)?;
            }
            write!(f, ")")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": caused by {}", source)?;
        }
        Ok(())
    }
}

impl Error for TrackError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|boxed| boxed.as_ref() as _)
    }
}

/// Build a [`TrackError`] with [`ErrorKind::Usage`].
#[macro_export]
macro_rules! usage {
    ($code:expr, $($arg:tt)+) => {
        $crate::TrackError::new($crate::ErrorKind::Usage, $code, format!($($arg)+))
    };
}

/// Build a [`TrackError`] with [`ErrorKind::Environment`].
#[macro_export]
macro_rules! enverr {
    ($code:expr, $($arg:tt)+) => {
        $crate::TrackError::new($crate::ErrorKind::Environment, $code, format!($($arg)+))
    };
}

/// Build a [`TrackError`] with [`ErrorKind::Target`].
#[macro_export]
macro_rules! target {
    ($code:expr, $($arg:tt)+) => {
        $crate::TrackError::new($crate::ErrorKind::Target, $code, format!($($arg)+))
    };
}

/// Build a [`TrackError`] with [`ErrorKind::Internal`].
#[macro_export]
macro_rules! bug {
    ($code:expr, $($arg:tt)+) => {
        $crate::TrackError::new($crate::ErrorKind::Internal, $code, format!($($arg)+))
    };
}
