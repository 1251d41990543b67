// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2018 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A single `Error` type carrying an [`ErrorKind`], used everywhere in this crate instead of
//! per-module error enums.
//!
//! The kind set starts from [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
//! a nice general-purpose classification, and adds a handful of kinds specific to this pipeline
//! (see the doc comment on each variant below).

use std::fmt;

/// A boxed, thread-safe cause. `Error` doesn't carry a backtrace itself; `RUST_BACKTRACE=1`
/// still captures one at panic time via the crate's panic hook.
type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    cause: Option<Cause>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            cause: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Returns a `Display` that prints this error and every cause in its chain, one per line.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            kind,
            msg: None,
            cause: None,
        }
    }
}

/// Prints an [`Error`] and its full `source()` chain, one `caused by:` line per cause.
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = std::error::Error::source(self.0);
        while let Some(c) = cause {
            write!(f, "\ncaused by: {c}")?;
            cause = c.source();
        }
        Ok(())
    }
}

/// Error kind.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,

    /// Capture open fails, encoder binary missing, TLS material unreadable, config invalid.
    /// Fatal at startup; propagated to the composition root. At steady state (capture-open
    /// failure after the camera was already running) this instead becomes a log + retry loop.
    BindError,
    /// Read/write glitch: a capture reconnect, a dropped frame in the MJPEG hub or encoder sink,
    /// a child encoder stdin write failure. Logged and recovered at the lowest level that can.
    TransientIOError,
    /// `stat`/duration probe failure when finalizing a recording artifact. Logged; the `have_*`
    /// flag for that artifact stays false, but the record persists.
    CorruptArtifact,
    /// An invariant the state machines assume was violated (stop timer fired while not
    /// recording, pool over-allocation). Always a bug; never expected to be recoverable.
    StateInvariant,
    /// A bad HTTP query, unknown identifier, or wrong method. Mapped to a 4xx response; never
    /// logged at error level.
    RequestError,
    /// A push-notification endpoint returned a permanent failure (404/410). The subscription is
    /// deleted rather than retried.
    PushDeliveryPermanent,
    /// A push-notification endpoint returned a transient failure. The subscription's
    /// `last_failure` is updated but the row is kept for retry.
    PushDeliveryTransient,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
            ErrorKind::BindError => "Bind error",
            ErrorKind::TransientIOError => "Transient I/O error",
            ErrorKind::CorruptArtifact => "Corrupt artifact",
            ErrorKind::StateInvariant => "State invariant violated",
            ErrorKind::RequestError => "Request error",
            ErrorKind::PushDeliveryPermanent => "Push delivery permanently failed",
            ErrorKind::PushDeliveryTransient => "Push delivery transiently failed",
        };
        f.write_str(s)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, wrapping the original as its cause.
    ///
    /// ```
    /// use camwatch_base::{ErrorKind, ResultExt};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k, e.to_string()).with_cause(e))
    }
}

/// Builds an [`Error`] of the given kind with a formatted message. Use `msg(...)` for the
/// second argument; the parens are a visual cue that it takes `format!`-style arguments.
///
/// ```
/// use camwatch_base::err;
/// let e = err!(Unauthenticated, msg("unknown user: {}", "slamb"));
/// assert_eq!(e.kind(), camwatch_base::ErrorKind::Unauthenticated);
/// assert_eq!(e.to_string(), "Unauthenticated: unknown user: slamb");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident, msg($($arg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind, format!($($arg)+))
    };
    ($kind:ident) => {
        $crate::Error::from($crate::ErrorKind::$kind)
    };
}

/// Like [`err!`], but returns immediately with `Err(...)`.
///
/// ```
/// use camwatch_base::bail;
/// let e = || -> Result<(), camwatch_base::Error> {
///     bail!(Unauthenticated, msg("unknown user: {}", "slamb"));
/// }().unwrap_err();
/// assert_eq!(e.kind(), camwatch_base::ErrorKind::Unauthenticated);
/// ```
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return Err($crate::err!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let e = err!(NotFound, msg("record {}", "abc"));
        assert_eq!(e.to_string(), "Not found: record abc");
    }

    #[test]
    fn chain_includes_cause() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = Error::new(ErrorKind::Internal, "writing artifact").with_cause(io_err);
        let rendered = e.chain().to_string();
        assert!(rendered.starts_with("Internal: writing artifact"));
        assert!(rendered.contains("caused by: disk full"));
    }

    #[test]
    fn err_kind_wraps_external_error() {
        let r: Result<(), _> = Err(std::io::Error::new(std::io::ErrorKind::NotFound, "enoent"));
        let e = r.err_kind(ErrorKind::BindError).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::BindError);
    }
}
