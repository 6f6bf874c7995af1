//! Error taxonomy for the proxy engine

use std::io;
use thiserror::Error;

/// Severity class used to decide how (or whether) an error gets logged.
///
/// Mirrors the `muteErrorCodes` / `warnErrorCodes` configuration surface:
/// benign peer-initiated closes are muted, a handful of recoverable
/// conditions are logged at warn, everything else is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Mute,
    Warn,
    Error,
}

/// Proxy engine error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upstream {upstream} rejected CONNECT with status {status}")]
    UpstreamConnectFailed { upstream: String, status: u16 },

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Carries its own client-visible status so an `authenticate` hook can
    /// signal anything from `401`/`403` to a bespoke code, not just the
    /// default `407` (§4.7: authenticate hook rejects with a `status` →
    /// that status is what the client sees).
    #[error("Authentication failed: {message}")]
    Auth { message: String, status: u16 },

    #[error("Route error: {0}")]
    Route(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Remote TLS peer not authorized")]
    RemoteNotAuthorized,

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    /// Defaults to `407`, per §4.7's error table; use
    /// [`Error::auth_with_status`] to signal a different status from an
    /// `authenticate` hook.
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Auth {
            message: msg.into(),
            status: 407,
        }
    }

    pub fn auth_with_status<S: Into<String>>(msg: S, status: u16) -> Self {
        Error::Auth {
            message: msg.into(),
            status,
        }
    }

    pub fn route<S: Into<String>>(msg: S) -> Self {
        Error::Route(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn certificate<S: Into<String>>(msg: S) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    pub fn upstream_failed(upstream: impl Into<String>, status: u16) -> Self {
        Error::UpstreamConnectFailed {
            upstream: upstream.into(),
            status,
        }
    }

    /// HTTP status this error maps to when reported back to a client.
    ///
    /// Default is 502, per the CONNECT/HTTP error semantics table.
    pub fn status(&self) -> u16 {
        match self {
            Error::UpstreamConnectFailed { status, .. } => *status,
            Error::Auth { status, .. } => *status,
            _ => 502,
        }
    }

    /// Reason phrase to pair with `status()` on the response line; falls
    /// back to a generic phrase for statuses this taxonomy doesn't name
    /// specifically (e.g. a custom status an `authenticate` hook chose).
    pub fn reason_phrase(&self) -> &'static str {
        match self.status() {
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            407 => "Proxy Authentication Required",
            502 => "Bad Gateway",
            504 => "Gateway Timeout",
            _ => "Proxy Error",
        }
    }

    /// Classification used by `on_error` to decide mute/warn/error logging.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Io(e) => classify_io_kind(e.kind()),
            Error::Connection(_) => ErrorClass::Warn,
            Error::RemoteNotAuthorized => ErrorClass::Warn,
            _ => ErrorClass::Error,
        }
    }
}

/// Structural stand-in for the mute/warn OS error-code tables of the
/// original spec (`EPIPE`, `ECONNRESET`, `ENOTCONN`, `EPROTO`, ...): Rust's
/// `io::ErrorKind` already carries the portable equivalent of those codes.
fn classify_io_kind(kind: io::ErrorKind) -> ErrorClass {
    use io::ErrorKind::*;
    match kind {
        BrokenPipe | ConnectionReset | ConnectionAborted | UnexpectedEof | InvalidInput => {
            ErrorClass::Mute
        }
        NotConnected | WouldBlock => ErrorClass::Warn,
        _ => ErrorClass::Error,
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::ConnectTimeout(std::time::Duration::default())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::Certificate(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
