use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a transport-level failure, assigned once at the
/// failure site. Retry decisions are pure functions over this value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    ConnectTimeout,
    TlsHandshake,
    CertificateVerification,
    CertificatePinning,
    ReadTimeout,
    Reset,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::ConnectTimeout => "connect_timeout",
            Self::TlsHandshake => "tls_handshake",
            Self::CertificateVerification => "certificate_verification",
            Self::CertificatePinning => "certificate_pinning",
            Self::ReadTimeout => "read_timeout",
            Self::Reset => "reset",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    Transport,
    Protocol,
    TooManyFollowUps,
    BodyNotReplayable,
    NoRouteAvailable,
    Canceled,
    AlreadyExecuted,
    InvalidLimit,
    Configuration,
    InvalidCacheKey,
    CacheEditIncomplete,
    CacheClosed,
    Io,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::TooManyFollowUps => "too_many_follow_ups",
            Self::BodyNotReplayable => "body_not_replayable",
            Self::NoRouteAvailable => "no_route_available",
            Self::Canceled => "canceled",
            Self::AlreadyExecuted => "already_executed",
            Self::InvalidLimit => "invalid_limit",
            Self::Configuration => "configuration",
            Self::InvalidCacheKey => "invalid_cache_key",
            Self::CacheEditIncomplete => "cache_edit_incomplete",
            Self::CacheClosed => "cache_closed",
            Self::Io => "io",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid url: {url}")]
    InvalidUrl { url: String },
    /// A connect or I/O failure. `request_sent` records whether any request
    /// bytes may have reached the wire before the failure, which the
    /// recoverability classifier consults.
    #[error("transport error ({kind}) for {uri}: {message}")]
    Transport {
        kind: TransportErrorKind,
        request_sent: bool,
        uri: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    /// A pipeline or HTTP contract violation. Never retried.
    #[error("protocol violation: {message}")]
    Protocol { message: String },
    #[error("too many follow-up requests: {count}")]
    TooManyFollowUps { count: u32 },
    #[error("cannot replay one-shot request body for {uri}")]
    BodyNotReplayable { uri: String },
    #[error("no route to {host}: exhausted all connection candidates")]
    NoRouteAvailable { host: String },
    #[error("call was canceled")]
    Canceled,
    #[error("call has already been executed")]
    AlreadyExecuted,
    #[error("limit must be positive, got {value}")]
    InvalidLimit { value: usize },
    #[error("invalid client configuration: {message}")]
    Configuration { message: String },
    #[error("cache keys must match [a-z0-9_-]{{1,120}}, got {key:?}")]
    InvalidCacheKey { key: String },
    #[error("newly created cache entry did not write a value for slot {index}")]
    CacheEditIncomplete { index: usize },
    #[error("cache is closed")]
    CacheClosed,
    #[error("i/o error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Protocol { .. } => ErrorCode::Protocol,
            Self::TooManyFollowUps { .. } => ErrorCode::TooManyFollowUps,
            Self::BodyNotReplayable { .. } => ErrorCode::BodyNotReplayable,
            Self::NoRouteAvailable { .. } => ErrorCode::NoRouteAvailable,
            Self::Canceled => ErrorCode::Canceled,
            Self::AlreadyExecuted => ErrorCode::AlreadyExecuted,
            Self::InvalidLimit { .. } => ErrorCode::InvalidLimit,
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::InvalidCacheKey { .. } => ErrorCode::InvalidCacheKey,
            Self::CacheEditIncomplete { .. } => ErrorCode::CacheEditIncomplete,
            Self::CacheClosed => ErrorCode::CacheClosed,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// A transport failure with no underlying error value. `request_sent`
    /// is whether any request bytes may have reached the wire.
    pub fn transport(
        kind: TransportErrorKind,
        request_sent: bool,
        uri: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transport {
            kind,
            request_sent,
            uri: uri.into(),
            message: message.into(),
            source: None,
        }
    }

    /// A transport failure wrapping an I/O error.
    pub fn transport_io(
        kind: TransportErrorKind,
        request_sent: bool,
        uri: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Transport {
            kind,
            request_sent,
            uri: uri.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
