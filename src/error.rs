use encoder_bus::RouterError;
use thiserror::Error;

use crate::rtsp::StatusCode;

/// Which protocol rule a request broke. Each maps to one RTSP status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolFault {
    BadRequest,
    Unauthorized,
    NotFound,
    SessionNotFound,
    MethodNotValidInState,
    UnsupportedTransport,
    NotImplemented,
    VersionNotSupported,
}

impl ProtocolFault {
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolFault::BadRequest => StatusCode::BAD_REQUEST,
            ProtocolFault::Unauthorized => StatusCode::UNAUTHORIZED,
            ProtocolFault::NotFound => StatusCode::NOT_FOUND,
            ProtocolFault::SessionNotFound => StatusCode::SESSION_NOT_FOUND,
            ProtocolFault::MethodNotValidInState => StatusCode::METHOD_NOT_VALID_IN_STATE,
            ProtocolFault::UnsupportedTransport => StatusCode::UNSUPPORTED_TRANSPORT,
            ProtocolFault::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ProtocolFault::VersionNotSupported => StatusCode::VERSION_NOT_SUPPORTED,
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    /// No encoder slot, no port pair or no worker available. Retriable.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("protocol violation ({fault:?}): {detail}")]
    ProtocolViolation { fault: ProtocolFault, detail: String },

    #[error("timed out: {0}")]
    Timeout(String),

    /// Caller bug (double init, untracked release, ...). Logged, never fatal.
    #[error("lifecycle misuse: {0}")]
    LifecycleMisuse(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn protocol(fault: ProtocolFault, detail: impl Into<String>) -> Self {
        MediaError::ProtocolViolation {
            fault,
            detail: detail.into(),
        }
    }

    pub fn fault(&self) -> Option<ProtocolFault> {
        match self {
            MediaError::ProtocolViolation { fault, .. } => Some(*fault),
            _ => None,
        }
    }

    /// Status code sent back to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            MediaError::ProtocolViolation { fault, .. } => fault.status(),
            MediaError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            MediaError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            MediaError::LifecycleMisuse(_) | MediaError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RouterError> for MediaError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::UnknownProfile(token) => MediaError::protocol(
                ProtocolFault::NotFound,
                format!("no encoder profile {:?}", token),
            ),
            err @ RouterError::ResourceExhausted { .. } => {
                MediaError::ResourceExhausted(err.to_string())
            }
        }
    }
}
