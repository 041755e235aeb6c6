use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid segment state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Client error (status {status}): {info}")]
    ClientError { status: u16, info: String },

    #[error("Server error (status {status}): {info}")]
    ServerError { status: u16, info: String },

    #[error("Unknown HTTP outcome (status {status}): {info}")]
    Unknown { status: u16, info: String },

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Clock failure: {0}")]
    ClockFailure(String),
}

impl Error {
    /// Map a non-2xx HTTP status to an error kind, carrying any diagnostic
    /// text the response body provided.
    #[must_use]
    pub fn from_status(status: u16, info: impl Into<String>) -> Self {
        let info = info.into();
        match status {
            400 => Self::BadRequest(info),
            404 => Self::NotFound(info),
            401..=499 => Self::ClientError { status, info },
            500..=599 => Self::ServerError { status, info },
            _ => Self::Unknown { status, info },
        }
    }

    /// Transport failures are the only retryable class; application-level
    /// HTTP statuses never are.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(Error::from_status(400, ""), Error::BadRequest(_)));
        assert!(matches!(Error::from_status(404, ""), Error::NotFound(_)));
        assert!(matches!(
            Error::from_status(403, ""),
            Error::ClientError { status: 403, .. }
        ));
        assert!(matches!(
            Error::from_status(503, ""),
            Error::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            Error::from_status(302, ""),
            Error::Unknown { status: 302, .. }
        ));
    }

    #[test]
    fn test_is_transport() {
        assert!(Error::Transport("connection reset".to_string()).is_transport());
        assert!(!Error::from_status(500, "").is_transport());
    }
}
