use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LicensaError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("api error: {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },
}

pub type LicensaResult<T> = Result<T, LicensaError>;

/// Coarse error shape used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Timeout,
    Connection,
    Api,
    Unclassified,
}

impl ErrorClass {
    /// Classify by variant first, then by message shape for errors that
    /// arrived wrapped as plain strings (e.g. driver messages).
    pub fn of(err: &LicensaError) -> Self {
        match err {
            LicensaError::Timeout(_) => Self::Timeout,
            LicensaError::Connection(_) => Self::Connection,
            LicensaError::Api { .. } => Self::Api,
            other => Self::from_message(&other.to_string()),
        }
    }

    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timeout") || message.contains("ETIMEDOUT") {
            Self::Timeout
        } else if lower.contains("connection") || message.contains("ECONNREFUSED") {
            Self::Connection
        } else if lower.contains("http ") || lower.contains("api error") {
            Self::Api
        } else {
            Self::Unclassified
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Api => "api",
            Self::Unclassified => "unclassified",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_variant() {
        assert_eq!(
            ErrorClass::of(&LicensaError::Timeout("db".into())),
            ErrorClass::Timeout
        );
        assert_eq!(
            ErrorClass::of(&LicensaError::Connection("refused".into())),
            ErrorClass::Connection
        );
        assert_eq!(
            ErrorClass::of(&LicensaError::Api {
                status: Some(502),
                message: "bad gateway".into()
            }),
            ErrorClass::Api
        );
    }

    #[test]
    fn classifies_wrapped_driver_messages() {
        assert_eq!(
            ErrorClass::of(&LicensaError::Database("read ETIMEDOUT".into())),
            ErrorClass::Timeout
        );
        assert_eq!(
            ErrorClass::of(&LicensaError::Database("connect ECONNREFUSED 127.0.0.1:5432".into())),
            ErrorClass::Connection
        );
        assert_eq!(
            ErrorClass::of(&LicensaError::Internal("HTTP 500 from upstream".into())),
            ErrorClass::Api
        );
    }

    #[test]
    fn unknown_errors_stay_unclassified() {
        assert_eq!(
            ErrorClass::of(&LicensaError::Validation("seat count out of range".into())),
            ErrorClass::Unclassified
        );
    }
}
