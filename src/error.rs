//! Error types for lab client operations

use thiserror::Error;

/// Result type for lab client operations
pub type LabResult<T> = Result<T, LabError>;

/// Errors that can end a lab request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabError {
    #[error("Network error: {message}")]
    Transport { message: String },

    #[error("HTTP error! status: {status}")]
    Status { status: u16 },

    #[error("Response has an empty body")]
    EmptyBody,

    #[error("Invalid response from lab server: {details}")]
    InvalidResponse { details: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl LabError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        LabError::Transport {
            message: message.into(),
        }
    }

    /// Create an HTTP status error
    pub fn status(status: u16) -> Self {
        LabError::Status { status }
    }

    /// Create an invalid response error
    pub fn invalid_response(details: impl Into<String>) -> Self {
        LabError::InvalidResponse {
            details: details.into(),
        }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        LabError::Config {
            message: message.into(),
        }
    }

    /// Transport error for a failed read of an already-open response body
    pub fn body_read(err: reqwest::Error) -> Self {
        LabError::transport(error_chain(&err))
    }

    /// Whether the failure happened below HTTP (no usable response)
    pub fn is_transport(&self) -> bool {
        matches!(self, LabError::Transport { .. })
    }

    /// Whether the server answered but the answer was unusable
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            LabError::Status { .. } | LabError::EmptyBody | LabError::InvalidResponse { .. }
        )
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        LabError::transport(err.to_string())
    }
}

impl From<reqwest::Error> for LabError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            LabError::status(status.as_u16())
        } else if err.is_decode() {
            LabError::invalid_response(error_chain(&err))
        } else {
            LabError::transport(error_chain(&err))
        }
    }
}

/// `err` followed by each of its sources, joined with `": "`.
///
/// Causes whose text already appears in the message are skipped.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !text.is_empty() && !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        LabError::invalid_response(format!("JSON parsing error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message_contains_code() {
        let err = LabError::status(500);
        assert!(err.to_string().contains("500"));
        assert!(err.is_protocol());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_io_error_is_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = LabError::from(io);
        assert!(err.is_transport());
        assert!(err.to_string().contains("reset by peer"));
    }

    #[derive(Debug)]
    struct Wrapped {
        context: &'static str,
        cause: Option<Box<Wrapped>>,
    }

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.context)
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
        }
    }

    #[test]
    fn test_error_chain_includes_every_cause() {
        let err = Wrapped {
            context: "error sending request",
            cause: Some(Box::new(Wrapped {
                context: "tcp connect error",
                cause: Some(Box::new(Wrapped {
                    context: "Connection refused (os error 111)",
                    cause: None,
                })),
            })),
        };
        assert_eq!(
            error_chain(&err),
            "error sending request: tcp connect error: Connection refused (os error 111)"
        );
    }

    #[test]
    fn test_error_chain_skips_repeated_cause() {
        let err = Wrapped {
            context: "read failed: connection reset",
            cause: Some(Box::new(Wrapped {
                context: "connection reset",
                cause: None,
            })),
        };
        assert_eq!(error_chain(&err), "read failed: connection reset");
    }

    #[test]
    fn test_json_error_is_invalid_response() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err = LabError::from(json_err);
        assert!(matches!(err, LabError::InvalidResponse { .. }));
    }
}
