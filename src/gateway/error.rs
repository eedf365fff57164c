use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes of the gateway. Construction-time kinds abort startup,
/// request-scoped kinds are reported back to the caller as an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    AuthenticationError,
    ConnectionError,
    QueryError,
    ValidationError,
    NotSupportedError,
    ManagementApiError,
}

impl ErrorKind {
    /// JSON-RPC application error code used when the kind surfaces as a fault.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::ConfigurationError => 10,
            ErrorKind::AuthenticationError => 11,
            ErrorKind::ConnectionError => 12,
            ErrorKind::QueryError => 13,
            ErrorKind::ValidationError => 14,
            ErrorKind::NotSupportedError => 15,
            ErrorKind::ManagementApiError => 16,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Database connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Statement rejected: {0}")]
    Validation(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("Management API error: {0}")]
    ManagementApi(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Configuration(_) => ErrorKind::ConfigurationError,
            GatewayError::Authentication(_) => ErrorKind::AuthenticationError,
            GatewayError::Connection(_) => ErrorKind::ConnectionError,
            GatewayError::Query(_) => ErrorKind::QueryError,
            GatewayError::Validation(_) => ErrorKind::ValidationError,
            GatewayError::NotSupported(_) => ErrorKind::NotSupportedError,
            GatewayError::ManagementApi(_) => ErrorKind::ManagementApiError,
        }
    }

    /// Whether a read-path tool should hand this back as an [`ErrorEnvelope`]
    /// instead of failing the call.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AuthenticationError
                | ErrorKind::ConnectionError
                | ErrorKind::QueryError
                | ErrorKind::ValidationError
        )
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.to_string(),
            kind: self.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub kind: ErrorKind,
}

/// Readable text for a driver error. The driver's own `Display` of a
/// server error is only "db error", so the server message and SQLSTATE are
/// used instead, and other errors get their source chain appended.
pub fn describe_pg_error(error: &tokio_postgres::Error) -> String {
    if let Some(db) = error.as_db_error() {
        return format!("{} (SQLSTATE {})", db.message(), db.code().code());
    }

    let mut text = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

impl From<tokio_postgres::Error> for GatewayError {
    fn from(error: tokio_postgres::Error) -> Self {
        // Server-reported errors carry a SQLSTATE; everything else is transport.
        let message = describe_pg_error(&error);
        if error.as_db_error().is_none() && error.is_closed() {
            GatewayError::Connection(message)
        } else {
            GatewayError::Query(message)
        }
    }
}
