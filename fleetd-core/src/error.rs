use std::fmt;

/// Custom error types for fleetd
#[derive(Debug, Clone)]
pub enum FleetError {
    /// Configuration related errors; fatal at startup
    Config(String),
    /// Network/API errors; retried with backoff
    Network(String),
    /// Metric buffer / embedded store errors
    Storage(String),
    /// Agent state persistence errors
    State(String),
    /// Checksum or signature mismatch; the update aborts with no side effect
    Verification(String),
    /// Update apply step failed; triggers rollback when enabled
    Apply(String),
    /// Rollback itself failed; requires operator intervention
    Rollback(String),
    /// A concurrent update is already in flight
    Busy,
    /// Unknown device or campaign id
    NotFound(String),
    /// Operation cancelled; terminal for the operation, not the agent
    Cancelled,
    /// Child process management errors
    Process(String),
    /// General internal errors
    Internal(String),
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FleetError::Network(msg) => write!(f, "Network error: {}", msg),
            FleetError::Storage(msg) => write!(f, "Storage error: {}", msg),
            FleetError::State(msg) => write!(f, "State error: {}", msg),
            FleetError::Verification(msg) => write!(f, "Verification error: {}", msg),
            FleetError::Apply(msg) => write!(f, "Apply error: {}", msg),
            FleetError::Rollback(msg) => write!(f, "Rollback error: {}", msg),
            FleetError::Busy => write!(f, "An update is already in progress"),
            FleetError::NotFound(msg) => write!(f, "Not found: {}", msg),
            FleetError::Cancelled => write!(f, "Operation cancelled"),
            FleetError::Process(msg) => write!(f, "Process error: {}", msg),
            FleetError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for FleetError {}

impl FleetError {
    /// Transient errors are retried locally with backoff; everything else
    /// surfaces to the caller with its original cause preserved.
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::Network(_) | FleetError::Storage(_))
    }
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        // Keep the taxonomy when a FleetError was wrapped in anyhow context
        match err.downcast::<FleetError>() {
            Ok(fleet) => fleet,
            Err(other) => FleetError::Internal(format!("{:#}", other)),
        }
    }
}

impl From<sqlx::Error> for FleetError {
    fn from(err: sqlx::Error) -> Self {
        FleetError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Internal(format!("JSON parsing error: {}", err))
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(format!("TOML parsing error: {}", err))
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::Internal(format!("IO error: {}", err))
    }
}

/// Result type alias for fleetd operations
pub type FleetResult<T> = Result<T, FleetError>;

/// Error context helper for better error reporting
pub trait ErrorContext<T> {
    fn with_storage_context(self, context: &str) -> FleetResult<T>;
    fn with_state_context(self, context: &str) -> FleetResult<T>;
    fn with_network_context(self, context: &str) -> FleetResult<T>;
    fn with_apply_context(self, context: &str) -> FleetResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_storage_context(self, context: &str) -> FleetResult<T> {
        self.map_err(|e| FleetError::Storage(format!("{}: {}", context, e)))
    }

    fn with_state_context(self, context: &str) -> FleetResult<T> {
        self.map_err(|e| FleetError::State(format!("{}: {}", context, e)))
    }

    fn with_network_context(self, context: &str) -> FleetResult<T> {
        self.map_err(|e| FleetError::Network(format!("{}: {}", context, e)))
    }

    fn with_apply_context(self, context: &str) -> FleetResult<T> {
        self.map_err(|e| FleetError::Apply(format!("{}: {}", context, e)))
    }
}
