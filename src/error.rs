use crate::driver::DriverError;
use thiserror::Error;

/// Boxed error carried as the cause of a connection-level failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error codes attached to configuration, connection and state errors.
pub mod codes {
    pub const NO_CONNECTION: &str = "NO_CONNECTION";
    pub const NO_HOST: &str = "NO_HOST";
    pub const NO_PORT: &str = "NO_PORT";
    pub const NO_DATABASE: &str = "NO_DATABASE";
    pub const NO_COLLECTION: &str = "NO_COLLECTION";
    pub const CANNOT_RESOLVE: &str = "CANNOT_RESOLVE";
    pub const CONNECT_FAILED: &str = "CONNECT_FAILED";
    pub const DISCONNECT_FAILED: &str = "DISCONNECT_FAILED";
    pub const CREATE_IDX_FAILED: &str = "CREATE_IDX_FAILED";
    pub const CLEAR_FAILED: &str = "CLEAR_FAILED";
    pub const NOT_OPENED: &str = "NOT_OPENED";
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Configuration error [{code}]: {message}")]
    Configuration {
        trace_id: String,
        code: &'static str,
        message: String,
    },

    #[error("Connection error [{code}]: {message}")]
    Connection {
        trace_id: String,
        code: &'static str,
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("Invalid state [{code}]: {message}")]
    InvalidState {
        trace_id: String,
        code: &'static str,
        message: String,
    },

    /// A scan was cut short because the component is being closed.
    #[error("Operation terminated: persistence component was closed")]
    Terminated { trace_id: String },

    #[error("Operation cancelled by caller")]
    Cancelled { trace_id: String },

    #[error("Operation deadline exceeded")]
    Timeout { trace_id: String },

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl PersistenceError {
    pub fn configuration(trace_id: &str, code: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            trace_id: trace_id.to_string(),
            code,
            message: message.into(),
        }
    }

    pub fn connection(trace_id: &str, code: &'static str, message: impl Into<String>) -> Self {
        Self::Connection {
            trace_id: trace_id.to_string(),
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn invalid_state(trace_id: &str, code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidState {
            trace_id: trace_id.to_string(),
            code,
            message: message.into(),
        }
    }

    /// Attaches an underlying cause. Only connection errors carry one.
    pub fn with_cause(mut self, err: impl Into<BoxError>) -> Self {
        if let Self::Connection { cause, .. } = &mut self {
            *cause = Some(err.into());
        }
        self
    }

    /// Translates a driver failure into a connection error with the driver
    /// error as its cause. Cancellation, termination and other non-driver
    /// errors pass through untouched.
    pub(crate) fn into_connection(
        self,
        trace_id: &str,
        code: &'static str,
        message: &str,
    ) -> Self {
        match self {
            Self::Driver(err) => Self::connection(trace_id, code, message).with_cause(err),
            other => other,
        }
    }

    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Configuration { code, .. }
            | Self::Connection { code, .. }
            | Self::InvalidState { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        match self {
            Self::Configuration { trace_id, .. }
            | Self::Connection { trace_id, .. }
            | Self::InvalidState { trace_id, .. }
            | Self::Terminated { trace_id }
            | Self::Cancelled { trace_id }
            | Self::Timeout { trace_id } => Some(trace_id),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Conversion(err.to_string())
    }
}
