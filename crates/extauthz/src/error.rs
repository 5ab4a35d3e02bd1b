//! Error types for the authorization decision service

use thiserror::Error;
use tonic::Code;

/// Authorization service error types
///
/// Configuration and listener errors are fatal at startup. Every other
/// variant is scoped to a single check call and is returned to the caller.
#[derive(Debug, Error)]
pub enum ExtAuthzError {
    /// Bad or ambiguous plugin configuration
    #[error("invalid config: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Listener address or bind failure
    #[error("listener error: {message}")]
    Listener {
        /// Error message
        message: String,
    },

    /// Failed to allocate a new evaluation context
    #[error("unable to start new evaluation: {message}")]
    EvalStart {
        /// Error message
        message: String,
    },

    /// Policy store failure (transaction open or close)
    #[error("storage error: {message}")]
    Store {
        /// Error message
        message: String,
    },

    /// Call deadline expired before the query ran
    #[error("check request timed out before query execution: {message}")]
    Timeout {
        /// Error message
        message: String,
    },

    /// Failed to build the policy input from the wire request
    #[error("failed to build policy input: {message}")]
    InputConversion {
        /// Error message
        message: String,
    },

    /// Failed to convert the input document into an engine value
    #[error("failed to convert input to policy value: {message}")]
    ValueConversion {
        /// Error message
        message: String,
    },

    /// Policy evaluation failed
    #[error("policy evaluation error: {message}")]
    Evaluation {
        /// Error message
        message: String,
    },

    /// Decision value could not be shaped into a wire response
    #[error("{message}")]
    ResponseShaping {
        /// Error message
        message: String,
    },

    /// The decision could not be written to the audit sink
    #[error("decision logging failed: {message}")]
    Logging {
        /// Error message
        message: String,
    },
}

impl ExtAuthzError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a listener error
    pub fn listener(msg: impl Into<String>) -> Self {
        Self::Listener {
            message: msg.into(),
        }
    }

    /// Create an evaluation start error
    pub fn eval_start(msg: impl Into<String>) -> Self {
        Self::EvalStart {
            message: msg.into(),
        }
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout {
            message: msg.into(),
        }
    }

    /// Create an input conversion error
    pub fn input_conversion(msg: impl Into<String>) -> Self {
        Self::InputConversion {
            message: msg.into(),
        }
    }

    /// Create a value conversion error
    pub fn value_conversion(msg: impl Into<String>) -> Self {
        Self::ValueConversion {
            message: msg.into(),
        }
    }

    /// Create an evaluation error
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation {
            message: msg.into(),
        }
    }

    /// Create a response shaping error
    pub fn response_shaping(msg: impl Into<String>) -> Self {
        Self::ResponseShaping {
            message: msg.into(),
        }
    }

    /// Create a logging error
    pub fn logging(msg: impl Into<String>) -> Self {
        Self::Logging {
            message: msg.into(),
        }
    }

    /// Prefix the message with context, keeping the variant
    pub fn context(self, ctx: &str) -> Self {
        match self {
            Self::ResponseShaping { message } => Self::ResponseShaping {
                message: format!("{}: {}", ctx, message),
            },
            other => other,
        }
    }

    /// Whether the transaction for this call must be aborted
    ///
    /// Only evaluation failures abort; everything else commits.
    pub fn aborts_transaction(&self) -> bool {
        matches!(self, ExtAuthzError::Evaluation { .. })
    }

    /// gRPC status code reported to the caller for this error
    pub fn grpc_code(&self) -> Code {
        match self {
            ExtAuthzError::Timeout { .. } => Code::DeadlineExceeded,
            ExtAuthzError::Config { .. } => Code::FailedPrecondition,
            ExtAuthzError::Logging { .. } => Code::Unknown,
            _ => Code::Internal,
        }
    }
}

impl From<ExtAuthzError> for tonic::Status {
    fn from(err: ExtAuthzError) -> Self {
        tonic::Status::new(err.grpc_code(), err.to_string())
    }
}

/// Result type for authorization service operations
pub type Result<T> = std::result::Result<T, ExtAuthzError>;
