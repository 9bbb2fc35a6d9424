//! Error types for courierq operations.

use thiserror::Error;

/// Result type used throughout courierq.
pub type CourierResult<T> = Result<T, CourierError>;

/// Main error type for courierq operations.
#[derive(Error, Debug)]
pub enum CourierError {
    /// Job execution failed
    #[error("Job execution failed: {message}")]
    JobFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Job type not found in the registry
    #[error("Job type '{job_type}' is not registered")]
    JobNotRegistered {
        /// The job type that wasn't found
        job_type: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue backend error
    #[error("Queue error: {message}")]
    Queue {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Job ran longer than its allotted time
    #[error("Job timed out after {timeout_secs} seconds")]
    Timeout {
        /// Timeout duration in seconds
        timeout_secs: u64,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// A backend name was registered twice
    #[error("Configuration error: connection '{name}' is already registered")]
    DuplicateConnection {
        /// The backend name
        name: String,
    },

    /// Unexpected reply from a queue daemon
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message
        message: String,
    },

    /// Socket or file error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis connection error
    #[cfg(feature = "redis-cache")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-cache")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Database error
    #[cfg(feature = "database-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "database-queue")))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CourierError {
    /// Create a job execution error from a plain message.
    pub fn job(message: impl Into<String>) -> Self {
        Self::JobFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a job execution error wrapping an underlying error.
    pub fn job_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::JobFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new queue error
    pub fn queue<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Queue {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a queue error without an underlying source.
    pub fn queue_msg(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether this error is a startup misconfiguration rather than a runtime failure.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::DuplicateConnection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(CourierError::config("missing key").is_configuration());
        assert!(
            CourierError::DuplicateConnection {
                name: "sync".to_string()
            }
            .is_configuration()
        );
        assert!(!CourierError::queue_msg("connection reset").is_configuration());
        assert!(!CourierError::job("boom").is_configuration());
    }

    #[test]
    fn test_messages() {
        let err = CourierError::DuplicateConnection {
            name: "database".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Configuration error: connection 'database' is already registered"
        );
        assert_eq!(
            CourierError::Timeout { timeout_secs: 5 }.to_string(),
            "Job timed out after 5 seconds"
        );
    }
}
