use thiserror::Error;

/// Configuration and build errors of the fencing engine.
///
/// None of these are retryable with the same inputs: they describe a
/// misconfiguration and fail the enclosing mechanism, method or source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FencingError {
    /// The configuration text could not be parsed
    #[error("Failed to parse fencing configuration '{name}': {details}")]
    Parse { name: String, details: String },

    /// The configuration parsed but is not usable
    #[error("Invalid fencing configuration '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    /// The configuration source does not carry the expected data key
    #[error("ConfigMap '{name}' has no '{key}' entry")]
    MissingData { name: String, key: String },

    /// A dynamic config field has neither a per-target value nor a default
    #[error("No value of '{field}' found for '{target}'")]
    MissingDynamicValue { field: String, target: String },

    /// The mechanism asked for an argument convention we do not implement
    #[error("ArgumentFormat '{0}' not supported")]
    UnsupportedArgumentFormat(String),

    /// One mechanism of a method failed to build, so the method is rejected
    #[error("Method '{method}' aborted: {reason}")]
    MethodAborted { method: String, reason: String },

    /// No configuration matches the target
    #[error("No valid config for {target}")]
    NoConfig { target: String },
}

/// Result type for fencing engine operations
pub type EngineResult<T> = Result<T, FencingError>;
