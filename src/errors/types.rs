//! # Error Types
//!
//! Error types for the Switchyard control plane using `thiserror`.

/// Custom result type for Switchyard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Switchyard control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors, including invalid user configuration objects
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network transport errors (gRPC listen/serve failures)
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding errors with context about what was being decoded
    #[error("Serialization error: {context}: {message}")]
    Serialization { context: String, message: String },

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// A translator plugin rejected an object
    #[error("plugin {plugin}: {message}")]
    Plugin { plugin: &'static str, message: String },

    /// An error relayed from one of the watchers, tagged with its source
    #[error("{source_name}: {source}")]
    Watcher {
        source_name: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// An error relayed from an endpoint discovery backend
    #[error("endpoint discovery {discovery}: {source}")]
    Discovery {
        discovery: String,
        #[source]
        source: Box<Error>,
    },

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Create a plugin error attributed to `plugin`
    pub fn plugin<S: Into<String>>(plugin: &'static str, message: S) -> Self {
        Self::Plugin { plugin, message: message.into() }
    }

    /// Create a decoding error with context
    pub fn serialization<C: Into<String>, E: std::fmt::Display>(context: C, err: E) -> Self {
        Self::Serialization { context: context.into(), message: err.to_string() }
    }

    /// Wrap an error with the name of the watcher it came from
    pub fn from_watcher(source_name: &'static str, source: Error) -> Self {
        Self::Watcher { source_name, source: Box::new(source) }
    }

    /// Wrap an error with the identity of the discovery backend it came from
    pub fn from_discovery<S: Into<String>>(discovery: S, source: Error) -> Self {
        Self::Discovery { discovery: discovery.into(), source: Box::new(source) }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}
