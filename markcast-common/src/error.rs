//! Common error types for markcast

use std::fmt;

use thiserror::Error;

/// Common result type for markcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the mediator, plugins and the control shell
#[derive(Error, Debug)]
pub enum Error {
    /// Caller broke an operation's contract (empty label, empty type list, ...)
    ///
    /// Indicates a programming error in a plugin, not a condition to retry.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The queue received its termination sentinel
    ///
    /// Not a failure: this is the normal signal for a listener to stop
    /// consuming and wind down its run loop.
    #[error("Subscription closed")]
    Unsubscribed,

    /// A subscriber id was registered twice
    #[error("Subscriber already registered: {0}")]
    DuplicateSubscriber(String),

    /// No queue is registered under the given subscriber id
    #[error("Unknown subscriber: {0}")]
    UnknownSubscriber(String),

    /// The mediator has been terminated and accepts no new subscribers
    #[error("Mediator terminated")]
    Terminated,

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound HTTP request failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the sentinel-triggered termination signal
    pub fn is_unsubscribed(&self) -> bool {
        matches!(self, Error::Unsubscribed)
    }
}

/// Batch of configuration problems
///
/// Validation collects every violated constraint before failing, so a user
/// fixing a config file sees all problems at once instead of one per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    messages: Vec<String>,
}

impl ConfigError {
    /// Create a batch from collected messages
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages }
    }

    /// Create a batch holding one message
    pub fn single(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    /// Every violated constraint, in the order it was found
    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages.join("\n"))
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_joins_lines() {
        let err = ConfigError::new(vec![
            "missing \"path\"".to_string(),
            "non-boolean \"delayed\"".to_string(),
        ]);
        assert_eq!(err.to_string(), "missing \"path\"\nnon-boolean \"delayed\"");
        assert_eq!(err.messages().len(), 2);
    }

    #[test]
    fn test_config_error_converts_into_error() {
        let err: Error = ConfigError::single("broken").into();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Configuration error: broken");
    }

    #[test]
    fn test_is_unsubscribed() {
        assert!(Error::Unsubscribed.is_unsubscribed());
        assert!(!Error::Terminated.is_unsubscribed());
    }
}
