//! The `error` module defines the error type shared by every `courier`
//! component.
//!
//! Errors fall into four families:
//! - configuration errors (missing collaborators, duplicate names), surfaced
//!   at construction and never retried;
//! - transport errors (`Closed`), propagated to the caller;
//! - per-message errors (handler failures, codec failures, panics), which the
//!   router always turns into a negative acknowledgement;
//! - shutdown errors (`CloseTimeout`).

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The broker (or another transport) has been closed.
    #[error("pub/sub is closed")]
    Closed,

    /// A required collaborator was not provided to a builder.
    #[error("missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// A handler with the same name is already registered on the router.
    #[error("handler '{0}' already exists")]
    DuplicateHandlerName(String),

    /// Two command handlers were registered for the same command name.
    #[error("command handler for '{command_name}' already registered by '{handler_name}'")]
    DuplicateCommandHandler {
        command_name: String,
        handler_name: String,
    },

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Loading settings from files or environment failed.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// `Router::run` was called while the router was already running.
    #[error("router is already running")]
    RouterAlreadyRunning,

    /// The router did not drain its handlers before the close timeout.
    #[error("router close timeout after {0:?}")]
    CloseTimeout(Duration),

    /// A handler registered without a publisher produced messages.
    #[error("returned output messages in a handler without publisher")]
    OutputInNoPublishHandler,

    /// A handler function panicked while processing a message.
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    /// A handler did not finish within the configured timeout.
    #[error("handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    /// Business logic failure reported by a handler.
    #[error("{0}")]
    Handler(String),

    /// Encoding a value into a message failed.
    #[error("cannot marshal: {0}")]
    Marshal(String),

    /// Decoding a message payload failed.
    #[error("cannot unmarshal: {0}")]
    Unmarshal(String),
}

impl Error {
    /// Create a business logic error from anything printable.
    pub fn handler(reason: impl std::fmt::Display) -> Self {
        Self::Handler(reason.to_string())
    }

    /// Whether the error is a configuration error that aborts startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingCollaborator(_)
                | Self::DuplicateHandlerName(_)
                | Self::DuplicateCommandHandler { .. }
                | Self::InvalidConfig(_)
                | Self::Config(_)
        )
    }
}
