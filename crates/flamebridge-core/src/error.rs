//! Error types for flamebridge-core

use std::path::PathBuf;
use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur while driving a native engine session
#[derive(Debug, Error)]
pub enum SessionError {
    /// The engine module could not be mapped into the process
    #[error("Failed to load engine module {path:?}: {source}")]
    ModuleLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// A required entry point is missing from the engine module
    #[error("Can't locate entry point \"{symbol}\" in module {module}: {source}")]
    Binding {
        symbol: String,
        module: String,
        #[source]
        source: libloading::Error,
    },

    /// A plugin could not be initialized; the session was released
    #[error("Unable to load plugin {path:?}: {cause}")]
    PluginLoad {
        path: PathBuf,
        #[source]
        cause: Box<SessionError>,
    },

    /// A render parameter was rejected before reaching the engine
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation is not allowed in the current session state
    #[error("Cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// An engine entry point failed during an otherwise valid call
    #[error("Native call {operation} failed: {cause}")]
    NativeCall {
        operation: &'static str,
        cause: String,
    },

    /// The render entry point returned a non-zero completion code
    #[error("Render failed with code {code}")]
    RenderFailure { code: u32 },

    /// Session configuration file error
    #[error("Session config error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn invalid_state(operation: &'static str, state: SessionState) -> SessionError {
    SessionError::InvalidState { operation, state }
}
