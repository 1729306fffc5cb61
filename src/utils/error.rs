use std::io;
use thiserror::Error;

/// Misconfiguration detected before or outside of serving.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A handler was registered on a server that already has one.
    #[error("multiple Handler registrations")]
    DuplicateHandler,

    /// Serving was requested before any handler was registered.
    #[error("no request Handler defined")]
    MissingHandler,

    /// `serve_tls` was called without a TLS configuration.
    #[error("TLS requested but no TLS configuration was set")]
    MissingTlsConfig,

    /// The server is already running its accept loop.
    #[error("server is already serving")]
    AlreadyServing,

    /// Shutdown may only be initiated once per server.
    #[error("shutdown already initiated")]
    ShutdownTwice,

    /// Represents an invalid or inconsistent setting.
    ///
    /// Raised while loading or validating [`crate::config::Settings`].
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that end serving and are returned to whoever started it.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The server was not in a state that allows serving.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Binding the listening socket failed.
    #[error("Bind error: {0}")]
    Bind(#[source] io::Error),

    /// Accepting a connection failed for a reason other than shutdown.
    ///
    /// The accept loop does not retry; a single failure ends serving.
    #[error("Accept error: {0}")]
    Accept(#[source] io::Error),
}
