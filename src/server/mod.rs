// src/server/mod.rs
pub mod acceptor;
pub mod handler;
pub mod session;
pub mod shutdown;
pub mod stream;
pub mod transport;

// Re-export public components
pub use handler::{EchoHandler, Handler};
pub use session::Session;
pub use shutdown::{Shutdown, WorkerGroup, WorkerGuard};
pub use transport::{AcceptError, Transport};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig as RustlsServerConfig;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::info;

use crate::utils::{ConfigError, ServerError};

/// Called with every accepted socket before it becomes a session.
/// Returning an error rejects and closes the connection.
pub type ConnectionHook = dyn Fn(&TcpStream) -> anyhow::Result<()> + Send + Sync;

/// Settings shared read-only by the accept loop and every session.
#[derive(Clone, Default)]
pub struct ServerConfig {
    handler: Option<Arc<dyn Handler>>,
    tls: Option<Arc<RustlsServerConfig>>,
    read_timeout: Duration,
    write_timeout: Duration,
    on_new_connection: Option<Arc<ConnectionHook>>,
}

impl ServerConfig {
    pub fn handler(&self) -> Option<&Arc<dyn Handler>> {
        self.handler.as_ref()
    }

    pub fn tls_config(&self) -> Option<&Arc<RustlsServerConfig>> {
        self.tls.as_ref()
    }

    /// Read deadline applied to each connection at accept time. Zero means none.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Write deadline applied to each connection at accept time. Zero means none.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn has_connection_hook(&self) -> bool {
        self.on_new_connection.is_some()
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("handler", &self.handler.is_some())
            .field("tls", &self.tls.is_some())
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("on_new_connection", &self.on_new_connection.is_some())
            .finish()
    }
}

/// A stream server.
///
/// Configure it through the `&mut self` methods, then share it (usually in an
/// `Arc`) between the task that serves and the task that stops it:
///
/// ```no_run
/// # use std::sync::Arc;
/// # use session_server::server::{EchoHandler, Server};
/// # async fn run() -> anyhow::Result<()> {
/// let mut server = Server::new();
/// server.handle(EchoHandler)?;
/// let server = Arc::new(server);
///
/// let serving = tokio::spawn({
///     let server = Arc::clone(&server);
///     async move { server.listen_and_serve("127.0.0.1:3890").await }
/// });
///
/// // ... later
/// server.stop().await?;
/// serving.await??;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Server {
    config: ServerConfig,
    shutdown: Shutdown,
    next_id: AtomicU64,
    serving: AtomicBool,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for the server.
    ///
    /// # Errors
    /// Returns [`ConfigError::DuplicateHandler`] if a handler is already set.
    pub fn handle<H: Handler>(&mut self, handler: H) -> Result<(), ConfigError> {
        if self.config.handler.is_some() {
            return Err(ConfigError::DuplicateHandler);
        }
        self.config.handler = Some(Arc::new(handler));
        Ok(())
    }

    /// TLS configuration used by [`Server::serve_tls`].
    pub fn set_tls_config(&mut self, config: Arc<RustlsServerConfig>) {
        self.config.tls = Some(config);
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.config.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.config.write_timeout = timeout;
    }

    /// Installs a hook run on every new connection before it gets an id.
    pub fn on_new_connection<F>(&mut self, hook: F)
    where
        F: Fn(&TcpStream) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.config.on_new_connection = Some(Arc::new(hook));
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serves plain connections accepted on `listener` until shutdown.
    ///
    /// # Errors
    /// Fails before accepting anything if no handler is registered or the
    /// server is already serving. Returns [`ServerError::Accept`] if the
    /// listener fails for any reason other than shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let handler = self.begin()?;
        let transport = Transport::plain(listener, self.shutdown.closed());
        self.run(transport, handler).await
    }

    /// Like [`Server::serve`], upgrading every connection to TLS first.
    pub async fn serve_tls(&self, listener: TcpListener) -> Result<(), ServerError> {
        let tls = self
            .config
            .tls_config()
            .cloned()
            .ok_or(ConfigError::MissingTlsConfig)?;
        let handler = self.begin()?;
        let transport = Transport::tls(listener, tls, self.shutdown.closed());
        self.run(transport, handler).await
    }

    /// Binds `addr` and serves plain connections on it.
    pub async fn listen_and_serve<A: ToSocketAddrs>(&self, addr: A) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        self.serve(listener).await
    }

    /// Binds `addr` and serves TLS connections on it.
    pub async fn listen_and_serve_tls<A: ToSocketAddrs>(
        &self,
        addr: A,
    ) -> Result<(), ServerError> {
        if self.config.tls_config().is_none() {
            return Err(ConfigError::MissingTlsConfig.into());
        }
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        self.serve_tls(listener).await
    }

    fn begin(&self) -> Result<Arc<dyn Handler>, ConfigError> {
        let handler = self
            .config
            .handler
            .clone()
            .ok_or(ConfigError::MissingHandler)?;
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyServing);
        }
        Ok(handler)
    }

    async fn run(
        &self,
        mut transport: Transport,
        handler: Arc<dyn Handler>,
    ) -> Result<(), ServerError> {
        if let Ok(addr) = transport.local_addr() {
            info!(
                address = %addr,
                tls = transport.is_tls(),
                hook = self.config.has_connection_hook(),
                "serving"
            );
        }
        let acceptor = acceptor::Acceptor {
            config: Arc::new(self.config.clone()),
            handler,
            shutdown: &self.shutdown,
            next_id: &self.next_id,
        };
        let result = acceptor.run(&mut transport).await;
        transport.close();
        result
    }

    /// Stops accepting connections. In-flight sessions keep running.
    ///
    /// # Errors
    /// Returns [`ConfigError::ShutdownTwice`] on every call after the first.
    pub fn shutdown(&self) -> Result<(), ConfigError> {
        self.shutdown.initiate()
    }

    /// Waits until the accept loop has exited and every dispatched session
    /// has finished.
    pub async fn wait_drain(&self) {
        self.shutdown.wait_drain().await;
    }

    /// Stops accepting, then waits for every in-flight session to finish.
    pub async fn stop(&self) -> Result<(), ConfigError> {
        self.shutdown()?;
        info!("gracefully closing client connections...");
        self.wait_drain().await;
        info!("all client connections closed");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Number of sessions whose worker has not finished yet.
    pub fn active_sessions(&self) -> usize {
        self.shutdown.workers().active()
    }
}
