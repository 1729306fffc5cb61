//! The accept loop and per-connection workers.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use crate::server::transport::{AcceptError, Pending};
use crate::server::{Handler, ServerConfig, Session, Shutdown, Transport, WorkerGuard};
use crate::utils::ServerError;

/// State the accept loop borrows from its [`Server`](crate::server::Server).
pub(crate) struct Acceptor<'s> {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) shutdown: &'s Shutdown,
    pub(crate) next_id: &'s AtomicU64,
}

impl Acceptor<'_> {
    /// Accepts connections until shutdown or an accept failure.
    ///
    /// Never waits on a worker: each session runs on its own task. The loop
    /// holds an acceptor guard for its whole run, so a drain cannot finish
    /// while a connection is between accept and worker registration.
    pub(crate) async fn run(&self, transport: &mut Transport) -> Result<(), ServerError> {
        let _accepting = self.shutdown.acceptors().add();
        loop {
            if self.shutdown.is_set() {
                transport.close();
                return Ok(());
            }

            let conn = match transport.accept().await {
                Ok(conn) => conn,
                Err(AcceptError::Closed) => {
                    debug!("listener closed, leaving accept loop");
                    return Ok(());
                }
                Err(AcceptError::Io(e)) => {
                    error!("Accept error: {}", e);
                    return Err(ServerError::Accept(e));
                }
            };

            let pending =
                conn.with_deadlines(self.config.read_timeout(), self.config.write_timeout());

            if let Some(hook) = &self.config.on_new_connection {
                if let Err(e) = hook(pending.stream()) {
                    debug!(peer = %pending.peer_addr(), error = %e, "connection rejected");
                    continue;
                }
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            info!("client [{}] from {} accepted", id, pending.peer_addr());

            let guard = self.shutdown.workers().add();
            tokio::spawn(work(
                id,
                pending,
                Arc::clone(&self.config),
                Arc::clone(&self.handler),
                guard,
            ));
        }
    }
}

/// Runs one session to completion.
///
/// The guard is the last thing dropped, after the connection is closed.
async fn work(
    id: u64,
    pending: Pending,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    _guard: WorkerGuard,
) {
    let peer = pending.peer_addr();
    let stream = match pending.upgrade().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(client = id, %peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let mut session = Session::new(id, peer, stream, config);
    let outcome = AssertUnwindSafe(handler.serve(&mut session))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => debug!(client = id, "handler finished"),
        Ok(Err(e)) => warn!(client = id, error = %e, "handler failed"),
        Err(_) => error!(client = id, "handler panicked"),
    }

    if let Err(e) = session.close().await {
        debug!(client = id, error = %e, "error closing connection");
    }
    info!("client [{}] disconnected", id);
}
