//! Listening transports, plain or TLS.
//!
//! A [`Transport`] owns the bound listener for as long as the server is
//! serving. Closing it is signalled through a `watch` channel held by the
//! shutdown coordinator, so a task blocked in [`Transport::accept`] wakes up
//! with [`AcceptError::Closed`] instead of a generic I/O error.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig as RustlsServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::server::stream::{DeadlineStream, SessionStream};

/// Why [`Transport::accept`] did not yield a connection.
#[derive(thiserror::Error, Debug)]
pub enum AcceptError {
    /// The transport was closed, normally because shutdown was initiated.
    #[error("listener closed")]
    Closed,
    /// Any other accept failure.
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

pub struct Transport {
    listener: Option<TcpListener>,
    tls: Option<TlsAcceptor>,
    closed: watch::Receiver<bool>,
}

impl Transport {
    /// Wraps a bound listener without encryption.
    pub fn plain(listener: TcpListener, closed: watch::Receiver<bool>) -> Self {
        Self {
            listener: Some(listener),
            tls: None,
            closed,
        }
    }

    /// Wraps a bound listener so every accepted connection is upgraded to TLS.
    pub fn tls(
        listener: TcpListener,
        config: Arc<RustlsServerConfig>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener: Some(listener),
            tls: Some(TlsAcceptor::from(config)),
            closed,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }

    /// Waits for the next connection.
    ///
    /// The close signal is checked first, so once the transport has been
    /// closed no further connection is handed out even if one is pending.
    /// The TLS handshake is not performed here; see [`Pending::upgrade`].
    pub async fn accept(&mut self) -> Result<Connection, AcceptError> {
        if *self.closed.borrow() {
            self.close();
        }
        let Some(listener) = &self.listener else {
            return Err(AcceptError::Closed);
        };

        let accepted = tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => None,
            res = listener.accept() => Some(res),
        };

        match accepted {
            Some(Ok((stream, peer_addr))) => Ok(Connection {
                stream,
                peer_addr,
                tls: self.tls.clone(),
            }),
            Some(Err(e)) => {
                if *self.closed.borrow() {
                    self.close();
                    Err(AcceptError::Closed)
                } else {
                    Err(AcceptError::Io(e))
                }
            }
            None => {
                self.close();
                Err(AcceptError::Closed)
            }
        }
    }

    /// Drops the listener. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            if let Ok(addr) = listener.local_addr() {
                tracing::debug!(address = %addr, "listener closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }
}

/// Resolves once the close flag is set or its sender is gone.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

/// A freshly accepted connection that has not reached a handler yet.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The raw socket, as handed to the new-connection hook.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Applies deadlines measured from now.
    pub fn with_deadlines(self, read_timeout: Duration, write_timeout: Duration) -> Pending {
        Pending {
            stream: DeadlineStream::new(self.stream, read_timeout, write_timeout),
            peer_addr: self.peer_addr,
            tls: self.tls,
        }
    }
}

/// A connection with its deadlines in place, waiting for the optional TLS
/// handshake.
pub struct Pending {
    stream: DeadlineStream<TcpStream>,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Pending {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    /// Runs the TLS handshake if the transport is encrypted.
    ///
    /// Called from the connection's own worker; the handshake is subject to
    /// the connection deadlines.
    pub async fn upgrade(self) -> io::Result<SessionStream> {
        match self.tls {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(self.stream).await?;
                Ok(SessionStream::Tls(Box::new(tls_stream)))
            }
            None => Ok(SessionStream::Plain(self.stream)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn accepts_plain_connection() {
        let (listener, addr) = bind().await;
        let (_tx, rx) = watch::channel(false);
        let mut transport = Transport::plain(listener, rx);

        let client = TcpStream::connect(addr).await.unwrap();
        let conn = transport.accept().await.unwrap();
        assert_eq!(conn.peer_addr(), client.local_addr().unwrap());

        let stream = conn
            .with_deadlines(Duration::ZERO, Duration::ZERO)
            .upgrade()
            .await
            .unwrap();
        assert!(!stream.is_tls());
    }

    #[tokio::test]
    async fn close_signal_interrupts_pending_accept() {
        let (listener, _addr) = bind().await;
        let (tx, rx) = watch::channel(false);
        let mut transport = Transport::plain(listener, rx);

        let accepting = tokio::spawn(async move {
            let res = transport.accept().await;
            (res, transport)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(true);

        let (res, transport) = accepting.await.unwrap();
        assert!(matches!(res, Err(AcceptError::Closed)));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn closed_transport_hands_out_nothing() {
        let (listener, addr) = bind().await;
        let (tx, rx) = watch::channel(false);
        let mut transport = Transport::plain(listener, rx);

        let _client = TcpStream::connect(addr).await.unwrap();
        tx.send_replace(true);

        assert!(matches!(transport.accept().await, Err(AcceptError::Closed)));
        transport.close();
        assert!(matches!(transport.accept().await, Err(AcceptError::Closed)));
        assert!(transport.local_addr().is_err());
    }
}
