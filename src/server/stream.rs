use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_rustls::server::TlsStream;

/// A stream wrapper enforcing absolute read and write deadlines.
///
/// Deadlines are fixed when the wrapper is built and never renewed. Once a
/// deadline has passed, every subsequent read (or write/flush) fails with
/// [`io::ErrorKind::TimedOut`], the same way a socket deadline behaves.
/// Shutdown is not subject to the write deadline so the connection can
/// always be closed.
#[derive(Debug)]
pub struct DeadlineStream<T> {
    inner: T,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<T> DeadlineStream<T> {
    /// Wraps `inner`, placing deadlines `read_timeout` / `write_timeout` from now.
    ///
    /// A zero duration means no deadline.
    pub fn new(inner: T, read_timeout: Duration, write_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner,
            read_deadline: deadline(now, read_timeout),
            write_deadline: deadline(now, write_timeout),
        }
    }

    /// Returns a reference to the wrapped stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn has_read_deadline(&self) -> bool {
        self.read_deadline.is_some()
    }

    pub fn has_write_deadline(&self) -> bool {
        self.write_deadline.is_some()
    }
}

fn deadline(now: Instant, timeout: Duration) -> Option<Pin<Box<Sleep>>> {
    if timeout.is_zero() {
        None
    } else {
        Some(Box::pin(sleep_until(now + timeout)))
    }
}

fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} deadline exceeded"))
}

impl<T: AsyncRead + Unpin> AsyncRead for DeadlineStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Polling the timer registers the waker, so a pending read is woken
        // when the deadline fires.
        if expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// The byte stream a session reads from and writes to.
///
/// Plain and TLS connections look the same to the handler.
pub enum SessionStream {
    Plain(DeadlineStream<TcpStream>),
    Tls(Box<TlsStream<DeadlineStream<TcpStream>>>),
}

impl SessionStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, SessionStream::Tls(_))
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
