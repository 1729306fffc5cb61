use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{
    split, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tracing::debug;

use crate::server::stream::SessionStream;
use crate::server::ServerConfig;

pub type SessionReader = BufReader<ReadHalf<SessionStream>>;
pub type SessionWriter = BufWriter<WriteHalf<SessionStream>>;

/// One accepted connection, as seen by a [`Handler`](crate::server::Handler).
///
/// The session is owned by the connection's worker; the handler borrows it
/// for the duration of its run. When the handler returns the worker flushes
/// and closes the connection.
pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    tls: bool,
    reader: SessionReader,
    writer: SessionWriter,
    config: Arc<ServerConfig>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        peer_addr: SocketAddr,
        stream: SessionStream,
        config: Arc<ServerConfig>,
    ) -> Self {
        let tls = stream.is_tls();
        let (read_half, write_half) = split(stream);
        Self {
            id,
            peer_addr,
            tls,
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            config,
        }
    }

    /// Ordinal of this connection, starting at 1 for the first accepted
    /// connection of a server.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Configuration of the server that accepted this session.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn reader(&mut self) -> &mut SessionReader {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut SessionWriter {
        &mut self.writer
    }

    /// Borrows the reader and writer at the same time.
    pub fn split(&mut self) -> (&mut SessionReader, &mut SessionWriter) {
        (&mut self.reader, &mut self.writer)
    }

    /// Reads one line, including its terminator. Returns 0 at end of stream.
    pub async fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        self.reader.read_line(buf).await
    }

    /// Writes `data` and flushes it to the peer.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    /// Flushes pending output and shuts the connection down.
    pub(crate) async fn close(self) -> io::Result<()> {
        let Session {
            id,
            mut writer,
            reader,
            ..
        } = self;
        if let Err(e) = writer.flush().await {
            debug!(client = id, error = %e, "dropping unflushed output");
        }
        let mut stream = reader.into_inner().unsplit(writer.into_inner());
        stream.shutdown().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}
