use futures_util::future::BoxFuture;
use tracing::{debug, instrument};

use crate::server::Session;

/// Protocol-specific processing of one session.
///
/// A server holds exactly one handler and calls it once per accepted
/// connection, each call on its own task. The handler reads requests, writes
/// responses and decides when the session is done by returning. Errors are
/// logged against the session and never reach the accept loop.
pub trait Handler: Send + Sync + 'static {
    fn serve<'a>(&'a self, session: &'a mut Session) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Writes every line it receives back to the peer until end of stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl EchoHandler {
    #[instrument(skip_all, fields(client = session.id()))]
    async fn echo(&self, session: &mut Session) -> anyhow::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if session.read_line(&mut line).await? == 0 {
                debug!("peer closed the stream");
                return Ok(());
            }
            session.write_all(line.as_bytes()).await?;
        }
    }
}

impl Handler for EchoHandler {
    fn serve<'a>(&'a self, session: &'a mut Session) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.echo(session))
    }
}
