use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use session_server::server::{EchoHandler, Handler, Server, Session};
use session_server::ServerError;

fn tls_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = generated.cert.der().to_vec();
    let key_der = generated.key_pair.serialize_der();

    let server = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(cert_der.clone())], PrivateKey(key_der))
        .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(&Certificate(cert_der)).unwrap();
    let client = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server), Arc::new(client))
}

async fn start_tls<H: Handler>(
    handler: H,
    tls: Arc<ServerConfig>,
) -> (Arc<Server>, SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let mut server = Server::new();
    server.handle(handler).unwrap();
    server.set_tls_config(tls);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server);
    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve_tls(listener).await }
    });
    (server, addr, serving)
}

async fn echo_over_tls(addr: SocketAddr, client: Arc<ClientConfig>, msg: &str) -> String {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let domain = ServerName::try_from("localhost").unwrap();
    let tls = TlsConnector::from(client).connect(domain, tcp).await.unwrap();

    let mut stream = BufReader::new(tls);
    stream.get_mut().write_all(msg.as_bytes()).await.unwrap();
    let mut echoed = String::new();
    stream.read_line(&mut echoed).await.unwrap();
    stream.get_mut().shutdown().await.unwrap();
    echoed
}

#[tokio::test]
async fn echoes_over_tls() {
    let (server_tls, client_tls) = tls_configs();
    let (server, addr, serving) = start_tls(EchoHandler, server_tls).await;

    assert_eq!(
        echo_over_tls(addr, Arc::clone(&client_tls), "secure hello\n").await,
        "secure hello\n"
    );
    assert_eq!(echo_over_tls(addr, client_tls, "again\n").await, "again\n");

    timeout(Duration::from_secs(5), server.stop())
        .await
        .unwrap()
        .unwrap();
    serving.await.unwrap().unwrap();
}

/// Reports whether the session arrived over TLS.
struct TlsFlag;

impl Handler for TlsFlag {
    fn serve<'a>(&'a self, session: &'a mut Session) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut line = String::new();
            session.read_line(&mut line).await?;
            let reply = format!("{}\n", session.is_tls());
            session.write_all(reply.as_bytes()).await?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn failed_handshake_does_not_stop_serving() {
    let (server_tls, client_tls) = tls_configs();
    let (server, addr, serving) = start_tls(TlsFlag, server_tls).await;

    let mut plain = TcpStream::connect(addr).await.unwrap();
    plain.write_all(b"not a client hello\n").await.unwrap();
    let mut buf = Vec::new();
    let _ = timeout(Duration::from_secs(5), plain.read_to_end(&mut buf)).await;
    assert!(!buf.starts_with(b"true"));

    assert_eq!(echo_over_tls(addr, client_tls, "ping\n").await, "true\n");

    timeout(Duration::from_secs(5), server.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.active_sessions(), 0);
    serving.await.unwrap().unwrap();
}
