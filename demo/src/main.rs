//! Echo demo: a listening server and a client in the same process.
//!
//! Run plain with `wavesock-demo`, or over TLS with a freshly generated
//! self-signed certificate via `wavesock-demo --tls`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

use wavesock::{
    Client, ConnectOptions, Event, Server, ServerOptions, Session, TlsIdentity, VerifyMode,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let use_tls = std::env::args().any(|arg| arg == "--tls");

    let tls = if use_tls {
        Some(TlsIdentity::self_signed(&["localhost", "127.0.0.1"])?)
    } else {
        None
    };
    let server = Server::new(ServerOptions {
        host: "127.0.0.1".into(),
        port: 0,
        tls,
    });
    server.on(Event::Text, |session: Arc<Session>, payload| async move {
        info!(
            peer = %session.peer_addr(),
            "server received {:?}",
            String::from_utf8_lossy(&payload)
        );
        let _ = session.send_text("Hello!").await;
    });
    server.run().await?;
    let port = server
        .local_addr()
        .context("server has no bound address")?
        .port();

    let options = ConnectOptions {
        tls: use_tls,
        verify: VerifyMode::None,
        ..ConnectOptions::default()
    };
    let session = Client::connect("127.0.0.1", port, options).await?;
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
    session.on(Event::Text, move |_session, payload| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(payload).await;
        }
    });
    session.serve();

    session.send_text("Hello?").await?;
    let reply = timeout(Duration::from_secs(1), rx.recv())
        .await
        .context("no reply within a second")?
        .context("session closed before replying")?;
    info!("client received {:?}", String::from_utf8_lossy(&reply));

    session.send_close(1000, "done").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.stop().await;
    server.stop().await;
    Ok(())
}
