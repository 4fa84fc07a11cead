//! Listening acceptor.
//!
//! Binds a TCP listener and runs one protocol session per accepted
//! connection: optional TLS accept, server-side handshake, then a
//! server-role `Session` wired with the handler table registered on the
//! server. Live sessions are tracked weakly so `stop` can broadcast without
//! keeping finished connections alive.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::WsError;
use crate::handshake;
use crate::session::{Event, HandlerTable, Role, Session};
use crate::tls::TlsIdentity;
use crate::transport::Transport;

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port (see `Server::local_addr`).
    pub port: u16,
    /// Serve TLS with this identity; plain TCP when absent.
    #[serde(skip)]
    pub tls: Option<TlsIdentity>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
        }
    }
}

type SessionRegistry = Arc<Mutex<HashMap<u64, Weak<Session>>>>;

/// A listening WebSocket server.
pub struct Server {
    options: ServerOptions,
    /// Handler table copied into every accepted session.
    prototype: Arc<RwLock<HandlerTable>>,
    sessions: SessionRegistry,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            prototype: Arc::new(RwLock::new(HandlerTable::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            local_addr: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Register a handler installed on every session accepted from now on.
    pub fn on<F, Fut>(&self, event: Event, handler: F)
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.prototype
            .write()
            .entry(event)
            .or_default()
            .push(crate::session::make_handler(handler));
    }

    /// Bind the listener and spawn the accept loop. Returns once accepting;
    /// already-running servers return immediately.
    pub async fn run(&self) -> Result<(), WsError> {
        if self.shutdown_tx.lock().is_some() {
            return Ok(());
        }

        let acceptor = self.options.tls.as_ref().map(|identity| identity.acceptor());
        let listener =
            TcpListener::bind((self.options.host.as_str(), self.options.port)).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(addr = %local, tls = acceptor.is_some(), "listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let prototype = Arc::clone(&self.prototype);
        let sessions = Arc::clone(&self.sessions);
        let task = tokio::spawn(async move {
            let mut next_id = 0u64;
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            next_id += 1;
                            let id = next_id;
                            let acceptor = acceptor.clone();
                            let prototype = Arc::clone(&prototype);
                            let sessions = Arc::clone(&sessions);
                            tokio::spawn(handle_connection(
                                stream, peer, id, acceptor, prototype, sessions,
                            ));
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        debug!(addr = %local, "accept loop shutting down");
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    /// The bound address, once `run` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Number of sessions currently alive.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Close the listener and stop every live session. Idempotent.
    pub async fn stop(&self) {
        let shutdown = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown {
            let _ = tx.send(()).await;
        }
        let live: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            sessions
                .drain()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for session in live {
            session.stop().await;
        }
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        *self.local_addr.lock() = None;
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    acceptor: Option<TlsAcceptor>,
    prototype: Arc<RwLock<HandlerTable>>,
    sessions: SessionRegistry,
) {
    let mut transport = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Transport::ServerTls(Box::new(tls)),
            Err(e) => {
                warn!(%peer, "tls accept failed: {e}");
                return;
            }
        },
        None => Transport::Plain(stream),
    };

    let upgrade = match handshake::server(&mut transport).await {
        Ok(upgrade) => upgrade,
        Err(e) => {
            warn!(%peer, "handshake failed: {e}");
            let _ = transport.shutdown().await;
            return;
        }
    };
    debug!(%peer, path = %upgrade.path, "connection upgraded");

    let handlers = prototype.read().clone();
    let session = Session::new(transport, Role::Server, peer, handlers);
    sessions.lock().insert(id, Arc::downgrade(&session));
    if let Some(done) = session.serve() {
        let _ = done.await;
    }
    sessions.lock().remove(&id);
    debug!(%peer, "session finished");
}
