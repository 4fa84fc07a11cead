//! Client-side connector.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::error::WsError;
use crate::handshake;
use crate::session::{HandlerTable, Role, Session};
use crate::tls::{self, VerifyMode};
use crate::transport::Transport;

/// Connection options for [`Client::connect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Wrap the connection in TLS before the handshake.
    pub tls: bool,
    /// SNI hostname; defaults to the target host.
    pub sni: Option<String>,
    pub verify: VerifyMode,
    /// Request path of the upgrade request.
    pub path: String,
    /// `Origin` header, sent when non-empty.
    pub origin: Option<String>,
    /// Additional header lines appended to the upgrade request.
    pub extra_headers: Vec<(String, String)>,
    pub user_agent: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            tls: false,
            sni: None,
            verify: VerifyMode::default(),
            path: "/".to_string(),
            origin: None,
            extra_headers: Vec::new(),
            user_agent: "WebSocket::Client".to_string(),
        }
    }
}

/// The client-initiator role: opens the TCP (and optionally TLS) stream,
/// performs the opening handshake and hands back a client-role session.
pub struct Client;

impl Client {
    /// Connect and upgrade. The returned session has no handlers yet and is
    /// not reading; register handlers with [`Session::on`] and then call
    /// [`Session::serve`].
    pub async fn connect(
        host: &str,
        port: u16,
        options: ConnectOptions,
    ) -> Result<Arc<Session>, WsError> {
        let stream = TcpStream::connect((host, port)).await?;
        let peer = stream.peer_addr()?;

        let mut transport = if options.tls {
            let connector = tls::connector(options.verify);
            let sni = options.sni.clone().unwrap_or_else(|| host.to_string());
            let name = ServerName::try_from(sni)
                .map_err(|e| WsError::InvalidArgument(format!("invalid sni hostname: {e}")))?;
            let tls_stream = connector.connect(name, stream).await?;
            Transport::ClientTls(Box::new(tls_stream))
        } else {
            Transport::Plain(stream)
        };

        if let Err(e) = handshake::client(&mut transport, host, port, &options).await {
            error!(host, port, "handshake failed: {e}");
            let _ = transport.shutdown().await;
            return Err(e);
        }
        debug!(%peer, "connected");

        Ok(Session::new(transport, Role::Client, peer, HandlerTable::new()))
    }
}
