//! _wavesock_ is a self-contained WebSocket protocol engine for both
//! connection roles: the client-initiator and the server-acceptor, over TCP
//! or TLS.
//!
//! The crate owns the HTTP/1.1 opening handshake in both directions, the
//! RFC 6455 base frame codec (length tiers, masking, fragmentation
//! reassembly, control-frame rules) and the per-connection state machine
//! with automatic Pong and Close responses. Protocol extensions and
//! subprotocol negotiation are not supported.
//!
//! # Example
//!
//! ```no_run
//! use wavesock::{Client, ConnectOptions, Event, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wavesock::WsError> {
//!     let server = Server::new(ServerOptions {
//!         host: "127.0.0.1".into(),
//!         port: 9880,
//!         ..ServerOptions::default()
//!     });
//!     server.on(Event::Text, |session, payload| async move {
//!         let _ = session.send_binary(&payload).await;
//!     });
//!     server.run().await?;
//!
//!     let session = Client::connect("127.0.0.1", 9880, ConnectOptions::default()).await?;
//!     session.on(Event::Binary, |_session, payload| async move {
//!         println!("echoed: {} bytes", payload.len());
//!     });
//!     session.serve();
//!     session.send_text("Hello?").await?;
//!     Ok(())
//! }
//! ```

mod client;
mod error;
pub mod frame;
pub mod handshake;
mod server;
mod session;
mod tls;
mod transport;

pub use crate::client::{Client, ConnectOptions};
pub use crate::error::{ProtocolError, WsError};
pub use crate::frame::{Frame, Opcode};
pub use crate::server::{Server, ServerOptions};
pub use crate::session::{Event, Role, Session, DEFAULT_MAX_FRAME_PAYLOAD};
pub use crate::tls::{TlsIdentity, VerifyMode};
pub use crate::transport::Transport;
