//! Per-connection protocol state machine.
//!
//! A `Session` wraps a transport after a completed handshake. One reader
//! task pulls frames off the wire, enforces the framing rules, reassembles
//! fragmented messages and dispatches to registered event handlers. Writes
//! may come from any task (including handlers running inside the reader
//! task) and are serialized by a per-session write mutex.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

use crate::error::{ProtocolError, WsError};
use crate::frame::{self, Frame, Opcode};
use crate::transport::Transport;

/// Frames declaring a payload larger than this are treated as a protocol
/// violation. Adjustable per session via `set_max_frame_payload`.
pub const DEFAULT_MAX_FRAME_PAYLOAD: u64 = 64 << 20;

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The initiator. Sends masked frames, receives unmasked ones.
    Client,
    /// The acceptor. Sends unmasked frames, receives masked ones.
    Server,
}

/// Dispatchable events. Continuation frames never surface: fragments are
/// coalesced and delivered once, under the opcode that started the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Event {
    fn from_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::Text => Some(Event::Text),
            Opcode::Binary => Some(Event::Binary),
            Opcode::Close => Some(Event::Close),
            Opcode::Ping => Some(Event::Ping),
            Opcode::Pong => Some(Event::Pong),
            Opcode::Continuation => None,
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type Handler = Arc<dyn Fn(Arc<Session>, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Event handlers in registration order, keyed by event.
pub(crate) type HandlerTable = HashMap<Event, Vec<Handler>>;

/// Box an async closure into the dispatchable handler shape.
pub(crate) fn make_handler<F, Fut>(handler: F) -> Handler
where
    F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |session, payload| {
        let fut: HandlerFuture = Box::pin(handler(session, payload));
        fut
    })
}

enum Step {
    Continue,
    /// The close handshake completed, the reader loop is done.
    Closed,
}

/// One live WebSocket connection.
pub struct Session {
    role: Role,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<WriteHalf<Transport>>,
    reader: Mutex<Option<ReadHalf<Transport>>>,
    handlers: RwLock<HandlerTable>,
    abort: Mutex<Option<AbortHandle>>,
    /// Set once this side has sent a Close frame.
    closing: AtomicBool,
    stopped: AtomicBool,
    max_frame_payload: AtomicU64,
}

impl Session {
    pub(crate) fn new(
        transport: Transport,
        role: Role,
        peer: SocketAddr,
        handlers: HandlerTable,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(transport);
        Arc::new(Self {
            role,
            peer,
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            handlers: RwLock::new(handlers),
            abort: Mutex::new(None),
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            max_frame_payload: AtomicU64::new(DEFAULT_MAX_FRAME_PAYLOAD),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Cap on a single frame's declared payload length.
    pub fn set_max_frame_payload(&self, limit: u64) {
        self.max_frame_payload.store(limit, Ordering::Relaxed);
    }

    /// Register a handler for `event`, appended after any existing ones.
    /// Safe to call at any time, including from inside another handler:
    /// dispatch works on a snapshot of the list.
    pub fn on<F, Fut>(&self, event: Event, handler: F)
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .write()
            .entry(event)
            .or_default()
            .push(make_handler(handler));
    }

    /// Encode and transmit one frame.
    ///
    /// `first_frame`/`last_frame` control fragmentation; single-frame
    /// messages pass `true, true`. Client sessions mask, server sessions do
    /// not. Sending a Close marks the session as closing, which suppresses
    /// the automatic reply when the peer's Close arrives.
    pub async fn send_frame(
        &self,
        opcode: Opcode,
        payload: &[u8],
        first_frame: bool,
        last_frame: bool,
    ) -> Result<(), WsError> {
        let mask = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        let bytes = frame::encode_frame(opcode, payload, first_frame, last_frame, mask)?;
        if opcode == Opcode::Close {
            self.closing.store(true, Ordering::SeqCst);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(WsError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn send_text(&self, text: impl AsRef<str>) -> Result<(), WsError> {
        self.send_frame(Opcode::Text, text.as_ref().as_bytes(), true, true)
            .await
    }

    pub async fn send_binary(&self, payload: &[u8]) -> Result<(), WsError> {
        self.send_frame(Opcode::Binary, payload, true, true).await
    }

    pub async fn send_ping(&self, payload: &[u8]) -> Result<(), WsError> {
        self.send_frame(Opcode::Ping, payload, true, true).await
    }

    /// Initiate the close handshake with a status code and reason.
    pub async fn send_close(&self, code: u16, reason: &str) -> Result<(), WsError> {
        self.send_frame(Opcode::Close, &frame::close_payload(code, reason), true, true)
            .await
    }

    /// Spawn the reader task. Separate from construction so handlers can be
    /// registered before the first frame is dispatched. Returns the task
    /// handle, or `None` when the session is already serving.
    pub fn serve(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let reader = self.reader.lock().take()?;
        let session = Arc::clone(self);
        let handle = tokio::spawn(session.read_loop(reader));
        *self.abort.lock() = Some(handle.abort_handle());
        Some(handle)
    }

    /// True while the reader task is live and the transport is open.
    pub fn is_serving(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && self
                .abort
                .lock()
                .as_ref()
                .map_or(false, |handle| !handle.is_finished())
    }

    /// Shut the transport down and cancel the reader task. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(abort) = self.abort.lock().take() {
            abort.abort();
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<Transport>) {
        let mut fragment: Option<(Opcode, Vec<u8>)> = None;
        loop {
            let head = match frame::read_head(&mut reader).await {
                Ok(head) => head,
                Err(e) => {
                    debug!(peer = %self.peer, "connection closed: {e}");
                    break;
                }
            };
            match self.process_frame(&mut reader, head, &mut fragment).await {
                Ok(Step::Continue) => {}
                Ok(Step::Closed) => break,
                Err(e) => {
                    match &e {
                        WsError::Io(_) | WsError::ConnectionClosed => {
                            debug!(peer = %self.peer, "read failed: {e}");
                        }
                        _ => error!(peer = %self.peer, "closing connection: {e}"),
                    }
                    if matches!(e, WsError::Protocol(_)) {
                        // Best effort; the violating peer may not read it.
                        let _ = self
                            .send_frame(
                                Opcode::Close,
                                &frame::close_payload(1002, ""),
                                true,
                                true,
                            )
                            .await;
                    }
                    break;
                }
            }
        }
        self.teardown().await;
    }

    /// Validate and consume one frame after its first two header bytes.
    async fn process_frame(
        self: &Arc<Self>,
        reader: &mut ReadHalf<Transport>,
        head: frame::FrameHead,
        fragment: &mut Option<(Opcode, Vec<u8>)>,
    ) -> Result<Step, WsError> {
        let opcode = Opcode::try_from(head.opcode)?;
        if head.rsv != 0 {
            return Err(ProtocolError::ReservedBits.into());
        }
        match self.role {
            Role::Server if !head.masked => return Err(ProtocolError::UnmaskedFrame.into()),
            Role::Client if head.masked => return Err(ProtocolError::MaskedFrame.into()),
            _ => {}
        }
        if opcode.is_control() && !head.fin {
            return Err(ProtocolError::FragmentedControl.into());
        }
        if opcode.is_data() && fragment.is_some() {
            return Err(ProtocolError::InterleavedMessage.into());
        }
        if opcode == Opcode::Continuation && fragment.is_none() {
            return Err(ProtocolError::StrayContinuation.into());
        }

        let length = frame::read_extended_len(reader, head.len7).await?;
        if opcode.is_control() && length > 125 {
            return Err(ProtocolError::ControlFrameTooLong(length).into());
        }
        let limit = self.max_frame_payload.load(Ordering::Relaxed);
        if length > limit {
            return Err(ProtocolError::FrameTooLarge { length, limit }.into());
        }

        let mask = if head.masked {
            Some(frame::read_mask(reader).await?)
        } else {
            None
        };
        let payload = frame::read_payload(reader, length as usize, mask).await?;
        let frame = Frame {
            fin: head.fin,
            opcode,
            payload,
        };

        if frame.opcode.is_control() {
            self.handle_control(frame).await
        } else {
            self.handle_data(frame, fragment).await;
            Ok(Step::Continue)
        }
    }

    /// Control frames pass through mid-fragmentation without disturbing the
    /// in-progress message.
    async fn handle_control(self: &Arc<Self>, frame: Frame) -> Result<Step, WsError> {
        match frame.opcode {
            Opcode::Ping => {
                self.dispatch(Event::Ping, frame.payload.clone()).await;
                // Echo the ping payload. Never happens after a Close: the
                // close handshake ends this loop first.
                self.send_frame(Opcode::Pong, &frame.payload, true, true)
                    .await?;
                Ok(Step::Continue)
            }
            Opcode::Pong => {
                self.dispatch(Event::Pong, frame.payload).await;
                Ok(Step::Continue)
            }
            Opcode::Close => {
                self.dispatch(Event::Close, frame.payload.clone()).await;
                if !self.closing.swap(true, Ordering::SeqCst) {
                    // Reply in kind, unless we initiated the close. The peer
                    // may already be gone, so a failed reply is not an error.
                    if let Err(e) = self
                        .send_frame(Opcode::Close, &frame.payload, true, true)
                        .await
                    {
                        debug!(peer = %self.peer, "close reply failed: {e}");
                    }
                }
                Ok(Step::Closed)
            }
            _ => unreachable!("data opcode on the control path"),
        }
    }

    async fn handle_data(
        self: &Arc<Self>,
        frame: Frame,
        fragment: &mut Option<(Opcode, Vec<u8>)>,
    ) {
        match fragment.take() {
            None if frame.fin => {
                if let Some(event) = Event::from_opcode(frame.opcode) {
                    self.dispatch(event, frame.payload).await;
                }
            }
            None => {
                // First fragment of a message; Text or Binary only, a stray
                // continuation was rejected before the payload was read.
                *fragment = Some((frame.opcode, frame.payload));
            }
            Some((opcode, mut assembled)) => {
                assembled.extend_from_slice(&frame.payload);
                if frame.fin {
                    if let Some(event) = Event::from_opcode(opcode) {
                        self.dispatch(event, assembled).await;
                    }
                } else {
                    *fragment = Some((opcode, assembled));
                }
            }
        }
    }

    /// Run every handler registered for `event`, in registration order, on a
    /// snapshot of the table. A panicking handler is logged and contained.
    async fn dispatch(self: &Arc<Self>, event: Event, payload: Vec<u8>) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&event)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            let fut = handler(Arc::clone(self), payload.clone());
            if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                warn!(peer = %self.peer, ?event, "event handler panicked");
            }
        }
    }

    async fn teardown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
