//! RFC 6455 base frame codec.
//!
//! Pure framing only: header layout, the three length-encoding tiers and
//! payload masking. Which side must mask and which must not is a property of
//! the session role and is enforced by the session, not here.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtocolError, WsError};

/// Payload bytes are read from the wire in chunks of at most this size.
const READ_CHUNK: usize = 1024;

/// WebSocket frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Close, Ping and Pong. Control frames are never fragmented and carry
    /// at most 125 payload bytes.
    pub fn is_control(self) -> bool {
        self as u8 >= 0x8
    }

    /// Text or Binary, the opcodes that may start a fragmented message.
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// The first two header bytes of a frame, undecoded beyond bit extraction.
///
/// The opcode nibble is left raw so the caller decides how to report an
/// out-of-enum value.
#[derive(Debug, Clone, Copy)]
pub struct FrameHead {
    pub fin: bool,
    /// RSV1..RSV3, already shifted down. Nonzero without a negotiated
    /// extension is a protocol violation.
    pub rsv: u8,
    pub opcode: u8,
    pub masked: bool,
    pub len7: u8,
}

impl FrameHead {
    pub fn parse(bytes: [u8; 2]) -> Self {
        Self {
            fin: bytes[0] & 0x80 != 0,
            rsv: (bytes[0] >> 4) & 0x07,
            opcode: bytes[0] & 0x0F,
            masked: bytes[1] & 0x80 != 0,
            len7: bytes[1] & 0x7F,
        }
    }
}

/// Read the two fixed header bytes of the next frame.
pub async fn read_head<R>(reader: &mut R) -> std::io::Result<FrameHead>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    Ok(FrameHead::parse(head))
}

/// Resolve the 7-bit length field into the actual payload length,
/// reading the 2- or 8-byte big-endian extension when needed.
pub async fn read_extended_len<R>(reader: &mut R, len7: u8) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    match len7 {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            Ok(u16::from_be_bytes(ext) as u64)
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            Ok(u64::from_be_bytes(ext))
        }
        direct => Ok(direct as u64),
    }
}

/// Read the 4-byte masking key.
pub async fn read_mask<R>(reader: &mut R) -> std::io::Result<[u8; 4]>
where
    R: AsyncRead + Unpin,
{
    let mut mask = [0u8; 4];
    reader.read_exact(&mut mask).await?;
    Ok(mask)
}

/// Read `len` payload bytes in bounded chunks, unmasking on the fly when a
/// masking key is present. A short read surfaces as `UnexpectedEof`.
pub async fn read_payload<R>(
    reader: &mut R,
    len: usize,
    mask: Option<[u8; 4]>,
) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let end = (filled + READ_CHUNK).min(len);
        reader.read_exact(&mut payload[filled..end]).await?;
        filled = end;
    }
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }
    Ok(payload)
}

/// XOR every payload byte with `mask[i % 4]`. Applying twice restores the
/// original bytes, so the same routine masks and unmasks.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encode one frame.
///
/// `first_frame`/`last_frame` drive fragmentation: the opcode is written on
/// the first frame of a message and Continuation afterwards, and FIN is set
/// on the last. Control frames ignore both flags since they cannot be
/// fragmented. A mask must be supplied iff the sender is the client.
pub fn encode_frame(
    opcode: Opcode,
    payload: &[u8],
    first_frame: bool,
    last_frame: bool,
    mask: Option<[u8; 4]>,
) -> Result<Vec<u8>, WsError> {
    if opcode.is_control() && payload.len() > 125 {
        return Err(WsError::InvalidArgument(format!(
            "control frame payload of {} bytes exceeds 125",
            payload.len()
        )));
    }

    let (fin, wire_opcode) = if opcode.is_control() {
        (true, opcode)
    } else {
        (last_frame, if first_frame { opcode } else { Opcode::Continuation })
    };

    let len = payload.len();
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    let mut frame = Vec::with_capacity(14 + len);
    frame.push(if fin { 0x80 } else { 0x00 } | wire_opcode as u8);
    if len < 126 {
        frame.push(mask_bit | len as u8);
    } else if len < 65536 {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(mask) => {
            frame.extend_from_slice(&mask);
            let start = frame.len();
            frame.extend_from_slice(payload);
            apply_mask(&mut frame[start..], mask);
        }
        None => frame.extend_from_slice(payload),
    }

    Ok(frame)
}

/// Build a Close frame body: 2-byte big-endian status code plus an optional
/// UTF-8 reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}
