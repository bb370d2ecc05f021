//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! [`Frame`] is the wire-level unit the [`codec`](crate::codec) reads and writes. Applications
//! mostly see [`Message`], the reassembled text or binary payload handed to
//! [`Handler::on_message`](crate::Handler::on_message).
use bytes::{Bytes, BytesMut};

use crate::{
    close::{CloseCode, CloseReason},
    WebSocketError,
};

/// WebSocket operation code, the low four bits of the first header byte.
///
/// `Continuation`, `Text` and `Binary` carry message data; `Close`, `Ping` and `Pong` are
/// control frames. The values 0x3-0x7 and 0xB-0xF are reserved and rejected while decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes of payload.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A complete application message: one or more data frames, reassembled and unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Either [`OpCode::Text`] or [`OpCode::Binary`].
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Message {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    #[inline]
    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }

    /// The payload as a string slice, or `None` if it is not valid UTF-8.
    ///
    /// Text messages are only guaranteed to be valid UTF-8 when the connection was set up
    /// with [`Options::with_utf8`](crate::Options::with_utf8).
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<Message> for (OpCode, Bytes) {
    fn from(val: Message) -> Self {
        (val.opcode, val.payload)
    }
}

/// Upper bound of a frame header: 2 base bytes, 8 bytes of extended length, 4 bytes of mask.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// A single WebSocket frame.
///
/// Frames coming out of the [`Decoder`](crate::codec::Decoder) are already unmasked.
/// Frames written by the server are never masked; the client role of the
/// [`Encoder`](crate::codec::Encoder) masks them right before serialization.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    pub opcode: OpCode,
    /// Key the payload is currently masked with.
    mask: Option<[u8; 4]>,
    pub payload: BytesMut,
}

impl Frame {
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// A final, unmasked frame with the given opcode.
    pub fn single(opcode: OpCode, payload: &[u8]) -> Self {
        Self::new(true, opcode, None, BytesMut::from(payload))
    }

    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::single(OpCode::Text, payload.as_ref())
    }

    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::single(OpCode::Binary, payload.as_ref())
    }

    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::single(OpCode::Ping, payload.as_ref())
    }

    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::single(OpCode::Pong, payload.as_ref())
    }

    /// Close frame carrying a status code and a reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        let payload = CloseReason::new(code, reason).to_payload();
        Self::single(OpCode::Close, &payload)
    }

    /// Close frame with an arbitrary payload; the payload is not validated.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::single(OpCode::Close, payload.as_ref())
    }

    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Masks the payload with a fresh random key. A frame that already carries a key is
    /// left as is.
    pub(crate) fn mask(&mut self) {
        if self.mask.is_none() {
            let mask: [u8; 4] = rand::random();
            crate::mask::apply_mask(&mut self.payload, mask);
            self.mask = Some(mask);
        }
    }

    /// Removes the masking key and restores the payload.
    pub(crate) fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, mask);
        }
    }

    /// Parses the payload of a close frame.
    ///
    /// Returns `Ok(None)` for an empty payload. A one byte payload, a status code that
    /// may not be sent on the wire, or a non UTF-8 reason are protocol errors.
    pub fn close_reason(&self) -> Result<Option<CloseReason>, WebSocketError> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([self.payload[0], self.payload[1]]));
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }

                let reason = std::str::from_utf8(&self.payload[2..])
                    .map_err(|_| WebSocketError::InvalidUTF8)?;
                Ok(Some(CloseReason::new(code, reason)))
            }
        }
    }

    /// Writes the frame header into `head` and returns its length.
    ///
    /// The length field takes the shortest form: 7 bits below 126, a 16-bit extension up to
    /// 65535 and the full 64-bit extension beyond that.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Frame::single(message.opcode, &message.payload)
    }
}
