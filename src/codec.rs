use std::fmt;

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    bits,
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    WebSocketError,
};

/// The side of the connection a codec works for.
///
/// A server expects masked frames and writes unmasked ones; a client does the opposite.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Represents the reading state of a WebSocket frame.
///
/// No state (`None` in the decoder) means the decoder is waiting for the two base header bytes.
enum ReadState {
    /// Base header parsed; waiting for the extended length and the masking key.
    MaskingKey(Header),
    /// Waiting for the payload bytes.
    Payload(HeaderAndMask),
}

/// Fields taken from the two base header bytes.
struct Header {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// The 7-bit length field.
    length_code: u8,
    /// Bytes of extended length following the base header (0, 2 or 8).
    extra: usize,
    /// Extended length plus masking key, in bytes.
    header_size: usize,
}

impl Header {
    /// Reads the declared payload length without consuming `src`.
    ///
    /// Returns `None` while the extended length bytes have not arrived.
    fn peek_length(&self, src: &BytesMut) -> Option<u64> {
        if src.remaining() < self.extra {
            return None;
        }

        Some(match self.extra {
            0 => u64::from(self.length_code),
            2 => u64::from(u16::from_be_bytes([src[0], src[1]])),
            _ => {
                let mut be = [0u8; 8];
                be.copy_from_slice(&src[..8]);
                u64::from_be_bytes(be)
            }
        })
    }
}

struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding of WebSocket frames.
///
/// Used with [`tokio_util::codec::Framed`] when a single object drives both directions,
/// as a test client does. The server splits the stream and uses [`Decoder`] and
/// [`Encoder`] on separate halves.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for one side of a connection.
    ///
    /// # Parameters
    /// - `role`: the side this codec works for; decides which masking is expected on read
    ///   and applied on write
    /// - `max_payload_read`: largest payload accepted for a single incoming frame
    ///
    /// # Returns
    /// A `Codec` ready to be wrapped in [`tokio_util::codec::Framed`].
    pub fn new(role: Role, max_payload_read: usize) -> Self {
        Self::from((Decoder::new(role, max_payload_read), Encoder::new(role)))
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// Incremental frame decoder.
///
/// Every header constraint is checked as soon as the bytes that carry it are buffered, so a
/// frame with reserved bits set, an unknown opcode, the wrong masking for the role, or an
/// oversized declared length fails before any of its payload is read or allocated.
/// Payloads come out unmasked.
pub struct Decoder {
    role: Role,
    state: Option<ReadState>,
    /// Largest payload accepted for a single frame.
    max_payload_read: usize,
}

impl Decoder {
    /// Creates a decoder.
    ///
    /// # Parameters
    /// - `role`: [`Role::Server`] requires masked frames and rejects unmasked ones with
    ///   [`WebSocketError::UnmaskedFrame`]; [`Role::Client`] does the opposite
    /// - `max_payload_read`: frames declaring a longer payload fail with
    ///   [`WebSocketError::FrameTooLarge`] before the payload is read
    ///
    /// # Returns
    /// A decoder waiting for the first header byte.
    pub fn new(role: Role, max_payload_read: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_read,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let first = bits::byte_to_bits(src[0]);
                    let second = bits::byte_to_bits(src[1]);

                    if first[1..4].iter().any(|&rsv| rsv) {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let fin = first[0];
                    let opcode = OpCode::try_from(bits::bits_to_uint(&first[4..]) as u8)?;
                    let masked = second[0];
                    let length_code = bits::bits_to_uint(&second[1..]) as u8;

                    match (self.role, masked) {
                        (Role::Server, false) => return Err(WebSocketError::UnmaskedFrame),
                        (Role::Client, true) => return Err(WebSocketError::MaskedFrame),
                        _ => {}
                    }

                    if opcode.is_control() {
                        if !fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if length_code > 125 {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    src.advance(2);

                    self.state = Some(ReadState::MaskingKey(Header {
                        fin,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size: extra + masked as usize * 4,
                    }));
                }
                Some(ReadState::MaskingKey(header)) => {
                    let Some(declared) = header.peek_length(src) else {
                        self.state = Some(ReadState::MaskingKey(header));
                        return Ok(None);
                    };

                    let payload_len = usize::try_from(declared)
                        .ok()
                        .filter(|len| *len <= self.max_payload_read)
                        .ok_or(WebSocketError::FrameTooLarge)?;

                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::MaskingKey(header));
                        return Ok(None);
                    }

                    src.advance(header.extra);
                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        src.reserve(header_and_mask.payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = header_and_mask;

                    let payload = src.split_to(payload_len);
                    let mut frame = Frame::new(header.fin, header.opcode, mask, payload);
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Serializes frames: header in its shortest length form, then the payload.
///
/// In the server role frames go out unmasked; in the client role each frame gets a fresh
/// random masking key.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates an encoder.
    ///
    /// # Parameters
    /// - `role`: [`Role::Server`] writes unmasked frames; [`Role::Client`] masks every
    ///   frame with a fresh random key
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.role {
            Role::Server => frame.unmask(),
            Role::Client => frame.mask(),
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
