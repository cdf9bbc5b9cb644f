//! WebSocket-compatible frame codec.
//!
//! Frames are decoded from an accumulating byte buffer. A frame is only
//! consumed once all of its bytes are present; partial frames stay in the
//! buffer until more bytes arrive, so decoding is independent of how the
//! stream was split across reads.
//!
//! Frame layout:
//! ```text
//! byte 0: FIN | RSV1-3 | opcode (4 bits)
//! byte 1: MASK | 7-bit length (126 => 16-bit length follows, 127 => 64-bit)
//! [extended length] [4-byte mask key if MASK] payload
//! ```
//!
//! Client-to-host payloads are masked with `payload[i] ^ key[i % 4]`.
//! Host-to-client frames are never masked.

use thiserror::Error;

/// Default ceiling on a single payload (or a reassembled fragmented one).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Normal closure status code.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Other(u8),
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Other(value) => value & 0x0F,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode,
            payload,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn binary(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    pub fn ping(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// A close frame. `None` produces the zero-payload form used as an echo.
    pub fn close(code: Option<u16>) -> Self {
        let payload = code.map(|c| c.to_be_bytes().to_vec()).unwrap_or_default();
        Self::new(Opcode::Close, payload)
    }

    /// Status code carried by a close frame, if any.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode == Opcode::Close && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("declared payload length {0} exceeds the 32-bit limit")]
    LengthOverflow(u64),
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: u64, max: usize },
}

/// XORs `payload` in place with the 4-byte `key`. Applying it twice restores
/// the original bytes.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, or the
/// frame and the number of bytes it occupied.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(buf[0]);
    let masked = buf[1] & 0x80 != 0;
    let mut offset = 2;

    let len = match buf[1] & 0x7F {
        126 => {
            if buf.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            offset += 2;
            len
        }
        127 => {
            if buf.len() < offset + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(bytes);
            if len > u32::MAX as u64 {
                return Err(FrameError::LengthOverflow(len));
            }
            offset += 8;
            len
        }
        short => short as u64,
    };

    if len > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }

    let key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = offset + len as usize;
    if buf.len() < end {
        return Ok(None);
    }

    let mut payload = buf[offset..end].to_vec();
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        end,
    )))
}

/// Decodes every complete frame at the front of `buf`, returning the frames
/// and the total number of bytes they occupied.
pub fn decode_all(buf: &[u8], max_payload: usize) -> Result<(Vec<Frame>, usize), FrameError> {
    let mut frames = Vec::new();
    let mut consumed = 0;
    while let Some((frame, used)) = decode_frame(&buf[consumed..], max_payload)? {
        frames.push(frame);
        consumed += used;
    }
    Ok((frames, consumed))
}

/// Encodes a frame. Hosts pass `None`; clients pass a fresh mask key.
pub fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(len + 14);

    let fin = if frame.fin { 0x80 } else { 0x00 };
    out.push(fin | frame.opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(&frame.payload),
    }

    out
}

/// Buffers raw bytes from a stream and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self::with_buffer(Vec::new(), max_payload)
    }

    /// Starts from bytes already read, e.g. whatever followed the handshake.
    pub fn with_buffer(buffer: Vec<u8>, max_payload: usize) -> Self {
        Self {
            buffer,
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_frame(&self.buffer, self.max_payload)? {
            Some((frame, used)) => {
                self.buffer.drain(..used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

/// A complete application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Close(Option<u16>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Unknown(u8),
}

/// Reassembles fragmented data frames. Control frames pass straight through,
/// even in the middle of a fragmented message.
#[derive(Debug)]
pub struct MessageAssembler {
    partial: Option<(Opcode, Vec<u8>)>,
    max_payload: usize,
}

impl MessageAssembler {
    pub fn new(max_payload: usize) -> Self {
        Self {
            partial: None,
            max_payload,
        }
    }

    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        match frame.opcode {
            Opcode::Close => Ok(Some(Message::Close(frame.close_code()))),
            Opcode::Ping => Ok(Some(Message::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(Message::Pong(frame.payload))),
            Opcode::Other(code) => Ok(Some(Message::Unknown(code))),
            Opcode::Text | Opcode::Binary => {
                if frame.fin {
                    // A new data frame abandons any unfinished message.
                    self.partial = None;
                    Ok(Some(data_message(frame.opcode, frame.payload)))
                } else {
                    self.partial = Some((frame.opcode, frame.payload));
                    Ok(None)
                }
            }
            Opcode::Continuation => {
                let Some((opcode, mut payload)) = self.partial.take() else {
                    return Ok(None);
                };
                let len = payload.len() + frame.payload.len();
                if len > self.max_payload {
                    return Err(FrameError::PayloadTooLarge {
                        len: len as u64,
                        max: self.max_payload,
                    });
                }
                payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    Ok(Some(data_message(opcode, payload)))
                } else {
                    self.partial = Some((opcode, payload));
                    Ok(None)
                }
            }
        }
    }
}

fn data_message(opcode: Opcode, payload: Vec<u8>) -> Message {
    if opcode == Opcode::Binary {
        Message::Binary(payload)
    } else {
        Message::Text(payload)
    }
}
