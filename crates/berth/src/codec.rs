//! Frame encoding and decoding on top of `tokio_util::codec`.
//!
//! This is the lowest layer of the engine: it turns raw bytes into
//! [`Frame`]s and back, handling header parsing, the 7-bit / 16-bit / 64-bit
//! payload length variants, and masking. It deliberately does **not** enforce
//! protocol policy — whether a frame must be masked or finished is decided by
//! the connection engine, which also owns message size limits across frames.
//!
//! The [`Decoder`] is stateful: when a header has been parsed but the payload
//! has not fully arrived, it parks the parsed header and returns `Ok(None)`
//! until enough bytes are buffered.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    Error,
    frame::{Frame, MAX_HEAD_SIZE, OpCode},
};

/// The role the codec is encoding for.
///
/// A server encoder refuses masked frames; a client encoder masks every
/// outgoing frame, generating a random key when none is set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Parsed frame header parked while the payload is still in flight.
struct ReadState {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A decoder for WebSocket frames.
///
/// Tracks the maximum payload size it will buffer for a single frame;
/// anything larger fails before the payload is read.
pub struct Decoder {
    state: Option<ReadState>,
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a decoder that refuses frames whose payload exceeds
    /// `max_payload_size` bytes.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = Error;

    /// Decodes one frame out of `src`, unmasking the payload when a masking
    /// key is present.
    ///
    /// Returns `Ok(None)` until a complete header and payload are buffered.
    /// Mask *presence* is recorded on the returned frame but not required
    /// here; the connection engine rejects unmasked client frames.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Complete a frame whose header was parsed on an earlier call.
        if let Some(state) = self.state.take() {
            if src.remaining() < state.payload_len {
                self.state = Some(state);
                return Ok(None);
            }

            if let Some(mask) = state.mask {
                crate::mask::apply_mask(&mut src[..state.payload_len], mask);
            }

            let payload = src.split_to(state.payload_len).freeze();
            return Ok(Some(Frame::new(state.fin, state.opcode, state.mask, payload)));
        }

        if src.remaining() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        let opcode = OpCode::from(src[0] & 0b0000_1111);
        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + (masked as usize * 4);

        if src.remaining() < header_size {
            return Ok(None);
        }

        src.advance(2);

        let payload_len: usize = match extra {
            0 => usize::from(length_code),
            2 => src.get_u16() as usize,
            #[cfg(target_pointer_width = "64")]
            8 => src.get_u64() as usize,
            #[cfg(any(target_pointer_width = "16", target_pointer_width = "32"))]
            8 => match usize::try_from(src.get_u64()) {
                Ok(length) => length,
                Err(_) => {
                    return Err(Error::MessageTooLarge {
                        size: usize::MAX,
                        limit: self.max_payload_size,
                    });
                }
            },
            _ => unreachable!(),
        };

        let mask = if masked {
            Some(src.get_u32().to_be_bytes())
        } else {
            None
        };

        if payload_len > self.max_payload_size {
            return Err(Error::MessageTooLarge {
                size: payload_len,
                limit: self.max_payload_size,
            });
        }

        if src.remaining() < payload_len {
            // Park the header and wait for the rest of the payload.
            self.state = Some(ReadState {
                fin,
                opcode,
                mask,
                payload_len,
            });
            return Ok(None);
        }

        if let Some(mask) = mask {
            crate::mask::apply_mask(&mut src[..payload_len], mask);
        }

        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Frame::new(fin, opcode, mask, payload)))
    }
}

/// WebSocket frame encoder.
///
/// Serializes a [`Frame`] header and payload into a `BytesMut` ready for the
/// wire. Behavior depends on the [`Role`]: a `Server` encoder treats a frame
/// with a masking key as a programming error, while a `Client` encoder masks
/// every frame.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = Error;

    #[inline]
    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.role {
            Role::Server => {
                if frame.is_masked() {
                    return Err(Error::InvalidState("server frames must not be masked"));
                }
            }
            Role::Client => frame.set_random_mask_if_not_set(),
        }

        dst.reserve(MAX_HEAD_SIZE + frame.payload.len());
        frame.write_head(dst);

        let index = dst.len();
        dst.extend_from_slice(&frame.payload);

        if let Some(mask) = frame.mask {
            crate::mask::apply_mask(&mut dst[index..], mask);
        }

        Ok(())
    }
}
