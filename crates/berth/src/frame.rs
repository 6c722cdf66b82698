//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the atomic unit the engine reads and writes:
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
//! ```
//!
//! Data frames carry application payload ([`OpCode::Text`], [`OpCode::Binary`],
//! [`OpCode::Continuation`]); control frames manage the connection
//! ([`OpCode::Close`], [`OpCode::Ping`], [`OpCode::Pong`]). Frames the server
//! produces are never masked; frames arriving from a client must be.

use bytes::Bytes;

use crate::close::CloseCode;

/// Frame type identifier, the low nibble of the first header byte.
///
/// The numeric values are defined in
/// [RFC 6455 Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// Continuation = 0x0, Text = 0x1, Binary = 0x2, Close = 0x8, Ping = 0x9,
/// Pong = 0xA. The ranges 0x3-0x7 and 0xB-0xF are reserved; the engine decodes
/// them as [`OpCode::Reserved`] and ignores such frames on dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// One of the reserved values 0x3-0x7 or 0xB-0xF.
    Reserved(u8),
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping`, `Pong`, and the reserved control
    /// range 0xB-0xF.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
            || matches!(*self, OpCode::Reserved(value) if value >= 0xB)
    }
}

impl From<u8> for OpCode {
    /// Interprets the low nibble of a header byte.
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
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
            OpCode::Reserved(value) => value & 0x0F,
        }
    }
}

/// Largest possible frame header: 2 fixed bytes, 8 extended-length bytes, and
/// a 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// Fixed per-frame header budget used when splitting a message into frames,
/// regardless of the length-marker size the frames end up with.
pub(crate) const FRAGMENT_HEADER_ALLOWANCE: usize = 10;

/// A single WebSocket frame.
///
/// Use the factory methods to build frames and the accessors to inspect them:
///
/// ```rust
/// use berth::{CloseCode, Frame, OpCode};
///
/// let text = Frame::text("Hello, WebSocket!");
/// assert_eq!(text.opcode(), OpCode::Text);
/// assert!(text.is_fin());
///
/// let close = Frame::close(CloseCode::Normal, b"Goodbye");
/// assert_eq!(close.close_code(), Some(CloseCode::Normal));
/// ```
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment flag.
    pub(crate) fin: bool,
    /// The opcode of the frame, defining its type.
    pub(crate) opcode: OpCode,
    /// The masking key, if any. Mandatory on client-to-server frames.
    pub(crate) mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Creates a text frame with the given payload.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Text,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a binary frame with the given payload.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Binary,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a ping frame with the given payload.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Ping,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a pong frame with the given payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Pong,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a continuation frame with the given payload.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Continuation,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a close frame carrying `code` as a big-endian `u16` followed by
    /// the UTF-8 `reason`.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let code16 = u16::from(code);
        let reason: &[u8] = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code16.to_be_bytes());
        payload.extend_from_slice(reason);

        Self {
            fin: true,
            opcode: OpCode::Close,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a close frame with a raw, preformatted payload (or none at
    /// all, for a codeless close).
    pub fn close_raw<T: Into<Bytes>>(payload: T) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Close,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Low-level constructor with full control over the flags.
    pub(crate) fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Sets the fin flag and returns self for method chaining.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets a masking key (builder form). Client-to-server frames must carry
    /// one; the server never sets it on outgoing frames.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Sets a randomly generated masking key (builder form).
    pub fn with_random_mask(mut self) -> Self {
        self.mask = Some(rand::random());
        self
    }

    /// Sets or clears the masking key.
    pub fn set_mask(&mut self, mask: Option<[u8; 4]>) {
        self.mask = mask;
    }

    /// Generates and sets a random mask if none is already set.
    #[inline]
    pub(crate) fn set_random_mask_if_not_set(&mut self) {
        if self.mask.is_none() {
            self.mask = Some(rand::random());
        }
    }

    /// Returns the frame's opcode.
    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Returns a reference to the frame's payload.
    #[inline(always)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame and returns its payload.
    #[inline(always)]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns whether this is the final frame in a message.
    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Returns whether the frame carries a masking key.
    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Extracts the close code from a Close frame's payload, if the payload
    /// is long enough to hold one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Extracts the UTF-8 close reason from a Close frame's payload.
    ///
    /// Returns `None` when the payload is empty and an empty string when the
    /// payload holds only a close code.
    pub fn close_reason(&self) -> Option<&str> {
        if self.payload.is_empty() {
            return None;
        }
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// Splits this frame into wire frames of at most `max_bytes_per_frame`
    /// bytes, reserving [`FRAGMENT_HEADER_ALLOWANCE`] bytes of that budget for
    /// the head frame's header.
    ///
    /// A payload of length `L` yields `ceil((L + 10) / M)` frames for a frame
    /// budget of `M`. The head frame keeps the caller's opcode; every later
    /// frame is a continuation, and only the last has FIN set. A payload that
    /// fits in one frame is returned unchanged.
    pub(crate) fn into_fragments(self, max_bytes_per_frame: usize) -> impl Iterator<Item = Frame> {
        struct Split {
            index: usize,
            budget: usize,
            frame: Option<Frame>,
        }

        impl Iterator for Split {
            type Item = Frame;

            fn next(&mut self) -> Option<Self::Item> {
                let mut frame = self.frame.take()?;
                // The head frame gives up the header allowance; continuations
                // use the full budget.
                let chunk = if self.index == 0 {
                    self.budget.saturating_sub(FRAGMENT_HEADER_ALLOWANCE).max(1)
                } else {
                    self.budget
                };

                if frame.payload.len() <= chunk {
                    if self.index != 0 {
                        frame.fin = true;
                        frame.opcode = OpCode::Continuation;
                    }
                    return Some(frame);
                }

                let is_first = self.index == 0;
                self.index += 1;
                let payload = frame.payload.split_to(chunk);
                let opcode = if is_first {
                    frame.opcode
                } else {
                    OpCode::Continuation
                };
                let mask = frame.mask;
                self.frame = Some(frame);
                Some(Frame::new(false, opcode, mask, payload))
            }
        }

        Split {
            index: 0,
            budget: max_bytes_per_frame,
            frame: Some(self),
        }
    }

    /// Total on-wire size of a message of `payload_len` bytes once split into
    /// frames of at most `max_bytes_per_frame`, charging the fixed header
    /// allowance per frame.
    pub(crate) fn wire_size(payload_len: usize, max_bytes_per_frame: usize) -> usize {
        let frames = (payload_len + FRAGMENT_HEADER_ALLOWANCE).div_ceil(max_bytes_per_frame.max(1));
        payload_len + FRAGMENT_HEADER_ALLOWANCE * frames.max(1)
    }

    /// Write the frame header into `dst`. The mask bit mirrors whether a
    /// masking key is set; the payload itself is not written here.
    #[inline]
    pub(crate) fn write_head(&self, dst: &mut bytes::BytesMut) {
        use bytes::BufMut;

        let first_byte = ((self.fin as u8) << 7) | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        if len <= 125 {
            dst.put_u8(first_byte);
            dst.put_u8(len as u8 | mask_bit);
        } else if len <= 65535 {
            dst.put_u8(first_byte);
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(first_byte);
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}
