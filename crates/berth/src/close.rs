//! Close codes and disconnect reasons.
//!
//! A Close frame payload starts with a 16-bit status code from the table in
//! [RFC 6455 Section 7.4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4.1),
//! optionally followed by a UTF-8 reason. [`CloseCode`] models the full code
//! table; [`DisconnectReason`] and [`ErrorKind`] describe *why* the engine is
//! tearing a connection down and map onto the code that goes on the wire.

use self::CloseCode::*;

/// Status codes carried in Close frame payloads.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been
    /// fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: the peer violated the WebSocket protocol.
    Protocol,
    /// 1003: a data type was received that the endpoint cannot accept.
    Unsupported,
    /// 1005: no status code was present in the Close frame. Never sent.
    Status,
    /// 1006: the connection dropped without a Close frame. Never sent.
    Abnormal,
    /// 1007: message data was inconsistent with its type (e.g. non-UTF-8
    /// text).
    Invalid,
    /// 1008: a generic policy violation.
    Policy,
    /// 1009: a message too large to process.
    Size,
    /// 1010: the client expected an extension the server did not negotiate.
    Extension,
    /// 1011: the server hit an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: try again later (server overload).
    Again,
    #[doc(hidden)]
    /// 1015: TLS handshake failure sentinel. Never sent.
    Tls,
    #[doc(hidden)]
    Reserved(u16),
    #[doc(hidden)]
    Iana(u16),
    #[doc(hidden)]
    Library(u16),
    #[doc(hidden)]
    Bad(u16),
}

impl CloseCode {
    /// Whether this code may legally be sent on the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Bad(_) | Reserved(_) | Status | Abnormal | Tls)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1015 => Tls,
            1..=999 => Bad(code),
            1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            Tls => 1015,
            Reserved(code) => code,
            Iana(code) => code,
            Library(code) => code,
            Bad(code) => code,
        }
    }
}

/// What went wrong when a connection is closed with
/// [`DisconnectReason::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A session hook failed while a frame was being processed.
    HandlingException,
    /// The peer sent a data frame with FIN=0.
    MessageUnfinished,
    /// A message exceeded the configured receive or send maximum.
    MessageTooLarge,
    /// The peer sent a frame without the mandatory client mask.
    MissingMask,
    /// The underlying stream went away under the reader.
    StreamDisposed,
    /// The HTTP upgrade request was rejected or malformed.
    UpgradeFail,
    /// An I/O error occurred while writing to the stream.
    WriteError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::HandlingException => "handling exception",
            Self::MessageUnfinished => "message unfinished",
            Self::MessageTooLarge => "message too large",
            Self::MissingMask => "missing mask",
            Self::StreamDisposed => "stream disposed",
            Self::UpgradeFail => "upgrade failed",
            Self::WriteError => "write error",
        };
        f.write_str(name)
    }
}

/// Why a connection was (or is being) torn down.
///
/// Passed to [`SessionHooks::on_disconnected`](crate::SessionHooks::on_disconnected)
/// and mapped onto the close code written to the peer:
///
/// | Reason | Close code |
/// |---|---|
/// | `Requested` | 1000 Normal |
/// | `ServerShutdown` | 1001 Away |
/// | `Timeout` | 1002 Protocol |
/// | `Error(MessageTooLarge)` | 1009 Size |
/// | `Error(MessageUnfinished \| MissingMask \| UpgradeFail)` | 1002 Protocol |
/// | `Error(HandlingException \| StreamDisposed \| WriteError)` | 1011 Error |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A clean close requested by either side (peer Close frame, disconnect
    /// phrase, or an explicit `disconnect` call).
    Requested,
    /// The supervisor is shutting the whole server down.
    ServerShutdown,
    /// The peer failed to answer a keep-alive ping in time.
    Timeout,
    /// The engine hit an error; the kind selects the close code.
    Error(ErrorKind),
}

impl DisconnectReason {
    /// The close code this reason puts on the wire.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Requested => CloseCode::Normal,
            Self::ServerShutdown => CloseCode::Away,
            Self::Timeout => CloseCode::Protocol,
            Self::Error(kind) => match kind {
                ErrorKind::MessageTooLarge => CloseCode::Size,
                ErrorKind::MessageUnfinished | ErrorKind::MissingMask | ErrorKind::UpgradeFail => {
                    CloseCode::Protocol
                }
                ErrorKind::HandlingException
                | ErrorKind::StreamDisposed
                | ErrorKind::WriteError => CloseCode::Error,
            },
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::ServerShutdown => f.write_str("server shutdown"),
            Self::Timeout => f.write_str("timeout"),
            Self::Error(kind) => write!(f, "error ({kind})"),
        }
    }
}
