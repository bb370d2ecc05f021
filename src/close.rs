//! Close status codes as defined in [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
use std::fmt;

use bytes::Bytes;

/// Status code carried in the first two bytes of a close frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away (server shutdown, browser navigating away).
    Away,
    /// 1002: the endpoint received a frame that violates the protocol.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: reserved; no status code was present in the close frame.
    Status,
    /// 1006: reserved; the connection was dropped without a close frame.
    Abnormal,
    /// 1007: message payload was inconsistent with its type (e.g. invalid UTF-8 text).
    Invalid,
    /// 1008: the message violates the endpoint's policy.
    Policy,
    /// 1009: the message is too big to process.
    Size,
    /// 1010: the client expected an extension the server did not negotiate.
    Extension,
    /// 1011: the server hit an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: the server is overloaded, try again later.
    Again,
    /// 1015: reserved; TLS handshake failure.
    Tls,
    /// Other codes in 1000-2999 reserved by the protocol.
    Reserved(u16),
    /// 3000-3999: registered with IANA.
    Iana(u16),
    /// 4000-4999: private use.
    Library(u16),
    /// Anything outside 1000-4999.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if the code may appear on the wire in a close frame.
    ///
    /// 1005, 1006 and 1015 are reserved for local reporting, and neither the reserved
    /// range nor codes outside 1000-4999 may be sent.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
                | CloseCode::Reserved(_)
                | CloseCode::Bad(_)
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1000..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Why a connection ended, as reported to [`Handler::on_close`](crate::Handler::on_close).
///
/// For a peer-initiated close this is what the peer sent. For a local close it is what
/// was sent to the peer. When the stream dropped without any close frame the code is
/// [`CloseCode::Abnormal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::Abnormal, reason)
    }

    /// Close frame payload for this reason: big-endian code followed by the UTF-8 text.
    ///
    /// Control frames are capped at 125 bytes, so the text is cut at the last character
    /// boundary that fits.
    pub(crate) fn to_payload(&self) -> Bytes {
        let mut end = self.reason.len().min(123);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&u16::from(self.code).to_be_bytes());
        payload.extend_from_slice(&self.reason.as_bytes()[..end]);
        payload.into()
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}
