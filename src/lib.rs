//! # wsgate
//! Server side of the WebSocket protocol (RFC 6455), sitting behind an HTTP server.
//!
//! The crate covers the part of a WebSocket server that has protocol state:
//!
//! - the opening handshake ([`handshake`]): `Sec-WebSocket-Key` validation, accept key
//!   computation and the `101 Switching Protocols` response,
//! - the frame codec ([`codec`]): header validation before any payload is read, unmasking,
//!   all three length encodings including the full 64-bit form,
//! - the connection lifecycle ([`Connection`], [`Session`]): fragment reassembly, ping/pong,
//!   the close handshake, serialized writes and exactly-once teardown.
//!
//! Applications implement [`Handler`] and either hand a taken-over stream to
//! [`begin_session`], or let [`Server`] accept connections and dispatch them through a
//! [`Router`].
//!
//! # Server Example
//! ```no_run
//! use futures::future::BoxFuture;
//! use tokio::net::TcpListener;
//! use wsgate::{Connection, Handler, Message, Router, Server};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message<'a>(&'a self, conn: &'a Connection, message: Message) -> BoxFuture<'a, ()> {
//!         Box::pin(async move {
//!             if let Err(err) = conn.send(message.opcode, message.payload).await {
//!                 log::warn!("echo failed: {err}");
//!             }
//!         })
//!     }
//! }
//!
//! # async fn run() -> wsgate::Result<()> {
//! let router = Router::new().route("/echo", Echo);
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! Server::new(router).serve(listener).await
//! # }
//! ```
//!
//! # Limits
//! Every connection runs with explicit bounds, see [`Options`]: 1 MiB per frame, 2 MiB per
//! reassembled message, a 120 s idle timeout, a 5 s close handshake timeout and a 30 s write
//! deadline by default.
//!
//! # Features
//! - `json`: [`Connection::send_json`] through `serde_json`.
//! - `simd`: UTF-8 validation of text messages with `simdutf8`.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod bits;
pub mod close;
pub mod codec;
mod connection;
pub mod frame;
pub mod handshake;
mod handler;
mod mask;
mod options;
pub mod server;
pub mod session;

use hyper::StatusCode;
use thiserror::Error;

pub use close::{CloseCode, CloseReason};
pub use connection::{Connection, State};
pub use frame::{Frame, Message, OpCode};
pub use handler::Handler;
pub use options::{
    Options, CLOSE_TIMEOUT, IDLE_TIMEOUT, MAX_MESSAGE_SIZE, MAX_PAYLOAD_READ, WRITE_TIMEOUT,
};
pub use server::{Router, Server};
pub use session::{begin_session, Session};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors raised by the handshake, the codec and the connection.
///
/// They fall into four groups:
///
/// - handshake errors, which reject the HTTP request (see [`WebSocketError::status`]),
/// - protocol violations, which close the connection with a status code
///   (see [`WebSocketError::close_code`]),
/// - resource limits ([`WebSocketError::FrameTooLarge`], [`WebSocketError::MessageTooLarge`]),
/// - stream errors, after which no close frame can be sent.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A text or binary frame arrived while a fragmented message was still open.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived with no fragmented message to continue.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A text message or a close reason is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// The connection is closing or closed; nothing more can be sent.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A close frame with a one byte payload.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame with a status code that may not be sent on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// One of RSV1, RSV2 or RSV3 is set. No extension is negotiated, so all must be 0.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame without the FIN bit.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame announcing more than 125 bytes of payload.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A frame declared a payload larger than [`Options::max_payload_read`].
    #[error("Frame too large")]
    FrameTooLarge,

    /// Reassembled fragments exceeded [`Options::max_message_size`].
    #[error("Message too large")]
    MessageTooLarge,

    /// A client frame without a masking key.
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// A server frame with a masking key (client role only).
    #[error("Server frame is masked")]
    MaskedFrame,

    /// An opcode outside the six defined by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// The request has no `Upgrade: websocket` header.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The request's `Connection` header does not contain `upgrade`.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The key is not the base64 encoding of a 16 byte nonce.
    #[error("Sec-WebSocket-Key header is malformed")]
    InvalidSecWebSocketKey,

    /// A read or write deadline expired.
    #[error("Timed out")]
    Timeout,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// The session task panicked or was aborted.
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),

    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Status code of the close frame sent when this error ends a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WebSocketError::FrameTooLarge | WebSocketError::MessageTooLarge => CloseCode::Size,
            WebSocketError::InvalidUTF8 => CloseCode::Invalid,
            WebSocketError::ReservedBitsNotZero
            | WebSocketError::InvalidOpCode(_)
            | WebSocketError::ControlFrameFragmented
            | WebSocketError::ControlFrameTooLarge
            | WebSocketError::InvalidFragment
            | WebSocketError::InvalidContinuationFrame
            | WebSocketError::UnmaskedFrame
            | WebSocketError::MaskedFrame
            | WebSocketError::InvalidCloseFrame
            | WebSocketError::InvalidCloseCode => CloseCode::Protocol,
            WebSocketError::Timeout => CloseCode::Away,
            _ => CloseCode::Error,
        }
    }

    /// HTTP status for rejecting an upgrade request, `None` for non-handshake errors.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            WebSocketError::InvalidSecWebsocketVersion => Some(StatusCode::UPGRADE_REQUIRED),
            WebSocketError::InvalidUpgradeHeader
            | WebSocketError::InvalidConnectionHeader
            | WebSocketError::MissingSecWebSocketKey
            | WebSocketError::InvalidSecWebSocketKey => Some(StatusCode::BAD_REQUEST),
            _ => None,
        }
    }

    /// Returns `true` if the stream itself failed, in which case no close frame is sent.
    pub fn is_stream_error(&self) -> bool {
        matches!(
            self,
            WebSocketError::IoError(_) | WebSocketError::HTTPError(_)
        )
    }
}
