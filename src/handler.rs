use futures::future::BoxFuture;

use crate::{CloseReason, Connection, Message, WebSocketError};

/// Application callbacks for one WebSocket endpoint.
///
/// The read loop awaits each callback before reading the next frame, so messages are
/// delivered one at a time and in order. Callbacks may send on the [`Connection`] they
/// receive; writes are serialized internally.
///
/// Only [`Handler::on_message`] is required.
///
/// ```rust
/// use futures::future::BoxFuture;
/// use wsgate::{CloseReason, Connection, Handler, Message};
///
/// struct Chat;
///
/// impl Handler for Chat {
///     fn on_message<'a>(&'a self, conn: &'a Connection, message: Message) -> BoxFuture<'a, ()> {
///         Box::pin(async move {
///             let _ = conn.send_text(format!("you said {} bytes", message.payload.len())).await;
///         })
///     }
///
///     fn on_close<'a>(&'a self, _conn: &'a Connection, reason: CloseReason) -> BoxFuture<'a, ()> {
///         Box::pin(async move { log::info!("left: {reason}") })
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Runs once after the handshake, before the first frame is read.
    ///
    /// Returning `false` refuses the connection: a close frame with status 1008 is sent and
    /// [`Handler::on_close`] still runs.
    fn on_open<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, bool> {
        let _ = conn;
        Box::pin(async { true })
    }

    /// A complete text or binary message.
    fn on_message<'a>(&'a self, conn: &'a Connection, message: Message) -> BoxFuture<'a, ()>;

    /// Runs exactly once per connection, after the stream has been released.
    fn on_close<'a>(&'a self, conn: &'a Connection, reason: CloseReason) -> BoxFuture<'a, ()> {
        let _ = (conn, reason);
        Box::pin(async {})
    }

    /// A protocol violation, timeout or stream failure is about to end the connection.
    fn on_error<'a>(&'a self, conn: &'a Connection, err: &'a WebSocketError) -> BoxFuture<'a, ()> {
        let _ = (conn, err);
        Box::pin(async {})
    }
}
