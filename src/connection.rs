use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::SinkExt;
use tokio::{io::AsyncWrite, sync::Mutex};
use tokio_util::{codec::FramedWrite, sync::CancellationToken};

use crate::{
    codec::{Encoder, Role},
    frame::{Frame, OpCode},
    CloseCode, CloseReason, Options, Result, WebSocketError,
};

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, Encoder>;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Handshake done, messages flow both ways.
    Open,
    /// A close frame was sent or received; waiting for the other side or for the stream to end.
    Closing,
    /// The stream has been released and `on_close` has run or is running.
    Closed,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Open,
            1 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Handle to one WebSocket connection.
///
/// Cheap to clone; every clone refers to the same connection. The write half of the stream
/// lives behind an async mutex, so concurrent `send` calls never interleave frame bytes.
/// The read half belongs to the session's read loop.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    /// Query parameters of the upgrade request.
    params: HashMap<String, String>,
    /// Taken on release, which drops the write half of the stream.
    writer: Mutex<Option<Writer>>,
    state: AtomicU8,
    /// The close frame this side sent, if any. Set at most once.
    sent_close: std::sync::Mutex<Option<CloseReason>>,
    released: AtomicBool,
    /// Cancelled when this side sends a close frame.
    closing: CancellationToken,
    /// Cancelled when a write fails; the read loop stops on it.
    aborted: CancellationToken,
    /// First write failure, reported to the handler by the read loop.
    write_error: std::sync::Mutex<Option<WebSocketError>>,
    write_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new<W>(writer: W, params: HashMap<String, String>, options: &Options) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            inner: Arc::new(Inner {
                params,
                writer: Mutex::new(Some(FramedWrite::new(writer, Encoder::new(Role::Server)))),
                state: AtomicU8::new(State::Open as u8),
                sent_close: std::sync::Mutex::new(None),
                released: AtomicBool::new(false),
                closing: CancellationToken::new(),
                aborted: CancellationToken::new(),
                write_error: std::sync::Mutex::new(None),
                write_timeout: options.write_timeout,
            }),
        }
    }

    /// Current lifecycle state.
    ///
    /// Moves from [`State::Open`] to [`State::Closing`] when either side sends a close
    /// frame, and to [`State::Closed`] once the stream has been released.
    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns `true` while data frames may still be sent.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// Query parameters of the upgrade request (`/chat?room=1` gives `room → 1`).
    pub fn params(&self) -> &HashMap<String, String> {
        &self.inner.params
    }

    /// Value of the query parameter `name`, if the upgrade request carried it.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.inner.params.get(name).map(String::as_str)
    }

    /// Sends one unfragmented frame.
    ///
    /// `Text`, `Binary`, `Ping` and `Pong` are written as they are. `Close` goes through the
    /// close handshake like [`Connection::close`], with `payload` as the raw close payload.
    ///
    /// # Errors
    /// - [`WebSocketError::ConnectionClosed`] once a close frame has been sent or received
    /// - [`WebSocketError::ControlFrameTooLarge`] for a ping or pong above 125 bytes
    /// - [`WebSocketError::InvalidContinuationFrame`] for `Continuation`, which only makes
    ///   sense inside a fragmented message
    /// - stream errors and [`WebSocketError::Timeout`] from the write itself
    pub async fn send(&self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        match opcode {
            OpCode::Continuation => Err(WebSocketError::InvalidContinuationFrame),
            OpCode::Close => {
                if payload.len() > 125 {
                    return Err(WebSocketError::ControlFrameTooLarge);
                }
                let reason = Frame::close_raw(&payload).close_reason()?;
                self.send_close(reason).await.map(|_| ())
            }
            _ => {
                if opcode.is_control() && payload.len() > 125 {
                    return Err(WebSocketError::ControlFrameTooLarge);
                }
                self.write_open(Frame::single(opcode, &payload)).await
            }
        }
    }

    /// Sends a text message in a single frame.
    ///
    /// # Parameters
    /// - `text`: the message; anything that converts into a `String`
    ///
    /// # Returns
    /// `Ok(())` once the frame is flushed, or the errors listed on [`Connection::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(OpCode::Text, text.into()).await
    }

    /// Sends a binary message in a single frame.
    ///
    /// # Parameters
    /// - `data`: the payload; `Vec<u8>`, `Bytes` and `&'static [u8]` all convert
    ///
    /// # Returns
    /// `Ok(())` once the frame is flushed, or the errors listed on [`Connection::send`].
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(OpCode::Binary, data).await
    }

    /// Sends a ping. The peer's pong is read and discarded by the session.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(OpCode::Ping, payload).await
    }

    /// Serializes `data` to JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn send_json<T: serde::Serialize>(&self, data: &T) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        self.send(OpCode::Text, bytes).await
    }

    /// Starts the close handshake.
    ///
    /// Sends a close frame and moves the connection to [`State::Closing`]. The session keeps
    /// reading until the peer answers with its own close frame, the stream ends, or
    /// [`Options::close_timeout`] passes; then the stream is released and `on_close` runs.
    /// Calling it again, or after the peer started closing, does nothing.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if !code.is_allowed() {
            return Err(WebSocketError::InvalidCloseCode);
        }
        self.send_close(Some(CloseReason::new(code, reason)))
            .await
            .map(|_| ())
    }

    /// Sends this side's close frame unless one was already sent.
    ///
    /// `None` sends an empty close payload. Returns `Ok(false)` when a close frame had
    /// already been sent or the stream is already released. The writer stays locked from
    /// the moment the close is recorded until it is flushed, so a release never sees a
    /// recorded close that was not written.
    pub(crate) async fn send_close(&self, reason: Option<CloseReason>) -> Result<bool> {
        let frame = match &reason {
            Some(reason) => Frame::close_raw(reason.to_payload()),
            None => Frame::close_raw([]),
        };

        let mut writer = self.inner.writer.lock().await;
        if writer.is_none() {
            return Ok(false);
        }

        {
            let mut sent = self
                .inner
                .sent_close
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if sent.is_some() {
                return Ok(false);
            }
            *sent = Some(reason.unwrap_or_else(|| CloseReason::new(CloseCode::Status, "")));
        }

        let _ = self.inner.state.compare_exchange(
            State::Open as u8,
            State::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.closing.cancel();

        self.write_locked(&mut writer, frame).await?;
        Ok(true)
    }

    /// The close frame this side sent, if any.
    pub(crate) fn sent_close(&self) -> Option<CloseReason> {
        self.inner
            .sent_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Writes a frame that is only allowed while the connection is open.
    ///
    /// The state is checked with the writer held. A close frame recorded by `send_close`
    /// is written under the same lock, so nothing written here can follow it.
    pub(crate) async fn write_open(&self, frame: Frame) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        if !self.is_open() {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.write_locked(&mut writer, frame).await
    }

    /// The first write failure, if any. Later calls return `None`.
    pub(crate) fn take_write_error(&self) -> Option<WebSocketError> {
        self.inner
            .write_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn write_locked(&self, writer: &mut Option<Writer>, frame: Frame) -> Result<()> {
        let writer = writer.as_mut().ok_or(WebSocketError::ConnectionClosed)?;

        let res = match self.inner.write_timeout {
            Some(limit) => tokio::time::timeout(limit, writer.send(frame))
                .await
                .unwrap_or(Err(WebSocketError::Timeout)),
            None => writer.send(frame).await,
        };

        if let Err(err) = &res {
            log::debug!("write failed: {err}");
            self.inner
                .write_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert_with(|| copy_write_error(err));
            self.inner.aborted.cancel();
        }
        res
    }

    /// Resolves once this side has sent a close frame.
    pub(crate) async fn closing(&self) {
        self.inner.closing.cancelled().await
    }

    /// Resolves once a write has failed.
    pub(crate) async fn aborted(&self) {
        self.inner.aborted.cancelled().await
    }

    /// Moves to [`State::Closed`] and drops the write half of the stream.
    ///
    /// Returns `true` only for the first caller; that caller owns the `on_close` callback.
    pub(crate) async fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.inner
            .state
            .store(State::Closed as u8, Ordering::Release);
        self.inner.closing.cancel();

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let shutdown = writer.close();
            let res = match self.inner.write_timeout {
                Some(limit) => tokio::time::timeout(limit, shutdown)
                    .await
                    .unwrap_or(Err(WebSocketError::Timeout)),
                None => shutdown.await,
            };
            if let Err(err) = res {
                log::debug!("stream shutdown failed: {err}");
            }
        }

        true
    }
}

/// Write failures are stream errors or timeouts; the error is kept for the handler while
/// the caller gets the original.
fn copy_write_error(err: &WebSocketError) -> WebSocketError {
    match err {
        WebSocketError::IoError(err) => {
            WebSocketError::IoError(io::Error::new(err.kind(), err.to_string()))
        }
        WebSocketError::Timeout => WebSocketError::Timeout,
        _ => WebSocketError::ConnectionClosed,
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("params", &self.inner.params)
            .finish()
    }
}
