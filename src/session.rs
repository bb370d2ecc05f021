//! The per-connection read loop.
//!
//! A session owns the read half of an upgraded stream. It decodes frames, reassembles
//! fragmented messages, answers pings, runs the close handshake and finally releases the
//! stream and calls [`Handler::on_close`] exactly once.
//!
//! [`begin_session`] is the entry point for streams taken over from an arbitrary HTTP
//! server; it writes the `101` response itself. [`serve`] runs a session on a stream whose
//! handshake is already done, which is what [`Server`](crate::Server) uses after a hyper
//! upgrade.
use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::{
    codec::{Decoder, Role},
    handshake, CloseCode, CloseReason, Connection, Frame, Handler, Message, OpCode, Options,
    Result, WebSocketError,
};

/// A running session.
///
/// Dropping it does not stop the session; the task keeps running until the connection ends.
pub struct Session {
    connection: Connection,
    task: JoinHandle<()>,
}

impl Session {
    /// Handle for sending on this session's connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the read loop to end. By then the stream is released and
    /// [`Handler::on_close`] has returned.
    pub async fn join(self) -> Result<()> {
        self.task.await?;
        Ok(())
    }
}

/// Completes the handshake on a stream taken over from an HTTP server and starts its
/// session.
///
/// `upgrade_key` is the request's `Sec-WebSocket-Key`. The key is validated before anything
/// is written; on error the stream is left untouched and no session starts.
pub async fn begin_session<S>(
    mut stream: S,
    upgrade_key: &str,
    handler: Arc<dyn Handler>,
    options: Options,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    handshake::write_response(&mut stream, upgrade_key).await?;
    Ok(spawn(
        stream,
        handler,
        options,
        HashMap::new(),
        CancellationToken::new(),
    ))
}

/// Starts a session on an upgraded stream in a new task.
///
/// Cancelling `shutdown` makes the session send a 1001 close frame and run the close
/// handshake.
pub fn spawn<S>(
    stream: S,
    handler: Arc<dyn Handler>,
    options: Options,
    params: HashMap<String, String>,
    shutdown: CancellationToken,
) -> Session
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (connection, frames) = open(stream, &options, params);
    let task = tokio::spawn(run(connection.clone(), frames, handler, options, shutdown));
    Session { connection, task }
}

/// Runs a session on an upgraded stream until the connection ends.
pub async fn serve<S>(
    stream: S,
    handler: Arc<dyn Handler>,
    options: Options,
    params: HashMap<String, String>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (connection, frames) = open(stream, &options, params);
    run(connection, frames, handler, options, shutdown).await
}

type Frames<S> = FramedRead<tokio::io::ReadHalf<S>, Decoder>;

fn open<S>(stream: S, options: &Options, params: HashMap<String, String>) -> (Connection, Frames<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let connection = Connection::new(write, params, options);
    let frames = FramedRead::new(read, Decoder::new(Role::Server, options.max_payload_read));
    (connection, frames)
}

async fn run<R>(
    conn: Connection,
    mut frames: FramedRead<R, Decoder>,
    handler: Arc<dyn Handler>,
    options: Options,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let reason = if handler.on_open(&conn).await {
        read_loop(&conn, &mut frames, handler.as_ref(), &options, &shutdown).await
    } else {
        log::debug!("connection refused by handler");
        let reason = CloseReason::new(CloseCode::Policy, "connection refused");
        if let Err(err) = conn.send_close(Some(reason.clone())).await {
            log::debug!("could not send close frame: {err}");
        }
        reason
    };

    // both halves go away before the handler hears about it
    drop(frames);
    if conn.release().await {
        log::debug!("connection closed: {reason}");
        handler.on_close(&conn, reason).await;
    }
}

/// Reads frames until the connection ends and returns why it ended.
async fn read_loop<R>(
    conn: &Connection,
    frames: &mut FramedRead<R, Decoder>,
    handler: &dyn Handler,
    options: &Options,
    shutdown: &CancellationToken,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    let mut assembler = Assembler::new(options);
    let mut closing = false;
    let mut shutting_down = false;

    loop {
        let wait = if closing {
            Some(options.close_timeout)
        } else {
            options.idle_timeout
        };

        let next = tokio::select! {
            biased;
            _ = conn.aborted() => return write_failed(conn, handler).await,
            _ = shutdown.cancelled(), if !shutting_down => {
                shutting_down = true;
                if let Err(err) = conn.close(CloseCode::Away, "server shutting down").await {
                    log::debug!("could not send close frame: {err}");
                }
                continue;
            }
            _ = conn.closing(), if !closing => {
                closing = true;
                continue;
            }
            next = next_frame(frames, wait) => next,
        };

        let frame = match next {
            None => {
                return conn
                    .sent_close()
                    .unwrap_or_else(|| CloseReason::abnormal("connection reset"));
            }
            Some(Err(WebSocketError::Timeout)) if closing => {
                log::debug!("peer did not answer the close frame");
                return conn
                    .sent_close()
                    .unwrap_or_else(|| CloseReason::abnormal("close timed out"));
            }
            Some(Err(err)) => return fail(conn, handler, err).await,
            Some(Ok(frame)) => frame,
        };

        match frame.opcode {
            OpCode::Continuation | OpCode::Text | OpCode::Binary => {
                match assembler.push(frame) {
                    Ok(Some(message)) => handler.on_message(conn, message).await,
                    Ok(None) => {}
                    Err(err) => return fail(conn, handler, err).await,
                }
            }
            OpCode::Ping => {
                // no pong once closing; a failed write ends the loop through `aborted`
                let _ = conn.write_open(Frame::pong(&frame.payload)).await;
            }
            OpCode::Pong => log::trace!("pong ({} bytes)", frame.payload.len()),
            OpCode::Close => {
                let received = match frame.close_reason() {
                    Ok(reason) => reason,
                    Err(err) => return fail(conn, handler, err).await,
                };

                let echo = received.as_ref().map(|r| CloseReason::new(r.code, ""));
                return match conn.send_close(echo).await {
                    Ok(false) => conn
                        .sent_close()
                        .unwrap_or_else(|| CloseReason::new(CloseCode::Status, "")),
                    res => {
                        if let Err(err) = res {
                            log::debug!("could not answer close frame: {err}");
                        }
                        received.unwrap_or_else(|| CloseReason::new(CloseCode::Status, ""))
                    }
                };
            }
        }
    }
}

async fn next_frame<R>(
    frames: &mut FramedRead<R, Decoder>,
    wait: Option<Duration>,
) -> Option<Result<Frame>>
where
    R: AsyncRead + Unpin,
{
    match wait {
        Some(limit) => tokio::time::timeout(limit, frames.next())
            .await
            .unwrap_or(Some(Err(WebSocketError::Timeout))),
        None => frames.next().await,
    }
}

/// Ends the connection because of `err`.
///
/// Stream errors end it without a close frame; everything else sends one with the status
/// code of the error.
async fn fail(conn: &Connection, handler: &dyn Handler, err: WebSocketError) -> CloseReason {
    log::warn!("closing connection: {err}");
    handler.on_error(conn, &err).await;

    if err.is_stream_error() {
        return CloseReason::abnormal(err.to_string());
    }

    let reason = CloseReason::new(err.close_code(), err.to_string());
    match conn.send_close(Some(reason.clone())).await {
        Ok(false) => conn.sent_close().unwrap_or(reason),
        _ => reason,
    }
}

/// Ends the connection after a write failed. The stream is unusable, so no close frame is
/// attempted.
async fn write_failed(conn: &Connection, handler: &dyn Handler) -> CloseReason {
    let err = conn
        .take_write_error()
        .unwrap_or(WebSocketError::ConnectionClosed);
    log::warn!("closing connection after failed write: {err}");
    handler.on_error(conn, &err).await;

    CloseReason::abnormal(err.to_string())
}

/// Reassembles fragmented messages.
struct Assembler {
    /// Opcode of the message being reassembled.
    fragment: Option<OpCode>,
    accumulated: BytesMut,
    max_message_size: usize,
    check_utf8: bool,
}

impl Assembler {
    fn new(options: &Options) -> Self {
        Self {
            fragment: None,
            accumulated: BytesMut::new(),
            max_message_size: options.max_message_size,
            check_utf8: options.check_utf8,
        }
    }

    /// Takes a data frame and returns the message it completes, if any.
    fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }
                if frame.payload.len() > self.max_message_size {
                    return Err(WebSocketError::MessageTooLarge);
                }

                if frame.fin {
                    return self.finish(frame.opcode, frame.payload.freeze()).map(Some);
                }

                self.fragment = Some(frame.opcode);
                self.accumulated.extend_from_slice(&frame.payload);
                Ok(None)
            }
            OpCode::Continuation => {
                let opcode = self
                    .fragment
                    .ok_or(WebSocketError::InvalidContinuationFrame)?;

                if self.accumulated.len() + frame.payload.len() > self.max_message_size {
                    return Err(WebSocketError::MessageTooLarge);
                }
                self.accumulated.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                self.fragment = None;
                // leaves the accumulator empty with no capacity
                let payload = std::mem::take(&mut self.accumulated).freeze();
                self.finish(opcode, payload).map(Some)
            }
            opcode => Err(WebSocketError::InvalidOpCode(opcode.into())),
        }
    }

    fn finish(&self, opcode: OpCode, payload: Bytes) -> Result<Message> {
        if opcode == OpCode::Text && self.check_utf8 && !is_utf8(&payload) {
            return Err(WebSocketError::InvalidUTF8);
        }
        Ok(Message { opcode, payload })
    }
}

#[cfg(not(feature = "simd"))]
fn is_utf8(payload: &[u8]) -> bool {
    std::str::from_utf8(payload).is_ok()
}

#[cfg(feature = "simd")]
fn is_utf8(payload: &[u8]) -> bool {
    simdutf8::basic::from_utf8(payload).is_ok()
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::Mutex,
        task::{Context, Poll},
    };

    use futures::{future::BoxFuture, SinkExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio_util::codec::{Framed, FramedWrite};

    use super::*;
    use crate::{
        codec::{Codec, Encoder},
        State,
    };

    type Client = Framed<DuplexStream, Codec>;

    #[derive(Default)]
    struct Recorder {
        echo: bool,
        refuse: bool,
        messages: Mutex<Vec<Message>>,
        closes: Mutex<Vec<CloseReason>>,
        errors: Mutex<Vec<String>>,
        /// Result of every echo send.
        sends: Mutex<Vec<std::result::Result<(), String>>>,
        /// `on_error` and `on_close` in call order.
        events: Mutex<Vec<&'static str>>,
    }

    /// A stream whose two directions are separate duplex pipes, so the peer can stop
    /// reading while it keeps writing.
    struct Pipes {
        read: DuplexStream,
        write: DuplexStream,
    }

    impl AsyncRead for Pipes {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.read).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Pipes {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.write).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.write).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.write).poll_shutdown(cx)
        }
    }

    impl Recorder {
        fn messages(&self) -> Vec<Message> {
            self.messages.lock().unwrap().clone()
        }

        fn closes(&self) -> Vec<CloseReason> {
            self.closes.lock().unwrap().clone()
        }
    }

    impl Handler for Recorder {
        fn on_open<'a>(&'a self, _conn: &'a Connection) -> BoxFuture<'a, bool> {
            Box::pin(async move { !self.refuse })
        }

        fn on_message<'a>(&'a self, conn: &'a Connection, message: Message) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.messages.lock().unwrap().push(message.clone());
                if self.echo {
                    let res = conn.send(message.opcode, message.payload).await;
                    self.sends.lock().unwrap().push(res.map_err(|err| err.to_string()));
                }
            })
        }

        fn on_close<'a>(&'a self, _conn: &'a Connection, reason: CloseReason) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.events.lock().unwrap().push("close");
                self.closes.lock().unwrap().push(reason);
            })
        }

        fn on_error<'a>(&'a self, _conn: &'a Connection, err: &'a WebSocketError) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.events.lock().unwrap().push("error");
                self.errors.lock().unwrap().push(err.to_string());
            })
        }
    }

    fn start(recorder: &Arc<Recorder>, options: Options) -> (Session, Client) {
        let (server, client) = tokio::io::duplex(1 << 20);
        let handler: Arc<dyn Handler> = recorder.clone();
        let session = spawn(
            server,
            handler,
            options,
            HashMap::new(),
            CancellationToken::new(),
        );
        let client = Framed::new(client, Codec::new(Role::Client, 1 << 20));
        (session, client)
    }

    async fn next_frame(client: &mut Client) -> Frame {
        client.next().await.unwrap().unwrap()
    }

    async fn expect_close(client: &mut Client) -> Option<CloseReason> {
        let frame = next_frame(client).await;
        assert_eq!(frame.opcode, OpCode::Close);
        frame.close_reason().unwrap()
    }

    /// Writes a masked client frame header and payload by hand.
    async fn write_raw(client: &mut Client, first: u8, payload: &[u8]) {
        let mut raw = vec![first, 0x80 | payload.len() as u8, 0, 0, 0, 0];
        raw.extend_from_slice(payload);
        client.get_mut().write_all(&raw).await.unwrap();
    }

    #[tokio::test]
    async fn test_text_message_is_delivered() {
        let recorder = Arc::new(Recorder {
            echo: true,
            ..Default::default()
        });
        let (session, mut client) = start(&recorder, Options::default());

        client.send(Frame::text("hello")).await.unwrap();
        let frame = next_frame(&mut client).await;
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(!frame.is_masked());
        assert_eq!(&frame.payload[..], b"hello");

        client
            .send(Frame::close(CloseCode::Normal, "done"))
            .await
            .unwrap();
        let echo = expect_close(&mut client).await.unwrap();
        assert_eq!(echo.code, CloseCode::Normal);

        session.join().await.unwrap();
        assert_eq!(recorder.messages(), vec![Message::text("hello")]);
        assert_eq!(
            recorder.closes(),
            vec![CloseReason::new(CloseCode::Normal, "done")]
        );
    }

    #[tokio::test]
    async fn test_fragments_are_delivered_once() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) = start(&recorder, Options::default());

        client
            .send(Frame::new(false, OpCode::Text, None, &b"Hel"[..]))
            .await
            .unwrap();
        client
            .send(Frame::new(false, OpCode::Continuation, None, &b"lo, "[..]))
            .await
            .unwrap();
        // control frames may be interleaved with fragments
        client.send(Frame::ping("sync")).await.unwrap();
        assert_eq!(next_frame(&mut client).await.opcode, OpCode::Pong);
        assert!(recorder.messages().is_empty());

        client
            .send(Frame::new(true, OpCode::Continuation, None, &b"world"[..]))
            .await
            .unwrap();
        client.send(Frame::close_raw([])).await.unwrap();
        assert_eq!(expect_close(&mut client).await, None);

        session.join().await.unwrap();
        assert_eq!(recorder.messages(), vec![Message::text("Hello, world")]);
        assert_eq!(
            recorder.closes(),
            vec![CloseReason::new(CloseCode::Status, "")]
        );
    }

    #[tokio::test]
    async fn test_reserved_bit_closes_without_message() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) = start(&recorder, Options::default());

        // fin + rsv1 + text
        write_raw(&mut client, 0xC1, b"hello").await;

        let reason = expect_close(&mut client).await.unwrap();
        assert_eq!(reason.code, CloseCode::Protocol);
        assert!(client.next().await.is_none());

        session.join().await.unwrap();
        assert!(recorder.messages().is_empty());
        assert_eq!(recorder.closes().len(), 1);
        assert_eq!(recorder.closes()[0].code, CloseCode::Protocol);
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmasked_frame_closes_with_protocol_error() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) = start(&recorder, Options::default());

        client
            .get_mut()
            .write_all(&[0x81, 0x02, b'h', b'i'])
            .await
            .unwrap();

        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Protocol
        );
        session.join().await.unwrap();
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_before_payload() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) =
            start(&recorder, Options::default().with_max_payload_read(1024));

        // masked binary frame declaring 2048 bytes, no payload follows
        client
            .get_mut()
            .write_all(&[0x82, 0x80 | 126, 0x08, 0x00, 1, 2, 3, 4])
            .await
            .unwrap();

        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Size
        );
        session.join().await.unwrap();
        assert_eq!(recorder.closes()[0].code, CloseCode::Size);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) =
            start(&recorder, Options::default().with_max_message_size(8));

        client
            .send(Frame::new(false, OpCode::Binary, None, &[0u8; 5][..]))
            .await
            .unwrap();
        client
            .send(Frame::new(true, OpCode::Continuation, None, &[0u8; 5][..]))
            .await
            .unwrap();

        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Size
        );
        session.join().await.unwrap();
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test]
    async fn test_fragment_sequence_errors() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) = start(&recorder, Options::default());

        client
            .send(Frame::new(true, OpCode::Continuation, None, &b"stray"[..]))
            .await
            .unwrap();
        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Protocol
        );
        session.join().await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let (session, mut client) = start(&recorder, Options::default());

        client
            .send(Frame::new(false, OpCode::Text, None, &b"a"[..]))
            .await
            .unwrap();
        client.send(Frame::text("b")).await.unwrap();
        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Protocol
        );
        session.join().await.unwrap();
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_rejected_when_checked() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) = start(&recorder, Options::default().with_utf8());

        client.send(Frame::text([0xff, 0xfe])).await.unwrap();
        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Invalid
        );
        session.join().await.unwrap();
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test]
    async fn test_ping_gets_exactly_one_pong() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) = start(&recorder, Options::default());

        client.send(Frame::ping("are you there")).await.unwrap();
        let pong = next_frame(&mut client).await;
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(&pong.payload[..], b"are you there");

        client.send(Frame::pong("unsolicited")).await.unwrap();
        client
            .send(Frame::close(CloseCode::Normal, ""))
            .await
            .unwrap();
        // the next frame is the close answer, not a second pong
        expect_close(&mut client).await;

        session.join().await.unwrap();
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test]
    async fn test_local_close_waits_for_peer() {
        let recorder = Arc::new(Recorder::default());
        let (session, mut client) = start(&recorder, Options::default());

        session
            .connection()
            .close(CloseCode::Normal, "bye")
            .await
            .unwrap();
        assert_eq!(session.connection().state(), State::Closing);
        assert_eq!(
            expect_close(&mut client).await,
            Some(CloseReason::new(CloseCode::Normal, "bye"))
        );
        assert!(!session.is_finished());

        client
            .send(Frame::close(CloseCode::Normal, ""))
            .await
            .unwrap();
        let conn = session.connection().clone();
        session.join().await.unwrap();

        assert_eq!(conn.state(), State::Closed);
        assert_eq!(
            recorder.closes(),
            vec![CloseReason::new(CloseCode::Normal, "bye")]
        );
    }

    #[tokio::test]
    async fn test_local_close_times_out() {
        let recorder = Arc::new(Recorder::default());
        let options = Options::default().with_close_timeout(Duration::from_millis(50));
        let (session, mut client) = start(&recorder, options);

        session
            .connection()
            .close(CloseCode::Normal, "bye")
            .await
            .unwrap();
        expect_close(&mut client).await;

        // the client never answers
        session.join().await.unwrap();
        assert_eq!(
            recorder.closes(),
            vec![CloseReason::new(CloseCode::Normal, "bye")]
        );
        assert!(recorder.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_race_fires_on_close_once() {
        for _ in 0..20 {
            let recorder = Arc::new(Recorder::default());
            let options = Options::default().with_close_timeout(Duration::from_millis(100));
            let (session, mut client) = start(&recorder, options);

            let conn = session.connection().clone();
            let local = tokio::spawn(async move { conn.close(CloseCode::Normal, "local").await });
            client
                .send(Frame::close(CloseCode::Away, "remote"))
                .await
                .unwrap();

            local.await.unwrap().unwrap();
            expect_close(&mut client).await;
            session.join().await.unwrap();

            let closes = recorder.closes();
            assert_eq!(closes.len(), 1);
            assert!(closes[0].reason == "local" || closes[0].reason == "remote");
        }
    }

    #[tokio::test]
    async fn test_failed_write_reports_error_then_close() {
        let recorder = Arc::new(Recorder {
            echo: true,
            ..Default::default()
        });
        let (server_in, client_out) = tokio::io::duplex(1 << 16);
        let (server_out, client_in) = tokio::io::duplex(1 << 16);
        let session = spawn(
            Pipes {
                read: server_in,
                write: server_out,
            },
            recorder.clone(),
            Options::default(),
            HashMap::new(),
            CancellationToken::new(),
        );

        // the client stops reading but keeps writing
        drop(client_in);
        let mut client = FramedWrite::new(client_out, Encoder::new(Role::Client));
        client.send(Frame::text("hello")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), session.join())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(recorder.messages(), vec![Message::text("hello")]);
        assert!(recorder.sends.lock().unwrap()[0].is_err());
        assert_eq!(*recorder.events.lock().unwrap(), vec!["error", "close"]);
        assert_eq!(recorder.closes()[0].code, CloseCode::Abnormal);
    }

    #[tokio::test]
    async fn test_write_timeout_ends_session() {
        let recorder = Arc::new(Recorder::default());
        let (server, mut client) = tokio::io::duplex(64);
        let options = Options::default().with_write_timeout(Duration::from_millis(50));
        let session = spawn(
            server,
            recorder.clone(),
            options,
            HashMap::new(),
            CancellationToken::new(),
        );
        let conn = session.connection().clone();

        // nobody reads the client side, so the pipe fills up
        assert!(matches!(
            conn.send_binary(vec![0u8; 4096]).await,
            Err(WebSocketError::Timeout)
        ));

        tokio::time::timeout(Duration::from_secs(5), session.join())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(conn.state(), State::Closed);
        assert!(matches!(
            conn.send_text("late").await,
            Err(WebSocketError::ConnectionClosed)
        ));
        assert_eq!(*recorder.events.lock().unwrap(), vec!["error", "close"]);
        assert_eq!(*recorder.errors.lock().unwrap(), vec!["Timed out".to_string()]);
        assert_eq!(recorder.closes()[0].code, CloseCode::Abnormal);

        // only the start of the binary frame made it out, no close frame behind it
        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        assert_eq!(written.len(), 64);
        assert_eq!(written[0], 0x82);
    }

    #[tokio::test]
    async fn test_eof_is_abnormal() {
        let recorder = Arc::new(Recorder::default());
        let (session, client) = start(&recorder, Options::default());

        drop(client);
        session.join().await.unwrap();

        let closes = recorder.closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].code, CloseCode::Abnormal);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let recorder = Arc::new(Recorder {
            refuse: true,
            ..Default::default()
        });
        let (session, mut client) = start(&recorder, Options::default());

        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Policy
        );
        session.join().await.unwrap();
        assert_eq!(recorder.closes()[0].code, CloseCode::Policy);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let recorder = Arc::new(Recorder::default());
        let options = Options::default().with_idle_timeout(Duration::from_millis(50));
        let (session, mut client) = start(&recorder, options);

        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Away
        );
        session.join().await.unwrap();
        assert_eq!(recorder.closes()[0].code, CloseCode::Away);
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let recorder = Arc::new(Recorder::default());
        let (server, client) = tokio::io::duplex(1 << 20);
        let shutdown = CancellationToken::new();
        let session = spawn(
            server,
            recorder.clone(),
            Options::default(),
            HashMap::new(),
            shutdown.clone(),
        );
        let mut client = Framed::new(client, Codec::new(Role::Client, 1 << 20));

        shutdown.cancel();
        assert_eq!(
            expect_close(&mut client).await.unwrap().code,
            CloseCode::Away
        );
        client.send(Frame::close(CloseCode::Away, "")).await.unwrap();
        session.join().await.unwrap();
        assert_eq!(recorder.closes()[0].code, CloseCode::Away);
    }

    #[tokio::test]
    async fn test_begin_session_writes_handshake() {
        let recorder = Arc::new(Recorder {
            echo: true,
            ..Default::default()
        });
        let (server, mut client) = tokio::io::duplex(1 << 20);

        let session = begin_session(
            server,
            "dGhlIHNhbXBsZSBub25jZQ==",
            recorder.clone(),
            Options::default(),
        )
        .await
        .unwrap();

        let expected = handshake::response_head("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let mut head = vec![0u8; expected.len()];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(String::from_utf8(head).unwrap(), expected);

        let mut client = Framed::new(client, Codec::new(Role::Client, 1 << 20));
        client.send(Frame::binary([1u8, 2, 3])).await.unwrap();
        assert_eq!(&next_frame(&mut client).await.payload[..], &[1u8, 2, 3]);

        drop(client);
        session.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_session_rejects_bad_key() {
        let recorder = Arc::new(Recorder::default());
        let (server, _client) = tokio::io::duplex(1024);

        let res = begin_session(server, "not a key", recorder.clone(), Options::default()).await;
        assert!(matches!(res, Err(WebSocketError::InvalidSecWebSocketKey)));
        assert!(recorder.closes().is_empty());
    }

    #[test]
    fn test_assembler_resets_after_delivery() {
        let mut assembler = Assembler::new(&Options::default());

        let first = Frame::new(false, OpCode::Binary, None, &b"ab"[..]);
        let last = Frame::new(true, OpCode::Continuation, None, &b"cd"[..]);
        assert!(assembler.push(first).unwrap().is_none());
        let message = assembler.push(last).unwrap().unwrap();
        assert_eq!(message, Message::binary(&b"abcd"[..]));

        assert!(assembler.fragment.is_none());
        assert!(assembler.accumulated.is_empty());
        assert!(matches!(
            assembler.push(Frame::new(true, OpCode::Continuation, None, &b"x"[..])),
            Err(WebSocketError::InvalidContinuationFrame)
        ));
    }
}
