//! The opening handshake ([RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2)).
//!
//! Two entry points are provided:
//!
//! - [`write_response`] writes the `101 Switching Protocols` block straight onto a stream the
//!   caller has already taken over from its HTTP server.
//! - [`upgrade`] validates a hyper [`Request`] and returns the response to send plus an
//!   [`UpgradeFut`] that resolves to the raw stream once hyper hands it over.
use std::{
    borrow::BorrowMut,
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use base64::prelude::*;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{header, upgrade::Upgraded, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{Result, WebSocketError};

/// Fixed GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Response sent to accept an upgrade on a hyper server.
pub type HttpResponse = Response<Empty<Bytes>>;

/// Stream handed over by hyper after a successful upgrade.
pub type HttpStream = TokioIo<Upgraded>;

/// Computes `Sec-WebSocket-Accept` for a client key.
///
/// ```rust
/// assert_eq!(
///     wsgate::handshake::accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Checks that a `Sec-WebSocket-Key` value is the base64 encoding of 16 bytes.
pub fn validate_key(key: &[u8]) -> Result<()> {
    let key = key.trim_ascii();
    if key.is_empty() {
        return Err(WebSocketError::MissingSecWebSocketKey);
    }

    match BASE64_STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => Ok(()),
        _ => Err(WebSocketError::InvalidSecWebSocketKey),
    }
}

/// The complete `101 Switching Protocols` response for a given accept value.
pub fn response_head(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

/// Validates `key` and writes the upgrade response onto `stream`.
///
/// Nothing is written when the key is rejected, so the caller can still answer with an
/// HTTP error.
pub async fn write_response<W>(stream: &mut W, key: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let key = key.as_bytes().trim_ascii();
    validate_key(key)?;
    let accept = accept_key(key);

    stream.write_all(response_head(&accept).as_bytes()).await?;
    stream.flush().await?;

    log::debug!("upgrade accepted, Sec-WebSocket-Accept={accept}");
    Ok(())
}

/// Returns `true` if a comma separated header value contains `token`, ignoring ASCII case.
fn has_token(value: &header::HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

/// Returns `true` if the request asks for a WebSocket upgrade.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .is_some_and(|value| has_token(value, "websocket"))
}

/// Validates a hyper request as a WebSocket upgrade.
///
/// Returns the `101` response that must be sent back, and a future that resolves to the raw
/// stream once hyper has sent the response and released the connection. The server must be
/// driving the connection with upgrades enabled
/// (`hyper::server::conn::http1::Connection::with_upgrades`).
///
/// # Errors
/// - [`WebSocketError::InvalidUpgradeHeader`] if `Upgrade` does not name `websocket`
/// - [`WebSocketError::InvalidConnectionHeader`] if `Connection` lacks `upgrade`
/// - [`WebSocketError::InvalidSecWebsocketVersion`] if the version is not 13
/// - [`WebSocketError::MissingSecWebSocketKey`] / [`WebSocketError::InvalidSecWebSocketKey`]
///
/// Each maps to an HTTP status through [`WebSocketError::status`].
pub fn upgrade<B>(mut request: impl BorrowMut<Request<B>>) -> Result<(HttpResponse, UpgradeFut)> {
    let request = request.borrow_mut();

    if !is_upgrade_request(request) {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !request
        .headers()
        .get(header::CONNECTION)
        .is_some_and(|value| has_token(value, "upgrade"))
    {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    if request
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes())
        != Some(b"13")
    {
        return Err(WebSocketError::InvalidSecWebsocketVersion);
    }

    let key = request
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;
    validate_key(key.as_bytes())?;

    let mut response = Response::new(Empty::new());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, header::HeaderValue::from_static("websocket"));
    headers.insert(
        header::SEC_WEBSOCKET_ACCEPT,
        header::HeaderValue::try_from(accept_key(key.as_bytes().trim_ascii()))
            .map_err(|_| WebSocketError::InvalidSecWebSocketKey)?,
    );

    let fut = UpgradeFut {
        inner: hyper::upgrade::on(request),
    };

    Ok((response, fut))
}

/// Resolves to the raw stream once hyper completes the protocol switch.
///
/// The response returned alongside it by [`upgrade`] has to be sent first; the future does
/// not complete before that.
#[pin_project]
#[derive(Debug)]
pub struct UpgradeFut {
    #[pin]
    inner: hyper::upgrade::OnUpgrade,
}

impl Future for UpgradeFut {
    type Output = Result<HttpStream>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = ready!(this.inner.poll(cx))?;
        Poll::Ready(Ok(TokioIo::new(upgraded)))
    }
}
