//! A small hyper server that dispatches WebSocket upgrades by path.
//!
//! ```no_run
//! # use futures::future::BoxFuture;
//! # use wsgate::{Connection, Handler, Message};
//! # struct Chat;
//! # impl Handler for Chat {
//! #     fn on_message<'a>(&'a self, _: &'a Connection, _: Message) -> BoxFuture<'a, ()> {
//! #         Box::pin(async {})
//! #     }
//! # }
//! use std::time::Duration;
//! use tokio::net::TcpListener;
//! use wsgate::{Options, Router, Server};
//!
//! # async fn run() -> wsgate::Result<()> {
//! let router = Router::new().route_with_options(
//!     "/chat",
//!     Chat,
//!     Options::default().with_idle_timeout(Duration::from_secs(30)),
//! );
//!
//! let server = Server::new(router);
//! let shutdown = server.shutdown_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.cancel();
//! });
//!
//! server.serve(TcpListener::bind("0.0.0.0:8080").await?).await
//! # }
//! ```
use std::{collections::HashMap, convert::Infallible, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{self, HeaderValue},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode, Uri,
};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{handshake, session, Handler, Options, Result};

/// Response type of the HTTP side of the server.
pub type HttpResponse = Response<Full<Bytes>>;

struct Route {
    handler: Arc<dyn Handler>,
    options: Options,
}

/// Maps request paths to handlers.
///
/// Paths match exactly, without the query string.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `path` with default [`Options`].
    pub fn route(self, path: &str, handler: impl Handler) -> Self {
        self.route_with_options(path, handler, Options::default())
    }

    /// Registers `handler` for `path`.
    ///
    /// The first registration of a path wins; later ones are ignored with a warning.
    pub fn route_with_options(mut self, path: &str, handler: impl Handler, options: Options) -> Self {
        if self.routes.contains_key(path) {
            log::warn!("route {path} is already registered, keeping the first handler");
            return self;
        }

        self.routes.insert(
            path.to_owned(),
            Route {
                handler: Arc::new(handler),
                options,
            },
        );
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    fn find(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }
}

/// Accepts TCP connections, speaks HTTP/1.1 and hands WebSocket upgrades to the router's
/// handlers.
///
/// Every HTTP connection and every session runs in its own task. When the shutdown token
/// is cancelled the server stops accepting, open sessions receive a 1001 close frame, and
/// [`Server::serve`] returns once all of them are done.
pub struct Server {
    router: Arc<Router>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the accept loop on `listener` until shutdown.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        log::info!("listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                },
            };

            log::debug!("connection from {peer}");
            self.tracker.spawn(serve_http(
                stream,
                Arc::clone(&self.router),
                self.tracker.clone(),
                self.shutdown.clone(),
            ));
        }

        log::info!("shutting down, waiting for {} tasks", self.tracker.len());
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}

async fn serve_http(
    stream: TcpStream,
    router: Arc<Router>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    let io = TokioIo::new(stream);
    let service = {
        let shutdown = shutdown.clone();
        service_fn(move |request| {
            let response = dispatch(request, &router, &tracker, &shutdown);
            async move { Ok::<_, Infallible>(response) }
        })
    };

    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(err) = res {
        log::debug!("http connection error: {err}");
    }
}

/// Answers one HTTP request: 404 for unknown paths, an error status for invalid upgrade
/// requests, `101` plus a new session otherwise.
fn dispatch(
    mut request: Request<Incoming>,
    router: &Router,
    tracker: &TaskTracker,
    shutdown: &CancellationToken,
) -> HttpResponse {
    let Some(route) = router.find(request.uri().path()) else {
        log::debug!("no route for {}", request.uri().path());
        return reject(StatusCode::NOT_FOUND, "404 Not Found!");
    };

    if !handshake::is_upgrade_request(&request) {
        return reject(StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required");
    }

    let params = query_params(request.uri());
    let (response, upgraded) = match handshake::upgrade(&mut request) {
        Ok(upgrade) => upgrade,
        Err(err) => {
            log::debug!("upgrade rejected: {err}");
            let status = err.status().unwrap_or(StatusCode::BAD_REQUEST);
            return reject(status, &err.to_string());
        }
    };

    let handler = Arc::clone(&route.handler);
    let options = route.options.clone();
    let shutdown = shutdown.clone();
    tracker.spawn(async move {
        match upgraded.await {
            Ok(stream) => session::serve(stream, handler, options, params, shutdown).await,
            Err(err) => log::warn!("upgrade failed: {err}"),
        }
    });

    response.map(|_| Full::new(Bytes::new()))
}

fn reject(status: StatusCode, body: &str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.to_owned())));
    *response.status_mut() = status;
    if status == StatusCode::UPGRADE_REQUIRED {
        response
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    }
    response
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}
