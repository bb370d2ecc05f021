//! A WebSocket echo server built on wsgate's router.
//! Text and binary messages sent to `/echo` come straight back; `/chat?name=...` greets the
//! client by name first.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpListener;
use wsgate::{CloseReason, Connection, Handler, Message, Options, Router, Server, WebSocketError};

struct Echo;

impl Handler for Echo {
    fn on_message<'a>(&'a self, conn: &'a Connection, message: Message) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(err) = conn.send(message.opcode, message.payload).await {
                log::warn!("echo failed: {err}");
            }
        })
    }

    fn on_close<'a>(&'a self, _conn: &'a Connection, reason: CloseReason) -> BoxFuture<'a, ()> {
        Box::pin(async move { log::info!("client disconnected: {reason}") })
    }
}

struct Greeter;

impl Handler for Greeter {
    fn on_open<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Some(name) = conn.param("name") else {
                // no name, no chat
                return false;
            };
            conn.send_text(format!("hello {name}")).await.is_ok()
        })
    }

    fn on_message<'a>(&'a self, conn: &'a Connection, message: Message) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let reply = match message.as_str() {
                Some(text) => format!("{} says {text}", conn.param("name").unwrap_or("?")),
                None => format!("{} bytes of binary", message.payload.len()),
            };
            let _ = conn.send_text(reply).await;
        })
    }

    fn on_error<'a>(&'a self, _conn: &'a Connection, err: &'a WebSocketError) -> BoxFuture<'a, ()> {
        Box::pin(async move { log::error!("chat error: {err}") })
    }
}

#[tokio::main]
async fn main() -> wsgate::Result<()> {
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let router = Router::new()
        .route_with_options(
            "/echo",
            Echo,
            Options::default()
                .with_utf8()
                .with_max_payload_read(16 * 1024 * 1024)
                .with_max_message_size(32 * 1024 * 1024),
        )
        .route_with_options(
            "/chat",
            Greeter,
            Options::default().with_idle_timeout(Duration::from_secs(30)),
        );

    let server = Server::new(router);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("ctrl-c received");
            shutdown.cancel();
        }
    });

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    server.serve(listener).await
}
