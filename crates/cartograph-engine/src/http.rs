// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Minimal loopback-only HTTP/1.1 server and the `/ws` upgrade.
//!
//! Hand-rolled over a raw [`TcpListener`] for the same reason as [`crate::ws`]:
//! the token gate and the upgrade handshake are part of this system's
//! testable surface, not something to hide behind a framework.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use cartograph_core::ClientEvent;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::hub::{ClientId, ClientStream};
use crate::ws;

const UI_HTML: &str = include_str!("../templates/ui.html");
const DOCUMENT_TEMPLATE: &str = include_str!("../templates/document.html");
const LOADING_HTML: &str = include_str!("../templates/loading.html");

/// Everything the HTTP layer needs from the engine, kept as a trait so
/// `http.rs` has no direct dependency on `engine.rs`'s internals.
#[async_trait]
pub trait ServerContext: Send + Sync {
    fn secret(&self) -> &str;
    fn status_json(&self) -> serde_json::Value;
    fn state_json(&self) -> serde_json::Value;
    fn models_json(&self) -> serde_json::Value;
    /// `(title, body_html)` of the current rendered document, if any.
    fn document_fragment(&self) -> Option<(String, String)>;

    /// Register a new WebSocket client and return its id plus the receiving
    /// half of its outbox (already seeded with `init` + history by the hub).
    fn connect_client(&self) -> (ClientId, ClientStream);
    fn disconnect_client(&self, id: ClientId);
    /// Handle one inbound text frame's JSON body from a connected client.
    async fn handle_client_message(&self, id: ClientId, text: &str);
}

/// Bind the loopback listener, trying `base..=base+span` on `EADDRINUSE`.
pub async fn bind_loopback(base_port: u16, span: u16) -> anyhow::Result<(TcpListener, u16)> {
    for port in base_port..=base_port.saturating_add(span) {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => {
                let bound_port = listener.local_addr()?.port();
                return Ok((listener, bound_port));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(cartograph_core::EngineError::NoFreePort {
        base: base_port,
        base_plus_span: base_port.saturating_add(span),
    }
    .into())
}

/// Accept connections until the listener is dropped (on `stopAll`), handing
/// each one to its own task.
pub async fn serve(listener: TcpListener, ctx: Arc<dyn ServerContext>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                debug!(%peer, error = %e, "connection ended");
            }
        });
    }
}

struct Request {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let k = parts.next()?;
            let v = parts.next().unwrap_or("");
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

async fn read_request(reader: &mut BufReader<&mut TcpStream>) -> std::io::Result<Option<Request>> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    let mut parts = request_line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    // HTTP version intentionally ignored; we always respond HTTP/1.1.

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), parse_query(q)),
        None => (target, HashMap::new()),
    };

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    Ok(Some(Request {
        method,
        path,
        query,
        headers,
    }))
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn forbidden(stream: &mut TcpStream) -> std::io::Result<()> {
    write_response(stream, 403, "Forbidden", "text/plain", b"").await
}

fn render_document(fragment: Option<(String, String)>) -> String {
    match fragment {
        Some((title, body)) => DOCUMENT_TEMPLATE
            .replace("{{TITLE}}", &html_escape(&title))
            .replace("{{BODY}}", &body),
        None => LOADING_HTML.to_string(),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

async fn handle_connection(mut stream: TcpStream, ctx: Arc<dyn ServerContext>) -> anyhow::Result<()> {
    let request = {
        let mut reader = BufReader::new(&mut stream);
        read_request(&mut reader).await?
    };
    let Some(request) = request else {
        return Ok(());
    };

    if request.method != "GET" {
        write_response(&mut stream, 405, "Method Not Allowed", "text/plain", b"").await?;
        return Ok(());
    }

    if request.path != "/" {
        let provided = request.query.get("token").map(String::as_str).unwrap_or("");
        if provided != ctx.secret() {
            forbidden(&mut stream).await?;
            return Ok(());
        }
    }

    match request.path.as_str() {
        "/" => {
            write_response(&mut stream, 200, "OK", "text/html; charset=utf-8", UI_HTML.as_bytes()).await?;
        }
        "/doc" => {
            let html = render_document(ctx.document_fragment());
            write_response(&mut stream, 200, "OK", "text/html; charset=utf-8", html.as_bytes()).await?;
        }
        "/status" => {
            let body = serde_json::to_vec(&ctx.status_json())?;
            write_response(&mut stream, 200, "OK", "application/json", &body).await?;
        }
        "/state" => {
            let body = serde_json::to_vec(&ctx.state_json())?;
            write_response(&mut stream, 200, "OK", "application/json", &body).await?;
        }
        "/models" => {
            let body = serde_json::to_vec(&ctx.models_json())?;
            write_response(&mut stream, 200, "OK", "application/json", &body).await?;
        }
        "/ws" => {
            handle_ws_upgrade(stream, &request.headers, ctx).await?;
        }
        _ => {
            write_response(&mut stream, 404, "Not Found", "text/plain", b"").await?;
        }
    }

    Ok(())
}

async fn handle_ws_upgrade(
    mut stream: TcpStream,
    headers: &HashMap<String, String>,
    ctx: Arc<dyn ServerContext>,
) -> anyhow::Result<()> {
    let Some(key) = headers.get("sec-websocket-key") else {
        write_response(&mut stream, 400, "Bad Request", "text/plain", b"missing Sec-WebSocket-Key").await?;
        return Ok(());
    };
    let accept = ws::accept_key(key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    let (id, mut outbox) = ctx.connect_client();
    info!(client = id, "websocket client connected");

    loop {
        tokio::select! {
            frame = ws::read_frame(&mut stream) => {
                match frame {
                    Ok(ws::InboundFrame::Text(text)) => ctx.handle_client_message(id, &text).await,
                    Ok(ws::InboundFrame::Ping(payload)) => {
                        if ws::write_pong(&mut stream, &payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(ws::InboundFrame::Close) => break,
                    Ok(ws::InboundFrame::Ignored) => {}
                    Err(ws::FrameError::Protocol(reason)) => {
                        debug!(client = id, reason, "dropping malformed frame");
                    }
                    Err(ws::FrameError::Io(_)) => break,
                }
            }
            event = outbox.recv() => {
                match event {
                    Some(event) => {
                        if send_client_event(&mut stream, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    ctx.disconnect_client(id);
    ws::write_close(&mut stream).await.ok();
    info!(client = id, "websocket client disconnected");
    Ok(())
}

async fn send_client_event(stream: &mut TcpStream, event: &ClientEvent) -> std::io::Result<()> {
    let json = serde_json::to_string(event).expect("ClientEvent always serializes");
    ws::write_text_frame(stream, &json).await
}
