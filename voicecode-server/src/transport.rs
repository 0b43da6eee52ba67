//! Per-connection I/O. A single TCP port speaks two protocols (§6): the
//! long-lived framed JSON channel used for the bulk of the dispatch table,
//! and a short-lived HTTP/1.1-shaped request/response channel used only for
//! file uploads. Nothing in the corpus pulls in an HTTP server crate, so the
//! upload request line is parsed by hand, mirroring the framed reader/writer
//! split the rest of this module already uses.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::warn;
use voicecode_core::connection::Connection;
use voicecode_core::connection::ConnectionId;
use voicecode_core::connection::ConnectionTable;
use voicecode_core::dispatch::Dispatcher;
use voicecode_protocol::ClientMessage;
use voicecode_protocol::ServerMessage;

/// Peek the first byte to tell a `POST` request line from a JSON frame
/// (which always starts with `{`). Neither protocol writes anything before
/// the client speaks first, so one `peek` is enough to route the connection.
async fn looks_like_upload_request(socket: &TcpStream) -> std::io::Result<bool> {
    let mut buf = [0u8; 1];
    let n = socket.peek(&mut buf).await?;
    Ok(n == 1 && buf[0] == b'P')
}

pub async fn handle_connection(
    socket: TcpStream,
    dispatcher: Arc<Dispatcher>,
    connections: ConnectionTable,
) -> std::io::Result<()> {
    socket.set_nodelay(true)?;

    if looks_like_upload_request(&socket).await? {
        return handle_upload_request(socket, dispatcher).await;
    }

    handle_framed_session(socket, dispatcher, connections).await
}

/// The long-lived, bidirectional channel (§4.1). Mirrors the
/// reader-task/processor/writer-task split used for the stdio JSON-RPC loop
/// elsewhere in this workspace, just over a socket instead of stdin/stdout.
async fn handle_framed_session(
    socket: TcpStream,
    dispatcher: Arc<Dispatcher>,
    connections: ConnectionTable,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let id = ConnectionId::next();
    connections.insert(Connection::new(id, outgoing_tx.clone()));
    let _ = outgoing_tx.send(Dispatcher::hello());

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let Ok(mut json) = serde_json::to_string(&message) else {
                error!(connection = ?id, "failed to serialize outgoing message");
                continue;
            };
            json.push('\n');
            if let Err(e) = write_half.write_all(json.as_bytes()).await {
                debug!(connection = ?id, error = %e, "write failed, closing writer task");
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(connection = ?id, error = %e, "read error, closing connection");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: ClientMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                connections.mutate(id, |c| {
                    c.send(ServerMessage::Error {
                        message: format!("invalid message: {e}"),
                        session_id: None,
                    })
                });
                continue;
            }
        };

        if !dispatcher.handle_message(id, message).await {
            break;
        }
    }

    connections.remove(id);
    drop(dispatcher);
    writer.abort();
    Ok(())
}

const MAX_UPLOAD_HEADER_BYTES: usize = 8 * 1024;
const MAX_UPLOAD_BODY_BYTES: u64 = 64 * 1024 * 1024;

struct ParsedRequest {
    bearer_token: Option<String>,
    content_length: u64,
}

fn parse_request_head(head: &str) -> ParsedRequest {
    let mut bearer_token = None;
    let mut content_length = 0;
    for line in head.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "authorization" => {
                bearer_token = value.strip_prefix("Bearer ").map(str::to_string);
            }
            "content-length" => {
                content_length = value.parse().unwrap_or(0);
            }
            _ => {}
        }
    }
    ParsedRequest {
        bearer_token,
        content_length,
    }
}

async fn write_http_response(
    socket: &mut TcpStream,
    status: &str,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> std::io::Result<()> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.push_str(body);
    socket.write_all(response.as_bytes()).await?;
    socket.flush().await
}

#[derive(serde::Deserialize)]
struct UploadBody {
    filename: Option<String>,
    content: Option<String>,
    storage_location: Option<String>,
}

/// The short-lived, single-exchange upload channel (§4.6, §6). Unlike the
/// framed channel it authenticates per-request via `Authorization: Bearer`
/// rather than a handshake, and the connection closes after one reply.
async fn handle_upload_request(mut socket: TcpStream, dispatcher: Arc<Dispatcher>) -> std::io::Result<()> {
    let mut reader = BufReader::new(&mut socket);
    let mut head = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 || line == b"\r\n" || line == b"\n" {
            break;
        }
        head.extend_from_slice(&line);
        if head.len() > MAX_UPLOAD_HEADER_BYTES {
            drop(reader);
            return write_http_response(
                &mut socket,
                "400 Bad Request",
                &[],
                r#"{"success":false,"error":"request head too large"}"#,
            )
            .await;
        }
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let parsed = parse_request_head(&head);

    let Some(token) = parsed.bearer_token else {
        drop(reader);
        return write_http_response(
            &mut socket,
            "401 Unauthorized",
            &[("WWW-Authenticate", r#"Bearer realm="voice-code""#)],
            r#"{"success":false,"error":"Authentication failed"}"#,
        )
        .await;
    };
    if !dispatcher.authenticate_key(&token) {
        drop(reader);
        return write_http_response(
            &mut socket,
            "401 Unauthorized",
            &[("WWW-Authenticate", r#"Bearer realm="voice-code""#)],
            r#"{"success":false,"error":"Authentication failed"}"#,
        )
        .await;
    }

    if parsed.content_length == 0 || parsed.content_length > MAX_UPLOAD_BODY_BYTES {
        drop(reader);
        return write_http_response(
            &mut socket,
            "400 Bad Request",
            &[],
            r#"{"success":false,"error":"missing or oversized body"}"#,
        )
        .await;
    }

    let mut body = vec![0u8; parsed.content_length as usize];
    reader.read_exact(&mut body).await?;
    drop(reader);

    let body: UploadBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            return write_http_response(
                &mut socket,
                "400 Bad Request",
                &[],
                &format!(r#"{{"success":false,"error":"invalid json: {e}"}}"#),
            )
            .await;
        }
    };
    let (Some(filename), Some(content), Some(storage_location)) =
        (body.filename, body.content, body.storage_location)
    else {
        return write_http_response(
            &mut socket,
            "400 Bad Request",
            &[],
            r#"{"success":false,"error":"missing field"}"#,
        )
        .await;
    };

    match voicecode_core::resources::upload(&storage_location, &filename, &content, chrono::Utc::now()) {
        Ok(uploaded) => {
            let body = serde_json::json!({
                "success": true,
                "filename": uploaded.filename,
                "path": uploaded.path.display().to_string(),
                "size": uploaded.size,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            write_http_response(&mut socket, "200 OK", &[], &body.to_string()).await
        }
        Err(e) => {
            write_http_response(
                &mut socket,
                "400 Bad Request",
                &[],
                &format!(r#"{{"success":false,"error":"{e}"}}"#),
            )
            .await
        }
    }
}
