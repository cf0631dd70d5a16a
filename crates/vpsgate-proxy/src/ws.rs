use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Largest backend handshake head we will buffer.
const MAX_HEAD: usize = 16 * 1024;

/// Whether a request asks for a protocol upgrade.
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    let upgrade_ws = headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrade = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade_ws || connection_upgrade
}

/// Strip the scheme and path from an upstream base URL, leaving
/// `host[:port]` with the scheme's default port filled in.
fn authority(upstream: &str) -> Option<String> {
    let (default_port, rest) = if let Some(rest) = upstream.strip_prefix("http://") {
        (80u16, rest)
    } else if let Some(rest) = upstream.strip_prefix("https://") {
        (443u16, rest)
    } else {
        (80u16, upstream)
    };
    let host = rest.split('/').next()?;
    if host.is_empty() {
        return None;
    }
    if host.contains(':') {
        Some(host.to_string())
    } else {
        Some(format!("{host}:{default_port}"))
    }
}

/// Take over an upgrade request: dial the backend, replay the rewritten
/// handshake, relay the backend's reply, then copy bytes both ways until
/// either side closes.
pub async fn hijack(upstream: &str, mut request: Request) -> Response {
    let Some(on_upgrade) = request.extensions_mut().remove::<OnUpgrade>() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "connection does not support hijacking")
            .into_response();
    };

    let Some(authority) = authority(upstream) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "invalid upstream target").into_response();
    };

    let mut backend = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%authority, error = %e, "backend dial failed for upgrade");
            // The raw-socket equivalent of writing an HTTP/1.1 502 line.
            return (StatusCode::BAD_GATEWAY, format!("backend dial failed: {e}"))
                .into_response();
        }
    };

    // Rewritten request line and headers; Host points at the backend and
    // the upgrade headers ride along unchanged.
    let path_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut head = format!("{} {path_query} HTTP/1.1\r\n", request.method());
    head.push_str(&format!("Host: {authority}\r\n"));
    for (name, value) in request.headers() {
        if name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    head.push_str("\r\n");

    let body = match axum::body::to_bytes(request.into_body(), MAX_HEAD).await {
        Ok(body) => body,
        Err(_) => Default::default(),
    };

    if let Err(e) = write_handshake(&mut backend, head.as_bytes(), &body).await {
        warn!(%authority, error = %e, "handshake write failed");
        return (StatusCode::BAD_GATEWAY, format!("handshake write failed: {e}")).into_response();
    }

    // Relay the backend's handshake reply to the client.
    let (head_bytes, leftover) = match read_head(&mut backend).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(%authority, error = %e, "handshake read failed");
            return (StatusCode::BAD_GATEWAY, format!("handshake read failed: {e}"))
                .into_response();
        }
    };
    let Some((status, headers)) = parse_head(&head_bytes) else {
        return (StatusCode::BAD_GATEWAY, "unparseable backend handshake").into_response();
    };

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                    return;
                }
                match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                    Ok((up, down)) => debug!(up, down, "upgrade relay finished"),
                    Err(e) => debug!(error = %e, "upgrade relay closed"),
                }
            }
            Err(e) => warn!(error = %e, "client upgrade failed"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn write_handshake(
    backend: &mut TcpStream,
    head: &[u8],
    body: &[u8],
) -> std::io::Result<()> {
    backend.write_all(head).await?;
    if !body.is_empty() {
        backend.write_all(body).await?;
    }
    backend.flush().await
}

/// Read the backend's response up to the blank line. Returns the head and
/// any bytes already received past it.
async fn read_head(backend: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed during handshake",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_blank_line(&buf) {
            let leftover = buf.split_off(pos + 4);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "backend handshake head too large",
            ));
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Minimal parse of an HTTP/1.1 response head into status + headers.
fn parse_head(bytes: &[u8]) -> Option<(StatusCode, HeaderMap)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let code: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
        let value = HeaderValue::from_str(value.trim()).ok()?;
        headers.append(name, value);
    }
    Some((status, headers))
}
