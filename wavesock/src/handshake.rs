//! HTTP/1.1 opening handshake, both directions.
//!
//! The exchange is a single request/response pair with CRLF-delimited lines,
//! terminated by a blank line. Nothing of HTTP survives past it: once the
//! 101 response is on the wire both ends speak frames only.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::client::ConnectOptions;
use crate::error::WsError;

/// GUID appended to the client key when computing the accept hash, fixed by
/// RFC 6455.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The handshake head (request or response) may not exceed this many bytes.
const MAX_HEAD: usize = 4096;

/// Compute the `Sec-WebSocket-Accept` value for a client key:
/// base64(SHA1(key + GUID)). The server emits it, the client checks it for
/// strict equality.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    BASE64.encode(rand::random::<[u8; 16]>())
}

/// Accumulate bytes until the blank line that ends an HTTP head.
async fn read_http_head<S>(stream: &mut S) -> Result<String, WsError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
        if head.len() >= 4 && &head[head.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if head.len() > MAX_HEAD {
            return Err(WsError::Handshake("http head too large".into()));
        }
    }
    String::from_utf8(head).map_err(|_| WsError::Handshake("http head is not utf-8".into()))
}

/// Case-insensitive single-header lookup over a parsed head.
fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (header, value) = line.split_once(':')?;
        header.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Perform the client half of the opening handshake on a connected stream.
///
/// `host` and `port` only shape the `Host` header; the stream is already
/// connected (and TLS-wrapped when requested).
pub(crate) async fn client<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    options: &ConnectOptions,
) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let host_header = if port == 80 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };

    let mut request = String::with_capacity(256);
    request.push_str(&format!("GET {} HTTP/1.1\r\n", options.path));
    request.push_str(&format!("Host: {host_header}\r\n"));
    request.push_str("Connection: Upgrade\r\n");
    request.push_str("Upgrade: websocket\r\n");
    request.push_str("Sec-WebSocket-Version: 13\r\n");
    request.push_str(&format!("Sec-WebSocket-Key: {key}\r\n"));
    request.push_str("Pragma: no-cache\r\n");
    request.push_str("Cache-Control: no-cache\r\n");
    request.push_str(&format!("User-Agent: {}\r\n", options.user_agent));
    if let Some(origin) = options.origin.as_deref() {
        if !origin.is_empty() {
            request.push_str(&format!("Origin: {origin}\r\n"));
        }
    }
    for (name, value) in &options.extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_http_head(stream).await?;
    let status = head.lines().next().unwrap_or_default();
    let mut parts = status.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default().trim();
    if version != "HTTP/1.1" || code != "101" || reason.is_empty() {
        return Err(WsError::Handshake(format!(
            "unexpected status line {status:?}"
        )));
    }

    match header_value(&head, "Upgrade") {
        Some(value) if value.eq_ignore_ascii_case("websocket") => {}
        other => {
            return Err(WsError::Handshake(format!(
                "bad Upgrade header: {other:?}"
            )))
        }
    }
    match header_value(&head, "Connection") {
        Some(value) if value.eq_ignore_ascii_case("upgrade") => {}
        other => {
            return Err(WsError::Handshake(format!(
                "bad Connection header: {other:?}"
            )))
        }
    }
    match header_value(&head, "Sec-WebSocket-Accept") {
        Some(value) if value == accept_key(&key) => {}
        other => {
            return Err(WsError::Handshake(format!(
                "bad Sec-WebSocket-Accept header: {other:?}"
            )))
        }
    }

    Ok(())
}

/// Successfully upgraded server-side handshake.
#[derive(Debug)]
pub(crate) struct ServerHandshake {
    pub path: String,
}

/// Perform the server half of the opening handshake on an accepted stream.
///
/// Emits the 101 response on success, a 400 on a request that is not a valid
/// WebSocket upgrade. The caller drops the connection on error.
pub(crate) async fn server<S>(stream: &mut S) -> Result<ServerHandshake, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_http_head(stream).await?;
    match validate_upgrade_request(&head) {
        Ok((path, key)) => {
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 \r\n",
                accept_key(&key)
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
            Ok(ServerHandshake { path })
        }
        Err(reason) => {
            let response = "HTTP/1.1 400 Bad Request\r\n\
                 Connection: close\r\n\
                 Content-Length: 0\r\n\
                 \r\n";
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.flush().await;
            Err(WsError::Handshake(reason))
        }
    }
}

fn validate_upgrade_request(head: &str) -> Result<(String, String), String> {
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if method != "GET" || path.is_empty() || version != "HTTP/1.1" {
        return Err(format!("not a GET HTTP/1.1 request: {request_line:?}"));
    }

    match header_value(head, "Upgrade") {
        Some(value) if value.eq_ignore_ascii_case("websocket") => {}
        other => return Err(format!("bad Upgrade header: {other:?}")),
    }
    // Connection is a comma-separated token list, e.g. "keep-alive, Upgrade".
    match header_value(head, "Connection") {
        Some(value) if value.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")) => {}
        other => return Err(format!("bad Connection header: {other:?}")),
    }
    match header_value(head, "Sec-WebSocket-Version") {
        Some("13") => {}
        other => return Err(format!("bad Sec-WebSocket-Version header: {other:?}")),
    }
    let key = match header_value(head, "Sec-WebSocket-Key") {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => return Err("missing Sec-WebSocket-Key header".into()),
    };

    Ok((path.to_string(), key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    // The worked example from RFC 6455 section 1.3.
    #[test]
    fn accept_key_matches_the_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_distinct_16_byte_values() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
    }

    fn scripted_peer(
        mut stream: tokio::io::DuplexStream,
        respond: impl FnOnce(String) -> String + Send + 'static,
    ) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            let head = read_http_head(&mut stream).await.unwrap();
            let response = respond(head.clone());
            stream.write_all(response.as_bytes()).await.unwrap();
            head
        })
    }

    fn valid_response(request: String) -> String {
        let key = header_value(&request, "Sec-WebSocket-Key").unwrap();
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        )
    }

    #[tokio::test]
    async fn client_handshake_round_trip() {
        let (mut near, far) = duplex(4096);
        let peer = scripted_peer(far, valid_response);
        client(&mut near, "example.test", 9881, &ConnectOptions::default())
            .await
            .unwrap();

        let request = peer.await.unwrap();
        let first = request.lines().next().unwrap();
        assert_eq!(first, "GET / HTTP/1.1");
        assert_eq!(header_value(&request, "Host"), Some("example.test:9881"));
        assert_eq!(header_value(&request, "Upgrade"), Some("websocket"));
        assert_eq!(header_value(&request, "Connection"), Some("Upgrade"));
        assert_eq!(header_value(&request, "Sec-WebSocket-Version"), Some("13"));
        assert_eq!(header_value(&request, "Pragma"), Some("no-cache"));
        assert_eq!(
            header_value(&request, "User-Agent"),
            Some("WebSocket::Client")
        );
        assert_eq!(header_value(&request, "Origin"), None);
    }

    #[tokio::test]
    async fn host_header_omits_port_80() {
        let (mut near, far) = duplex(4096);
        let peer = scripted_peer(far, valid_response);
        client(&mut near, "example.test", 80, &ConnectOptions::default())
            .await
            .unwrap();
        let request = peer.await.unwrap();
        assert_eq!(header_value(&request, "Host"), Some("example.test"));
    }

    #[tokio::test]
    async fn origin_and_extra_headers_are_emitted() {
        let (mut near, far) = duplex(4096);
        let peer = scripted_peer(far, valid_response);
        let options = ConnectOptions {
            origin: Some("https://example.test".into()),
            extra_headers: vec![("X-Trace".into(), "abc".into())],
            ..ConnectOptions::default()
        };
        client(&mut near, "example.test", 9881, &options).await.unwrap();
        let request = peer.await.unwrap();
        assert_eq!(
            header_value(&request, "Origin"),
            Some("https://example.test")
        );
        assert_eq!(header_value(&request, "X-Trace"), Some("abc"));
    }

    #[tokio::test]
    async fn client_rejects_http_1_0() {
        let (mut near, far) = duplex(4096);
        let _peer = scripted_peer(far, |request| {
            valid_response(request).replacen("HTTP/1.1", "HTTP/1.0", 1)
        });
        let err = client(&mut near, "example.test", 9881, &ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Handshake(_)));
    }

    #[tokio::test]
    async fn client_rejects_a_bad_accept_hash() {
        let (mut near, far) = duplex(4096);
        let _peer = scripted_peer(far, |_| {
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Accept: bm90IHZhbGlk\r\n\r\n"
                .to_string()
        });
        let err = client(&mut near, "example.test", 9881, &ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Handshake(_)));
    }

    #[tokio::test]
    async fn client_rejects_a_missing_reason_phrase() {
        let (mut near, far) = duplex(4096);
        let _peer = scripted_peer(far, |request| {
            valid_response(request).replacen("HTTP/1.1 101 Switching Protocols", "HTTP/1.1 101", 1)
        });
        let err = client(&mut near, "example.test", 9881, &ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Handshake(_)));
    }

    #[tokio::test]
    async fn server_accepts_a_valid_upgrade() {
        let (mut near, mut far) = duplex(4096);
        let request = "GET /chat HTTP/1.1\r\nHost: example.test\r\n\
                       Upgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\
                       Sec-WebSocket-Version: 13\r\n\
                       Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        far.write_all(request.as_bytes()).await.unwrap();

        let upgraded = server(&mut near).await.unwrap();
        assert_eq!(upgraded.path, "/chat");

        let response = read_http_head(&mut far).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert_eq!(
            header_value(&response, "Sec-WebSocket-Accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[tokio::test]
    async fn server_rejects_a_request_without_a_key() {
        let (mut near, mut far) = duplex(4096);
        let request = "GET / HTTP/1.1\r\nHost: example.test\r\n\
                       Upgrade: websocket\r\nConnection: Upgrade\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        far.write_all(request.as_bytes()).await.unwrap();

        let err = server(&mut near).await.unwrap_err();
        assert!(matches!(err, WsError::Handshake(_)));
        let response = read_http_head(&mut far).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn server_rejects_a_wrong_version() {
        let (mut near, mut far) = duplex(4096);
        let request = "GET / HTTP/1.1\r\nHost: example.test\r\n\
                       Upgrade: websocket\r\nConnection: Upgrade\r\n\
                       Sec-WebSocket-Version: 8\r\n\
                       Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        far.write_all(request.as_bytes()).await.unwrap();
        assert!(server(&mut near).await.is_err());
    }
}
