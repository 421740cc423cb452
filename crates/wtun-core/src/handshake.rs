//! WebSocket opening handshake over a raw byte stream.
//!
//! The client sends a fixed `GET /tunnel` upgrade request carrying a bearer
//! token; the server validates it and answers `101 Switching Protocols` or
//! an HTTP error (`400`, `401`, `431`). Header blocks are read one byte at a
//! time so nothing past the blank line is consumed from the stream.

use crate::error::{TunnelError, TunnelResult};
use crate::token;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Capacity of the buffer a header block must fit into.
pub const HEADER_BUFFER_SIZE: usize = 4096;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const REQUEST_LINE: &str = "GET /tunnel HTTP/1.1";
const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101 Switching Protocols";
const CR: u8 = b'\r';
const LF: u8 = b'\n';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndOfHeaders {
    Start,
    Cr,
    CrLf,
    CrLfCr,
}

/// Read bytes into `buf` until the blank line ending a header block.
///
/// Returns the index of the final `LF`. Fails with
/// [`TunnelError::HeadersTooLarge`] when `buf` fills up first and with
/// [`TunnelError::ConnectionClosed`] when the stream ends first.
pub async fn read_header_block<R>(reader: &mut R, buf: &mut [u8]) -> TunnelResult<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut state = EndOfHeaders::Start;
    for i in 0..buf.len() {
        let n = reader.read(&mut buf[i..i + 1]).await?;
        if n == 0 {
            return Err(TunnelError::ConnectionClosed);
        }
        let b = buf[i];
        state = match (state, b) {
            (EndOfHeaders::CrLf, LF) | (EndOfHeaders::CrLfCr, LF) => return Ok(i),
            (EndOfHeaders::Start, CR) | (EndOfHeaders::Cr, CR) => EndOfHeaders::Cr,
            (EndOfHeaders::Start, LF) | (EndOfHeaders::Cr, LF) => EndOfHeaders::CrLf,
            (EndOfHeaders::CrLf, CR) | (EndOfHeaders::CrLfCr, CR) => EndOfHeaders::CrLfCr,
            _ => EndOfHeaders::Start,
        };
    }
    Err(TunnelError::HeadersTooLarge)
}

/// A parsed header block: first line plus `(name, value)` pairs in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    pub first_line: String,
    pub headers: Vec<(String, String)>,
}

impl HeaderBlock {
    /// Parse a raw header block (as returned by [`read_header_block`]).
    pub fn parse(raw: &[u8]) -> TunnelResult<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| TunnelError::MalformedHeader("header block is not valid text".into()))?;
        let mut lines = text.split(['\r', '\n']).filter(|l| !l.is_empty());

        let first_line = lines
            .next()
            .ok_or_else(|| TunnelError::MalformedHeader("empty header block".into()))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TunnelError::MalformedHeader(format!("missing ':' in {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            first_line,
            headers,
        })
    }

    /// Value of the last header named `name` (ASCII case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of the headers named `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Require `name` to be present with every occurrence equal to `expected`.
    fn expect_all(&self, name: &str, expected: &str) -> Result<(), String> {
        let mut seen = false;
        for value in self.get_all(name) {
            if value != expected {
                return Err(format!("unexpected {name}: {value}"));
            }
            seen = true;
        }
        if seen {
            Ok(())
        } else {
            Err(format!("missing {name}"))
        }
    }

    /// Status code from an HTTP response status line.
    pub fn status_code(&self) -> Option<u16> {
        let mut parts = self.first_line.split_whitespace();
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        parts.next()?.parse().ok()
    }
}

/// `base64(SHA-1(key + GUID))` as required for `Sec-WebSocket-Accept`.
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WEBSOCKET_GUID.len());
    input.push_str(client_key);
    input.push_str(WEBSOCKET_GUID);
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    BASE64.encode(digest.as_ref())
}

fn generate_client_key() -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill(&mut key[..]);
    BASE64.encode(key)
}

/// Build the upgrade request sent by the client.
pub fn build_request(host: &str, client_key: &str, token: &str) -> String {
    format!(
        "{REQUEST_LINE}\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {client_key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Authorization: Bearer {token}\r\n\
         \r\n"
    )
}

/// Perform the client side of the handshake.
///
/// Any deviation in the server's answer (status line, `Connection`,
/// `Upgrade`, `Sec-WebSocket-Accept`) fails with
/// [`TunnelError::HandshakeRejected`]. A repeated header must match on
/// every occurrence.
pub async fn client_handshake<S>(stream: &mut S, host: &str, token: &str) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let client_key = generate_client_key();
    let request = build_request(host, &client_key, token);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; HEADER_BUFFER_SIZE];
    let end = read_header_block(stream, &mut buf).await?;
    let response = HeaderBlock::parse(&buf[..=end])?;

    if response.first_line != SWITCHING_PROTOCOLS {
        return Err(TunnelError::HandshakeRejected(format!(
            "unexpected status line: {}",
            response.first_line
        )));
    }

    let expected = accept_key(&client_key);
    response
        .expect_all("Connection", "Upgrade")
        .and_then(|_| response.expect_all("Upgrade", "websocket"))
        .and_then(|_| response.expect_all("Sec-WebSocket-Accept", &expected))
        .map_err(TunnelError::HandshakeRejected)?;

    debug!("websocket handshake accepted by server");
    Ok(())
}

/// HTTP error statuses the server answers a failed handshake with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStatus {
    BadRequest,
    Unauthorized,
    HeaderFieldsTooLarge,
}

impl RejectStatus {
    /// Full HTTP status line for the rejection response.
    pub fn status_line(self) -> &'static str {
        match self {
            RejectStatus::BadRequest => "HTTP/1.1 400 Bad Request",
            RejectStatus::Unauthorized => "HTTP/1.1 401 Unauthorized",
            RejectStatus::HeaderFieldsTooLarge => "HTTP/1.1 431 Request Header Fields Too Large",
        }
    }
}

/// Check an upgrade request and return the `Sec-WebSocket-Accept` value.
pub fn validate_request(
    request: &HeaderBlock,
    token_hash: &str,
) -> Result<String, (RejectStatus, TunnelError)> {
    let bad = |msg: String| (RejectStatus::BadRequest, TunnelError::MalformedHeader(msg));

    if request.first_line != REQUEST_LINE {
        return Err(bad(format!("unexpected request line: {}", request.first_line)));
    }

    let unauthorized = |msg: &str| (RejectStatus::Unauthorized, TunnelError::AuthFailed(msg.into()));
    let mut authorized = false;
    for authorization in request.get_all("Authorization") {
        let bearer = authorization
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Authorization is not a bearer token"))?;
        token::verify_bearer(bearer, token_hash).map_err(|e| (RejectStatus::Unauthorized, e))?;
        authorized = true;
    }
    if !authorized {
        return Err(unauthorized("missing Authorization"));
    }

    request.expect_all("Connection", "Upgrade").map_err(bad)?;
    request.expect_all("Sec-WebSocket-Version", "13").map_err(bad)?;
    let key = request
        .get("Sec-WebSocket-Key")
        .filter(|k| !k.is_empty())
        .ok_or_else(|| bad("missing Sec-WebSocket-Key".into()))?;

    Ok(accept_key(key))
}

/// Perform the server side of the handshake against the expected token hash.
///
/// On failure an HTTP error response has already been written (except
/// when the peer closed the stream) before the error is returned.
pub async fn server_handshake<S>(stream: &mut S, token_hash: &str) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; HEADER_BUFFER_SIZE];
    let end = match read_header_block(stream, &mut buf).await {
        Ok(end) => end,
        Err(TunnelError::HeadersTooLarge) => {
            send_rejection(stream, RejectStatus::HeaderFieldsTooLarge).await;
            return Err(TunnelError::HeadersTooLarge);
        }
        Err(e) => return Err(e),
    };

    let accept = match HeaderBlock::parse(&buf[..=end]) {
        Ok(request) => validate_request(&request, token_hash),
        Err(e) => Err((RejectStatus::BadRequest, e)),
    };
    let accept = match accept {
        Ok(accept) => accept,
        Err((status, e)) => {
            warn!(status = status.status_line(), error = %e, "rejecting tunnel handshake");
            send_rejection(stream, status).await;
            return Err(e);
        }
    };

    let response = format!(
        "{SWITCHING_PROTOCOLS}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    debug!("websocket handshake completed");
    Ok(())
}

async fn send_rejection<S>(stream: &mut S, status: RejectStatus)
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let response = format!("{}\r\n\r\n", status.status_line());
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "failed to send handshake rejection");
        return;
    }
    let _ = stream.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{generate_key, hash_key};

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn scanner_stops_at_blank_line() {
        let data = b"HTTP/1.1 200 OK\r\nA: b\r\n\r\n\x82\x00";
        let mut reader = &data[..];
        let mut buf = [0u8; 64];
        let end = read_header_block(&mut reader, &mut buf).await.unwrap();
        assert_eq!(end, data.len() - 3);
        assert_eq!(reader, b"\x82\x00");
    }

    #[tokio::test]
    async fn scanner_accepts_bare_lf() {
        let data = b"GET / HTTP/1.1\nHost: x\n\n";
        let mut buf = [0u8; 64];
        let end = read_header_block(&mut &data[..], &mut buf).await.unwrap();
        assert_eq!(end, data.len() - 1);
    }

    #[tokio::test]
    async fn scanner_limits() {
        let mut buf = [0u8; 8];
        let err = read_header_block(&mut &b"0123456789"[..], &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::HeadersTooLarge));

        let mut buf = [0u8; 64];
        let err = read_header_block(&mut &b"GET / HTTP/1.1\r\n"[..], &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ConnectionClosed));
    }

    #[test]
    fn parse_header_block() {
        let block = HeaderBlock::parse(b"HTTP/1.1 200 Connection established\r\nVia: x:1\r\n\r\n").unwrap();
        assert_eq!(block.status_code(), Some(200));
        assert_eq!(block.get("via"), Some("x:1"));
        assert!(HeaderBlock::parse(b"GET / HTTP/1.1\r\nbroken\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn handshake_success() {
        let key = generate_key(40).unwrap();
        let hash = hash_key(&key).unwrap();
        let (mut client, mut server) = tokio::io::duplex(8192);

        let (c, s) = tokio::join!(
            client_handshake(&mut client, "localhost", &key),
            server_handshake(&mut server, &hash)
        );
        assert!(c.is_ok(), "client: {c:?}");
        assert!(s.is_ok(), "server: {s:?}");
    }

    #[tokio::test]
    async fn handshake_wrong_token_hash() {
        let key = generate_key(40).unwrap();
        let (mut client, mut server) = tokio::io::duplex(8192);

        let (c, s) = tokio::join!(
            client_handshake(&mut client, "localhost", &key),
            server_handshake(&mut server, "wrongToken")
        );
        assert!(matches!(s, Err(TunnelError::AuthFailed(_))));
        assert!(matches!(c, Err(TunnelError::HandshakeRejected(_))));
    }

    #[tokio::test]
    async fn oversized_request_gets_431() {
        let (mut client, mut server) = tokio::io::duplex(16384);
        client.write_all(&[b'a'; HEADER_BUFFER_SIZE + 100]).await.unwrap();

        let err = server_handshake(&mut server, "hash").await.unwrap_err();
        assert!(matches!(err, TunnelError::HeadersTooLarge));

        let mut buf = [0u8; 128];
        let end = read_header_block(&mut client, &mut buf).await.unwrap();
        let response = HeaderBlock::parse(&buf[..=end]).unwrap();
        assert_eq!(response.status_code(), Some(431));
    }

    #[tokio::test]
    async fn missing_version_gets_400() {
        let key = generate_key(8).unwrap();
        let hash = hash_key(&key).unwrap();
        let (mut client, mut server) = tokio::io::duplex(8192);
        let request = format!(
            "GET /tunnel HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: abc\r\nAuthorization: Bearer {key}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let err = server_handshake(&mut server, &hash).await.unwrap_err();
        assert!(matches!(err, TunnelError::MalformedHeader(_)));

        let mut buf = [0u8; 128];
        let end = read_header_block(&mut client, &mut buf).await.unwrap();
        assert_eq!(
            HeaderBlock::parse(&buf[..=end]).unwrap().status_code(),
            Some(400)
        );
    }

    #[test]
    fn missing_authorization_is_unauthorized() {
        let request = HeaderBlock::parse(
            b"GET /tunnel HTTP/1.1\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: k\r\n\r\n",
        )
        .unwrap();
        let (status, _) = validate_request(&request, "hash").unwrap_err();
        assert_eq!(status, RejectStatus::Unauthorized);
    }

    fn upgrade_request(extra: &str, key: &str) -> HeaderBlock {
        HeaderBlock::parse(
            format!(
                "GET /tunnel HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\n\
                 Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: k\r\n\
                 Authorization: Bearer {key}\r\n{extra}\r\n"
            )
            .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn every_repeated_header_must_be_valid() {
        let key = "00";
        let hash = hash_key(key).unwrap();
        assert!(validate_request(&upgrade_request("", key), &hash).is_ok());

        // A valid last value does not cover an invalid earlier one.
        let request = HeaderBlock::parse(
            format!(
                "GET /tunnel HTTP/1.1\r\nConnection: close\r\nConnection: Upgrade\r\n\
                 Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: k\r\n\
                 Authorization: Bearer {key}\r\n\r\n"
            )
            .as_bytes(),
        )
        .unwrap();
        let (status, _) = validate_request(&request, &hash).unwrap_err();
        assert_eq!(status, RejectStatus::BadRequest);

        let request = upgrade_request("Sec-WebSocket-Version: 8\r\n", key);
        let (status, _) = validate_request(&request, &hash).unwrap_err();
        assert_eq!(status, RejectStatus::BadRequest);

        let request = upgrade_request("Authorization: Bearer 01\r\n", key);
        let (status, _) = validate_request(&request, &hash).unwrap_err();
        assert_eq!(status, RejectStatus::Unauthorized);
    }

    #[tokio::test]
    async fn client_rejects_conflicting_response_headers() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        let fake_server = tokio::spawn(async move {
            let mut buf = [0u8; HEADER_BUFFER_SIZE];
            let end = read_header_block(&mut server, &mut buf).await.unwrap();
            let request = HeaderBlock::parse(&buf[..=end]).unwrap();
            let accept = accept_key(request.get("Sec-WebSocket-Key").unwrap());
            let response = format!(
                "{SWITCHING_PROTOCOLS}\r\nUpgrade: h2c\r\nUpgrade: websocket\r\n\
                 Connection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
            );
            server.write_all(response.as_bytes()).await.unwrap();
        });

        let err = client_handshake(&mut client, "localhost", "00")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::HandshakeRejected(ref m) if m.contains("Upgrade")));
        fake_server.await.unwrap();
    }

    #[test]
    fn wrong_request_line_is_bad_request() {
        let key = "00";
        let hash = hash_key(key).unwrap();
        let request = HeaderBlock::parse(
            format!("GET /other HTTP/1.1\r\nAuthorization: Bearer {key}\r\n\r\n").as_bytes(),
        )
        .unwrap();
        let (status, _) = validate_request(&request, &hash).unwrap_err();
        assert_eq!(status, RejectStatus::BadRequest);
    }
}
