//! HTTP `CONNECT` through an outgoing proxy to reach the tunnel server.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};
use wtun_core::handshake::{read_header_block, HeaderBlock, HEADER_BUFFER_SIZE};
use wtun_core::{TunnelError, TunnelResult};

/// Outgoing proxy endpoint and optional Basic credentials.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub endpoint: String,
    pub credentials: Option<(String, String)>,
}

/// Build the `CONNECT` request for `target`.
pub fn build_connect_request(target: &str, credentials: Option<(&str, &str)>) -> String {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((user, pass)) = credentials {
        let token = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Ask the proxy on `stream` to open a tunnel to `target`.
///
/// Anything but a `200` status fails with [`TunnelError::HandshakeRejected`].
pub async fn establish_connect<S>(
    stream: &mut S,
    target: &str,
    credentials: Option<(&str, &str)>,
) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = build_connect_request(target, credentials);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; HEADER_BUFFER_SIZE];
    let end = read_header_block(stream, &mut buf).await?;
    let response = HeaderBlock::parse(&buf[..=end])?;
    debug!(status = %response.first_line, "proxy answered CONNECT");

    match response.status_code() {
        Some(200) => Ok(()),
        _ => Err(TunnelError::HandshakeRejected(format!(
            "proxy refused CONNECT: {}",
            response.first_line
        ))),
    }
}

/// Dial `target` through the proxy.
pub async fn connect_via_proxy(proxy: &ProxySettings, target: &str) -> TunnelResult<TcpStream> {
    let mut stream = TcpStream::connect(&proxy.endpoint).await?;
    let credentials = proxy
        .credentials
        .as_ref()
        .map(|(user, pass)| (user.as_str(), pass.as_str()));
    establish_connect(&mut stream, target, credentials).await?;
    info!(proxy = %proxy.endpoint, target, "connected through outgoing proxy");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn request_with_basic_auth() {
        let request = build_connect_request("tunnel:443", Some(("user", "pass")));
        assert!(request.starts_with("CONNECT tunnel:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: tunnel:443\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_without_auth() {
        let request = build_connect_request("tunnel:443", None);
        assert!(!request.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn accepts_200_and_leaves_stream_positioned() {
        let (mut client, mut proxy) = tokio::io::duplex(4096);
        let proxy_task = tokio::spawn(async move {
            let mut buf = [0u8; HEADER_BUFFER_SIZE];
            let end = read_header_block(&mut proxy, &mut buf).await.unwrap();
            let request = HeaderBlock::parse(&buf[..=end]).unwrap();
            assert_eq!(request.first_line, "CONNECT tunnel:443 HTTP/1.1");
            proxy
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nTLS")
                .await
                .unwrap();
        });

        establish_connect(&mut client, "tunnel:443", None)
            .await
            .unwrap();
        let mut rest = [0u8; 3];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"TLS");
        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_200() {
        let (mut client, mut proxy) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; HEADER_BUFFER_SIZE];
            let _ = read_header_block(&mut proxy, &mut buf).await;
            let _ = proxy
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let err = establish_connect(&mut client, "tunnel:443", Some(("u", "p")))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::HandshakeRejected(_)));
    }
}
