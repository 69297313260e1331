//! HTTP `CONNECT` tunnelling for clients behind a forward proxy.

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;
use url::Url;

use crate::utils::error::{Result, WebSocketError};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Opens a TCP connection to `proxy_url` and asks it to tunnel to the host of
/// `target`. On success the returned stream speaks directly to the target.
pub async fn connect_via_proxy(proxy_url: &str, target: &Url) -> Result<TcpStream> {
    let proxy = Url::parse(proxy_url)?;
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| WebSocketError::InvalidUrl(format!("proxy has no host: {proxy_url}")))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    let target_host = target
        .host_str()
        .ok_or_else(|| WebSocketError::InvalidUrl(format!("target has no host: {target}")))?;
    let target_port = target
        .port_or_known_default()
        .ok_or_else(|| WebSocketError::InvalidUrl(format!("target has no port: {target}")))?;
    let authority = format!("{target_host}:{target_port}");

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| WebSocketError::ConnectionError(format!("proxy {proxy_host}:{proxy_port}: {e}")))?;

    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(WebSocketError::ConnectionError(format!(
            "proxy refused CONNECT: {status_line}"
        )));
    }

    debug!(proxy = %proxy_host, target = %authority, "proxy tunnel established");
    Ok(stream)
}

/// Reads up to and including the blank line ending the response head. Reads one
/// byte at a time so nothing belonging to the tunnelled stream is consumed.
async fn read_response_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(WebSocketError::ConnectionError(
                "proxy response head too large".into(),
            ));
        }
        let byte = stream.read_u8().await.map_err(|e| {
            WebSocketError::ConnectionError(format!("proxy closed during CONNECT: {e}"))
        })?;
        head.push(byte);
    }
    String::from_utf8(head)
        .map_err(|_| WebSocketError::ConnectionError("proxy response is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_proxy(reply: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_response_head(&mut socket).await.unwrap();
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.write_all(b"tunnel").await.unwrap();
            head
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn tunnels_after_200() {
        let (proxy, server) = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let target = Url::parse("ws://example.com/ws").unwrap();

        let mut stream = connect_via_proxy(&proxy, &target).await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:80 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn refused_tunnel_is_an_error() {
        let (proxy, _server) = fake_proxy("HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let target = Url::parse("wss://example.com/ws").unwrap();
        let err = connect_via_proxy(&proxy, &target).await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
