//! Proxy traversal for control and data connections.
//!
//! SOCKS5 (with optional username/password) covers both outgoing
//! connections and active-mode listening via the BIND command; HTTP
//! CONNECT covers outgoing connections only.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::ProxyDescriptor;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_socks::tcp::{Socks5Listener, Socks5Stream};

/// Open a TCP connection to `host:port`, optionally through a proxy.
pub async fn connect_tcp(
    proxy: &ProxyDescriptor,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> FtpResult<TcpStream> {
    let fut = async {
        match proxy {
            ProxyDescriptor::Direct => TcpStream::connect((host, port))
                .await
                .map_err(|e| FtpError::connection_failed(format!("connect {}:{}: {}", host, port, e))),
            ProxyDescriptor::Socks5 {
                host: phost,
                port: pport,
                username,
                password,
            } => {
                let proxy_addr = format!("{}:{}", phost, pport);
                let stream = match (username, password) {
                    (Some(user), Some(pass)) => Socks5Stream::connect_with_password(
                        proxy_addr.as_str(),
                        (host, port),
                        user.as_str(),
                        pass.as_str(),
                    )
                    .await,
                    _ => Socks5Stream::connect(proxy_addr.as_str(), (host, port)).await,
                }
                .map_err(|e| FtpError::connection_failed(format!("SOCKS5 {}: {}", proxy_addr, e)))?;
                Ok(stream.into_inner())
            }
            ProxyDescriptor::HttpConnect { host: phost, port: pport } => {
                http_connect(phost, *pport, host, port).await
            }
        }
    };
    match timeout(connect_timeout, fut).await {
        Ok(r) => {
            let tcp = r?;
            tcp.set_nodelay(true).ok();
            Ok(tcp)
        }
        Err(_) => Err(FtpError::connection_failed(format!(
            "connect to {}:{} timed out",
            host, port
        ))),
    }
}

/// HTTP CONNECT tunnel: one request, 200 status, raw stream afterwards.
async fn http_connect(phost: &str, pport: u16, host: &str, port: u16) -> FtpResult<TcpStream> {
    let mut tcp = TcpStream::connect((phost, pport))
        .await
        .map_err(|e| FtpError::connection_failed(format!("proxy {}:{}: {}", phost, pport, e)))?;
    let req = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = host,
        port = port
    );
    tcp.write_all(req.as_bytes()).await?;

    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    // read the response headers byte-wise; they end with CRLFCRLF
    while !buf.ends_with(b"\r\n\r\n") {
        let n = tcp.read(&mut byte).await?;
        if n == 0 {
            return Err(FtpError::connection_failed("proxy closed during CONNECT"));
        }
        buf.push(byte[0]);
        if buf.len() > 8192 {
            return Err(FtpError::protocol_error("oversized CONNECT response"));
        }
    }
    let head = String::from_utf8_lossy(&buf);
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.contains(" 200") {
        return Err(FtpError::connection_failed(format!(
            "CONNECT rejected: {}",
            status_line
        )));
    }
    Ok(tcp)
}

// ─── Active-mode listening ───────────────────────────────────────────

/// A listener for an active-mode data connection: local socket, or a
/// BIND opened on a SOCKS5 proxy.
pub enum DataListener {
    Local(TcpListener),
    Socks5(Socks5Listener<TcpStream>),
}

/// Bind a listener for an active-mode transfer and return the address
/// the server must be told via PORT/EPRT.
///
/// `server_host`/`server_port` identify the peer expected to connect
/// (required by the SOCKS5 BIND handshake).
pub async fn open_listener(
    proxy: &ProxyDescriptor,
    bind_addr: Option<&str>,
    server_host: &str,
    server_port: u16,
) -> FtpResult<(DataListener, SocketAddr)> {
    match proxy {
        ProxyDescriptor::Direct => {
            let bind = bind_addr.unwrap_or("0.0.0.0");
            let listener = TcpListener::bind(format!("{}:0", bind))
                .await
                .map_err(|e| FtpError::data_channel(format!("listen bind: {}", e)))?;
            let local = listener
                .local_addr()
                .map_err(|e| FtpError::data_channel(format!("listen local_addr: {}", e)))?;
            Ok((DataListener::Local(listener), local))
        }
        ProxyDescriptor::Socks5 {
            host: phost,
            port: pport,
            username,
            password,
        } => {
            let proxy_addr = format!("{}:{}", phost, pport);
            let listener = match (username, password) {
                (Some(user), Some(pass)) => Socks5Listener::bind_with_password(
                    proxy_addr.as_str(),
                    (server_host, server_port),
                    user.as_str(),
                    pass.as_str(),
                )
                .await,
                _ => Socks5Listener::bind(proxy_addr.as_str(), (server_host, server_port)).await,
            }
            .map_err(|e| FtpError::data_channel(format!("SOCKS5 BIND {}: {}", proxy_addr, e)))?;
            let advertised = match listener.bind_addr() {
                tokio_socks::TargetAddr::Ip(addr) => addr,
                tokio_socks::TargetAddr::Domain(_, _) => {
                    return Err(FtpError::data_channel(
                        "SOCKS5 proxy returned a domain for BIND",
                    ))
                }
            };
            Ok((DataListener::Socks5(listener), advertised))
        }
        ProxyDescriptor::HttpConnect { .. } => Err(FtpError::invalid_config(
            "active mode is not possible through an HTTP proxy",
        )),
    }
}

impl DataListener {
    /// Wait for the server's incoming connection.
    pub async fn accept(self, accept_timeout: Duration) -> FtpResult<TcpStream> {
        match self {
            DataListener::Local(listener) => {
                let (tcp, _) = timeout(accept_timeout, listener.accept())
                    .await
                    .map_err(|_| FtpError::data_channel("data accept timed out"))?
                    .map_err(|e| FtpError::data_channel(format!("data accept: {}", e)))?;
                tcp.set_nodelay(true).ok();
                Ok(tcp)
            }
            DataListener::Socks5(listener) => {
                let stream = timeout(accept_timeout, listener.accept())
                    .await
                    .map_err(|_| FtpError::data_channel("proxy data accept timed out"))?
                    .map_err(|e| FtpError::data_channel(format!("proxy data accept: {}", e)))?;
                Ok(stream.into_inner())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_connect_refused() {
        // port 1 on loopback is virtually never listening
        let err = connect_tcp(
            &ProxyDescriptor::Direct,
            "127.0.0.1",
            1,
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::ConnectionFailed);
    }

    #[tokio::test]
    async fn direct_listener_binds_ephemeral_port() {
        let (listener, addr) = open_listener(&ProxyDescriptor::Direct, None, "example.com", 21)
            .await
            .unwrap();
        assert!(addr.port() != 0);
        drop(listener);
    }

    #[tokio::test]
    async fn http_proxy_cannot_listen() {
        let proxy = ProxyDescriptor::HttpConnect {
            host: "proxy".into(),
            port: 3128,
        };
        assert!(open_listener(&proxy, None, "example.com", 21).await.is_err());
    }

    #[tokio::test]
    async fn local_accept_roundtrip() {
        let (listener, addr) = open_listener(&ProxyDescriptor::Direct, Some("127.0.0.1"), "x", 21)
            .await
            .unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let accepted = listener.accept(Duration::from_secs(5)).await.unwrap();
        assert!(accepted.peer_addr().is_ok());
        client.await.unwrap();
    }
}
