use super::{AdapterFactory, AdapterSocket, AdapterSocketCore};
use crate::address::Endpoint;
use crate::error::{Result, TunnelError};
use crate::proxy_socket::MAX_HEADER_SIZE;
use crate::raw_socket::{RawSocket, RawSocketFactory};
use crate::session::{ConnectionRequest, Credentials};
use crate::tls::TlsSettings;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tracing::debug;

/// 经 HTTP(S) 上游代理的 CONNECT 隧道转发
#[derive(Debug, Clone)]
pub struct HttpAdapterFactory {
    id: String,
    server: Endpoint,
    credentials: Option<Credentials>,
    tls: Option<TlsSettings>,
    sockets: RawSocketFactory,
}

impl HttpAdapterFactory {
    pub fn new(id: impl Into<String>, server: Endpoint, sockets: RawSocketFactory) -> Self {
        Self {
            id: id.into(),
            server,
            credentials: None,
            tls: None,
            sockets,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// 与上游之间使用 TLS（HTTPS 代理）
    pub fn with_tls(mut self, tls: Option<TlsSettings>) -> Self {
        self.tls = tls;
        self
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn adapter_for(&self, _request: &ConnectionRequest) -> Result<Box<dyn AdapterSocket>> {
        Ok(Box::new(HttpAdapter {
            core: AdapterSocketCore::new(self.sockets.create(), self.id.clone()),
            server: self.server.clone(),
            credentials: self.credentials.clone(),
            tls: self.tls.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct HttpAdapter {
    core: AdapterSocketCore,
    server: Endpoint,
    credentials: Option<Credentials>,
    tls: Option<TlsSettings>,
}

impl HttpAdapter {
    fn connect_request(&self, request: &ConnectionRequest) -> Bytes {
        let authority = request.to_string();
        let mut header = format!(
            "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n",
            authority = authority
        );
        if let Some(credentials) = &self.credentials {
            let token = STANDARD.encode(format!(
                "{}:{}",
                credentials.username, credentials.password
            ));
            header.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
        }
        header.push_str("\r\n");
        Bytes::from(header)
    }

    async fn establish(&self, request: &ConnectionRequest) -> Result<()> {
        let raw = self.core.raw();
        raw.connect(self.server.host(), self.server.port(), self.tls.as_ref())
            .await?;
        raw.write(self.connect_request(request)).await?;

        let response = raw.read_until(b"\r\n\r\n", MAX_HEADER_SIZE).await?;
        let status = parse_status(&response)?;
        if !(200..300).contains(&status) {
            let kind = if status == 407 {
                io::ErrorKind::PermissionDenied
            } else {
                io::ErrorKind::ConnectionRefused
            };
            return Err(TunnelError::connection_failed(
                request.to_string(),
                io::Error::new(
                    kind,
                    format!("HTTP upstream {} answered {}", self.server, status),
                ),
            ));
        }

        debug!("HTTP upstream {} connected to {}", self.server, request);
        Ok(())
    }
}

/// 解析状态行中的状态码
fn parse_status(response: &[u8]) -> Result<u16> {
    let line_end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(response.len());
    let line = std::str::from_utf8(&response[..line_end])
        .map_err(|_| TunnelError::handshake("HTTP upstream status line is not UTF-8"))?;

    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next().and_then(|c| c.parse::<u16>().ok())) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => Ok(code),
        _ => Err(TunnelError::handshake(format!(
            "Malformed HTTP upstream status line: {:?}",
            line
        ))),
    }
}

#[async_trait]
impl AdapterSocket for HttpAdapter {
    fn raw(&self) -> &Arc<dyn RawSocket> {
        self.core.raw()
    }

    fn description(&self) -> &str {
        self.core.description()
    }

    async fn open(&mut self, request: &ConnectionRequest) -> Result<()> {
        self.core.opened(request);
        let result = self.establish(request).await;
        self.core.finish(result)
    }

    async fn disconnect(&self) {
        self.core.disconnect().await
    }

    fn force_disconnect(&self) {
        self.core.force_disconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn fake_proxy(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                lines.push(line.trim_end().to_string());
            }
            reader.get_mut().write_all(response).await.unwrap();
            lines
        });
        (port, handle)
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"HTTP/1.1 200 OK\r\n\r\n").unwrap(), 200);
        assert_eq!(
            parse_status(b"HTTP/1.0 407 Proxy Authentication Required\r\n\r\n").unwrap(),
            407
        );
        assert!(parse_status(b"SSH-2.0-OpenSSH\r\n\r\n").unwrap_err().is_handshake());
    }

    #[tokio::test]
    async fn test_connect_with_credentials() {
        let (port, handle) = fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let factory = HttpAdapterFactory::new(
            "http-upstream",
            Endpoint::new("127.0.0.1", port),
            RawSocketFactory::Tcp,
        )
        .with_credentials(Some(Credentials::new("user", "pass")));

        let request = ConnectionRequest::new("example.com", 443).unwrap();
        let mut adapter = factory.adapter_for(&request).unwrap();
        adapter.open(&request).await.unwrap();

        let lines = handle.await.unwrap();
        assert_eq!(lines[0], "CONNECT example.com:443 HTTP/1.1");
        assert!(lines.contains(&"Host: example.com:443".to_string()));
        assert!(lines.contains(&"Proxy-Authorization: Basic dXNlcjpwYXNz".to_string()));
    }

    #[tokio::test]
    async fn test_non_2xx_is_connect_error() {
        let (port, _handle) = fake_proxy(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let factory = HttpAdapterFactory::new(
            "http-upstream",
            Endpoint::new("127.0.0.1", port),
            RawSocketFactory::Tcp,
        );
        let request = ConnectionRequest::new("example.com", 443).unwrap();
        let mut adapter = factory.adapter_for(&request).unwrap();

        let err = adapter.open(&request).await.unwrap_err();
        assert!(err.is_connect());
    }
}
