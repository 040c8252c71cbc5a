use super::{ProxySocket, ProxySocketCore};
use crate::error::{Result, TunnelError};
use crate::raw_socket::RawSocket;
use crate::session::{ConnectionRequest, ProxyProtocol};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use url::Url;

/// HTTP 请求头最大长度
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nConnection failed";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nBad request";

/// 解析后的 HTTP 请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl HttpHeader {
    /// 解析以空行结尾的请求头块
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| TunnelError::handshake("HTTP header is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TunnelError::handshake(format!(
                "Malformed HTTP request line: {:?}",
                request_line
            )));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(TunnelError::handshake(format!(
                "Unsupported HTTP version: {}",
                version
            )));
        }

        let mut headers = Vec::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                return Err(TunnelError::handshake(format!(
                    "Malformed HTTP header line: {:?}",
                    line
                )));
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// 按名称（不区分大小写）查找头部
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// 请求目标的主机和端口
    pub fn destination(&self) -> Result<(String, u16)> {
        if self.is_connect() {
            return split_authority(&self.target, 443);
        }
        if let Some(url) = self.absolute_url() {
            let host = url
                .host_str()
                .ok_or_else(|| TunnelError::handshake("HTTP request URL has no host"))?;
            let port = url.port_or_known_default().unwrap_or(80);
            return Ok((strip_brackets(host).to_string(), port));
        }
        let host = self
            .header("Host")
            .ok_or_else(|| TunnelError::handshake("HTTP request has no Host header"))?;
        split_authority(host, 80)
    }

    fn absolute_url(&self) -> Option<Url> {
        if self.target.starts_with('/') {
            return None;
        }
        Url::parse(&self.target).ok().filter(|u| u.has_host())
    }

    /// 改写为发往源站的请求头：origin-form 请求行，去掉 `Proxy-*` 头部
    pub fn to_origin_form(&self) -> Bytes {
        let (path, authority) = match self.absolute_url() {
            Some(url) => {
                let mut path = url.path().to_string();
                if let Some(query) = url.query() {
                    path.push('?');
                    path.push_str(query);
                }
                let authority = url.host_str().map(|host| match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                });
                (path, authority)
            }
            None => (self.target.clone(), None),
        };

        let mut buf = BytesMut::with_capacity(MAX_HEADER_SIZE.min(1024));
        buf.put_slice(format!("{} {} {}\r\n", self.method, path, self.version).as_bytes());
        if self.header("Host").is_none() {
            if let Some(authority) = authority {
                buf.put_slice(format!("Host: {}\r\n", authority).as_bytes());
            }
        }
        for (name, value) in &self.headers {
            if name.to_ascii_lowercase().starts_with("proxy-") {
                continue;
            }
            buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// 拆分 `host[:port]` / `[v6][:port]`
pub(crate) fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let invalid = || TunnelError::handshake(format!("Invalid authority: {:?}", authority));

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if after.is_empty() => default_port,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host.to_string(), port.parse().map_err(|_| invalid())?))
        }
        _ => Ok((authority.to_string(), default_port)),
    }
}

/// HTTP 代理前端：CONNECT 隧道和普通 HTTP 转发
#[derive(Debug)]
pub struct HttpProxySocket {
    core: ProxySocketCore,
    request: Option<ConnectionRequest>,
    is_connect: bool,
    initial_payload: Option<Bytes>,
    replied: bool,
}

impl HttpProxySocket {
    pub fn new(raw: Arc<dyn RawSocket>) -> Self {
        Self {
            core: ProxySocketCore::new(raw, ProxyProtocol::Http),
            request: None,
            is_connect: false,
            initial_payload: None,
            replied: false,
        }
    }

    async fn negotiate(&mut self) -> Result<ConnectionRequest> {
        let raw = self.core.raw().clone();

        let block = match raw.read_until(HEADER_END, MAX_HEADER_SIZE).await {
            Ok(block) => block,
            Err(e) if e.io_kind() == Some(io::ErrorKind::InvalidData) => {
                raw.write(Bytes::from_static(BAD_REQUEST)).await?;
                return Err(TunnelError::handshake(format!(
                    "HTTP header exceeds {} bytes",
                    MAX_HEADER_SIZE
                )));
            }
            Err(e) => return Err(e),
        };

        let parsed = HttpHeader::parse(&block).and_then(|header| {
            let (host, port) = header.destination()?;
            let request = ConnectionRequest::new(host, port)?;
            Ok((header, request))
        });
        let (header, request) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                raw.write(Bytes::from_static(BAD_REQUEST)).await?;
                return Err(e);
            }
        };

        self.is_connect = header.is_connect();
        if !self.is_connect {
            self.initial_payload = Some(header.to_origin_form());
        }
        Ok(request.with_protocol(ProxyProtocol::Http))
    }
}

#[async_trait]
impl ProxySocket for HttpProxySocket {
    fn protocol(&self) -> ProxyProtocol {
        ProxyProtocol::Http
    }

    fn raw(&self) -> &Arc<dyn RawSocket> {
        self.core.raw()
    }

    fn description(&self) -> &str {
        self.core.description()
    }

    fn request(&self) -> Option<&ConnectionRequest> {
        self.request.as_ref()
    }

    async fn open(&mut self) -> Result<ConnectionRequest> {
        match self.negotiate().await {
            Ok(request) => {
                self.core.handshake_complete(&request);
                self.request = Some(request.clone());
                Ok(request)
            }
            Err(e) => Err(self.core.failed(e)),
        }
    }

    async fn respond(&mut self, outcome: std::result::Result<(), &TunnelError>) -> Result<()> {
        if self.request.is_none() || self.replied {
            return Ok(());
        }
        self.replied = true;
        match outcome {
            Ok(()) if self.is_connect => {
                self.core
                    .raw()
                    .write(Bytes::from_static(CONNECT_ESTABLISHED))
                    .await
            }
            Ok(()) => Ok(()),
            Err(_) => self.core.raw().write(Bytes::from_static(BAD_GATEWAY)).await,
        }
    }

    fn take_initial_payload(&mut self) -> Option<Bytes> {
        self.initial_payload.take()
    }

    async fn disconnect(&self) {
        self.core.disconnect().await
    }

    fn force_disconnect(&self) {
        self.core.force_disconnect()
    }
}
