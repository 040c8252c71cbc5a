use super::{ProxySocket, ProxySocketCore};
use crate::address::Port;
use crate::error::{Result, TunnelError};
use crate::raw_socket::RawSocket;
use crate::session::{ConnectionRequest, Credentials, ProxyProtocol};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::debug;

pub(crate) const SOCKS_VERSION: u8 = 0x05;
pub(crate) const AUTH_VERSION: u8 = 0x01;

pub(crate) const METHOD_NO_AUTH: u8 = 0x00;
pub(crate) const METHOD_USER_PASS: u8 = 0x02;
pub(crate) const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub(crate) const CMD_CONNECT: u8 = 0x01;

pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

pub(crate) const REPLY_SUCCEEDED: u8 = 0x00;
pub(crate) const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub(crate) const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub(crate) const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub(crate) const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub(crate) const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// 按地址类型读取地址；不支持的类型返回 `None`
pub(crate) async fn read_address(raw: &dyn RawSocket, atyp: u8) -> Result<Option<String>> {
    let host = match atyp {
        ATYP_IPV4 => {
            let addr = raw.read_exactly(4).await?;
            Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).to_string()
        }
        ATYP_DOMAIN => {
            let len = raw.read_exactly(1).await?[0] as usize;
            if len == 0 {
                return Err(TunnelError::handshake("Invalid SOCKS5 domain name length: 0"));
            }
            let domain = raw.read_exactly(len).await?;
            String::from_utf8(domain.to_vec())
                .map_err(|_| TunnelError::handshake("SOCKS5 domain name is not valid UTF-8"))?
        }
        ATYP_IPV6 => {
            let addr = raw.read_exactly(16).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr);
            Ipv6Addr::from(octets).to_string()
        }
        _ => return Ok(None),
    };
    Ok(Some(host))
}

/// 编码 ATYP + DST.ADDR + DST.PORT
pub(crate) fn encode_address(buf: &mut BytesMut, host: &str, port: Port) {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        Err(_) => {
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host.as_bytes());
        }
    }
    buf.put_slice(&port.to_be_bytes());
}

/// 上游连接结果对应的 SOCKS5 回复码
pub(crate) fn reply_code_for(error: &TunnelError) -> u8 {
    match error.io_kind() {
        Some(io::ErrorKind::ConnectionRefused) => REPLY_CONNECTION_REFUSED,
        Some(io::ErrorKind::TimedOut)
        | Some(io::ErrorKind::NotFound)
        | Some(io::ErrorKind::AddrNotAvailable) => REPLY_HOST_UNREACHABLE,
        _ => REPLY_GENERAL_FAILURE,
    }
}

fn reply(code: u8) -> Bytes {
    // BND.ADDR 固定为 0.0.0.0:0
    Bytes::copy_from_slice(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
}

/// SOCKS5 前端（RFC 1928 / RFC 1929）
#[derive(Debug)]
pub struct Socks5ProxySocket {
    core: ProxySocketCore,
    auth: Option<Credentials>,
    request: Option<ConnectionRequest>,
    replied: bool,
}

impl Socks5ProxySocket {
    pub fn new(raw: Arc<dyn RawSocket>, auth: Option<Credentials>) -> Self {
        Self {
            core: ProxySocketCore::new(raw, ProxyProtocol::Socks5),
            auth,
            request: None,
            replied: false,
        }
    }

    async fn negotiate(&self) -> Result<ConnectionRequest> {
        let raw = self.core.raw().as_ref();

        let greeting = raw.read_exactly(2).await?;
        if greeting[0] != SOCKS_VERSION {
            return Err(TunnelError::handshake(format!(
                "Unsupported SOCKS version: {}",
                greeting[0]
            )));
        }
        let nmethods = greeting[1] as usize;
        if nmethods == 0 {
            return Err(TunnelError::handshake("Invalid number of methods: 0"));
        }
        let methods = raw.read_exactly(nmethods).await?;

        let wanted = match self.auth {
            Some(_) => METHOD_USER_PASS,
            None => METHOD_NO_AUTH,
        };
        if !methods.contains(&wanted) {
            raw.write(Bytes::from_static(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]))
                .await?;
            return Err(TunnelError::handshake("No acceptable authentication method"));
        }
        raw.write(Bytes::copy_from_slice(&[SOCKS_VERSION, wanted]))
            .await?;

        if let Some(auth) = &self.auth {
            authenticate(raw, auth).await?;
        }

        let header = raw.read_exactly(4).await?;
        if header[0] != SOCKS_VERSION {
            return Err(TunnelError::handshake("Invalid SOCKS5 request version"));
        }
        let cmd = header[1];
        if cmd != CMD_CONNECT {
            raw.write(reply(REPLY_COMMAND_NOT_SUPPORTED)).await?;
            return Err(TunnelError::handshake(format!(
                "Unsupported SOCKS5 command: {:#04x}",
                cmd
            )));
        }

        let atyp = header[3];
        let Some(host) = read_address(raw, atyp).await? else {
            raw.write(reply(REPLY_ADDRESS_NOT_SUPPORTED)).await?;
            return Err(TunnelError::handshake(format!(
                "Unsupported address type: {:#04x}",
                atyp
            )));
        };
        let port = raw.read_exactly(2).await?;
        let port = Port::from_be_bytes([port[0], port[1]]);

        match ConnectionRequest::new(host, port) {
            Ok(request) => Ok(request.with_protocol(ProxyProtocol::Socks5)),
            Err(e) => {
                raw.write(reply(REPLY_GENERAL_FAILURE)).await?;
                Err(e)
            }
        }
    }
}

async fn authenticate(raw: &dyn RawSocket, auth: &Credentials) -> Result<()> {
    let head = raw.read_exactly(2).await?;
    let username = raw.read_exactly(head[1] as usize).await?;
    let plen = raw.read_exactly(1).await?[0] as usize;
    let password = raw.read_exactly(plen).await?;

    let accepted = head[0] == AUTH_VERSION
        && &username[..] == auth.username.as_bytes()
        && &password[..] == auth.password.as_bytes();
    let status = if accepted { 0x00 } else { 0x01 };
    raw.write(Bytes::copy_from_slice(&[AUTH_VERSION, status]))
        .await?;

    if accepted {
        debug!("SOCKS5 user '{}' authenticated", auth.username);
        Ok(())
    } else {
        Err(TunnelError::handshake(format!(
            "SOCKS5 authentication failed for user '{}'",
            String::from_utf8_lossy(&username)
        )))
    }
}

#[async_trait]
impl ProxySocket for Socks5ProxySocket {
    fn protocol(&self) -> ProxyProtocol {
        ProxyProtocol::Socks5
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
        let code = match outcome {
            Ok(()) => REPLY_SUCCEEDED,
            Err(e) => reply_code_for(e),
        };
        self.core.raw().write(reply(code)).await
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
    use crate::raw_socket::TcpSocket;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn proxy_pair(auth: Option<Credentials>) -> (Socks5ProxySocket, DuplexStream) {
        let (local, client) = duplex(1024);
        let raw: Arc<dyn RawSocket> = Arc::new(TcpSocket::from_transport(local, None));
        (Socks5ProxySocket::new(raw, auth), client)
    }

    #[tokio::test]
    async fn test_domain_request() {
        let (mut socket, mut client) = proxy_pair(None);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 11])
            .await
            .unwrap();
        client.write_all(b"example.com").await.unwrap();
        client.write_all(&[0x01, 0xBB]).await.unwrap();

        let request = socket.open().await.unwrap();
        assert_eq!(request.host(), "example.com");
        assert_eq!(request.port().value(), 443);
        assert_eq!(request.protocol(), Some(ProxyProtocol::Socks5));

        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        socket.respond(Ok(())).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCEEDED);
    }

    #[tokio::test]
    async fn test_ipv6_request() {
        let (mut socket, mut client) = proxy_pair(None);
        let mut msg = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04];
        msg.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        msg.extend_from_slice(&[0x00, 0x50]);
        client.write_all(&msg).await.unwrap();

        let request = socket.open().await.unwrap();
        assert_eq!(request.host(), "::1");
        assert!(request.is_ip());
    }

    #[tokio::test]
    async fn test_unsupported_command_replies_07() {
        let (mut socket, mut client) = proxy_pair(None);
        // BIND
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let err = socket.open().await.unwrap_err();
        assert!(err.is_handshake());

        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0x05, 0x00]);
        assert_eq!(buf[3], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_unsupported_address_type_replies_08() {
        let (mut socket, mut client) = proxy_pair(None);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x09])
            .await
            .unwrap();

        let err = socket.open().await.unwrap_err();
        assert!(err.is_handshake());

        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[3], REPLY_ADDRESS_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_bad_version() {
        let (mut socket, mut client) = proxy_pair(None);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(socket.open().await.unwrap_err().is_handshake());
        // 握手失败时不再回复
        socket.respond(Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_password_auth() {
        let (mut socket, mut client) = proxy_pair(Some(Credentials::new("alice", "s3cret")));
        let mut msg = vec![0x05, 0x02, 0x00, 0x02];
        msg.extend_from_slice(&[0x01, 5]);
        msg.extend_from_slice(b"alice");
        msg.push(6);
        msg.extend_from_slice(b"s3cret");
        msg.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90]);
        client.write_all(&msg).await.unwrap();

        let request = socket.open().await.unwrap();
        assert_eq!(request.to_string(), "10.0.0.1:8080");

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, METHOD_USER_PASS, AUTH_VERSION, 0x00]);
    }

    #[tokio::test]
    async fn test_auth_required_but_not_offered() {
        let (mut socket, mut client) = proxy_pair(Some(Credentials::new("alice", "pw")));
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        assert!(socket.open().await.unwrap_err().is_handshake());
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, METHOD_NO_ACCEPTABLE]);
    }

    #[test]
    fn test_reply_codes() {
        let refused = TunnelError::connection_failed(
            "a:1",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(reply_code_for(&refused), REPLY_CONNECTION_REFUSED);
        let timed_out = TunnelError::connection_failed(
            "a:1",
            io::Error::new(io::ErrorKind::TimedOut, "timeout"),
        );
        assert_eq!(reply_code_for(&timed_out), REPLY_HOST_UNREACHABLE);
        assert_eq!(
            reply_code_for(&TunnelError::routing("no route")),
            REPLY_GENERAL_FAILURE
        );
    }

    #[test]
    fn test_encode_address() {
        let mut buf = BytesMut::new();
        encode_address(&mut buf, "example.com", Port::new(80));
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1], 11);
        assert_eq!(&buf[buf.len() - 2..], &[0x00, 0x50]);

        let mut buf = BytesMut::new();
        encode_address(&mut buf, "1.2.3.4", Port::new(443));
        assert_eq!(&buf[..], &[ATYP_IPV4, 1, 2, 3, 4, 0x01, 0xBB]);
    }
}
