use super::{AdapterFactory, AdapterSocket, AdapterSocketCore};
use crate::address::Endpoint;
use crate::error::{Result, TunnelError};
use crate::proxy_socket::socks5::{
    encode_address, read_address, AUTH_VERSION, CMD_CONNECT, METHOD_NO_ACCEPTABLE,
    METHOD_NO_AUTH, METHOD_USER_PASS, REPLY_SUCCEEDED, SOCKS_VERSION,
};
use crate::raw_socket::{RawSocket, RawSocketFactory};
use crate::session::{ConnectionRequest, Credentials};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tracing::debug;

/// 经 SOCKS5 上游代理转发
#[derive(Debug, Clone)]
pub struct Socks5AdapterFactory {
    id: String,
    server: Endpoint,
    credentials: Option<Credentials>,
    sockets: RawSocketFactory,
}

impl Socks5AdapterFactory {
    pub fn new(id: impl Into<String>, server: Endpoint, sockets: RawSocketFactory) -> Self {
        Self {
            id: id.into(),
            server,
            credentials: None,
            sockets,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn server(&self) -> &Endpoint {
        &self.server
    }
}

impl AdapterFactory for Socks5AdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn adapter_for(&self, _request: &ConnectionRequest) -> Result<Box<dyn AdapterSocket>> {
        Ok(Box::new(Socks5Adapter {
            core: AdapterSocketCore::new(self.sockets.create(), self.id.clone()),
            server: self.server.clone(),
            credentials: self.credentials.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct Socks5Adapter {
    core: AdapterSocketCore,
    server: Endpoint,
    credentials: Option<Credentials>,
}

impl Socks5Adapter {
    async fn establish(&self, request: &ConnectionRequest) -> Result<()> {
        let raw = self.core.raw().as_ref();
        raw.connect(self.server.host(), self.server.port(), None)
            .await?;

        let greeting: &'static [u8] = match self.credentials {
            Some(_) => &[SOCKS_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS],
            None => &[SOCKS_VERSION, 0x01, METHOD_NO_AUTH],
        };
        raw.write(Bytes::from_static(greeting)).await?;

        let choice = raw.read_exactly(2).await?;
        if choice[0] != SOCKS_VERSION {
            return Err(TunnelError::handshake(format!(
                "Upstream {} is not a SOCKS5 server (version {})",
                self.server, choice[0]
            )));
        }
        match (choice[1], &self.credentials) {
            (METHOD_NO_AUTH, _) => {}
            (METHOD_USER_PASS, Some(credentials)) => self.authenticate(raw, credentials).await?,
            (METHOD_NO_ACCEPTABLE, _) => {
                return Err(TunnelError::handshake(format!(
                    "Upstream {} accepted none of the offered auth methods",
                    self.server
                )))
            }
            (method, _) => {
                return Err(TunnelError::handshake(format!(
                    "Upstream {} selected unexpected auth method {:#04x}",
                    self.server, method
                )))
            }
        }

        let mut packet = BytesMut::with_capacity(7 + request.host().len());
        packet.put_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
        encode_address(&mut packet, request.host(), request.port());
        raw.write(packet.freeze()).await?;

        let reply = raw.read_exactly(4).await?;
        if reply[0] != SOCKS_VERSION {
            return Err(TunnelError::handshake("Invalid SOCKS5 reply version"));
        }
        if reply[1] != REPLY_SUCCEEDED {
            return Err(TunnelError::connection_failed(
                request.to_string(),
                io::Error::new(
                    error_kind_for_reply(reply[1]),
                    format!("SOCKS5 upstream {} replied {:#04x}", self.server, reply[1]),
                ),
            ));
        }

        // 读完 BND.ADDR / BND.PORT，之后的数据都属于目标
        if read_address(raw, reply[3]).await?.is_none() {
            return Err(TunnelError::handshake(format!(
                "Unsupported bound address type: {:#04x}",
                reply[3]
            )));
        }
        raw.read_exactly(2).await?;

        debug!("SOCKS5 upstream {} connected to {}", self.server, request);
        Ok(())
    }

    async fn authenticate(&self, raw: &dyn RawSocket, credentials: &Credentials) -> Result<()> {
        let username = credentials.username.as_bytes();
        let password = credentials.password.as_bytes();
        if username.len() > 255 || password.len() > 255 {
            return Err(TunnelError::handshake("SOCKS5 credentials too long"));
        }

        let mut packet = BytesMut::with_capacity(3 + username.len() + password.len());
        packet.put_u8(AUTH_VERSION);
        packet.put_u8(username.len() as u8);
        packet.put_slice(username);
        packet.put_u8(password.len() as u8);
        packet.put_slice(password);
        raw.write(packet.freeze()).await?;

        let status = raw.read_exactly(2).await?;
        if status[1] != 0x00 {
            return Err(TunnelError::handshake(format!(
                "Upstream {} rejected credentials for '{}'",
                self.server, credentials.username
            )));
        }
        Ok(())
    }
}

fn error_kind_for_reply(code: u8) -> io::ErrorKind {
    match code {
        0x02 => io::ErrorKind::PermissionDenied,
        0x03 | 0x04 => io::ErrorKind::AddrNotAvailable,
        0x05 => io::ErrorKind::ConnectionRefused,
        0x06 => io::ErrorKind::TimedOut,
        _ => io::ErrorKind::Other,
    }
}

#[async_trait]
impl AdapterSocket for Socks5Adapter {
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
