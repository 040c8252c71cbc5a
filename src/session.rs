use crate::address::{Endpoint, IpAddress, Port};
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 域名最大长度（SOCKS5 域名字段为 1 字节长度）
pub const MAX_HOST_LENGTH: usize = 255;

/// 前端代理协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Socks5,
    Http,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Socks5 => write!(f, "socks5"),
            ProxyProtocol::Http => write!(f, "http"),
        }
    }
}

/// 用户名/密码凭据
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 一次连接请求：客户端希望到达的目标
///
/// 在前端握手完成时由不可信输入构造，之后不再修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    host: String,
    port: Port,
    fake_ip_enabled: bool,
    resolved_ip: Option<IpAddress>,
    protocol: Option<ProxyProtocol>,
}

impl ConnectionRequest {
    pub fn new(host: impl Into<String>, port: impl Into<Port>) -> Result<Self> {
        let host = host.into();
        let port = port.into();

        if host.is_empty() {
            return Err(TunnelError::handshake("Empty destination host"));
        }
        if host.len() > MAX_HOST_LENGTH {
            return Err(TunnelError::handshake(format!(
                "Destination host too long: {} bytes",
                host.len()
            )));
        }
        if port.value() == 0 {
            return Err(TunnelError::handshake(format!(
                "Invalid destination port 0 for {}",
                host
            )));
        }

        Ok(Self {
            host,
            port,
            fake_ip_enabled: false,
            resolved_ip: None,
            protocol: None,
        })
    }

    pub fn with_fake_ip(mut self, enabled: bool) -> Self {
        self.fake_ip_enabled = enabled;
        self
    }

    pub fn with_resolved_ip(mut self, ip: IpAddress) -> Self {
        self.resolved_ip = Some(ip);
        self
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn fake_ip_enabled(&self) -> bool {
        self.fake_ip_enabled
    }

    pub fn protocol(&self) -> Option<ProxyProtocol> {
        self.protocol
    }

    /// 主机是否为 IP 字面量
    pub fn is_ip(&self) -> bool {
        IpAddress::from_string(&self.host).is_some()
    }

    /// 可用于 IP 类规则的地址：IP 字面量或预先解析的地址
    pub fn ip_address(&self) -> Option<IpAddress> {
        IpAddress::from_string(&self.host).or(self.resolved_ip)
    }
}

impl fmt::Display for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Endpoint::new(self.host.clone(), self.port))
    }
}
