/// 地址基础类型：IP 地址、端口、端点
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// TCP 端口
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(u16);

impl Port {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// 按网络字节序还原端口
    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl From<u16> for Port {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Port {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u16>().map(Self)
    }
}

/// IPv4 / IPv6 地址
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpAddress(IpAddr);

impl IpAddress {
    pub const fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    /// 解析文本形式的地址，允许 `[v6]` 括号写法
    pub fn from_string(s: &str) -> Option<Self> {
        let trimmed = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);
        trimmed.parse::<IpAddr>().ok().map(Self)
    }

    pub const fn inner(&self) -> IpAddr {
        self.0
    }

    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }
}

impl From<IpAddr> for IpAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self(IpAddr::V4(ip))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(ip: Ipv6Addr) -> Self {
        Self(IpAddr::V6(ip))
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IpAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<IpAddr>().map(Self)
    }
}

/// 主机 + 端口
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: Port,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: impl Into<Port>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Port {
        self.port
    }

    /// 主机为 IP 字面量时返回该地址
    pub fn ip(&self) -> Option<IpAddress> {
        IpAddress::from_string(&self.host)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("example.com", 443).to_string(), "example.com:443");
        assert_eq!(Endpoint::new("::1", 8080).to_string(), "[::1]:8080");
    }

    #[test]
    fn test_ip_address_parse() {
        let v4 = IpAddress::from_string("10.0.0.1").unwrap();
        assert!(v4.is_ipv4());
        let v6 = IpAddress::from_string("[2001:db8::1]").unwrap();
        assert!(v6.is_ipv6());
        assert_eq!(v6.to_string(), "2001:db8::1");
        assert!(IpAddress::from_string("example.com").is_none());
    }

    #[test]
    fn test_port_bytes() {
        let port = Port::from_be_bytes([0x01, 0xBB]);
        assert_eq!(port.value(), 443);
        assert_eq!(port.to_be_bytes(), [0x01, 0xBB]);
        assert!("0x50".parse::<Port>().is_err());
    }

    #[test]
    fn test_endpoint_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let endpoint = Endpoint::from(addr);
        assert_eq!(endpoint.ip(), Some(IpAddress::from(Ipv4Addr::LOCALHOST)));
        assert_eq!(endpoint.port(), Port::new(1080));
    }
}
