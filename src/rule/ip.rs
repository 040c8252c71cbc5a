use super::Rule;
use crate::adapter::AdapterFactory;
use crate::error::{Result, TunnelError};
use crate::session::ConnectionRequest;
use ipnetwork::IpNetwork;
use std::sync::Arc;

/// 按目标 IP 所在网段匹配
///
/// 只检查 IP 字面量或请求中预先解析的地址，不会为规则匹配做 DNS 查询。
#[derive(Debug, Clone)]
pub struct IpRangeRule {
    name: String,
    factory: Arc<dyn AdapterFactory>,
    networks: Vec<IpNetwork>,
}

impl IpRangeRule {
    pub fn new(factory: Arc<dyn AdapterFactory>, networks: Vec<IpNetwork>) -> Self {
        Self {
            name: format!("ip({}) -> {}", networks.len(), factory.id()),
            factory,
            networks,
        }
    }

    /// 从 CIDR 字符串构造，单个地址视为 /32 或 /128
    pub fn parse(factory: Arc<dyn AdapterFactory>, cidrs: &[String]) -> Result<Self> {
        let networks = cidrs
            .iter()
            .map(|cidr| {
                cidr.trim().parse::<IpNetwork>().map_err(|e| {
                    TunnelError::config_error(format!("Invalid CIDR '{}': {}", cidr, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(factory, networks))
    }

    pub fn networks(&self) -> &[IpNetwork] {
        &self.networks
    }
}

impl Rule for IpRangeRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory(&self) -> &Arc<dyn AdapterFactory> {
        &self.factory
    }

    fn matches(&self, request: &ConnectionRequest) -> bool {
        match request.ip_address() {
            Some(ip) => self.networks.iter().any(|n| n.contains(ip.inner())),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DirectAdapterFactory;
    use crate::address::IpAddress;
    use crate::raw_socket::RawSocketFactory;

    fn rule() -> IpRangeRule {
        let factory: Arc<dyn AdapterFactory> =
            Arc::new(DirectAdapterFactory::new("lan", RawSocketFactory::Tcp));
        IpRangeRule::parse(
            factory,
            &["10.0.0.0/8".into(), "192.168.1.1".into(), "fd00::/8".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_cidr_match() {
        let rule = rule();
        let matches = |host: &str| rule.matches(&ConnectionRequest::new(host, 80).unwrap());
        assert!(matches("10.2.3.4"));
        assert!(matches("192.168.1.1"));
        assert!(!matches("192.168.1.2"));
        assert!(matches("fd12::1"));
        assert!(!matches("8.8.8.8"));
    }

    #[test]
    fn test_domain_uses_resolved_address() {
        let rule = rule();
        let request = ConnectionRequest::new("intranet.local", 80).unwrap();
        assert!(!rule.matches(&request));

        let resolved = request.with_resolved_ip(IpAddress::from_string("10.9.9.9").unwrap());
        assert!(rule.matches(&resolved));
    }

    #[test]
    fn test_invalid_cidr() {
        let factory: Arc<dyn AdapterFactory> =
            Arc::new(DirectAdapterFactory::new("lan", RawSocketFactory::Tcp));
        let err = IpRangeRule::parse(factory, &["10.0.0.0/33".into()]).unwrap_err();
        assert!(err.is_config_error());
    }
}
