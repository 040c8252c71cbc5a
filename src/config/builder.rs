use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{AdapterConfig, AppConfig, RuleConfig, BUILTIN_DIRECT, BUILTIN_REJECT};
use crate::adapter::{
    AdapterFactory, AdapterFactoryManager, DirectAdapterFactory, HttpAdapterFactory, HttpProber,
    Prober, RejectAdapterFactory, SelectAdapterFactory, Socks5AdapterFactory,
};
use crate::address::Endpoint;
use crate::historian::Historian;
use crate::raw_socket::RawSocketFactory;
use crate::rule::{
    AllRule, CountryDatabase, CountryRule, DomainMatcher, DomainRule, IpRangeRule, Rule,
    RuleManager,
};
use crate::server::ProxyServer;
use crate::session::Credentials;
use crate::tls::TlsSettings;

fn credentials(username: &Option<String>, password: &Option<String>) -> Option<Credentials> {
    match (username, password) {
        (Some(u), Some(p)) => Some(Credentials::new(u, p)),
        _ => None,
    }
}

fn build_fixed(adapter: &AdapterConfig, sockets: &RawSocketFactory) -> Option<Arc<dyn AdapterFactory>> {
    let factory: Arc<dyn AdapterFactory> = match adapter {
        AdapterConfig::Direct { id } => Arc::new(DirectAdapterFactory::new(id, sockets.clone())),
        AdapterConfig::Reject { id, delay_ms } => {
            Arc::new(RejectAdapterFactory::new(id, Duration::from_millis(*delay_ms)))
        }
        AdapterConfig::Socks5 {
            id,
            server,
            port,
            username,
            password,
        } => Arc::new(
            Socks5AdapterFactory::new(id, Endpoint::new(server, *port), sockets.clone())
                .with_credentials(credentials(username, password)),
        ),
        AdapterConfig::Http {
            id,
            server,
            port,
            username,
            password,
        } => Arc::new(
            HttpAdapterFactory::new(id, Endpoint::new(server, *port), sockets.clone())
                .with_credentials(credentials(username, password)),
        ),
        AdapterConfig::Https {
            id,
            server,
            port,
            username,
            password,
            server_name,
            skip_verify,
            ca_cert_path,
        } => Arc::new(
            HttpAdapterFactory::new(id, Endpoint::new(server, *port), sockets.clone())
                .with_credentials(credentials(username, password))
                .with_tls(Some(TlsSettings {
                    server_name: server_name.clone(),
                    skip_verify: *skip_verify,
                    ca_cert_path: ca_cert_path.clone(),
                })),
        ),
        AdapterConfig::Select { .. } => return None,
    };
    Some(factory)
}

/// 根据配置创建所有适配器工厂（含内置的 direct / reject）
pub fn build_adapters(config: &AppConfig, sockets: &RawSocketFactory) -> Result<AdapterFactoryManager> {
    let mut manager = AdapterFactoryManager::new();
    manager.insert(Arc::new(DirectAdapterFactory::new(BUILTIN_DIRECT, sockets.clone())));
    manager.insert(Arc::new(RejectAdapterFactory::new(BUILTIN_REJECT, Duration::ZERO)));

    for adapter in &config.adapters {
        if let Some(factory) = build_fixed(adapter, sockets) {
            debug!("Built {} adapter '{}'", adapter.kind(), adapter.id());
            manager.insert(factory);
        }
    }

    let prober: Arc<dyn Prober> = Arc::new(
        HttpProber::new(&config.probe.url).context("Invalid probe configuration")?,
    );
    let direct = manager.require(BUILTIN_DIRECT)?;

    // 候选池可以引用其他候选池，按依赖顺序反复构建
    let mut pending: Vec<&AdapterConfig> = config
        .adapters
        .iter()
        .filter(|a| matches!(a, AdapterConfig::Select { .. }))
        .collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut waiting = Vec::new();
        for adapter in pending {
            let AdapterConfig::Select {
                id,
                candidates,
                default,
                ..
            } = adapter
            else {
                continue;
            };
            if !candidates.iter().all(|c| manager.contains(c)) {
                waiting.push(adapter);
                continue;
            }
            let factories = candidates
                .iter()
                .map(|c| manager.require(c))
                .collect::<crate::error::Result<Vec<_>>>()?;
            let selector = SelectAdapterFactory::new(id, factories, default.as_deref())?
                .with_prober(prober.clone())
                .with_direct(direct.clone());
            debug!("Built select adapter '{}' ({} candidates)", id, candidates.len());
            manager.insert_selector(Arc::new(selector));
        }
        if waiting.len() == before {
            let ids: Vec<&str> = waiting.iter().map(|a| a.id()).collect();
            bail!("Select adapters have circular or missing candidates: {}", ids.join(", "));
        }
        pending = waiting;
    }

    Ok(manager)
}

/// 根据配置创建规则管理器
pub fn build_rule_manager(config: &AppConfig, adapters: &AdapterFactoryManager) -> Result<RuleManager> {
    let mut databases: HashMap<String, CountryDatabase> = HashMap::new();
    let mut rules: Vec<Box<dyn Rule>> = Vec::with_capacity(config.rules.len());

    for rule in &config.rules {
        let factory = adapters.require(rule.adapter())?;
        let built: Box<dyn Rule> = match rule {
            RuleConfig::Domain { mode, domains, .. } => {
                let matchers = domains
                    .iter()
                    .filter(|d| !d.trim().is_empty())
                    .map(|d| match mode {
                        Some(mode) => DomainMatcher::new(*mode, d),
                        None => DomainMatcher::parse(d),
                    })
                    .collect();
                Box::new(DomainRule::new(factory, matchers))
            }
            RuleConfig::Ip { cidrs, .. } => Box::new(IpRangeRule::parse(factory, cidrs)?),
            RuleConfig::Country {
                countries,
                geoip_db,
                ..
            } => {
                let database = match geoip_db {
                    Some(path) => databases
                        .entry(path.clone())
                        .or_insert_with(|| {
                            let expanded = shellexpand::tilde(path);
                            CountryDatabase::open(std::path::Path::new(&*expanded))
                        })
                        .clone(),
                    None => CountryDatabase::empty(),
                };
                Box::new(CountryRule::new(factory, countries.iter().cloned(), database))
            }
            RuleConfig::All { .. } => Box::new(AllRule::new(factory)),
        };
        rules.push(built);
    }

    let default = match &config.default_adapter {
        Some(id) => Some(adapters.require(id)?),
        None => None,
    };
    let manager = RuleManager::new(rules, default);
    manager.validate()?;
    Ok(manager)
}

/// 为每个监听器创建服务器，共用规则和历史记录
pub fn build_servers(
    config: &AppConfig,
    rules: Arc<RuleManager>,
    historian: Arc<Historian>,
) -> Vec<ProxyServer> {
    config
        .listeners
        .iter()
        .map(|listener| {
            ProxyServer::with_historian(listener.to_options(), rules.clone(), historian.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionRequest;

    const CONFIG: &str = r#"
        [[adapters]]
        kind = "socks5"
        id = "a"
        server = "127.0.0.1"
        port = 1081

        [[adapters]]
        kind = "select"
        id = "outer"
        candidates = ["inner", "a"]

        [[adapters]]
        kind = "select"
        id = "inner"
        candidates = ["a", "direct"]
        default = "direct"

        [[rules]]
        kind = "domain"
        adapter = "reject"
        domains = ["*.ads.example"]

        [[rules]]
        kind = "domain"
        adapter = "inner"
        mode = "keyword"
        domains = ["video"]

        [[rules]]
        kind = "all"
        adapter = "outer"
    "#;

    #[test]
    fn test_build_nested_pools() {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        let adapters = build_adapters(&config, &RawSocketFactory::Tcp).unwrap();
        assert!(adapters.contains("direct"));
        assert!(adapters.contains("reject"));
        assert_eq!(adapters.selectors().count(), 2);
        assert_eq!(adapters.selector("inner").unwrap().current(), "direct");
        assert_eq!(adapters.selector("outer").unwrap().current(), "inner");
    }

    #[test]
    fn test_build_rules() {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        let adapters = build_adapters(&config, &RawSocketFactory::Tcp).unwrap();
        let rules = build_rule_manager(&config, &adapters).unwrap();
        assert_eq!(rules.rules().len(), 3);

        let route = |host: &str| {
            rules
                .match_route(&ConnectionRequest::new(host, 443).unwrap())
                .unwrap()
                .id()
                .to_string()
        };
        assert_eq!(route("x.ads.example"), "reject");
        assert_eq!(route("myvideo.site"), "inner");
        assert_eq!(route("example.org"), "outer");
    }

    #[test]
    fn test_build_servers() {
        let config = AppConfig::from_toml(
            r#"
            default_adapter = "direct"
            [[listeners]]
            protocol = "socks5"
            bind_port = 1080
            [[listeners]]
            protocol = "http"
            bind_port = 8080
        "#,
        )
        .unwrap();
        let adapters = build_adapters(&config, &RawSocketFactory::Tcp).unwrap();
        let rules = Arc::new(build_rule_manager(&config, &adapters).unwrap());
        let servers = build_servers(&config, rules, Arc::new(Historian::new(10)));
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].name(), "http://127.0.0.1:8080");
        assert!(Arc::ptr_eq(servers[0].historian(), servers[1].historian()));
    }
}
