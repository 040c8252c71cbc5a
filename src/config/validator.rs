use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

use super::{AdapterConfig, AppConfig, ListenerConfig, RuleConfig, BUILTIN_DIRECT, BUILTIN_REJECT};
use crate::adapter::HttpProber;
use crate::session::ProxyProtocol;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证用户名和密码必须同时设置
    pub fn validate_credentials(
        username: &Option<String>,
        password: &Option<String>,
        context: &str,
    ) -> Result<()> {
        match (username, password) {
            (Some(u), Some(_)) if u.is_empty() => bail!("{}: username cannot be empty", context),
            (Some(u), Some(p)) if u.len() > 255 || p.len() > 255 => {
                bail!("{}: username and password must be at most 255 bytes", context)
            }
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => bail!("{}: username and password must be set together", context),
        }
    }

    /// 验证监听器配置
    pub fn validate_listener(listener: &ListenerConfig) -> Result<()> {
        let context = format!("Listener '{}'", listener.name());
        Self::validate_address(&listener.bind_addr, &context)?;
        Self::validate_port(listener.bind_port, &context)?;
        Self::validate_credentials(&listener.username, &listener.password, &context)?;

        if listener.protocol == ProxyProtocol::Http && listener.username.is_some() {
            bail!("{}: authentication is only supported on socks5 listeners", context);
        }
        if listener.idle_timeout_secs == Some(0) {
            bail!("{}: idle_timeout_secs must be greater than 0", context);
        }
        if let Some(rate) = &listener.accept_rate {
            if rate.per_second == 0 {
                bail!("{}: accept_rate.per_second must be greater than 0", context);
            }
            if rate.burst < rate.per_second {
                warn!(
                    "{}: accept_rate.burst ({}) is smaller than per_second ({})",
                    context, rate.burst, rate.per_second
                );
            }
        }
        Ok(())
    }

    /// 验证单个适配器，`known` 为全部可用 id
    pub fn validate_adapter(adapter: &AdapterConfig, known: &HashSet<&str>) -> Result<()> {
        let context = format!("Adapter '{}'", adapter.id());
        if adapter.id().trim().is_empty() {
            bail!("Adapter id cannot be empty");
        }

        match adapter {
            AdapterConfig::Direct { .. } | AdapterConfig::Reject { .. } => {}
            AdapterConfig::Socks5 {
                server,
                port,
                username,
                password,
                ..
            }
            | AdapterConfig::Http {
                server,
                port,
                username,
                password,
                ..
            } => {
                Self::validate_address(server, &context)?;
                Self::validate_port(*port, &context)?;
                Self::validate_credentials(username, password, &context)?;
            }
            AdapterConfig::Https {
                server,
                port,
                username,
                password,
                skip_verify,
                ca_cert_path,
                ..
            } => {
                Self::validate_address(server, &context)?;
                Self::validate_port(*port, &context)?;
                Self::validate_credentials(username, password, &context)?;
                if *skip_verify {
                    warn!("{}: TLS certificate verification is disabled", context);
                }
                if let Some(path) = ca_cert_path {
                    if !path.exists() {
                        bail!("{}: ca_cert_path {} does not exist", context, path.display());
                    }
                }
            }
            AdapterConfig::Select {
                id,
                candidates,
                default,
                auto_select_interval_secs,
            } => {
                if candidates.is_empty() {
                    bail!("{}: select pool must have at least one candidate", context);
                }
                let mut seen = HashSet::new();
                for candidate in candidates {
                    if candidate == id {
                        bail!("{}: select pool cannot contain itself", context);
                    }
                    if !known.contains(candidate.as_str()) {
                        bail!("{}: unknown candidate '{}'", context, candidate);
                    }
                    if !seen.insert(candidate.as_str()) {
                        bail!("{}: duplicate candidate '{}'", context, candidate);
                    }
                }
                if let Some(default) = default {
                    if !candidates.contains(default) {
                        bail!("{}: default '{}' is not a candidate", context, default);
                    }
                }
                if *auto_select_interval_secs == Some(0) {
                    bail!("{}: auto_select_interval_secs must be greater than 0", context);
                }
            }
        }
        Ok(())
    }

    /// 验证规则
    pub fn validate_rule(rule: &RuleConfig, index: usize, known: &HashSet<&str>) -> Result<()> {
        let context = format!("Rule #{}", index + 1);
        if !known.contains(rule.adapter()) {
            bail!("{}: unknown adapter '{}'", context, rule.adapter());
        }

        match rule {
            RuleConfig::Domain { domains, .. } => {
                if domains.iter().all(|d| d.trim().is_empty()) {
                    bail!("{}: domain list cannot be empty", context);
                }
            }
            RuleConfig::Ip { cidrs, .. } => {
                if cidrs.is_empty() {
                    bail!("{}: cidr list cannot be empty", context);
                }
                for cidr in cidrs {
                    if cidr.trim().parse::<ipnetwork::IpNetwork>().is_err() {
                        bail!("{}: invalid CIDR '{}'", context, cidr);
                    }
                }
            }
            RuleConfig::Country {
                countries,
                geoip_db,
                ..
            } => {
                if countries.is_empty() {
                    bail!("{}: country list cannot be empty", context);
                }
                if let Some(code) = countries.iter().find(|c| c.trim().len() != 2) {
                    bail!("{}: invalid country code '{}'", context, code);
                }
                if geoip_db.is_none() {
                    warn!("{}: no geoip_db configured, the rule will never match", context);
                }
            }
            RuleConfig::All { .. } => {}
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        if config.historian_capacity == 0 {
            bail!("historian_capacity must be greater than 0");
        }

        for listener in &config.listeners {
            Self::validate_listener(listener)?;
        }
        let mut bound = HashSet::new();
        for listener in &config.listeners {
            if !bound.insert((listener.bind_addr.as_str(), listener.bind_port)) {
                bail!("Duplicate listener on {}:{}", listener.bind_addr, listener.bind_port);
            }
        }

        let mut known: HashSet<&str> = HashSet::new();
        for adapter in &config.adapters {
            if !known.insert(adapter.id()) {
                bail!("Duplicate adapter id '{}'", adapter.id());
            }
        }
        known.insert(BUILTIN_DIRECT);
        known.insert(BUILTIN_REJECT);

        for adapter in &config.adapters {
            Self::validate_adapter(adapter, &known)?;
        }
        for (index, rule) in config.rules.iter().enumerate() {
            Self::validate_rule(rule, index, &known)?;
        }

        let catch_all = config
            .rules
            .iter()
            .position(|r| matches!(r, RuleConfig::All { .. }));
        if let Some(position) = catch_all {
            if position + 1 != config.rules.len() {
                warn!(
                    "Rule #{} matches everything, {} rules after it are unreachable",
                    position + 1,
                    config.rules.len() - position - 1
                );
            }
        }
        match &config.default_adapter {
            Some(id) if !known.contains(id.as_str()) => {
                bail!("default_adapter '{}' is not a known adapter", id)
            }
            Some(_) => {}
            None if catch_all.is_none() => {
                bail!("Routing has no default: set default_adapter or add an `all` rule")
            }
            None => {}
        }

        if config.probe.timeout_ms == 0 {
            bail!("probe.timeout_ms must be greater than 0");
        }
        if let Err(e) = HttpProber::new(&config.probe.url) {
            bail!("probe.url: {}", e);
        }

        if let Some(stats) = &config.stats {
            Self::validate_address(&stats.bind_addr, "Stats")?;
            Self::validate_port(stats.port, "Stats")?;
        }
        Ok(())
    }
}
