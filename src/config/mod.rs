// 配置管理模块

mod builder;
mod validator;

pub use builder::{build_adapters, build_rule_manager, build_servers};
pub use validator::ConfigValidator;

use crate::adapter::DEFAULT_PROBE_URL;
use crate::historian::DEFAULT_HISTORY_CAPACITY;
use crate::rate_limiter::AcceptRateConfig;
use crate::rule::DomainMatchMode;
use crate::server::ProxyServerOptions;
use crate::session::{Credentials, ProxyProtocol};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 内置直连适配器 id
pub const BUILTIN_DIRECT: &str = "direct";
/// 内置拒绝适配器 id
pub const BUILTIN_REJECT: &str = "reject";

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_historian_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_probe_url() -> String {
    DEFAULT_PROBE_URL.to_string()
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

/// 本地监听器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// 前端协议（socks5 或 http）
    pub protocol: ProxyProtocol,
    /// 绑定地址（默认 127.0.0.1）
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    pub bind_port: u16,
    /// SOCKS5 用户名（与 password 同时设置）
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 空闲超时（秒），缺省不超时
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    /// 新连接速率限制
    #[serde(default)]
    pub accept_rate: Option<AcceptRateConfig>,
}

impl ListenerConfig {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.bind_addr, self.bind_port)
    }

    pub fn to_options(&self) -> ProxyServerOptions {
        ProxyServerOptions::new(self.protocol, self.bind_addr.clone(), self.bind_port)
            .with_auth(self.credentials())
            .with_idle_timeout(self.idle_timeout_secs.map(Duration::from_secs))
            .with_accept_rate(self.accept_rate)
    }
}

/// 适配器配置，`kind` 决定类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AdapterConfig {
    Direct {
        id: String,
    },
    Reject {
        id: String,
        /// 拒绝前等待的毫秒数
        #[serde(default)]
        delay_ms: u64,
    },
    Socks5 {
        id: String,
        server: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    Http {
        id: String,
        server: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    Https {
        id: String,
        server: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        /// TLS SNI，缺省使用 server
        #[serde(default)]
        server_name: Option<String>,
        /// 跳过证书验证（仅用于测试）
        #[serde(default)]
        skip_verify: bool,
        #[serde(default)]
        ca_cert_path: Option<PathBuf>,
    },
    /// 候选池，`candidates` 为其他适配器的 id
    Select {
        id: String,
        candidates: Vec<String>,
        #[serde(default)]
        default: Option<String>,
        /// 周期自动选择间隔（秒），缺省不自动选择
        #[serde(default)]
        auto_select_interval_secs: Option<u64>,
    },
}

impl AdapterConfig {
    pub fn id(&self) -> &str {
        match self {
            AdapterConfig::Direct { id }
            | AdapterConfig::Reject { id, .. }
            | AdapterConfig::Socks5 { id, .. }
            | AdapterConfig::Http { id, .. }
            | AdapterConfig::Https { id, .. }
            | AdapterConfig::Select { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AdapterConfig::Direct { .. } => "direct",
            AdapterConfig::Reject { .. } => "reject",
            AdapterConfig::Socks5 { .. } => "socks5",
            AdapterConfig::Http { .. } => "http",
            AdapterConfig::Https { .. } => "https",
            AdapterConfig::Select { .. } => "select",
        }
    }
}

/// 路由规则配置，按顺序匹配
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuleConfig {
    /// 域名列表；未指定 mode 时每项可带 `suffix:` 等前缀或写成 `*.example.com`
    Domain {
        adapter: String,
        #[serde(default)]
        mode: Option<DomainMatchMode>,
        domains: Vec<String>,
    },
    Ip {
        adapter: String,
        cidrs: Vec<String>,
    },
    Country {
        adapter: String,
        /// ISO 3166-1 alpha-2 代码
        countries: Vec<String>,
        /// GeoIP 数据库路径（.mmdb 文件）
        #[serde(default)]
        geoip_db: Option<String>,
    },
    All {
        adapter: String,
    },
}

impl RuleConfig {
    pub fn adapter(&self) -> &str {
        match self {
            RuleConfig::Domain { adapter, .. }
            | RuleConfig::Ip { adapter, .. }
            | RuleConfig::Country { adapter, .. }
            | RuleConfig::All { adapter } => adapter,
        }
    }
}

/// 延迟探测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_url")]
    pub url: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: default_probe_url(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// JSON 统计接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    pub port: u16,
}

/// 完整配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 保留的已关闭连接记录数
    #[serde(default = "default_historian_capacity")]
    pub historian_capacity: usize,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// 所有规则都不匹配时使用的适配器
    #[serde(default)]
    pub default_adapter: Option<String>,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub stats: Option<StatsConfig>,
}

impl AppConfig {
    /// 从文件加载并验证配置
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let path = shellexpand::tilde(path);
        let content = std::fs::read_to_string(&*path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_app_config(self)
    }

    /// 配置模板
    pub fn template() -> &'static str {
        include_str!("../../demos/proxy-template.toml")
    }

    /// 某个 id 是否由内置适配器提供
    pub fn is_builtin(&self, id: &str) -> bool {
        (id == BUILTIN_DIRECT || id == BUILTIN_REJECT) && !self.adapters.iter().any(|a| a.id() == id)
    }

    pub fn has_adapter(&self, id: &str) -> bool {
        self.is_builtin(id) || self.adapters.iter().any(|a| a.id() == id)
    }
}
