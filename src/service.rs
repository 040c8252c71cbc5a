use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::{AdapterFactoryManager, SelectAdapterFactory};
use crate::config::{build_adapters, build_rule_manager, build_servers, AdapterConfig, AppConfig};
use crate::historian::{ConnectionRecord, Historian};
use crate::raw_socket::RawSocketFactory;
use crate::rule::RuleManager;
use crate::server::ProxyServer;
use crate::stats::{start_stats_server, StatsContext};

/// 按配置组装的完整代理服务：所有监听器、适配器、规则和后台任务
pub struct ProxyService {
    config: AppConfig,
    adapters: AdapterFactoryManager,
    rules: Arc<RuleManager>,
    servers: Vec<Arc<ProxyServer>>,
    historian: Arc<Historian>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ProxyService {
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_sockets(config, RawSocketFactory::Tcp)
    }

    /// 上游连接使用指定的原始套接字后端
    pub fn with_sockets(config: AppConfig, sockets: RawSocketFactory) -> Result<Self> {
        let adapters = build_adapters(&config, &sockets).context("Failed to build adapters")?;
        let rules = Arc::new(
            build_rule_manager(&config, &adapters).context("Failed to build routing rules")?,
        );
        let historian = Arc::new(Historian::new(config.historian_capacity));
        let servers = build_servers(&config, rules.clone(), historian.clone())
            .into_iter()
            .map(Arc::new)
            .collect();

        Ok(Self {
            config,
            adapters,
            rules,
            servers,
            historian,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn servers(&self) -> &[Arc<ProxyServer>] {
        &self.servers
    }

    pub fn adapters(&self) -> &AdapterFactoryManager {
        &self.adapters
    }

    pub fn rules(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    pub fn historian(&self) -> &Arc<Historian> {
        &self.historian
    }

    pub fn selector(&self, id: &str) -> Option<Arc<SelectAdapterFactory>> {
        self.adapters.selector(id)
    }

    /// 启动所有监听器和后台任务，任一监听器绑定失败则停止已启动的部分
    pub async fn start(&mut self) -> Result<Vec<SocketAddr>> {
        let mut addrs = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            match server.start().await {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    for started in &self.servers {
                        started.stop().await;
                    }
                    return Err(e).with_context(|| format!("Failed to start {}", server.name()));
                }
            }
        }

        self.spawn_auto_select();
        self.spawn_stats();
        Ok(addrs)
    }

    fn spawn_auto_select(&mut self) {
        let timeout = self.config.probe.timeout();
        for adapter in &self.config.adapters {
            let AdapterConfig::Select {
                id,
                auto_select_interval_secs: Some(interval),
                ..
            } = adapter
            else {
                continue;
            };
            let Some(selector) = self.adapters.selector(id) else {
                continue;
            };

            info!("Auto select for '{}' every {}s", id, interval);
            // 启动时先选一次
            let initial = selector.clone();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = initial.auto_select(timeout).await {
                    warn!("Initial auto select failed: {}", e);
                }
            }));
            self.tasks.push(selector.spawn_auto_select(
                Duration::from_secs(*interval),
                timeout,
                self.shutdown.child_token(),
            ));
        }
    }

    fn spawn_stats(&mut self) {
        let Some(stats) = self.config.stats.clone() else {
            return;
        };
        let context = StatsContext::new(
            self.servers.clone(),
            self.historian.clone(),
            self.adapters.selectors().cloned().collect(),
        )
        .with_probe_timeout(self.config.probe.timeout());
        let shutdown = self.shutdown.child_token();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = start_stats_server(stats.bind_addr, stats.port, context, shutdown).await {
                error!("Stats server error: {:#}", e);
            }
        }));
    }

    /// 所有监听器的存活隧道
    pub fn dump(&self) -> Vec<ConnectionRecord> {
        self.servers.iter().flat_map(|s| s.dump()).collect()
    }

    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        for server in &self.servers {
            server.stop().await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!(
            "All listeners stopped ({} connections recorded)",
            self.historian.total_recorded()
        );
    }

    /// 运行直到收到 Ctrl+C
    pub async fn run(mut self) -> Result<()> {
        let addrs = self.start().await?;
        info!(
            "Proxy service started with {} listeners (Press Ctrl+C to stop)",
            addrs.len()
        );

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Received shutdown signal, stopping...");
        self.stop().await;
        Ok(())
    }
}
