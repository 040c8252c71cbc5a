use super::{AdapterFactory, AdapterSocket, DirectAdapterFactory};
use crate::error::{Result, TunnelError};
use crate::raw_socket::RawSocketFactory;
use crate::session::ConnectionRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// 默认探测地址
pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// 延迟探测器
#[async_trait]
pub trait Prober: Send + Sync + fmt::Debug {
    /// 通过给定工厂访问探测目标，返回耗时
    async fn probe(&self, factory: &dyn AdapterFactory) -> Result<Duration>;
}

/// 发送 `HEAD` 请求并等待状态行的探测器
#[derive(Debug, Clone)]
pub struct HttpProber {
    host: String,
    port: u16,
    path: String,
}

impl HttpProber {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| TunnelError::config_error(format!("Invalid probe URL '{}': {}", url, e)))?;
        if url.scheme() != "http" {
            return Err(TunnelError::config_error(format!(
                "Probe URL must use http, got '{}'",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TunnelError::config_error("Probe URL has no host"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port: url.port_or_known_default().unwrap_or(80),
            path,
        })
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self {
            host: "www.gstatic.com".into(),
            port: 80,
            path: "/generate_204".into(),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, factory: &dyn AdapterFactory) -> Result<Duration> {
        let request = ConnectionRequest::new(self.host.clone(), self.port)?;
        let mut adapter = factory.adapter_for(&request)?;
        let started = Instant::now();

        let result = probe_once(adapter.as_mut(), &request, &self.path).await;
        adapter.force_disconnect();
        result.map(|_| started.elapsed())
    }
}

async fn probe_once(
    adapter: &mut dyn AdapterSocket,
    request: &ConnectionRequest,
    path: &str,
) -> Result<()> {
    adapter.open(request).await?;
    let head = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nUser-Agent: proxy-tunnel\r\n\r\n",
        path,
        request.host()
    );
    adapter.raw().write(Bytes::from(head)).await?;

    let line = adapter.raw().read_until(b"\r\n", 1024).await?;
    if !line.starts_with(b"HTTP/1.") {
        return Err(TunnelError::handshake("Probe target did not answer with HTTP"));
    }
    Ok(())
}

/// 候选服务器状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub id: String,
    /// 最近一次探测延迟，失败或未探测时为空
    pub latency_ms: Option<u64>,
    pub current: bool,
}

#[derive(Debug)]
struct Selection {
    current: usize,
    pings: Vec<Option<Duration>>,
    /// 每次手动切换加一
    switches: u64,
}

/// 候选上游池，按当前选择转发，可探测后自动切换到最快的候选
pub struct SelectAdapterFactory {
    id: String,
    candidates: Vec<Arc<dyn AdapterFactory>>,
    selection: RwLock<Selection>,
    prober: Arc<dyn Prober>,
    direct: Arc<dyn AdapterFactory>,
}

impl SelectAdapterFactory {
    /// `default` 为初始选择，缺省为第一个候选
    pub fn new(
        id: impl Into<String>,
        candidates: Vec<Arc<dyn AdapterFactory>>,
        default: Option<&str>,
    ) -> Result<Self> {
        let id = id.into();
        if candidates.is_empty() {
            return Err(TunnelError::config_error(format!(
                "Select adapter '{}' has no candidates",
                id
            )));
        }
        let current = match default {
            Some(name) => candidates
                .iter()
                .position(|c| c.id() == name)
                .ok_or_else(|| {
                    TunnelError::config_error(format!(
                        "Select adapter '{}' default '{}' is not a candidate",
                        id, name
                    ))
                })?,
            None => 0,
        };
        let pings = vec![None; candidates.len()];

        Ok(Self {
            id,
            candidates,
            selection: RwLock::new(Selection {
                current,
                pings,
                switches: 0,
            }),
            prober: Arc::new(HttpProber::default()),
            direct: Arc::new(DirectAdapterFactory::new("direct", RawSocketFactory::Tcp)),
        })
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    /// `test_direct` 使用的直连工厂
    pub fn with_direct(mut self, direct: Arc<dyn AdapterFactory>) -> Self {
        self.direct = direct;
        self
    }

    /// 当前选择的候选 id
    pub fn current(&self) -> String {
        let index = self.selection.read().current;
        self.candidates[index].id().to_string()
    }

    fn current_factory(&self) -> Arc<dyn AdapterFactory> {
        let index = self.selection.read().current;
        self.candidates[index].clone()
    }

    /// 手动切换候选
    pub fn set_current(&self, id: &str) -> Result<()> {
        let index = self
            .candidates
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| {
                TunnelError::config_error(format!(
                    "'{}' is not a candidate of select adapter '{}'",
                    id, self.id
                ))
            })?;
        {
            let mut selection = self.selection.write();
            selection.current = index;
            selection.switches += 1;
        }
        info!("{} switched to {}", self.id, id);
        Ok(())
    }

    /// 候选列表及最近一次延迟
    pub fn servers(&self) -> Vec<ServerStatus> {
        let selection = self.selection.read();
        self.candidates
            .iter()
            .zip(selection.pings.iter())
            .enumerate()
            .map(|(index, (candidate, ping))| ServerStatus {
                id: candidate.id().to_string(),
                latency_ms: ping.map(|d| d.as_millis() as u64),
                current: index == selection.current,
            })
            .collect()
    }

    /// 并发探测所有候选，切换到延迟最低的一个
    ///
    /// 全部失败时保持当前选择不变并返回 `ProbeTimeout`。
    /// 探测期间发生过 `set_current` 时只更新延迟，保留手动选择。
    pub async fn auto_select(&self, timeout: Duration) -> Result<Vec<ServerStatus>> {
        let switches = self.selection.read().switches;
        let probes = self.candidates.iter().map(|candidate| {
            let prober = self.prober.clone();
            async move {
                match tokio::time::timeout(timeout, prober.probe(candidate.as_ref())).await {
                    Ok(Ok(latency)) => {
                        debug!(candidate = %candidate.id(), ?latency, "Probe succeeded");
                        Some(latency)
                    }
                    Ok(Err(e)) => {
                        warn!(candidate = %candidate.id(), error = %e, "Probe failed");
                        None
                    }
                    Err(_) => {
                        warn!(candidate = %candidate.id(), ?timeout, "Probe timed out");
                        None
                    }
                }
            }
        });
        let pings: Vec<Option<Duration>> = join_all(probes).await;

        let best = pings
            .iter()
            .enumerate()
            .filter_map(|(index, ping)| ping.map(|latency| (index, latency)))
            .min_by_key(|(_, latency)| *latency)
            .map(|(index, _)| index);

        let overridden = {
            let mut selection = self.selection.write();
            selection.pings = pings;
            let overridden = selection.switches != switches;
            if let (Some(index), false) = (best, overridden) {
                selection.current = index;
            }
            overridden
        };

        match best {
            Some(_) if overridden => {
                info!("{} switched manually while probing, keeping {}", self.id, self.current());
                Ok(self.servers())
            }
            Some(index) => {
                info!(
                    "{} auto-selected {}",
                    self.id,
                    self.candidates[index].id()
                );
                Ok(self.servers())
            }
            None => {
                warn!("{}: every candidate failed, keeping {}", self.id, self.current());
                Err(TunnelError::probe_timeout(timeout))
            }
        }
    }

    /// 探测当前候选
    pub async fn test_current(&self, timeout: Duration) -> Result<Duration> {
        let index = self.selection.read().current;
        let result = self.probe_with_timeout(self.candidates[index].as_ref(), timeout).await;
        let mut selection = self.selection.write();
        if selection.current == index {
            selection.pings[index] = result.as_ref().ok().copied();
        }
        result
    }

    /// 不经上游直接探测
    pub async fn test_direct(&self, timeout: Duration) -> Result<Duration> {
        self.probe_with_timeout(self.direct.as_ref(), timeout).await
    }

    async fn probe_with_timeout(
        &self,
        factory: &dyn AdapterFactory,
        timeout: Duration,
    ) -> Result<Duration> {
        tokio::time::timeout(timeout, self.prober.probe(factory))
            .await
            .map_err(|_| TunnelError::probe_timeout(timeout))?
    }

    /// 周期性执行自动选择，直到 `shutdown` 被取消
    pub fn spawn_auto_select(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = this.auto_select(timeout).await {
                            warn!("Periodic auto select for {} failed: {}", this.id, e);
                        }
                    }
                }
            }
            debug!("Auto select task for {} stopped", this.id);
        })
    }
}

impl AdapterFactory for SelectAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn adapter_for(&self, request: &ConnectionRequest) -> Result<Box<dyn AdapterSocket>> {
        self.current_factory().adapter_for(request)
    }
}

impl fmt::Debug for SelectAdapterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectAdapterFactory")
            .field("id", &self.id)
            .field(
                "candidates",
                &self.candidates.iter().map(|c| c.id()).collect::<Vec<_>>(),
            )
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RejectAdapterFactory;
    use std::collections::HashMap;

    /// 按候选 id 返回固定延迟；未配置的候选永不返回
    #[derive(Debug)]
    struct FakeProber {
        latencies: HashMap<String, Duration>,
    }

    impl FakeProber {
        fn new(latencies: &[(&str, u64)]) -> Arc<Self> {
            Arc::new(Self {
                latencies: latencies
                    .iter()
                    .map(|(id, ms)| (id.to_string(), Duration::from_millis(*ms)))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, factory: &dyn AdapterFactory) -> Result<Duration> {
            match self.latencies.get(factory.id()) {
                Some(latency) => {
                    tokio::time::sleep(*latency).await;
                    Ok(*latency)
                }
                None => std::future::pending().await,
            }
        }
    }

    fn candidate(id: &str) -> Arc<dyn AdapterFactory> {
        Arc::new(RejectAdapterFactory::new(id, Duration::ZERO))
    }

    fn pool(prober: Arc<dyn Prober>) -> SelectAdapterFactory {
        SelectAdapterFactory::new(
            "proxy",
            vec![candidate("a"), candidate("b"), candidate("c")],
            Some("b"),
        )
        .unwrap()
        .with_prober(prober)
    }

    #[tokio::test]
    async fn test_auto_select_picks_fastest() {
        let pool = pool(FakeProber::new(&[("a", 50), ("b", 500)]));
        assert_eq!(pool.current(), "b");

        let servers = pool.auto_select(Duration::from_secs(2)).await.unwrap();
        assert_eq!(pool.current(), "a");
        assert_eq!(servers[0].latency_ms, Some(50));
        assert!(servers[0].current);
        assert_eq!(servers[1].latency_ms, Some(500));
        assert_eq!(servers[2].latency_ms, None);
    }

    #[tokio::test]
    async fn test_auto_select_all_fail_keeps_current() {
        let pool = pool(FakeProber::new(&[]));
        let err = pool
            .auto_select(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(pool.current(), "b");
    }

    #[tokio::test]
    async fn test_auto_select_is_rerunnable() {
        let pool = pool(FakeProber::new(&[("a", 30), ("c", 10)]));
        pool.auto_select(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.current(), "c");
        pool.auto_select(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.current(), "c");
    }

    #[tokio::test]
    async fn test_adapter_follows_current() {
        let pool = pool(FakeProber::new(&[]));
        let request = ConnectionRequest::new("example.com", 80).unwrap();
        assert!(pool.adapter_for(&request).unwrap().description().contains('b'));

        pool.set_current("c").unwrap();
        assert!(pool.adapter_for(&request).unwrap().description().contains('c'));
        assert!(pool.set_current("missing").is_err());
        assert_eq!(pool.current(), "c");
    }

    #[tokio::test]
    async fn test_current_and_direct_probes() {
        let prober = FakeProber::new(&[("b", 5), ("direct", 5)]);
        let pool = pool(prober);
        assert_eq!(
            pool.test_current(Duration::from_secs(1)).await.unwrap(),
            Duration::from_millis(5)
        );
        assert_eq!(pool.servers()[1].latency_ms, Some(5));
        assert!(pool.test_direct(Duration::from_secs(1)).await.is_ok());

        pool.set_current("a").unwrap();
        let err = pool
            .test_current(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_invalid_pools() {
        assert!(SelectAdapterFactory::new("empty", vec![], None).is_err());
        assert!(SelectAdapterFactory::new("p", vec![candidate("a")], Some("z")).is_err());
    }

    #[test]
    fn test_http_prober_url() {
        assert!(HttpProber::new("https://example.com/").is_err());
        let prober = HttpProber::new("http://127.0.0.1:8080/ping?x=1").unwrap();
        assert_eq!(prober.port, 8080);
        assert_eq!(prober.path, "/ping?x=1");
    }

    #[tokio::test]
    async fn test_manual_switch_wins_over_running_auto_select() {
        let pool = Arc::new(pool(FakeProber::new(&[("a", 200), ("b", 300)])));
        let probing = tokio::spawn({
            let pool = pool.clone();
            async move { pool.auto_select(Duration::from_millis(500)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.set_current("c").unwrap();
        let servers = probing.await.unwrap().unwrap();

        assert_eq!(pool.current(), "c");
        assert!(servers[2].current);
        assert_eq!(servers[0].latency_ms, Some(200));

        // 之后没有手动切换的探测照常生效
        pool.auto_select(Duration::from_millis(500)).await.unwrap();
        assert_eq!(pool.current(), "a");
    }

    #[tokio::test]
    async fn test_readers_see_a_candidate_during_auto_select() {
        let pool = Arc::new(pool(FakeProber::new(&[("a", 20), ("b", 10), ("c", 30)])));
        let probing = tokio::spawn({
            let pool = pool.clone();
            async move {
                for _ in 0..5 {
                    pool.auto_select(Duration::from_secs(1)).await.unwrap();
                }
            }
        });

        let request = ConnectionRequest::new("example.com", 80).unwrap();
        while !probing.is_finished() {
            let current = pool.current();
            assert!(["a", "b", "c"].contains(&current.as_str()));
            let adapter = pool.adapter_for(&request).unwrap();
            assert!(["a", "b", "c"].iter().any(|id| adapter.description().contains(id)));
            assert_eq!(pool.servers().iter().filter(|s| s.current).count(), 1);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        probing.await.unwrap();
        assert_eq!(pool.current(), "b");
    }
}
