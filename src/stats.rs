/// 统计接口
///
/// 以 JSON 提供存活隧道、历史记录和候选池状态
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::adapter::{AdapterFactory, SelectAdapterFactory, ServerStatus};
use crate::error::TunnelError;
use crate::historian::{ConnectionRecord, Historian};
use crate::server::ProxyServer;

/// 单个监听器的存活隧道
#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub name: String,
    pub local_addr: Option<String>,
    pub active: Vec<ConnectionRecord>,
}

/// 候选池状态
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub id: String,
    pub current: String,
    pub servers: Vec<ServerStatus>,
}

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// 统计接口读取的数据
#[derive(Clone)]
pub struct StatsContext {
    servers: Vec<Arc<ProxyServer>>,
    historian: Arc<Historian>,
    selectors: Vec<Arc<SelectAdapterFactory>>,
    probe_timeout: Duration,
}

impl StatsContext {
    pub fn new(
        servers: Vec<Arc<ProxyServer>>,
        historian: Arc<Historian>,
        selectors: Vec<Arc<SelectAdapterFactory>>,
    ) -> Self {
        Self {
            servers,
            historian,
            selectors,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// `auto_select` 与 `ping` 接口使用的探测超时
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn listeners(&self) -> Vec<ListenerSnapshot> {
        self.servers
            .iter()
            .map(|server| ListenerSnapshot {
                name: server.name().to_string(),
                local_addr: server.local_addr().map(|a| a.to_string()),
                active: server.dump(),
            })
            .collect()
    }

    pub fn pools(&self) -> Vec<PoolSnapshot> {
        self.selectors
            .iter()
            .map(|pool| PoolSnapshot {
                id: pool.id().to_string(),
                current: pool.current(),
                servers: pool.servers(),
            })
            .collect()
    }

    /// `from` 为历史记录起始下标，用于增量拉取
    pub fn connections(&self, from: usize) -> serde_json::Value {
        json!({
            "listeners": self.listeners(),
            "closed": self.historian.records_from(from),
            "closed_total": self.historian.total_recorded(),
        })
    }

    fn selector(&self, pool: &str) -> Option<&Arc<SelectAdapterFactory>> {
        self.selectors.iter().find(|s| s.id() == pool)
    }

    fn select(&self, pool: &str, candidate: &str) -> std::result::Result<PoolSnapshot, String> {
        let selector = self
            .selector(pool)
            .ok_or_else(|| format!("unknown pool '{}'", pool))?;
        selector.set_current(candidate).map_err(|e| e.to_string())?;
        Ok(snapshot(selector))
    }
}

fn snapshot(selector: &SelectAdapterFactory) -> PoolSnapshot {
    PoolSnapshot {
        id: selector.id().to_string(),
        current: selector.current(),
        servers: selector.servers(),
    }
}

/// 启动统计接口，直到 `shutdown` 被取消
pub async fn start_stats_server(
    bind_addr: String,
    port: u16,
    context: StatsContext,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(format!("{}:{}", bind_addr, port))
        .await
        .context("Failed to bind stats server port")?;
    info!("Stats server listening on http://{}:{}", bind_addr, port);
    serve(listener, context, shutdown).await;
    Ok(())
}

pub(crate) async fn serve(listener: TcpListener, context: StatsContext, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((mut stream, addr)) => {
                    let context = context.clone();
                    tokio::spawn(async move {
                        handle_stats_request(&mut stream, addr, &context).await;
                    });
                }
                Err(e) => error!("Failed to accept stats connection: {}", e),
            }
        }
    }
    debug!("Stats server stopped");
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// 处理单个统计请求
async fn handle_stats_request(stream: &mut TcpStream, addr: SocketAddr, context: &StatsContext) {
    let mut buffer = vec![0u8; 4096];
    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to read from stats client {}: {}", addr, e);
            return;
        }
    };

    let request = String::from_utf8_lossy(&buffer[..n]);
    let mut parts = request
        .lines()
        .next()
        .map(|line| line.split_whitespace())
        .into_iter()
        .flatten();
    let method = parts.next().unwrap_or("GET").to_string();
    let target = parts.next().unwrap_or("/").to_string();

    let response = route(context, &method, &target).await;
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write stats response to {}: {}", addr, e);
    }
}

async fn route(context: &StatsContext, method: &str, target: &str) -> String {
    let Ok(url) = Url::parse(&format!("http://localhost{}", target)) else {
        return http_response("400 Bad Request", r#"{"error":"bad request"}"#);
    };
    let query = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    match (method, segments.as_slice()) {
        ("GET", ["connections"]) => {
            let from = query("from").and_then(|v| v.parse().ok()).unwrap_or(0);
            let body = serde_json::to_string_pretty(&context.connections(from)).unwrap_or_default();
            http_response("200 OK", &body)
        }
        ("GET", ["servers"]) => {
            let body = serde_json::to_string_pretty(&context.pools()).unwrap_or_default();
            http_response("200 OK", &body)
        }
        ("POST", ["servers", pool]) | ("PUT", ["servers", pool]) => match query("current") {
            Some(candidate) => match context.select(pool, &candidate) {
                Ok(snapshot) => {
                    let body = serde_json::to_string_pretty(&snapshot).unwrap_or_default();
                    http_response("200 OK", &body)
                }
                Err(e) => http_response("404 Not Found", &json!({ "error": e }).to_string()),
            },
            None => http_response(
                "400 Bad Request",
                r#"{"error":"missing 'current' query parameter"}"#,
            ),
        },
        ("POST", ["servers", pool, "auto_select"]) => {
            let Some(selector) = context.selector(pool) else {
                return unknown_pool(pool);
            };
            match selector.auto_select(context.probe_timeout).await {
                Ok(_) => {
                    let body = serde_json::to_string_pretty(&snapshot(selector)).unwrap_or_default();
                    http_response("200 OK", &body)
                }
                Err(e) => probe_failed(&e),
            }
        }
        ("GET", ["servers", pool, "ping"]) => {
            let Some(selector) = context.selector(pool) else {
                return unknown_pool(pool);
            };
            let direct = url.query_pairs().any(|(k, _)| k == "direct");
            let (target, result) = if direct {
                ("direct".to_string(), selector.test_direct(context.probe_timeout).await)
            } else {
                (selector.current(), selector.test_current(context.probe_timeout).await)
            };
            match result {
                Ok(latency) => {
                    let body = json!({
                        "pool": pool,
                        "target": target,
                        "latency_ms": latency.as_millis() as u64,
                    });
                    http_response("200 OK", &body.to_string())
                }
                Err(e) => probe_failed(&e),
            }
        }
        _ => http_response("404 Not Found", r#"{"error":"not found"}"#),
    }
}

fn unknown_pool(pool: &str) -> String {
    let body = json!({ "error": format!("unknown pool '{}'", pool) });
    http_response("404 Not Found", &body.to_string())
}

fn probe_failed(error: &TunnelError) -> String {
    let status = if error.is_timeout() {
        "504 Gateway Timeout"
    } else {
        "502 Bad Gateway"
    };
    http_response(status, &json!({ "error": error.to_string() }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Prober, RejectAdapterFactory};
    use async_trait::async_trait;

    /// "b" 与直连 5ms 返回，其余候选失败
    #[derive(Debug)]
    struct FixedProber;

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, factory: &dyn AdapterFactory) -> crate::error::Result<Duration> {
            match factory.id() {
                "b" | "direct" => Ok(Duration::from_millis(5)),
                _ => Err(TunnelError::probe_timeout(Duration::from_millis(5))),
            }
        }
    }

    fn context() -> StatsContext {
        let candidates: Vec<Arc<dyn AdapterFactory>> = vec![
            Arc::new(RejectAdapterFactory::new("a", Duration::ZERO)),
            Arc::new(RejectAdapterFactory::new("b", Duration::ZERO)),
        ];
        let pool = SelectAdapterFactory::new("pool", candidates, None)
            .unwrap()
            .with_prober(Arc::new(FixedProber))
            .with_direct(Arc::new(RejectAdapterFactory::new("direct", Duration::ZERO)));
        let historian = Arc::new(Historian::new(10));
        historian.record(ConnectionRecord {
            id: 7,
            protocol: None,
            destination: Some("example.com:443".into()),
            adapter: Some("a".into()),
            rx: 1,
            tx: 2,
            opened_at: 0,
            duration_ms: 5,
            established: true,
            closed: true,
        });
        StatsContext::new(vec![], historian, vec![Arc::new(pool)])
            .with_probe_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_connections_route() {
        let context = context();
        let response = route(&context, "GET", "/connections?from=0").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("example.com:443"));

        let response = route(&context, "GET", "/connections?from=1").await;
        assert!(!response.contains("example.com:443"));
    }

    #[tokio::test]
    async fn test_switch_server() {
        let context = context();
        assert!(route(&context, "GET", "/servers").await.contains("\"current\": \"a\""));

        let response = route(&context, "POST", "/servers/pool?current=b").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(context.pools()[0].current, "b");

        let response = route(&context, "POST", "/servers/pool?current=z").await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(route(&context, "POST", "/servers/pool").await.starts_with("HTTP/1.1 400"));
        assert!(route(&context, "GET", "/nothing").await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_auto_select_route() {
        let context = context();
        let response = route(&context, "POST", "/servers/pool/auto_select").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"latency_ms\": 5"));
        assert_eq!(context.pools()[0].current, "b");

        let response = route(&context, "POST", "/servers/other/auto_select").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_ping_route() {
        let context = context();
        // 当前候选 "a" 探测失败
        let response = route(&context, "GET", "/servers/pool/ping").await;
        assert!(response.starts_with("HTTP/1.1 504"));

        let response = route(&context, "GET", "/servers/pool/ping?direct").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"target\":\"direct\""));
        assert!(response.contains("\"latency_ms\":5"));

        context.select("pool", "b").unwrap();
        let response = route(&context, "GET", "/servers/pool/ping").await;
        assert!(response.contains("\"target\":\"b\""));
        assert_eq!(context.pools()[0].servers[1].latency_ms, Some(5));
    }
}
