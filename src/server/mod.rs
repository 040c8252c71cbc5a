mod registry;

pub use registry::TunnelRegistry;

use crate::error::{Result, TunnelError};
use crate::historian::{ConnectionRecord, Historian};
use crate::observer::{self, notify, Observer, ProxyServerEvent};
use crate::proxy_socket::create_proxy_socket;
use crate::rate_limiter::{AcceptRateConfig, AcceptRateLimiter};
use crate::raw_socket::{RawSocket, TcpSocket};
use crate::rule::RuleManager;
use crate::session::{Credentials, ProxyProtocol};
use crate::tunnel::{Tunnel, TunnelId};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 监听器选项
#[derive(Debug, Clone)]
pub struct ProxyServerOptions {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    /// SOCKS5 前端的用户名/密码认证
    pub auth: Option<Credentials>,
    pub idle_timeout: Option<Duration>,
    pub accept_rate: Option<AcceptRateConfig>,
}

impl ProxyServerOptions {
    pub fn new(protocol: ProxyProtocol, address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            name: format!("{}://{}:{}", protocol, address, port),
            address,
            port,
            protocol,
            auth: None,
            idle_timeout: None,
            accept_rate: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_accept_rate(mut self, accept_rate: Option<AcceptRateConfig>) -> Self {
        self.accept_rate = accept_rate;
        self
    }
}

struct Listening {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<TcpListener>,
}

/// 服务器共享状态，隧道任务和接受循环各持有一份
struct ServerInner {
    options: ProxyServerOptions,
    rules: Arc<RuleManager>,
    registry: TunnelRegistry,
    historian: Arc<Historian>,
    observer: Option<Arc<dyn Observer<ProxyServerEvent>>>,
}

impl ServerInner {
    fn accept(self: &Arc<Self>, raw: Arc<dyn RawSocket>) -> TunnelId {
        let id = self.registry.next_id();
        let proxy = create_proxy_socket(self.options.protocol, raw, self.options.auth.clone());
        let (tunnel, handle) = Tunnel::new(id, proxy, self.rules.clone());
        let tunnel = tunnel.with_idle_timeout(self.options.idle_timeout);

        let active = self.registry.register(handle);
        notify(&self.observer, || ProxyServerEvent::Accepted {
            server: self.options.name.clone(),
            tunnel: id,
            active,
        });

        let mut guard = CloseGuard {
            server: self.clone(),
            id,
            record: None,
        };
        tokio::spawn(async move {
            guard.record = Some(tunnel.run().await);
        });
        id
    }

    /// 隧道结束后调用，重复调用无副作用
    fn tunnel_did_close(&self, id: TunnelId, record: Option<ConnectionRecord>) {
        let Some((handle, active)) = self.registry.remove(id) else {
            return;
        };
        let record = record.unwrap_or_else(|| {
            let mut record = handle.record();
            record.closed = true;
            record
        });
        debug!(
            "{} tunnel #{} closed: {} (rx {} tx {})",
            self.options.name,
            id,
            record.description(),
            record.rx,
            record.tx
        );
        self.historian.record(record.clone());
        notify(&self.observer, || ProxyServerEvent::TunnelClosed {
            server: self.options.name.clone(),
            record,
            active,
        });
    }
}

/// 隧道任务结束（包括 panic 或被取消）时从存活集合中移除
struct CloseGuard {
    server: Arc<ServerInner>,
    id: TunnelId,
    record: Option<ConnectionRecord>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.server.tunnel_did_close(self.id, self.record.take());
    }
}

/// 本地代理监听器
pub struct ProxyServer {
    inner: Arc<ServerInner>,
    listening: Mutex<Option<Listening>>,
}

impl ProxyServer {
    pub fn new(options: ProxyServerOptions, rules: Arc<RuleManager>) -> Self {
        Self::with_historian(options, rules, Arc::new(Historian::default()))
    }

    /// 多个监听器可以共用一个 `Historian`
    pub fn with_historian(
        options: ProxyServerOptions,
        rules: Arc<RuleManager>,
        historian: Arc<Historian>,
    ) -> Self {
        let observer = observer::proxy_server_observer(&options.name);
        Self {
            inner: Arc::new(ServerInner {
                options,
                rules,
                registry: TunnelRegistry::new(),
                historian,
                observer,
            }),
            listening: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn options(&self) -> &ProxyServerOptions {
        &self.inner.options
    }

    /// 绑定并开始接受连接，返回实际监听地址
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(listening) = self.listening.lock().as_ref() {
            return Ok(listening.local_addr);
        }

        let options = &self.inner.options;
        let bind = format!("{}:{}", options.address, options.port);
        let listener = TcpListener::bind((options.address.as_str(), options.port))
            .await
            .map_err(|e| TunnelError::connection_failed(bind.clone(), e))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let limiter = options.accept_rate.map(AcceptRateLimiter::new);
        let task = tokio::spawn(accept_loop(
            self.inner.clone(),
            listener,
            shutdown.clone(),
            limiter,
        ));

        let mut listening = self.listening.lock();
        if listening.is_some() {
            // 并发的 start 已经成功，放弃本次监听
            shutdown.cancel();
            return Ok(listening.as_ref().map(|l| l.local_addr).unwrap_or(local_addr));
        }
        *listening = Some(Listening {
            local_addr,
            shutdown,
            task,
        });
        drop(listening);

        info!(
            "{} listening on {} ({})",
            self.name(),
            local_addr,
            options.protocol
        );
        notify(&self.inner.observer, || ProxyServerEvent::Started {
            server: self.name().to_string(),
        });
        Ok(local_addr)
    }

    /// 停止接受新连接，强制关闭所有隧道并等待它们结束，最后释放监听端口
    ///
    /// 没有监听时也会关闭经 `did_accept_new_socket` 进入的隧道。
    pub async fn stop(&self) {
        let listening = self.listening.lock().take();
        let listener = match listening {
            Some(listening) => {
                listening.shutdown.cancel();
                Some(listening.task.await)
            }
            None => None,
        };

        let closing = self.inner.registry.force_close_all();
        if closing > 0 {
            info!("{} closing {} tunnels", self.name(), closing);
        }
        self.inner.registry.wait_empty().await;

        let Some(listener) = listener else {
            return;
        };
        match listener {
            Ok(listener) => drop(listener),
            Err(e) => error!("{} accept loop failed: {}", self.name(), e),
        }
        info!("{} stopped", self.name());
        notify(&self.inner.observer, || ProxyServerEvent::Stopped {
            server: self.name().to_string(),
        });
    }

    /// 由外部接受的原始套接字（如宿主隧道）进入本监听器
    pub fn did_accept_new_socket(&self, raw: Arc<dyn RawSocket>) -> TunnelId {
        self.inner.accept(raw)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().as_ref().map(|l| l.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.listening.lock().is_some()
    }

    /// 存活隧道的记录，按 id 排序
    pub fn dump(&self) -> Vec<ConnectionRecord> {
        self.inner.registry.dump()
    }

    pub fn tunnel_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn historian(&self) -> &Arc<Historian> {
        &self.inner.historian
    }

    pub fn force_close(&self, id: TunnelId) -> bool {
        match self.inner.registry.get(id) {
            Some(handle) => {
                handle.force_close();
                true
            }
            None => false,
        }
    }

    /// 强制关闭隧道并等待它离开存活集合，隧道不存在时返回 `false`
    ///
    /// 历史记录由隧道任务结束时写入。
    pub async fn remove_tunnel(&self, id: TunnelId) -> bool {
        let Some(handle) = self.inner.registry.get(id) else {
            return false;
        };
        handle.force_close();
        self.inner.registry.wait_removed(id).await;
        true
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("name", &self.inner.options.name)
            .field("local_addr", &self.local_addr())
            .field("tunnels", &self.tunnel_count())
            .finish()
    }
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    shutdown: CancellationToken,
    limiter: Option<AcceptRateLimiter>,
) -> TcpListener {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Some(limiter) = &limiter {
                        if let Err(wait) = limiter.check() {
                            warn!(
                                "{} rate limit exceeded, dropping {} (retry after {:?})",
                                inner.options.name, peer, wait
                            );
                            continue;
                        }
                    }
                    debug!("{} accepted connection from {}", inner.options.name, peer);
                    inner.accept(Arc::new(TcpSocket::from_stream(stream)));
                }
                Err(e) => {
                    error!("{} accept error: {}", inner.options.name, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    listener
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterFactory, DirectAdapterFactory};
    use crate::raw_socket::RawSocketFactory;
    use crate::tunnel::TunnelState;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn server() -> ProxyServer {
        let direct: Arc<dyn AdapterFactory> =
            Arc::new(DirectAdapterFactory::new("direct", RawSocketFactory::Tcp));
        let rules = Arc::new(RuleManager::new(vec![], Some(direct)));
        ProxyServer::new(
            ProxyServerOptions::new(ProxyProtocol::Socks5, "127.0.0.1", 0),
            rules,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let direct: Arc<dyn AdapterFactory> =
            Arc::new(DirectAdapterFactory::new("direct", RawSocketFactory::Tcp));
        let server = ProxyServer::new(
            ProxyServerOptions::new(ProxyProtocol::Http, "127.0.0.1", port),
            Arc::new(RuleManager::new(vec![], Some(direct))),
        );
        assert!(server.start().await.unwrap_err().is_connect());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_handshake_failure_goes_to_history() {
        let server = server();
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x04, 0x01]).await.unwrap();
        wait_until(|| server.historian().len() == 1).await;

        let record = &server.historian().records()[0];
        assert!(!record.established);
        assert!(record.closed);
        assert_eq!(server.tunnel_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_pending_tunnels() {
        let server = server();
        let addr = server.start().await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_until(|| server.tunnel_count() == 3).await;
        let ids: Vec<u64> = server.dump().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        server.stop().await;
        assert_eq!(server.tunnel_count(), 0);
        assert!(server.dump().is_empty());
        assert_eq!(server.historian().len(), 3);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_closes_running_tunnel() {
        let server = server();
        assert!(!server.remove_tunnel(42).await);

        let (local, _client) = tokio::io::duplex(64);
        let id = server.did_accept_new_socket(Arc::new(TcpSocket::from_transport(local, None)));
        let handle = server.inner.registry.get(id).unwrap();
        assert_eq!(server.tunnel_count(), 1);

        assert!(server.remove_tunnel(id).await);
        assert!(!server.remove_tunnel(id).await);
        assert_eq!(handle.state(), TunnelState::Closed);
        assert_eq!(server.tunnel_count(), 0);
        assert!(!server.force_close(id));

        let records = server.historian().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert!(records[0].closed);
        assert!(!records[0].established);
    }

    #[tokio::test]
    async fn test_stop_closes_externally_accepted_tunnels() {
        let server = server();
        let (local, _client) = tokio::io::duplex(64);
        let id = server.did_accept_new_socket(Arc::new(TcpSocket::from_transport(local, None)));
        let handle = server.inner.registry.get(id).unwrap();
        assert!(!server.is_running());

        server.stop().await;
        assert_eq!(server.tunnel_count(), 0);
        assert_eq!(handle.state(), TunnelState::Closed);
        assert_eq!(server.historian().len(), 1);
    }
}
