use crate::adapter::AdapterSocket;
use crate::error::{Result, TunnelError};
use crate::historian::ConnectionRecord;
use crate::observer::{self, notify, Observer, Side, TunnelEvent};
use crate::proxy_socket::ProxySocket;
use crate::raw_socket::RawSocket;
use crate::rule::RuleManager;
use crate::session::ProxyProtocol;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type TunnelId = u64;

/// 隧道状态，只会向前推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TunnelState {
    Opening,
    Established,
    Closing,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Opening => "opening",
            TunnelState::Established => "established",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 隧道计数器与描述，由隧道任务更新，`dump()` 只读
#[derive(Debug)]
pub struct TunnelStats {
    id: TunnelId,
    protocol: ProxyProtocol,
    rx: AtomicU64,
    tx: AtomicU64,
    opened_at: u64,
    started: Instant,
    destination: RwLock<Option<String>>,
    adapter: RwLock<Option<String>>,
    established: AtomicBool,
}

impl TunnelStats {
    fn new(id: TunnelId, protocol: ProxyProtocol) -> Self {
        let opened_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            id,
            protocol,
            rx: AtomicU64::new(0),
            tx: AtomicU64::new(0),
            opened_at,
            started: Instant::now(),
            destination: RwLock::new(None),
            adapter: RwLock::new(None),
            established: AtomicBool::new(false),
        }
    }

    pub fn rx(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    pub fn tx(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, closed: bool) -> ConnectionRecord {
        ConnectionRecord {
            id: self.id,
            protocol: Some(self.protocol),
            destination: self.destination.read().clone(),
            adapter: self.adapter.read().clone(),
            rx: self.rx(),
            tx: self.tx(),
            opened_at: self.opened_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            established: self.established.load(Ordering::Acquire),
            closed,
        }
    }
}

/// 隧道外部句柄：查询状态、强制关闭
#[derive(Clone)]
pub struct TunnelHandle {
    id: TunnelId,
    stats: Arc<TunnelStats>,
    cancel: CancellationToken,
    state: watch::Receiver<TunnelState>,
    observer: Option<Arc<dyn Observer<TunnelEvent>>>,
}

impl TunnelHandle {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.stats
    }

    pub fn record(&self) -> ConnectionRecord {
        self.stats.snapshot(self.state() == TunnelState::Closed)
    }

    /// 立即中断隧道，进行中的读写被丢弃
    pub fn force_close(&self) {
        if !self.cancel.is_cancelled() {
            notify(&self.observer, || TunnelEvent::ForceCloseCalled { tunnel: self.id });
            self.cancel.cancel();
        }
    }

    /// 等待隧道进入 `Closed`
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == TunnelState::Closed).await;
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// 一侧 EOF 后等待另一方向写完的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 单方向转发的结束方式
enum PumpEnd {
    Eof,
    Failed(TunnelError),
    /// 另一方向已结束，本方向在两次读之间停下
    Drained,
}

enum RelayEnd {
    Cancelled,
    Idle,
    Pump(Side, PumpEnd),
}

/// 两个方向共享的最近一次读到数据的时间
struct Activity {
    base: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self, timeout: Duration) -> Instant {
        self.base + Duration::from_millis(self.last_ms.load(Ordering::Relaxed)) + timeout
    }
}

/// 客户端与上游之间的一条转发隧道
pub struct Tunnel {
    id: TunnelId,
    proxy: Box<dyn ProxySocket>,
    adapter: Option<Box<dyn AdapterSocket>>,
    rules: Arc<RuleManager>,
    stats: Arc<TunnelStats>,
    cancel: CancellationToken,
    state: watch::Sender<TunnelState>,
    idle_timeout: Option<Duration>,
    observer: Option<Arc<dyn Observer<TunnelEvent>>>,
}

impl Tunnel {
    pub fn new(
        id: TunnelId,
        proxy: Box<dyn ProxySocket>,
        rules: Arc<RuleManager>,
    ) -> (Self, TunnelHandle) {
        let stats = Arc::new(TunnelStats::new(id, proxy.protocol()));
        let cancel = CancellationToken::new();
        let (state, state_rx) = watch::channel(TunnelState::Opening);
        let observer = observer::tunnel_observer(id);
        notify(&observer, || TunnelEvent::Opened { tunnel: id });

        let handle = TunnelHandle {
            id,
            stats: stats.clone(),
            cancel: cancel.clone(),
            state: state_rx,
            observer: observer.clone(),
        };
        let tunnel = Self {
            id,
            proxy,
            adapter: None,
            rules,
            stats,
            cancel,
            state,
            idle_timeout: None,
            observer,
        };
        (tunnel, handle)
    }

    /// 两个方向都在该时间内没有数据才关闭，缺省不限制
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    fn set_state(&self, state: TunnelState) {
        self.state.send_replace(state);
    }

    /// 运行隧道直到关闭，返回最终记录
    pub async fn run(mut self) -> ConnectionRecord {
        let cancel = self.cancel.clone();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = self.open() => result,
        };

        match opened {
            Ok(()) => {
                self.stats.established.store(true, Ordering::Release);
                self.set_state(TunnelState::Established);
                notify(&self.observer, || TunnelEvent::Established { tunnel: self.id });
                self.relay().await;
            }
            Err(e) => {
                debug!("Tunnel #{} failed to open: {}", self.id, e);
                self.force_close_sockets();
            }
        }

        self.set_state(TunnelState::Closed);
        let record = self.stats.snapshot(true);
        notify(&self.observer, || TunnelEvent::Closed {
            tunnel: self.id,
            rx: record.rx,
            tx: record.tx,
            empty: record.is_empty(),
        });
        record
    }

    async fn open(&mut self) -> Result<()> {
        let request = self.proxy.open().await?;
        *self.stats.destination.write() = Some(request.to_string());
        notify(&self.observer, || TunnelEvent::ReceivedRequest {
            tunnel: self.id,
            request: request.to_string(),
        });

        let adapter = self
            .rules
            .match_route(&request)
            .and_then(|factory| factory.adapter_for(&request));
        let mut adapter = match adapter {
            Ok(adapter) => adapter,
            Err(e) => return Err(self.reject(e).await),
        };
        let description = adapter.description().to_string();
        *self.stats.adapter.write() = Some(description.clone());

        let result = adapter.open(&request).await;
        let remote = adapter.raw().clone();
        self.adapter = Some(adapter);
        if let Err(e) = result {
            return Err(self.reject(e).await);
        }
        notify(&self.observer, || TunnelEvent::ConnectedToRemote {
            tunnel: self.id,
            adapter: description,
        });

        self.proxy.respond(Ok(())).await?;

        // 握手时读到的首包（如普通 HTTP 请求头）计入 rx
        if let Some(payload) = self.proxy.take_initial_payload() {
            self.stats.rx.fetch_add(payload.len() as u64, Ordering::Relaxed);
            remote.write(payload).await?;
        }
        Ok(())
    }

    /// 回复客户端连接失败，回复本身的错误被忽略
    async fn reject(&mut self, error: TunnelError) -> TunnelError {
        if let Err(e) = self.proxy.respond(Err(&error)).await {
            debug!("Tunnel #{} failed to report error to client: {}", self.id, e);
        }
        error
    }

    async fn relay(&self) {
        let Some(adapter) = self.adapter.as_ref() else {
            return;
        };
        let proxy_raw = self.proxy.raw().clone();
        let adapter_raw = adapter.raw().clone();
        let activity = Activity::new();
        let drain = CancellationToken::new();

        let upstream = pump(
            &proxy_raw,
            &adapter_raw,
            Side::Proxy,
            &self.stats.rx,
            &activity,
            &drain,
            self.id,
            &self.observer,
        );
        let downstream = pump(
            &adapter_raw,
            &proxy_raw,
            Side::Adapter,
            &self.stats.tx,
            &activity,
            &drain,
            self.id,
            &self.observer,
        );
        tokio::pin!(upstream, downstream);

        let ended = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => RelayEnd::Cancelled,
            end = &mut upstream => RelayEnd::Pump(Side::Proxy, end),
            end = &mut downstream => RelayEnd::Pump(Side::Adapter, end),
            _ = idle_watch(&activity, self.idle_timeout) => RelayEnd::Idle,
        };

        self.set_state(TunnelState::Closing);
        match ended {
            RelayEnd::Pump(side, PumpEnd::Eof) => {
                debug!("Tunnel #{} got EOF from {:?} side", self.id, side);
                // 另一方向只完成当前这次写，不再读新数据
                drain.cancel();
                let finished = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => false,
                    end = &mut downstream, if side == Side::Proxy => {
                        !matches!(end, PumpEnd::Failed(_))
                    }
                    end = &mut upstream, if side == Side::Adapter => {
                        !matches!(end, PumpEnd::Failed(_))
                    }
                    _ = tokio::time::sleep(DRAIN_TIMEOUT) => false,
                };
                if finished {
                    self.close_after_eof(side).await;
                } else {
                    self.force_close_sockets();
                }
            }
            RelayEnd::Pump(side, PumpEnd::Failed(e)) => {
                debug!("Tunnel #{} {:?} side failed: {}", self.id, side, e);
                self.force_close_sockets();
            }
            RelayEnd::Pump(_, PumpEnd::Drained) | RelayEnd::Cancelled => {
                self.force_close_sockets();
            }
            RelayEnd::Idle => {
                debug!(
                    "Tunnel #{} idle for {:?} in both directions",
                    self.id, self.idle_timeout
                );
                self.force_close_sockets();
            }
        }
    }

    /// 一侧读到 EOF：另一侧在写完后正常关闭，EOF 一侧强制关闭
    async fn close_after_eof(&self, eof_side: Side) {
        let other = match eof_side {
            Side::Proxy => Side::Adapter,
            Side::Adapter => Side::Proxy,
        };
        notify(&self.observer, || TunnelEvent::CloseCalled {
            tunnel: self.id,
            side: other,
        });

        let graceful = async {
            match other {
                Side::Proxy => self.proxy.disconnect().await,
                Side::Adapter => {
                    if let Some(adapter) = &self.adapter {
                        adapter.disconnect().await
                    }
                }
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = graceful => {}
        }
        self.force_close_sockets();
    }

    fn force_close_sockets(&self) {
        self.proxy.force_disconnect();
        if let Some(adapter) = &self.adapter {
            adapter.force_disconnect();
        }
    }
}

/// 从 `from` 读、向 `to` 写，写完成后才读下一块
#[allow(clippy::too_many_arguments)]
async fn pump(
    from: &Arc<dyn RawSocket>,
    to: &Arc<dyn RawSocket>,
    side: Side,
    counter: &AtomicU64,
    activity: &Activity,
    drain: &CancellationToken,
    tunnel: TunnelId,
    observer: &Option<Arc<dyn Observer<TunnelEvent>>>,
) -> PumpEnd {
    loop {
        let read = tokio::select! {
            biased;
            _ = drain.cancelled() => return PumpEnd::Drained,
            read = from.read_data() => read,
        };
        let data = match read {
            Ok(data) if data.is_empty() => return PumpEnd::Eof,
            Ok(data) => data,
            Err(e) => return PumpEnd::Failed(e),
        };
        activity.touch();

        let len = data.len();
        counter.fetch_add(len as u64, Ordering::Relaxed);
        notify(observer, || TunnelEvent::DataRead {
            tunnel,
            side,
            bytes: len,
        });

        if let Err(e) = to.write(data).await {
            return PumpEnd::Failed(e);
        }
        notify(observer, || TunnelEvent::DataWritten {
            tunnel,
            side,
            bytes: len,
        });
    }
}

/// 两个方向都超过 `timeout` 没有读到数据时返回，`None` 表示永不返回
async fn idle_watch(activity: &Activity, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending::<()>().await;
    };
    loop {
        let deadline = activity.deadline(timeout);
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline.into()).await;
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("proxy", &self.proxy.description())
            .field(
                "adapter",
                &self.adapter.as_ref().map(|a| a.description().to_string()),
            )
            .field("state", &*self.state.borrow())
            .finish()
    }
}
