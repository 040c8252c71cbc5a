//! 事件总线
//!
//! 各组件在构造时向全局 `ObserverFactory` 请求观察者，未安装工厂时不产生任何事件。
//! 事件只是通知，观察者不能影响组件行为。

use crate::historian::ConnectionRecord;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// 隧道的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// 客户端一侧
    Proxy,
    /// 上游一侧
    Adapter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyServerEvent {
    Started { server: String },
    Stopped { server: String },
    Accepted { server: String, tunnel: u64, active: usize },
    TunnelClosed { server: String, record: ConnectionRecord, active: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Opened { tunnel: u64 },
    ReceivedRequest { tunnel: u64, request: String },
    ConnectedToRemote { tunnel: u64, adapter: String },
    Established { tunnel: u64 },
    DataRead { tunnel: u64, side: Side, bytes: usize },
    DataWritten { tunnel: u64, side: Side, bytes: usize },
    CloseCalled { tunnel: u64, side: Side },
    ForceCloseCalled { tunnel: u64 },
    Closed { tunnel: u64, rx: u64, tx: u64, empty: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySocketEvent {
    Opened { socket: String },
    HandshakeComplete { socket: String, request: String },
    Error { socket: String, error: String },
    Disconnected { socket: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSocketEvent {
    Opened { socket: String, request: String },
    HandshakeComplete { socket: String },
    Error { socket: String, error: String },
    Disconnected { socket: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatchEvent {
    RuleMatched { rule: String, request: String },
    RuleNotMatched { rule: String, request: String },
}

/// 事件观察者
pub trait Observer<E>: Send + Sync {
    fn signal(&self, event: E);
}

/// 观察者工厂，每类组件一个方法，缺省不观察
pub trait ObserverFactory: Send + Sync {
    fn proxy_server_observer(&self, _server: &str) -> Option<Arc<dyn Observer<ProxyServerEvent>>> {
        None
    }

    fn tunnel_observer(&self, _tunnel: u64) -> Option<Arc<dyn Observer<TunnelEvent>>> {
        None
    }

    fn proxy_socket_observer(&self, _socket: &str) -> Option<Arc<dyn Observer<ProxySocketEvent>>> {
        None
    }

    fn adapter_socket_observer(
        &self,
        _socket: &str,
    ) -> Option<Arc<dyn Observer<AdapterSocketEvent>>> {
        None
    }

    fn rule_observer(&self) -> Option<Arc<dyn Observer<RuleMatchEvent>>> {
        None
    }
}

static FACTORY: RwLock<Option<Arc<dyn ObserverFactory>>> = parking_lot::const_rwlock(None);

/// 安装进程级观察者工厂，只影响之后构造的组件
pub fn set_observer_factory(factory: Arc<dyn ObserverFactory>) {
    *FACTORY.write() = Some(factory);
}

pub fn clear_observer_factory() {
    *FACTORY.write() = None;
}

pub fn observer_factory() -> Option<Arc<dyn ObserverFactory>> {
    FACTORY.read().clone()
}

pub(crate) fn proxy_server_observer(server: &str) -> Option<Arc<dyn Observer<ProxyServerEvent>>> {
    observer_factory().and_then(|f| f.proxy_server_observer(server))
}

pub(crate) fn tunnel_observer(tunnel: u64) -> Option<Arc<dyn Observer<TunnelEvent>>> {
    observer_factory().and_then(|f| f.tunnel_observer(tunnel))
}

pub(crate) fn proxy_socket_observer(socket: &str) -> Option<Arc<dyn Observer<ProxySocketEvent>>> {
    observer_factory().and_then(|f| f.proxy_socket_observer(socket))
}

pub(crate) fn adapter_socket_observer(
    socket: &str,
) -> Option<Arc<dyn Observer<AdapterSocketEvent>>> {
    observer_factory().and_then(|f| f.adapter_socket_observer(socket))
}

pub(crate) fn rule_observer() -> Option<Arc<dyn Observer<RuleMatchEvent>>> {
    observer_factory().and_then(|f| f.rule_observer())
}

/// 有观察者时才构造事件
pub(crate) fn notify<E>(observer: &Option<Arc<dyn Observer<E>>>, event: impl FnOnce() -> E) {
    if let Some(observer) = observer {
        observer.signal(event());
    }
}

/// 把事件写入 tracing 日志的观察者工厂
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugObserverFactory;

struct DebugObserver;

impl ObserverFactory for DebugObserverFactory {
    fn proxy_server_observer(&self, _server: &str) -> Option<Arc<dyn Observer<ProxyServerEvent>>> {
        Some(Arc::new(DebugObserver))
    }

    fn tunnel_observer(&self, _tunnel: u64) -> Option<Arc<dyn Observer<TunnelEvent>>> {
        Some(Arc::new(DebugObserver))
    }

    fn proxy_socket_observer(&self, _socket: &str) -> Option<Arc<dyn Observer<ProxySocketEvent>>> {
        Some(Arc::new(DebugObserver))
    }

    fn adapter_socket_observer(
        &self,
        _socket: &str,
    ) -> Option<Arc<dyn Observer<AdapterSocketEvent>>> {
        Some(Arc::new(DebugObserver))
    }

    fn rule_observer(&self) -> Option<Arc<dyn Observer<RuleMatchEvent>>> {
        Some(Arc::new(DebugObserver))
    }
}

impl Observer<ProxyServerEvent> for DebugObserver {
    fn signal(&self, event: ProxyServerEvent) {
        match event {
            ProxyServerEvent::Started { server } => info!("{} started", server),
            ProxyServerEvent::Stopped { server } => info!("{} stopped", server),
            ProxyServerEvent::Accepted {
                server,
                tunnel,
                active,
            } => debug!("{} accepted tunnel #{} ({} active)", server, tunnel, active),
            ProxyServerEvent::TunnelClosed {
                server,
                record,
                active,
            } => debug!(
                "{} closed tunnel #{} {} ({} active)",
                server,
                record.id,
                record.description(),
                active
            ),
        }
    }
}

impl Observer<TunnelEvent> for DebugObserver {
    fn signal(&self, event: TunnelEvent) {
        match event {
            TunnelEvent::Closed {
                tunnel,
                empty: true,
                ..
            } => warn!("Tunnel #{} closed and didn't transfer any data", tunnel),
            TunnelEvent::Closed { tunnel, rx, tx, .. } => {
                debug!("Tunnel #{} closed (rx {} bytes, tx {} bytes)", tunnel, rx, tx)
            }
            TunnelEvent::DataRead { .. } | TunnelEvent::DataWritten { .. } => {
                trace!("{:?}", event)
            }
            other => debug!("{:?}", other),
        }
    }
}

impl Observer<ProxySocketEvent> for DebugObserver {
    fn signal(&self, event: ProxySocketEvent) {
        match event {
            ProxySocketEvent::Error { socket, error } => {
                warn!("Proxy socket {} error: {}", socket, error)
            }
            other => debug!("{:?}", other),
        }
    }
}

impl Observer<AdapterSocketEvent> for DebugObserver {
    fn signal(&self, event: AdapterSocketEvent) {
        match event {
            AdapterSocketEvent::Error { socket, error } => {
                warn!("Adapter socket {} error: {}", socket, error)
            }
            other => debug!("{:?}", other),
        }
    }
}

impl Observer<RuleMatchEvent> for DebugObserver {
    fn signal(&self, event: RuleMatchEvent) {
        match event {
            RuleMatchEvent::RuleMatched { rule, request } => {
                debug!("Rule {} matched {}", rule, request)
            }
            RuleMatchEvent::RuleNotMatched { rule, request } => {
                trace!("Rule {} did not match {}", rule, request)
            }
        }
    }
}
