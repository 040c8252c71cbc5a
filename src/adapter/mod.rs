mod direct;
mod http;
mod reject;
mod select;
mod socks5;

pub use direct::{DirectAdapter, DirectAdapterFactory};
pub use http::{HttpAdapter, HttpAdapterFactory};
pub use reject::{RejectAdapter, RejectAdapterFactory};
pub use select::{HttpProber, Prober, SelectAdapterFactory, ServerStatus, DEFAULT_PROBE_URL};
pub use socks5::{Socks5Adapter, Socks5AdapterFactory};

use crate::error::{Result, TunnelError};
use crate::observer::{self, notify, AdapterSocketEvent, Observer};
use crate::raw_socket::RawSocket;
use crate::session::ConnectionRequest;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 上游一侧的适配器套接字
///
/// `open` 返回时到目标的通道已经可用（直连已连接，或上游代理握手已完成）。
#[async_trait]
pub trait AdapterSocket: Send + Sync + fmt::Debug {
    fn raw(&self) -> &Arc<dyn RawSocket>;

    fn description(&self) -> &str;

    async fn open(&mut self, request: &ConnectionRequest) -> Result<()>;

    async fn disconnect(&self);

    fn force_disconnect(&self);
}

/// 适配器工厂：为每个请求创建一个新的适配器套接字
pub trait AdapterFactory: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn adapter_for(&self, request: &ConnectionRequest) -> Result<Box<dyn AdapterSocket>>;
}

/// 按 id 管理所有适配器工厂
#[derive(Debug, Default)]
pub struct AdapterFactoryManager {
    factories: BTreeMap<String, Arc<dyn AdapterFactory>>,
    selectors: BTreeMap<String, Arc<SelectAdapterFactory>>,
}

impl AdapterFactoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(factory.id().to_string(), factory);
    }

    pub fn insert_selector(&mut self, selector: Arc<SelectAdapterFactory>) {
        self.factories
            .insert(selector.id().to_string(), selector.clone());
        self.selectors.insert(selector.id().to_string(), selector);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<dyn AdapterFactory>> {
        self.get(id)
            .ok_or_else(|| TunnelError::config_error(format!("Unknown adapter '{}'", id)))
    }

    pub fn selector(&self, id: &str) -> Option<Arc<SelectAdapterFactory>> {
        self.selectors.get(id).cloned()
    }

    pub fn selectors(&self) -> impl Iterator<Item = &Arc<SelectAdapterFactory>> {
        self.selectors.values()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// 适配器套接字的公共部分
pub(crate) struct AdapterSocketCore {
    raw: Arc<dyn RawSocket>,
    description: String,
    observer: Option<Arc<dyn Observer<AdapterSocketEvent>>>,
    disconnected: AtomicBool,
}

impl AdapterSocketCore {
    pub(crate) fn new(raw: Arc<dyn RawSocket>, description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            observer: observer::adapter_socket_observer(&description),
            raw,
            description,
            disconnected: AtomicBool::new(false),
        }
    }

    pub(crate) fn raw(&self) -> &Arc<dyn RawSocket> {
        &self.raw
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn opened(&self, request: &ConnectionRequest) {
        notify(&self.observer, || AdapterSocketEvent::Opened {
            socket: self.description.clone(),
            request: request.to_string(),
        });
    }

    /// 记录 `open` 的结果，失败时立即关闭原始套接字
    pub(crate) fn finish(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                notify(&self.observer, || AdapterSocketEvent::HandshakeComplete {
                    socket: self.description.clone(),
                });
                Ok(())
            }
            Err(e) => {
                notify(&self.observer, || AdapterSocketEvent::Error {
                    socket: self.description.clone(),
                    error: e.to_string(),
                });
                self.raw.force_disconnect();
                Err(e)
            }
        }
    }

    fn mark_disconnected(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            notify(&self.observer, || AdapterSocketEvent::Disconnected {
                socket: self.description.clone(),
            });
        }
    }

    pub(crate) async fn disconnect(&self) {
        self.raw.disconnect().await;
        self.mark_disconnected();
    }

    pub(crate) fn force_disconnect(&self) {
        self.raw.force_disconnect();
        self.mark_disconnected();
    }
}

impl fmt::Debug for AdapterSocketCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSocketCore")
            .field("description", &self.description)
            .field("raw", &self.raw)
            .finish()
    }
}
