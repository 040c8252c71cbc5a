mod http;
pub(crate) mod socks5;

pub use http::{HttpHeader, HttpProxySocket, MAX_HEADER_SIZE};
pub use socks5::Socks5ProxySocket;

use crate::error::{Result, TunnelError};
use crate::observer::{self, notify, Observer, ProxySocketEvent};
use crate::raw_socket::RawSocket;
use crate::session::{ConnectionRequest, Credentials, ProxyProtocol};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 客户端一侧的代理套接字
///
/// 负责前端协议握手，产生 `ConnectionRequest`，并在上游连接结果确定后回复客户端。
#[async_trait]
pub trait ProxySocket: Send + Sync + fmt::Debug {
    fn protocol(&self) -> ProxyProtocol;

    fn raw(&self) -> &Arc<dyn RawSocket>;

    fn description(&self) -> &str;

    /// 握手完成后的请求
    fn request(&self) -> Option<&ConnectionRequest>;

    /// 完成前端握手
    async fn open(&mut self) -> Result<ConnectionRequest>;

    /// 上游连接成功或失败后回复客户端，握手未完成时不做任何事
    async fn respond(&mut self, outcome: std::result::Result<(), &TunnelError>) -> Result<()>;

    /// 握手中读到、需要作为首包发往上游的数据
    fn take_initial_payload(&mut self) -> Option<Bytes> {
        None
    }

    async fn disconnect(&self);

    fn force_disconnect(&self);
}

/// 按监听协议创建代理套接字
pub fn create_proxy_socket(
    protocol: ProxyProtocol,
    raw: Arc<dyn RawSocket>,
    auth: Option<Credentials>,
) -> Box<dyn ProxySocket> {
    match protocol {
        ProxyProtocol::Socks5 => Box::new(Socks5ProxySocket::new(raw, auth)),
        ProxyProtocol::Http => Box::new(HttpProxySocket::new(raw)),
    }
}

/// 代理套接字的公共部分：原始套接字、描述和观察者
pub(crate) struct ProxySocketCore {
    raw: Arc<dyn RawSocket>,
    description: String,
    observer: Option<Arc<dyn Observer<ProxySocketEvent>>>,
    disconnected: AtomicBool,
}

impl ProxySocketCore {
    pub(crate) fn new(raw: Arc<dyn RawSocket>, protocol: ProxyProtocol) -> Self {
        let peer = raw
            .source_endpoint()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "tunnel".into());
        let description = format!("{}<{}>", protocol, peer);
        let observer = observer::proxy_socket_observer(&description);
        notify(&observer, || ProxySocketEvent::Opened {
            socket: description.clone(),
        });

        Self {
            raw,
            description,
            observer,
            disconnected: AtomicBool::new(false),
        }
    }

    pub(crate) fn raw(&self) -> &Arc<dyn RawSocket> {
        &self.raw
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn handshake_complete(&self, request: &ConnectionRequest) {
        notify(&self.observer, || ProxySocketEvent::HandshakeComplete {
            socket: self.description.clone(),
            request: request.to_string(),
        });
    }

    pub(crate) fn failed(&self, error: TunnelError) -> TunnelError {
        notify(&self.observer, || ProxySocketEvent::Error {
            socket: self.description.clone(),
            error: error.to_string(),
        });
        error
    }

    fn mark_disconnected(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            notify(&self.observer, || ProxySocketEvent::Disconnected {
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

impl fmt::Debug for ProxySocketCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySocketCore")
            .field("description", &self.description)
            .field("raw", &self.raw)
            .finish()
    }
}
