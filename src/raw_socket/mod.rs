mod buffer;
pub mod scanner;
mod tcp;
mod tunnel;

pub use scanner::{ScanResult, StreamScanner};
pub use tcp::TcpSocket;
pub use tunnel::{
    StreamTunnelConnection, TcpTunnelProvider, TunnelConnection, TunnelConnectionState,
    TunnelProvider, TunnelSocket,
};

use crate::address::{Endpoint, Port};
use crate::error::Result;
use crate::tls::TlsSettings;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// 单次读取的最大字节数
pub const MAX_READ_SIZE: usize = 64 * 1024;

/// 双工字节流抽象
///
/// 任何满足条件的流（TcpStream、TLS 流、内存管道）都可作为原始套接字的底层
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 读请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRequest {
    /// 读取任意可用数据，空结果表示对端关闭
    Any,
    /// 读取恰好 n 字节
    Exactly(usize),
    /// 读取直到分隔符（含分隔符），超过 `max_len` 仍未找到则失败
    Until { pattern: Bytes, max_len: usize },
}

impl ReadRequest {
    pub fn until(pattern: impl Into<Bytes>, max_len: usize) -> Self {
        Self::Until {
            pattern: pattern.into(),
            max_len,
        }
    }
}

/// 原始套接字状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::Idle => "idle",
            SocketState::Connecting => "connecting",
            SocketState::Connected => "connected",
            SocketState::Disconnecting => "disconnecting",
            SocketState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// 原始 TCP 套接字接口
///
/// 调用方保证同一时刻最多一个读和一个写在进行中。
/// 所有操作都会被 `force_disconnect` 立即打断并返回 `TunnelError::Cancelled`。
#[async_trait]
pub trait RawSocket: Send + Sync + fmt::Debug {
    /// 当前状态
    fn state(&self) -> SocketState;

    /// 本端看到的对端地址（接受的连接才有）
    fn source_endpoint(&self) -> Option<Endpoint>;

    /// 主动连接的远端地址
    fn destination_endpoint(&self) -> Option<Endpoint>;

    /// 连接远端；`tls` 存在时在返回前完成 TLS 握手
    async fn connect(&self, host: &str, port: Port, tls: Option<&TlsSettings>) -> Result<()>;

    async fn read(&self, request: ReadRequest) -> Result<Bytes>;

    /// 写入全部数据，空数据立即完成
    async fn write(&self, data: Bytes) -> Result<()>;

    /// 等待进行中的写完成后关闭
    async fn disconnect(&self);

    /// 立即关闭，丢弃进行中的读写
    fn force_disconnect(&self);

    fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    async fn read_data(&self) -> Result<Bytes> {
        self.read(ReadRequest::Any).await
    }

    async fn read_exactly(&self, length: usize) -> Result<Bytes> {
        self.read(ReadRequest::Exactly(length)).await
    }

    async fn read_until(&self, pattern: &'static [u8], max_len: usize) -> Result<Bytes> {
        self.read(ReadRequest::until(pattern, max_len)).await
    }
}

/// 原始套接字工厂，构造时决定使用哪种底层实现
#[derive(Clone, Default)]
pub enum RawSocketFactory {
    /// 操作系统 TCP（tokio）
    #[default]
    Tcp,
    /// 宿主提供的隧道连接
    Tunnel(Arc<dyn TunnelProvider>),
}

impl RawSocketFactory {
    pub fn create(&self) -> Arc<dyn RawSocket> {
        match self {
            RawSocketFactory::Tcp => Arc::new(TcpSocket::new()),
            RawSocketFactory::Tunnel(provider) => Arc::new(TunnelSocket::new(provider.clone())),
        }
    }
}

impl fmt::Debug for RawSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawSocketFactory::Tcp => f.write_str("Tcp"),
            RawSocketFactory::Tunnel(_) => f.write_str("Tunnel"),
        }
    }
}
