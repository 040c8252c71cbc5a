use super::buffer::{ChunkSource, ReadBuffer};
use super::{RawSocket, ReadRequest, SocketState, Transport};
use crate::address::{Endpoint, Port};
use crate::error::{Result, TunnelError};
use crate::tls::{self, TlsSettings};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 宿主隧道连接的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Cancelled,
}

/// 宿主提供的隧道 TCP 连接
///
/// 读取以 `(min, max)` 区间表达，返回空数据表示对端关闭。
#[async_trait]
pub trait TunnelConnection: Send + Sync + 'static {
    fn state(&self) -> TunnelConnectionState;

    fn remote_endpoint(&self) -> Option<Endpoint>;

    async fn read_minimum(&self, min: usize, max: usize) -> io::Result<Bytes>;

    async fn write(&self, data: Bytes) -> io::Result<()>;

    /// 关闭写方向
    async fn write_close(&self) -> io::Result<()>;

    /// 立即取消连接
    fn cancel(&self);
}

/// 宿主隧道的出站连接创建者，返回时连接已就绪
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn create_tcp_connection(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsSettings>,
    ) -> Result<Arc<dyn TunnelConnection>>;
}

/// 把任意字节流适配为 `TunnelConnection`
pub struct StreamTunnelConnection<T> {
    reader: AsyncMutex<ReadHalf<T>>,
    writer: AsyncMutex<Option<WriteHalf<T>>>,
    state: Mutex<TunnelConnectionState>,
    remote: Option<Endpoint>,
    cancel: CancellationToken,
}

impl<T: Transport> StreamTunnelConnection<T> {
    pub fn new(stream: T, remote: Option<Endpoint>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: AsyncMutex::new(read_half),
            writer: AsyncMutex::new(Some(write_half)),
            state: Mutex::new(TunnelConnectionState::Connected),
            remote,
            cancel: CancellationToken::new(),
        }
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel connection cancelled")
}

#[async_trait]
impl<T: Transport> TunnelConnection for StreamTunnelConnection<T> {
    fn state(&self) -> TunnelConnectionState {
        *self.state.lock()
    }

    fn remote_endpoint(&self) -> Option<Endpoint> {
        self.remote.clone()
    }

    async fn read_minimum(&self, min: usize, max: usize) -> io::Result<Bytes> {
        let max = max.max(min).max(1);
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(max);

        let read = async {
            while buf.len() < min.max(1) {
                let n = reader.read_buf(&mut buf).await?;
                if n == 0 {
                    break;
                }
            }
            Ok::<_, io::Error>(())
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(aborted()),
            result = read => result?,
        }

        if buf.is_empty() {
            *self.state.lock() = TunnelConnectionState::Disconnected;
        }
        Ok(buf.freeze())
    }

    async fn write(&self, data: Bytes) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or_else(aborted)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(aborted()),
            result = async {
                half.write_all(&data).await?;
                half.flush().await
            } => result,
        }
    }

    async fn write_close(&self) -> io::Result<()> {
        match self.writer.lock().await.take() {
            Some(mut half) => half.shutdown().await,
            None => Ok(()),
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
        *self.state.lock() = TunnelConnectionState::Cancelled;
    }
}

/// 通过普通 TCP 创建隧道连接的提供者
#[derive(Debug, Default, Clone)]
pub struct TcpTunnelProvider;

#[async_trait]
impl TunnelProvider for TcpTunnelProvider {
    async fn create_tcp_connection(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsSettings>,
    ) -> Result<Arc<dyn TunnelConnection>> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port().value()))
            .await
            .map_err(|e| TunnelError::connection_failed(endpoint.to_string(), e))?;
        let remote = Some(endpoint.clone());

        let connection: Arc<dyn TunnelConnection> = match tls {
            Some(settings) => {
                let stream = tls::upgrade(stream, endpoint.host(), settings).await?;
                Arc::new(StreamTunnelConnection::new(stream, remote))
            }
            None => Arc::new(StreamTunnelConnection::new(stream, remote)),
        };
        Ok(connection)
    }
}

struct ConnectionSource(Arc<dyn TunnelConnection>);

#[async_trait]
impl ChunkSource for ConnectionSource {
    async fn next_chunk(&mut self, min: usize, max: usize) -> io::Result<Bytes> {
        self.0.read_minimum(min, max).await
    }
}

/// 基于宿主隧道连接的原始套接字
///
/// 没有来源地址；模式读取在用户态完成。
pub struct TunnelSocket {
    provider: Option<Arc<dyn TunnelProvider>>,
    connection: Mutex<Option<Arc<dyn TunnelConnection>>>,
    destination: Mutex<Option<Endpoint>>,
    state: Mutex<SocketState>,
    reader: AsyncMutex<ReadBuffer>,
    write_lock: AsyncMutex<()>,
    cancel: CancellationToken,
}

impl TunnelSocket {
    /// 创建出站套接字
    pub fn new(provider: Arc<dyn TunnelProvider>) -> Self {
        Self {
            provider: Some(provider),
            connection: Mutex::new(None),
            destination: Mutex::new(None),
            state: Mutex::new(SocketState::Idle),
            reader: AsyncMutex::new(ReadBuffer::new()),
            write_lock: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// 包装宿主交给引擎的已连接隧道连接
    pub fn from_connection(connection: Arc<dyn TunnelConnection>) -> Self {
        Self {
            provider: None,
            destination: Mutex::new(connection.remote_endpoint()),
            connection: Mutex::new(Some(connection)),
            state: Mutex::new(SocketState::Connected),
            reader: AsyncMutex::new(ReadBuffer::new()),
            write_lock: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    fn connection(&self) -> Result<Arc<dyn TunnelConnection>> {
        self.connection.lock().clone().ok_or_else(|| {
            TunnelError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel connection is not established",
            ))
        })
    }

    fn set_state(&self, state: SocketState) {
        *self.state.lock() = state;
    }
}

impl fmt::Debug for TunnelSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSocket")
            .field("state", &*self.state.lock())
            .field("destination", &*self.destination.lock())
            .finish()
    }
}

#[async_trait]
impl RawSocket for TunnelSocket {
    fn state(&self) -> SocketState {
        *self.state.lock()
    }

    fn source_endpoint(&self) -> Option<Endpoint> {
        None
    }

    fn destination_endpoint(&self) -> Option<Endpoint> {
        self.destination.lock().clone()
    }

    async fn connect(&self, host: &str, port: Port, tls: Option<&TlsSettings>) -> Result<()> {
        let Some(provider) = self.provider.clone() else {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "accepted tunnel socket cannot connect",
            )));
        };
        {
            let mut state = self.state.lock();
            if *state != SocketState::Idle {
                return Err(TunnelError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("socket is {}, cannot connect", *state),
                )));
            }
            *state = SocketState::Connecting;
        }

        let endpoint = Endpoint::new(host, port);
        *self.destination.lock() = Some(endpoint.clone());

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled),
            result = provider.create_tcp_connection(&endpoint, tls) => result,
        };

        match result {
            Ok(connection) => {
                debug!("Tunnel connection established to {}", endpoint);
                *self.connection.lock() = Some(connection);
                self.set_state(SocketState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(SocketState::Disconnected);
                Err(e)
            }
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<Bytes> {
        let connection = self.connection()?;
        let mut buffer = self.reader.lock().await;
        let mut source = ConnectionSource(connection);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled),
            result = buffer.read(&mut source, &request) => result,
        }
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let connection = self.connection()?;
        let _guard = self.write_lock.lock().await;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled),
            result = connection.write(data) => result.map_err(TunnelError::from),
        }
    }

    async fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SocketState::Disconnecting | SocketState::Disconnected) {
                return;
            }
            *state = SocketState::Disconnecting;
        }

        if let Ok(connection) = self.connection() {
            let _guard = self.write_lock.lock().await;
            if let Err(e) = connection.write_close().await {
                debug!("Closing tunnel write side failed: {}", e);
            }
            connection.cancel();
        }
        self.cancel.cancel();
        self.set_state(SocketState::Disconnected);
    }

    fn force_disconnect(&self) {
        self.cancel.cancel();
        if let Some(connection) = self.connection.lock().take() {
            connection.cancel();
        }
        self.set_state(SocketState::Disconnected);
    }
}
