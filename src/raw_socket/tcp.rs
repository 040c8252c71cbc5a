use super::buffer::{ChunkSource, ReadBuffer};
use super::{RawSocket, ReadRequest, SocketState, Transport};
use crate::address::{Endpoint, Port};
use crate::error::{Result, TunnelError};
use crate::tls::{self, TlsSettings};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type BoxedStream = Box<dyn Transport>;

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

struct TcpReader {
    half: Option<ReadHalf<BoxedStream>>,
    buffer: ReadBuffer,
}

struct HalfSource<'a>(&'a mut ReadHalf<BoxedStream>);

#[async_trait]
impl<'a> ChunkSource for HalfSource<'a> {
    async fn next_chunk(&mut self, _min: usize, max: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(max.max(1));
        self.0.read_buf(&mut buf).await?;
        Ok(buf.freeze())
    }
}

/// 基于 tokio TcpStream 的原始套接字
///
/// 读写两半各自加锁，可以同时进行一个读和一个写。
pub struct TcpSocket {
    state: Mutex<SocketState>,
    source: Option<Endpoint>,
    destination: Mutex<Option<Endpoint>>,
    reader: AsyncMutex<TcpReader>,
    writer: AsyncMutex<Option<WriteHalf<BoxedStream>>>,
    cancel: CancellationToken,
}

impl TcpSocket {
    /// 创建未连接的套接字，随后调用 `connect`
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SocketState::Idle),
            source: None,
            destination: Mutex::new(None),
            reader: AsyncMutex::new(TcpReader {
                half: None,
                buffer: ReadBuffer::new(),
            }),
            writer: AsyncMutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// 包装监听器接受的连接
    pub fn from_stream(stream: TcpStream) -> Self {
        configure_stream(&stream);
        let source = stream.peer_addr().ok().map(Endpoint::from);
        Self::from_transport(stream, source)
    }

    /// 包装任意已连接的字节流
    pub fn from_transport(stream: impl Transport, source: Option<Endpoint>) -> Self {
        let (read_half, write_half) = tokio::io::split(Box::new(stream) as BoxedStream);
        Self {
            state: Mutex::new(SocketState::Connected),
            source,
            destination: Mutex::new(None),
            reader: AsyncMutex::new(TcpReader {
                half: Some(read_half),
                buffer: ReadBuffer::new(),
            }),
            writer: AsyncMutex::new(Some(write_half)),
            cancel: CancellationToken::new(),
        }
    }

    fn set_state(&self, state: SocketState) {
        *self.state.lock() = state;
    }

    async fn open_stream(host: &str, port: Port, tls: Option<&TlsSettings>) -> Result<BoxedStream> {
        let addr = Endpoint::new(host, port).to_string();
        let stream = TcpStream::connect((host, port.value()))
            .await
            .map_err(|e| TunnelError::connection_failed(&addr, e))?;
        configure_stream(&stream);
        debug!("TCP connection established to {}", addr);

        match tls {
            Some(settings) => Ok(Box::new(tls::upgrade(stream, host, settings).await?)),
            None => Ok(Box::new(stream)),
        }
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSocket")
            .field("state", &*self.state.lock())
            .field("source", &self.source)
            .field("destination", &*self.destination.lock())
            .finish()
    }
}

#[async_trait]
impl RawSocket for TcpSocket {
    fn state(&self) -> SocketState {
        *self.state.lock()
    }

    fn source_endpoint(&self) -> Option<Endpoint> {
        self.source.clone()
    }

    fn destination_endpoint(&self) -> Option<Endpoint> {
        self.destination.lock().clone()
    }

    async fn connect(&self, host: &str, port: Port, tls: Option<&TlsSettings>) -> Result<()> {
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
        *self.destination.lock() = Some(Endpoint::new(host, port));

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled),
            result = Self::open_stream(host, port, tls) => result,
        };

        match result {
            Ok(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                self.reader.lock().await.half = Some(read_half);
                *self.writer.lock().await = Some(write_half);
                // 连接期间可能已被强制关闭
                if self.cancel.is_cancelled() {
                    return Err(TunnelError::Cancelled);
                }
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
        let mut guard = self.reader.lock().await;
        let TcpReader { half, buffer } = &mut *guard;
        let Some(half) = half.as_mut() else {
            return Err(not_connected());
        };
        let mut source = HalfSource(half);

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
        let mut guard = self.writer.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(not_connected());
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TunnelError::Cancelled),
            result = async {
                half.write_all(&data).await?;
                half.flush().await
            } => result.map_err(TunnelError::from),
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

        // 拿到写锁即表示进行中的写已完成
        if let Some(mut half) = self.writer.lock().await.take() {
            if let Err(e) = half.shutdown().await {
                debug!("Shutdown of write half failed: {}", e);
            }
        }
        self.cancel.cancel();
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.half = None;
        }
        self.set_state(SocketState::Disconnected);
    }

    fn force_disconnect(&self) {
        self.cancel.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.half = None;
        }
        self.set_state(SocketState::Disconnected);
    }
}

fn not_connected() -> TunnelError {
    TunnelError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "socket is not connected",
    ))
}

fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}
