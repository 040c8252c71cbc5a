/// 自定义错误类型
///
/// 使用 thiserror 定义引擎内的错误分类，调用者可以据此区分握手、连接、路由等失败
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 代理隧道引擎的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 前端或上游协议握手失败（格式错误、不支持的命令/地址类型、认证失败）
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// 无法建立到目标或上游的连接（包括被拒绝）
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 路由错误
    #[error("Routing error: {0}")]
    Routing(String),

    /// 探测超时
    #[error("Probe timeout after {duration:?}")]
    ProbeTimeout { duration: Duration },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS 错误
    #[error("TLS error: {0}")]
    Tls(String),

    /// 操作被强制关闭打断
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建握手错误
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            addr: addr.into(),
            source,
        }
    }

    /// 创建路由错误
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// 创建探测超时错误
    pub fn probe_timeout(duration: Duration) -> Self {
        Self::ProbeTimeout { duration }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建 TLS 错误
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// 检查是否为握手错误
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// 检查是否为连接错误
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    /// 检查是否为超时（探测超时或底层连接超时）
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::ProbeTimeout { .. } => true,
            Self::Connect { source, .. } | Self::Io(source) => {
                source.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }

    /// 检查是否为强制关闭
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// 底层 I/O 错误类型
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Connect { source, .. } | Self::Io(source) => Some(source.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_error() {
        let err = TunnelError::handshake("Unsupported SOCKS version: 4");
        assert!(err.is_handshake());
        assert!(!err.is_connect());
        assert_eq!(
            err.to_string(),
            "Handshake error: Unsupported SOCKS version: 4"
        );
    }

    #[test]
    fn test_probe_timeout() {
        let err = TunnelError::probe_timeout(Duration::from_secs(2));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connection_failed("127.0.0.1:8080", io_err);
        assert!(err.is_connect());
        assert!(!err.is_timeout());
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }

    #[test]
    fn test_connect_timeout_is_timeout() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let err = TunnelError::connection_failed("10.0.0.1:80", io_err);
        assert!(err.is_timeout());
    }

    #[test]
    fn test_error_is_checks() {
        let config_err = TunnelError::config_error("test");
        let cancelled = TunnelError::Cancelled;

        assert!(config_err.is_config_error());
        assert!(!config_err.is_handshake());
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_timeout());
        assert_eq!(cancelled.io_kind(), None);
    }
}
