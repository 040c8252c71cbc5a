/// Proxy Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod adapter;
pub mod address;
pub mod cli;
pub mod config;
pub mod error;
pub mod historian;
pub mod observer;
pub mod proxy_socket;
pub mod rate_limiter;
pub mod raw_socket;
pub mod rule;
pub mod server;
pub mod service;
pub mod session;
pub mod stats;
pub mod tls;
pub mod tunnel;

// 重新导出常用类型
pub use adapter::{AdapterFactory, AdapterFactoryManager, AdapterSocket, SelectAdapterFactory};
pub use address::{Endpoint, IpAddress, Port};
pub use config::AppConfig;
pub use error::{Result, TunnelError};
pub use historian::{ConnectionRecord, Historian};
pub use proxy_socket::ProxySocket;
pub use raw_socket::{RawSocket, RawSocketFactory, TcpSocket, TunnelSocket};
pub use rule::{Rule, RuleManager};
pub use server::{ProxyServer, ProxyServerOptions};
pub use service::ProxyService;
pub use session::{ConnectionRequest, Credentials, ProxyProtocol};
pub use tunnel::{Tunnel, TunnelHandle, TunnelId, TunnelState};
