//! Common utilities for integration tests
#![allow(dead_code)]

use proxy_tunnel::adapter::{AdapterFactory, DirectAdapterFactory};
use proxy_tunnel::raw_socket::RawSocketFactory;
use proxy_tunnel::rule::RuleManager;
use proxy_tunnel::server::{ProxyServer, ProxyServerOptions};
use proxy_tunnel::session::ProxyProtocol;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Find an available port
pub fn get_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing, returns its port
pub async fn start_echo_server() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break, // Connection closed
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });
    (port, handle)
}

pub fn direct_factory() -> Arc<dyn AdapterFactory> {
    Arc::new(DirectAdapterFactory::new("direct", RawSocketFactory::Tcp))
}

/// 所有请求都直连的规则
pub fn direct_rules() -> Arc<RuleManager> {
    Arc::new(RuleManager::new(vec![], Some(direct_factory())))
}

/// 在随机端口上启动代理服务器
pub async fn start_proxy(protocol: ProxyProtocol, rules: Arc<RuleManager>) -> (ProxyServer, SocketAddr) {
    let server = ProxyServer::new(ProxyServerOptions::new(protocol, "127.0.0.1", 0), rules);
    let addr = server.start().await.expect("Failed to start proxy server");
    (server, addr)
}

/// SOCKS5 无认证握手并发送 CONNECT，返回连接和回复码
pub async fn socks5_connect(proxy: SocketAddr, host: &str, port: u16) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.expect("Failed to connect to proxy");
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .expect("SOCKS5 reply timed out")
        .unwrap();
    assert_eq!(reply[0], 0x05);
    (stream, reply[1])
}

/// 读取 HTTP 响应头（到空行为止）
pub async fn read_http_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("HTTP response timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// 发送 HTTP CONNECT，返回连接和响应头
pub async fn http_connect(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.expect("Failed to connect to proxy");
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_http_head(&mut stream).await;
    (stream, head)
}

/// Test data transmission through an established tunnel
pub async fn assert_echo<S>(stream: &mut S, data: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(data).await.unwrap();
    let mut buf = vec![0u8; data.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Echo timed out")
        .unwrap();
    assert_eq!(buf, data);
}

/// 轮询直到条件成立
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached in time");
}
