use super::{AdapterFactory, AdapterSocket, AdapterSocketCore};
use crate::error::{Result, TunnelError};
use crate::raw_socket::{RawSocket, TcpSocket};
use crate::session::ConnectionRequest;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// 拒绝所有连接，可选延迟后失败
#[derive(Debug, Clone)]
pub struct RejectAdapterFactory {
    id: String,
    delay: Duration,
}

impl RejectAdapterFactory {
    pub fn new(id: impl Into<String>, delay: Duration) -> Self {
        Self {
            id: id.into(),
            delay,
        }
    }
}

impl AdapterFactory for RejectAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn adapter_for(&self, _request: &ConnectionRequest) -> Result<Box<dyn AdapterSocket>> {
        Ok(Box::new(RejectAdapter {
            core: AdapterSocketCore::new(Arc::new(TcpSocket::new()), self.id.clone()),
            delay: self.delay,
        }))
    }
}

#[derive(Debug)]
pub struct RejectAdapter {
    core: AdapterSocketCore,
    delay: Duration,
}

#[async_trait]
impl AdapterSocket for RejectAdapter {
    fn raw(&self) -> &Arc<dyn RawSocket> {
        self.core.raw()
    }

    fn description(&self) -> &str {
        self.core.description()
    }

    async fn open(&mut self, request: &ConnectionRequest) -> Result<()> {
        self.core.opened(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.core.finish(Err(TunnelError::connection_failed(
            request.to_string(),
            io::Error::new(io::ErrorKind::ConnectionRefused, "rejected by rule"),
        )))
    }

    async fn disconnect(&self) {
        self.core.disconnect().await
    }

    fn force_disconnect(&self) {
        self.core.force_disconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_is_connect_error() {
        let factory = RejectAdapterFactory::new("reject", Duration::from_millis(10));
        let request = ConnectionRequest::new("ads.example.com", 443).unwrap();
        let mut adapter = factory.adapter_for(&request).unwrap();

        let started = std::time::Instant::now();
        let err = adapter.open(&request).await.unwrap_err();
        assert!(err.is_connect());
        assert!(!err.is_handshake());
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
