use super::{AdapterFactory, AdapterSocket, AdapterSocketCore};
use crate::error::Result;
use crate::raw_socket::{RawSocket, RawSocketFactory};
use crate::session::ConnectionRequest;
use async_trait::async_trait;
use std::sync::Arc;

/// 直连目标
#[derive(Debug, Clone)]
pub struct DirectAdapterFactory {
    id: String,
    sockets: RawSocketFactory,
}

impl DirectAdapterFactory {
    pub fn new(id: impl Into<String>, sockets: RawSocketFactory) -> Self {
        Self {
            id: id.into(),
            sockets,
        }
    }
}

impl AdapterFactory for DirectAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn adapter_for(&self, _request: &ConnectionRequest) -> Result<Box<dyn AdapterSocket>> {
        Ok(Box::new(DirectAdapter {
            core: AdapterSocketCore::new(self.sockets.create(), self.id.clone()),
        }))
    }
}

#[derive(Debug)]
pub struct DirectAdapter {
    core: AdapterSocketCore,
}

#[async_trait]
impl AdapterSocket for DirectAdapter {
    fn raw(&self) -> &Arc<dyn RawSocket> {
        self.core.raw()
    }

    fn description(&self) -> &str {
        self.core.description()
    }

    async fn open(&mut self, request: &ConnectionRequest) -> Result<()> {
        self.core.opened(request);
        let result = self
            .core
            .raw()
            .connect(request.host(), request.port(), None)
            .await;
        self.core.finish(result)
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
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_connects_to_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"pong").await.unwrap();
        });

        let factory = DirectAdapterFactory::new("direct", RawSocketFactory::Tcp);
        let request = ConnectionRequest::new("127.0.0.1", port).unwrap();
        let mut adapter = factory.adapter_for(&request).unwrap();
        adapter.open(&request).await.unwrap();
        assert_eq!(adapter.description(), "direct");

        let data = adapter.raw().read_exactly(4).await.unwrap();
        assert_eq!(&data[..], b"pong");
    }
}
