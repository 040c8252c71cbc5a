use crate::historian::ConnectionRecord;
use crate::tunnel::{TunnelHandle, TunnelId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// 监听器的存活隧道集合
///
/// 插入、删除、遍历与停止时的强制关闭都在同一把锁下进行。
#[derive(Debug)]
pub struct TunnelRegistry {
    tunnels: Mutex<BTreeMap<TunnelId, TunnelHandle>>,
    count: watch::Sender<usize>,
    next_id: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            tunnels: Mutex::new(BTreeMap::new()),
            count,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TunnelId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 返回注册后的存活数量
    pub fn register(&self, handle: TunnelHandle) -> usize {
        let mut tunnels = self.tunnels.lock();
        tunnels.insert(handle.id(), handle);
        self.count.send_replace(tunnels.len());
        tunnels.len()
    }

    /// 移除隧道，不存在时返回 `None`
    pub fn remove(&self, id: TunnelId) -> Option<(TunnelHandle, usize)> {
        let mut tunnels = self.tunnels.lock();
        let handle = tunnels.remove(&id)?;
        self.count.send_replace(tunnels.len());
        Some((handle, tunnels.len()))
    }

    pub fn force_close_all(&self) -> usize {
        let tunnels = self.tunnels.lock();
        for handle in tunnels.values() {
            handle.force_close();
        }
        tunnels.len()
    }

    /// 存活隧道的快照，按 id 排序
    pub fn dump(&self) -> Vec<ConnectionRecord> {
        self.tunnels.lock().values().map(|h| h.record()).collect()
    }

    pub fn get(&self, id: TunnelId) -> Option<TunnelHandle> {
        self.tunnels.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 等待指定隧道离开集合
    pub async fn wait_removed(&self, id: TunnelId) {
        let mut count = self.count.subscribe();
        while self.tunnels.lock().contains_key(&id) {
            if count.changed().await.is_err() {
                return;
            }
        }
    }

    /// 等待集合清空
    pub async fn wait_empty(&self) {
        let mut count = self.count.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
