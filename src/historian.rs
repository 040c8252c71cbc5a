use crate::session::ProxyProtocol;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 历史记录默认容量
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// 连接记录：某个隧道在某一时刻的快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: u64,
    pub protocol: Option<ProxyProtocol>,
    /// 目标 host:port，握手完成前为空
    pub destination: Option<String>,
    /// 承载该连接的适配器描述
    pub adapter: Option<String>,
    /// 从客户端读取的字节数
    pub rx: u64,
    /// 从上游读取的字节数
    pub tx: u64,
    /// 创建时间（Unix 毫秒）
    pub opened_at: u64,
    pub duration_ms: u64,
    pub established: bool,
    pub closed: bool,
}

impl ConnectionRecord {
    /// 关闭时两个方向都没有传输数据
    pub fn is_empty(&self) -> bool {
        self.rx == 0 && self.tx == 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn description(&self) -> String {
        let protocol = self
            .protocol
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        let destination = self.destination.as_deref().unwrap_or("-");
        match &self.adapter {
            Some(adapter) => format!("[{}] {} via {}", protocol, destination, adapter),
            None => format!("[{}] {}", protocol, destination),
        }
    }
}

/// 已关闭连接的有界历史（先进先出，满时淘汰最旧记录）
#[derive(Debug)]
pub struct Historian {
    capacity: usize,
    records: Mutex<VecDeque<ConnectionRecord>>,
    total: AtomicU64,
}

impl Historian {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            total: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, record: ConnectionRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// 按时间顺序返回全部记录
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// 返回从下标 `from` 开始的记录，用于增量拉取
    pub fn records_from(&self, from: usize) -> Vec<ConnectionRecord> {
        self.records.lock().iter().skip(from).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// 累计记录过的连接数（含已淘汰的）
    pub fn total_recorded(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Default for Historian {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> ConnectionRecord {
        ConnectionRecord {
            id,
            protocol: Some(ProxyProtocol::Socks5),
            destination: Some(format!("host{}:80", id)),
            adapter: Some("direct".into()),
            rx: id,
            tx: 0,
            opened_at: 0,
            duration_ms: 5,
            established: true,
            closed: true,
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let historian = Historian::new(3);
        for id in 1..=5 {
            historian.record(record(id));
        }
        let ids: Vec<u64> = historian.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(historian.total_recorded(), 5);
    }

    #[test]
    fn test_records_from() {
        let historian = Historian::new(10);
        for id in 1..=4 {
            historian.record(record(id));
        }
        let ids: Vec<u64> = historian.records_from(2).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(historian.records_from(10).is_empty());
    }

    #[test]
    fn test_record_helpers() {
        let mut r = record(0);
        r.rx = 0;
        assert!(r.is_empty());
        assert_eq!(r.description(), "[socks5] host0:80 via direct");
        assert_eq!(r.duration(), Duration::from_millis(5));
    }
}
