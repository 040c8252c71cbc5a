use bytes::{Bytes, BytesMut};

/// 扫描结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// 找到分隔符：`matched` 以分隔符结尾，`rest` 为其后已收到的数据
    Matched { matched: Bytes, rest: Bytes },
    /// 尚未找到，需要更多数据
    NeedMore,
    /// 超过最大长度仍未找到
    Exceeded,
}

/// 增量式分隔符扫描器
///
/// 数据可以任意分块送入，跨块的分隔符同样能被识别；
/// 已扫描过的位置不会重复扫描。
#[derive(Debug)]
pub struct StreamScanner {
    pattern: Bytes,
    max_len: usize,
    buffer: BytesMut,
    scanned: usize,
}

impl StreamScanner {
    pub fn new(pattern: impl Into<Bytes>, max_len: usize) -> Self {
        let pattern = pattern.into();
        Self {
            max_len: max_len.max(pattern.len()),
            pattern,
            buffer: BytesMut::new(),
            scanned: 0,
        }
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// 已缓冲但尚未匹配的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 追加数据并继续扫描
    pub fn add_and_scan(&mut self, data: &[u8]) -> ScanResult {
        self.buffer.extend_from_slice(data);

        let plen = self.pattern.len();
        if plen == 0 {
            return ScanResult::Matched {
                matched: Bytes::new(),
                rest: self.buffer.split().freeze(),
            };
        }

        // 回退 plen - 1 字节，覆盖跨块的分隔符
        let start = self.scanned.saturating_sub(plen - 1);
        let found = self.buffer[start..]
            .windows(plen)
            .position(|w| w == &self.pattern[..])
            .map(|pos| start + pos);

        match found {
            Some(pos) if pos + plen <= self.max_len => {
                let matched = self.buffer.split_to(pos + plen).freeze();
                let rest = self.buffer.split().freeze();
                self.scanned = 0;
                ScanResult::Matched { matched, rest }
            }
            Some(_) => ScanResult::Exceeded,
            None if self.buffer.len() >= self.max_len => ScanResult::Exceeded,
            None => {
                self.scanned = self.buffer.len();
                ScanResult::NeedMore
            }
        }
    }

    /// 取出缓冲中尚未匹配的数据
    pub fn take_remaining(&mut self) -> Bytes {
        self.scanned = 0;
        self.buffer.split().freeze()
    }
}
