use super::scanner::{ScanResult, StreamScanner};
use super::{ReadRequest, MAX_READ_SIZE};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;

/// 底层数据来源：每次返回至少 `min`、至多 `max` 字节，空块表示 EOF
#[async_trait]
pub(crate) trait ChunkSource: Send {
    async fn next_chunk(&mut self, min: usize, max: usize) -> io::Result<Bytes>;
}

/// 读缓冲
///
/// 保存模式扫描或定长读取后多出的字节，下一次读取优先返回这部分数据。
#[derive(Debug, Default)]
pub(crate) struct ReadBuffer {
    pending: BytesMut,
}

impl ReadBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) async fn read<S: ChunkSource>(
        &mut self,
        source: &mut S,
        request: &ReadRequest,
    ) -> Result<Bytes> {
        match request {
            ReadRequest::Any => self.read_any(source).await,
            ReadRequest::Exactly(length) => self.read_exactly(source, *length).await,
            ReadRequest::Until { pattern, max_len } => {
                self.read_until(source, pattern.clone(), *max_len).await
            }
        }
    }

    async fn read_any<S: ChunkSource>(&mut self, source: &mut S) -> Result<Bytes> {
        if !self.pending.is_empty() {
            return Ok(self.pending.split().freeze());
        }
        Ok(source.next_chunk(1, MAX_READ_SIZE).await?)
    }

    async fn read_exactly<S: ChunkSource>(&mut self, source: &mut S, length: usize) -> Result<Bytes> {
        while self.pending.len() < length {
            let missing = length - self.pending.len();
            let chunk = source.next_chunk(missing, missing).await?;
            if chunk.is_empty() {
                return Err(unexpected_eof(self.pending.len(), length));
            }
            self.pending.extend_from_slice(&chunk);
        }
        Ok(self.pending.split_to(length).freeze())
    }

    async fn read_until<S: ChunkSource>(
        &mut self,
        source: &mut S,
        pattern: Bytes,
        max_len: usize,
    ) -> Result<Bytes> {
        let mut scanner = StreamScanner::new(pattern, max_len);
        let mut result = scanner.add_and_scan(&self.pending.split());

        loop {
            match result {
                ScanResult::Matched { matched, rest } => {
                    self.pending.extend_from_slice(&rest);
                    return Ok(matched);
                }
                ScanResult::Exceeded => {
                    return Err(TunnelError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("delimiter not found within {} bytes", max_len),
                    )));
                }
                ScanResult::NeedMore => {
                    let chunk = match source.next_chunk(1, MAX_READ_SIZE).await {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            self.pending.extend_from_slice(&scanner.take_remaining());
                            return Err(e.into());
                        }
                    };
                    if chunk.is_empty() {
                        let buffered = scanner.buffered();
                        self.pending.extend_from_slice(&scanner.take_remaining());
                        return Err(unexpected_eof(buffered, max_len));
                    }
                    result = scanner.add_and_scan(&chunk);
                }
            }
        }
    }
}

fn unexpected_eof(got: usize, wanted: usize) -> TunnelError {
    TunnelError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("connection closed after {} of {} bytes", got, wanted),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSource {
        chunks: VecDeque<Bytes>,
    }

    impl ScriptedSource {
        fn new(chunks: &[&'static [u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| Bytes::from_static(c)).collect(),
            }
        }
    }

    #[async_trait]
    impl ChunkSource for ScriptedSource {
        async fn next_chunk(&mut self, _min: usize, _max: usize) -> io::Result<Bytes> {
            Ok(self.chunks.pop_front().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_until_keeps_remainder() {
        let mut source = ScriptedSource::new(&[b"HEAD\r", b"\n\r\nbo", b"dy"]);
        let mut buffer = ReadBuffer::new();

        let header = buffer
            .read(&mut source, &ReadRequest::until(&b"\r\n\r\n"[..], 64))
            .await
            .unwrap();
        assert_eq!(&header[..], b"HEAD\r\n\r\n");

        let next = buffer.read(&mut source, &ReadRequest::Any).await.unwrap();
        assert_eq!(&next[..], b"bo");
        let next = buffer.read(&mut source, &ReadRequest::Any).await.unwrap();
        assert_eq!(&next[..], b"dy");
    }

    #[tokio::test]
    async fn test_exactly_across_chunks() {
        let mut source = ScriptedSource::new(&[b"\x05", b"\x01\x00\x01", b"rest"]);
        let mut buffer = ReadBuffer::new();

        let head = buffer.read(&mut source, &ReadRequest::Exactly(2)).await.unwrap();
        assert_eq!(&head[..], b"\x05\x01");
        let tail = buffer.read(&mut source, &ReadRequest::Exactly(2)).await.unwrap();
        assert_eq!(&tail[..], b"\x00\x01");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_exactly_eof() {
        let mut source = ScriptedSource::new(&[b"ab"]);
        let mut buffer = ReadBuffer::new();

        let err = buffer
            .read(&mut source, &ReadRequest::Exactly(4))
            .await
            .unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_any_returns_empty_on_eof() {
        let mut source = ScriptedSource::new(&[]);
        let mut buffer = ReadBuffer::new();
        let data = buffer.read(&mut source, &ReadRequest::Any).await.unwrap();
        assert!(data.is_empty());
    }
}
