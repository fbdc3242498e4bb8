use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

/// 协议解析失败后的丢弃处理, 只读取不响应, 直到对端关闭或空闲超时
pub struct DiscardSink;

impl DiscardSink {
    /// 返回丢弃的字节数
    pub async fn drain<T>(mut stream: T, idle_timeout: Option<Duration>) -> u64
    where
        T: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 4096];
        let mut total = 0u64;
        loop {
            let read = match idle_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => break,
                },
                None => stream.read(&mut buf).await,
            };
            match read {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n as u64,
            }
        }
        total
    }
}
