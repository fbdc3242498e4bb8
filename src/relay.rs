// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2024/03/07 16:48:10

use std::sync::Arc;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    error::ProxyTypeResult,
    outbound::{Outbound, OutboundStream},
    Odor, ProxyError,
};

/// 出口连接及交接给字节中转
pub struct Relay;

impl Relay {
    /// 连接出口, 失败时不做重试, 重试策略属于出口自身
    pub async fn connect<T>(
        outbound: &Arc<dyn Outbound>,
        odor: &Odor,
    ) -> ProxyTypeResult<OutboundStream, T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match outbound.connect(odor).await {
            Ok(stream) => {
                log::info!(
                    "[{}] 出口{}连接成功 {}",
                    odor.from_channel(),
                    outbound.tag(),
                    odor.target_addr()
                );
                Ok(stream)
            }
            Err(e) => {
                log::warn!(
                    "[{}] 出口{}连接{}失败: {}",
                    odor.from_channel(),
                    outbound.tag(),
                    odor.target_addr(),
                    e
                );
                Err(ProxyError::OutboundConnectFailed(e))
            }
        }
    }

    /// 交接: 先将缓存的首包写入出口并刷新, 完成之后才继续读取客户端,
    /// 保证首包在客户端后续的数据之前到达出口
    pub async fn handoff<T>(
        mut inbound: T,
        mut outbound: OutboundStream,
        odor: &Odor,
        payload: &[u8],
    ) -> ProxyTypeResult<(), T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if !payload.is_empty() {
            outbound.write_all(payload).await?;
        }
        outbound.flush().await?;
        log::trace!(
            "[{}] 首包{}字节已写入, 开始中转",
            odor.from_channel(),
            payload.len()
        );
        // 此后的读写均由字节中转负责, 不再解析任何协议帧
        let (up, down) = copy_bidirectional(&mut inbound, &mut outbound).await?;
        log::debug!(
            "[{}] 中转结束 {} 上行:{} 下行:{}",
            odor.from_channel(),
            odor.target_addr(),
            up + payload.len() as u64,
            down
        );
        Ok(())
    }
}
