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
// Created Date: 2024/03/06 15:30:02

use std::{io, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Odor;

mod direct;
mod rule;
mod udp;

pub use direct::DirectOutbound;
pub use rule::RuleResolver;
pub use udp::UdpStream;

pub trait IoTrait: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoTrait for T {}

/// 出口建立后的字节流, 由中转部分独占
pub type OutboundStream = Box<dyn IoTrait>;

/// 出口, 可异步连接到目标
#[async_trait]
pub trait Outbound: Send + Sync {
    fn tag(&self) -> &str;

    async fn connect(&self, odor: &Odor) -> io::Result<OutboundStream>;
}

/// 根据标签及目标描述选择出口, 返回None表示拒绝
#[async_trait]
pub trait OutboundResolver: Send + Sync {
    async fn resolve(&self, tag: &str, odor: &Odor) -> Option<Arc<dyn Outbound>>;
}
