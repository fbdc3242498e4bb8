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
// Created Date: 2024/03/08 09:36:27

use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};
use webparse::BinaryMut;

use super::{CredentialSet, TrojanPackage};
use crate::{
    error::ProxyTypeResult, outbound::OutboundResolver, DiscardSink, Helper, Odor, Protocol,
    ProxyError, Relay,
};

/// 单次读取的缓存大小, 首帧需在一次读取内完整到达
pub const TROJAN_READ_SIZE: usize = 0x4000;

/// 连接所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingRequest,
    Parsed,
    Authenticated,
    Resolving,
    Connecting,
    Relaying,
    Rejected,
    Failed,
}

/// 单连接的上下文, 只在该连接的任务内访问
struct Connection {
    id: String,
    stage: Stage,
}

impl Connection {
    fn new(id: String) -> Self {
        Self {
            id,
            stage: Stage::AwaitingRequest,
        }
    }

    fn transit(&mut self, stage: Stage) {
        log::trace!("[{}] trojan {:?} -> {:?}", self.id, self.stage, stage);
        self.stage = stage;
    }
}

/// Trojan入口, 负责解析、认证、选择出口及交接给字节中转
pub struct TrojanInbound {
    tag: String,
    credentials: Arc<CredentialSet>,
    resolver: Arc<dyn OutboundResolver>,
    idle_timeout: Option<Duration>,
}

impl TrojanInbound {
    pub fn new(
        tag: String,
        credentials: Arc<CredentialSet>,
        resolver: Arc<dyn OutboundResolver>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            tag,
            credentials,
            resolver,
            idle_timeout,
        }
    }

    /// 处理一个连接, 交接之前客户端只被读取一次,
    /// 在出口确定之前不会缓存更多攻击者可控的数据
    pub async fn process<T>(&self, mut inbound: T, id: String) -> ProxyTypeResult<(), T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut conn = Connection::new(id);
        let mut buffer = BinaryMut::with_capacity(TROJAN_READ_SIZE);
        let size = match self.idle_timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, Helper::read_once(&mut inbound, &mut buffer)).await??
            }
            None => Helper::read_once(&mut inbound, &mut buffer).await?,
        };
        if size == 0 {
            log::debug!("[{}] trojan inbound closed before request", conn.id);
            return Ok(());
        }

        let package = match TrojanPackage::parse(&mut buffer) {
            Ok(package) => package,
            Err(ProxyError::MalformedRequest(reason)) => {
                conn.transit(Stage::Failed);
                log::warn!(
                    "[{}] parse trojan package failed, {}, give a discard handler",
                    conn.id,
                    reason
                );
                let discard = DiscardSink::drain(inbound, self.idle_timeout).await;
                log::debug!("[{}] discard {} bytes", conn.id, discard);
                return Err(ProxyError::MalformedRequest(reason));
            }
            Err(err) => return Err(err.to_type()),
        };
        conn.transit(Stage::Parsed);

        let credential = match self.credentials.authenticate(&package.hex_password) {
            Some(credential) => credential,
            None => {
                conn.transit(Stage::Rejected);
                log::warn!("[{}], drop trojan package, password not matched", conn.id);
                Helper::close_on_flush(&mut inbound).await;
                return Err(ProxyError::AuthenticationRejected);
            }
        };
        conn.transit(Stage::Authenticated);

        let request = &package.request;
        log::info!(
            "trojan inbound: [{}], addr: {}:{}, cmd: {}",
            conn.id,
            request.host,
            request.port,
            request.cmd_name()
        );
        let odor = Odor::with_command(
            request.host.clone(),
            request.port,
            Protocol::Trojan,
            request.is_connect(),
            conn.id.clone(),
        );
        log::debug!("trojan inbound: [{}], odor: {}", conn.id, odor);

        conn.transit(Stage::Resolving);
        let tag = credential.tag().unwrap_or(&self.tag);
        let outbound = match self.resolver.resolve(tag, &odor).await {
            Some(outbound) => outbound,
            None => {
                conn.transit(Stage::Rejected);
                log::info!("[{}] no outbound for {}, close", conn.id, odor.target_addr());
                Helper::close_on_flush(&mut inbound).await;
                return Err(ProxyError::RouteDenied);
            }
        };

        conn.transit(Stage::Connecting);
        let stream = match Relay::connect::<T>(&outbound, &odor).await {
            Ok(stream) => stream,
            Err(err) => {
                conn.transit(Stage::Failed);
                Helper::close_on_flush(&mut inbound).await;
                return Err(err);
            }
        };

        conn.transit(Stage::Relaying);
        Relay::handoff(inbound, stream, &odor, &package.payload).await
    }
}
