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
// Created Date: 2024/03/06 11:27:15

use std::{net::Ipv4Addr, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use webparse::{BinaryMut, Buf};

use crate::{
    error::ProxyTypeResult, outbound::OutboundResolver, Helper, Odor, Protocol, ProxyError,
    ProxyResult, ProxySocks5, Relay,
};

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS4_CONNECT: u8 = 0x01;
pub const SOCKS4_GRANTED: u8 = 0x5A;
pub const SOCKS4_REJECTED: u8 = 0x5B;

/// userid及4a的域名最大长度
const SOCKS4_MAX_FIELD: usize = 255;

/// SOCKS4及SOCKS4A代理, 只支持CONNECT
pub struct ProxySocks4 {
    username: Option<String>,
    tag: String,
    resolver: Arc<dyn OutboundResolver>,
}

impl ProxySocks4 {
    pub fn new(username: Option<String>, tag: String, resolver: Arc<dyn OutboundResolver>) -> Self {
        Self {
            username,
            tag,
            resolver,
        }
    }

    /// 读取以0结尾的字段, 不包含结尾的0
    async fn read_cstr<T>(stream: &mut T, buffer: &mut BinaryMut) -> ProxyResult<String>
    where
        T: AsyncRead + Unpin,
    {
        let mut need = 1;
        loop {
            ProxySocks5::read_len(stream, buffer, need).await?;
            if let Some(pos) = buffer.chunk().iter().position(|b| *b == 0) {
                let value = String::from_utf8_lossy(&buffer.chunk()[..pos]).to_string();
                buffer.advance(pos + 1);
                return Ok(value);
            }
            if buffer.remaining() > SOCKS4_MAX_FIELD {
                return Err(ProxyError::ProtErr);
            }
            need = buffer.remaining() + 1;
        }
    }

    /// +----+----+----+----+----+----+----+----+----+----+....+----+
    /// | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
    /// +----+----+----+----+----+----+----+----+----+----+....+----+
    ///   1    1      2              4           variable       1
    /// 4a中DSTIP为0.0.0.x时USERID之后跟随以0结尾的域名
    pub async fn read_request<T>(
        stream: &mut T,
        buffer: &mut BinaryMut,
    ) -> ProxyResult<(u8, String, u16, String)>
    where
        T: AsyncRead + Unpin,
    {
        ProxySocks5::read_len(stream, buffer, 8).await?;
        if buffer.get_u8() != SOCKS4_VERSION {
            return Err(ProxyError::ProtErr);
        }
        let cmd = buffer.get_u8();
        let port = buffer.get_u16();
        let ip = Ipv4Addr::new(
            buffer.get_u8(),
            buffer.get_u8(),
            buffer.get_u8(),
            buffer.get_u8(),
        );
        let userid = Self::read_cstr(stream, buffer).await?;
        let octets = ip.octets();
        let host = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
            let domain = Self::read_cstr(stream, buffer).await?;
            if domain.is_empty() {
                return Err(ProxyError::ProtErr);
            }
            domain
        } else {
            ip.to_string()
        };
        Ok((cmd, host, port, userid))
    }

    /// +----+----+----+----+----+----+----+----+
    /// | VN | CD | DSTPORT |      DSTIP        |
    /// +----+----+----+----+----+----+----+----+
    pub async fn write_reply<T>(stream: &mut T, cd: u8) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin,
    {
        stream.write_all(&[0x00, cd, 0, 0, 0, 0, 0, 0]).await
    }

    pub async fn process<T>(
        &self,
        mut stream: T,
        buffer: Option<BinaryMut>,
        id: String,
    ) -> ProxyTypeResult<(), T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buffer = buffer.unwrap_or_else(|| BinaryMut::with_capacity(256));
        ProxySocks5::read_len(&mut stream, &mut buffer, 1)
            .await
            .map_err(|e| e.to_type::<T>())?;
        if buffer.chunk()[0] != SOCKS4_VERSION {
            return Err(ProxyError::Continue((Some(buffer), stream)));
        }

        let (cmd, host, port, userid) = Self::read_request(&mut stream, &mut buffer)
            .await
            .map_err(|e| e.to_type::<T>())?;
        if let Some(username) = &self.username {
            if username != &userid {
                log::warn!("[{}] socks4 userid not matched", id);
                Self::write_reply(&mut stream, SOCKS4_REJECTED).await?;
                Helper::close_on_flush(&mut stream).await;
                return Err(ProxyError::VerifyFail);
            }
        }
        if cmd != SOCKS4_CONNECT {
            Self::write_reply(&mut stream, SOCKS4_REJECTED).await?;
            Helper::close_on_flush(&mut stream).await;
            return Err(ProxyError::ProtNoSupport);
        }

        let odor = Odor::with_command(host, port, Protocol::Socks, true, id.clone());
        log::info!("socks4 inbound: [{}], addr: {}", id, odor.target_addr());
        let outbound = match self.resolver.resolve(&self.tag, &odor).await {
            Some(outbound) => outbound,
            None => {
                Self::write_reply(&mut stream, SOCKS4_REJECTED).await?;
                Helper::close_on_flush(&mut stream).await;
                return Err(ProxyError::RouteDenied);
            }
        };
        let target = match Relay::connect::<T>(&outbound, &odor).await {
            Ok(target) => target,
            Err(err) => {
                Self::write_reply(&mut stream, SOCKS4_REJECTED).await?;
                Helper::close_on_flush(&mut stream).await;
                return Err(err);
            }
        };
        Self::write_reply(&mut stream, SOCKS4_GRANTED).await?;
        let payload = buffer.chunk().to_vec();
        Relay::handoff(stream, target, &odor, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use webparse::BinaryMut;

    use super::ProxySocks4;

    #[tokio::test]
    async fn read_socks4a_request() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut req = vec![0x04, 0x01, 0x01, 0xBB, 0, 0, 0, 1];
        req.extend_from_slice(b"bob\0example.com\0");
        client.write_all(&req).await.unwrap();
        let mut buffer = BinaryMut::with_capacity(256);
        let (cmd, host, port, userid) = ProxySocks4::read_request(&mut server, &mut buffer)
            .await
            .unwrap();
        assert_eq!(cmd, 0x01);
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
        assert_eq!(userid, "bob");
    }

    #[tokio::test]
    async fn read_socks4_request() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let req = [0x04, 0x01, 0x00, 0x50, 10, 0, 0, 1, 0];
        client.write_all(&req).await.unwrap();
        let mut buffer = BinaryMut::with_capacity(256);
        let (_, host, port, userid) = ProxySocks4::read_request(&mut server, &mut buffer)
            .await
            .unwrap();
        assert_eq!(host, "10.0.0.1");
        assert_eq!(port, 80);
        assert!(userid.is_empty());
    }
}
