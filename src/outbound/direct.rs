use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{Outbound, OutboundStream, UdpStream};
use crate::{Odor, Protocol};

/// 直连出口, 按目标描述的传输方式建立tcp或udp
pub struct DirectOutbound {
    tag: String,
    connect_timeout: Duration,
}

impl DirectOutbound {
    pub fn new(tag: String, connect_timeout: Duration) -> Self {
        Self {
            tag,
            connect_timeout,
        }
    }

    async fn connect_addr(odor: &Odor) -> io::Result<OutboundStream> {
        match odor.des_protocol() {
            // udp的每个数据包自带目标地址, 请求中的地址不参与发送
            Protocol::Udp => Ok(Box::new(UdpStream::new())),
            _ => {
                let tcp = TcpStream::connect(odor.target_addr()).await?;
                tcp.set_nodelay(true)?;
                Ok(Box::new(tcp))
            }
        }
    }
}

#[async_trait]
impl Outbound for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self, odor: &Odor) -> io::Result<OutboundStream> {
        match tokio::time::timeout(self.connect_timeout, Self::connect_addr(odor)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect {} timeout", odor.target_addr()),
            )),
        }
    }
}
