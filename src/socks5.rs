use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use crate::{
    error::ProxyTypeResult, outbound::OutboundResolver, Helper, Odor, Protocol, ProxyError,
    ProxyResult, Relay,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use webparse::{BinaryMut, Buf, BufMut};

pub struct ProxySocks5 {
    username: Option<String>,
    password: Option<String>,
    tag: String,
    resolver: Arc<dyn OutboundResolver>,
}

pub const SOCK_CONNECT: u8 = 0x01u8;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
pub const SOCKS5_REPLY_NOT_ALLOWED: u8 = 0x02;
pub const SOCKS5_REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

impl ProxySocks5 {
    pub fn new(
        username: Option<String>,
        password: Option<String>,
        tag: String,
        resolver: Arc<dyn OutboundResolver>,
    ) -> Self {
        Self {
            username,
            password,
            tag,
            resolver,
        }
    }

    /// 读取的信息, 并返回验证方法, 如果没有用户密码则表示无需认证
    pub async fn read_head_len<T>(
        &self,
        stream: &mut T,
        buffer: &mut BinaryMut,
    ) -> ProxyTypeResult<u8, T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        ProxySocks5::read_len(stream, buffer, 2)
            .await
            .map_err(|e| e.to_type::<T>())?;
        if buffer.chunk()[0] != SOCKS5_VERSION {
            return Err(ProxyError::SizeNotMatch);
        }
        buffer.advance(1);
        let len = buffer.get_u8() as usize;
        ProxySocks5::read_len(stream, buffer, len)
            .await
            .map_err(|e| e.to_type::<T>())?;
        let chunk = &buffer.chunk()[..len];
        let verify = if self.is_user_password() {
            if chunk.contains(&2) {
                2u8
            } else {
                0xFF
            }
        } else if chunk.contains(&0) {
            0u8
        } else {
            0xFF
        };
        buffer.advance(len);
        Ok(verify)
    }

    /// 尝试是否验证成功
    pub async fn read_verify<T>(&self, stream: &mut T, buffer: &mut BinaryMut) -> ProxyResult<bool>
    where
        T: AsyncRead + Unpin,
    {
        ProxySocks5::read_len(stream, buffer, 2).await?;
        if buffer.get_u8() != 1 {
            return Err(ProxyError::ProtErr);
        }
        let user_len = buffer.get_u8() as usize;
        ProxySocks5::read_len(stream, buffer, user_len + 1).await?;
        let user_ok = match &self.username {
            Some(v) => user_len != 0 && v.as_bytes() == &buffer.chunk()[..user_len],
            None => true,
        };
        buffer.advance(user_len);
        let pass_len = buffer.get_u8() as usize;
        ProxySocks5::read_len(stream, buffer, pass_len).await?;
        let pass_ok = match &self.password {
            Some(v) => pass_len != 0 && v.as_bytes() == &buffer.chunk()[..pass_len],
            None => true,
        };
        buffer.advance(pass_len);
        Ok(user_ok && pass_ok)
    }

    /// 读取至少长度为size的大小的字节数, 如果足够则返回Ok(())
    pub async fn read_len<T>(stream: &mut T, buffer: &mut BinaryMut, size: usize) -> ProxyResult<()>
    where
        T: AsyncRead + Unpin,
    {
        buffer.reserve(size);
        loop {
            if buffer.remaining() >= size {
                return Ok(());
            }
            let n = {
                let mut buf = ReadBuf::uninit(buffer.chunk_mut());
                stream.read_buf(&mut buf).await?;
                buf.filled().len()
            };
            if n == 0 {
                return Err(ProxyError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "socks closed before complete",
                )));
            }
            unsafe {
                buffer.advance_mut(n);
            }
        }
    }

    /// +------+----------+----------+
    /// | ATYP | DST.ADDR | DST.PORT |
    /// +------+----------+----------+
    /// |  1   | Variable |    2     |
    /// +------+----------+----------+
    /// 读取通用地址格式，包含V4/V6/Domain三种格式, 域名不在此处解析
    pub async fn read_addr<T>(stream: &mut T, buffer: &mut BinaryMut) -> ProxyResult<(String, u16)>
    where
        T: AsyncRead + Unpin,
    {
        ProxySocks5::read_len(stream, buffer, 1).await?;
        let atyp = buffer.get_u8();
        let addr = match atyp {
            SOCKS5_ADDR_TYPE_IPV4 => {
                ProxySocks5::read_len(stream, buffer, 6).await?;
                let ip = Ipv4Addr::new(
                    buffer.get_u8(),
                    buffer.get_u8(),
                    buffer.get_u8(),
                    buffer.get_u8(),
                );
                (ip.to_string(), buffer.get_u16())
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                ProxySocks5::read_len(stream, buffer, 1).await?;
                let len = buffer.get_u8() as usize;
                ProxySocks5::read_len(stream, buffer, len + 2).await?;
                let name = String::from_utf8_lossy(&buffer.chunk()[0..len]).to_string();
                buffer.advance(len);
                (name, buffer.get_u16())
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                ProxySocks5::read_len(stream, buffer, 18).await?;
                let ip = Ipv6Addr::new(
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                    buffer.get_u16(),
                );
                (ip.to_string(), buffer.get_u16())
            }
            _ => return Err(ProxyError::ProtErr),
        };
        Ok(addr)
    }

    /// +------+----------+----------+
    /// | ATYP | DST.ADDR | DST.PORT |
    /// +------+----------+----------+
    /// |  1   | Variable |    2     |
    /// +------+----------+----------+
    /// 将地址转化成二进制流
    pub fn encode_socket_addr(buf: &mut BinaryMut, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(sock) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&sock.ip().octets());
            }
            SocketAddr::V6(sock) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&sock.ip().octets());
            }
        };
        buf.put_slice(&addr.port().to_be_bytes());
    }

    /// +----+-----+-------+------+----------+----------+
    /// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    /// +----+-----+-------+------+----------+----------+
    /// | 1  |  1  | X'00' |  1   | Variable |    2     |
    /// +----+-----+-------+------+----------+----------+
    /// 解析request
    pub async fn tcp_read_request<T>(
        stream: &mut T,
        buffer: &mut BinaryMut,
    ) -> ProxyResult<(u8, String, u16)>
    where
        T: AsyncRead + Unpin,
    {
        ProxySocks5::read_len(stream, buffer, 3).await?;
        if buffer.get_u8() != SOCKS5_VERSION {
            return Err(ProxyError::ProtErr);
        }
        let sock = buffer.get_u8();
        if buffer.get_u8() != 0 {
            return Err(ProxyError::ProtErr);
        }
        let (host, port) = Self::read_addr(stream, buffer).await?;
        Ok((sock, host, port))
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
        let verify = match self.read_head_len(&mut stream, &mut buffer).await {
            Err(ProxyError::SizeNotMatch) => {
                return Err(ProxyError::Continue((Some(buffer), stream)));
            }
            Err(err) => {
                return Err(err);
            }
            Ok(result) => result,
        };

        stream.write_all(&[SOCKS5_VERSION, verify]).await?;
        if verify == 0xFF {
            Helper::close_on_flush(&mut stream).await;
            return Err(ProxyError::VerifyFail);
        }

        if verify == 2 {
            let succ = self
                .read_verify(&mut stream, &mut buffer)
                .await
                .map_err(|e| e.to_type::<T>())?;
            if !succ {
                log::warn!("[{}] socks5 user password not matched", id);
                stream.write_all(&[0x01_u8, 0x01]).await?;
                Helper::close_on_flush(&mut stream).await;
                return Err(ProxyError::VerifyFail);
            } else {
                stream.write_all(&[0x01_u8, 0x00]).await?;
            }
        }

        let (sock, host, port) = ProxySocks5::tcp_read_request(&mut stream, &mut buffer)
            .await
            .map_err(|e| e.to_type::<T>())?;
        // 只支持connect指令, bind及udp需要额外的监听
        if sock != SOCK_CONNECT {
            Self::tcp_write_reply(&mut stream, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED).await?;
            Helper::close_on_flush(&mut stream).await;
            return Err(ProxyError::ProtNoSupport);
        }

        let odor = Odor::with_command(host, port, Protocol::Socks, true, id.clone());
        log::info!("socks5 inbound: [{}], addr: {}", id, odor.target_addr());
        let outbound = match self.resolver.resolve(&self.tag, &odor).await {
            Some(outbound) => outbound,
            None => {
                Self::tcp_write_reply(&mut stream, SOCKS5_REPLY_NOT_ALLOWED).await?;
                Helper::close_on_flush(&mut stream).await;
                return Err(ProxyError::RouteDenied);
            }
        };

        let target = match Relay::connect::<T>(&outbound, &odor).await {
            Ok(target) => target,
            Err(err) => {
                Self::tcp_write_reply(&mut stream, SOCKS5_REPLY_HOST_UNREACHABLE).await?;
                Helper::close_on_flush(&mut stream).await;
                return Err(err);
            }
        };
        Self::tcp_write_reply(&mut stream, SOCKS5_REPLY_SUCCEEDED).await?;
        // 客户端在应答前提前发送的数据作为首包
        let payload = buffer.chunk().to_vec();
        Relay::handoff(stream, target, &odor, &payload).await
    }

    pub fn is_user_password(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// +----+-----+-------+------+----------+----------+
    /// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    /// +----+-----+-------+------+----------+----------+
    /// | 1  |  1  | X'00' |  1   | Variable |    2     |
    /// +----+-----+-------+------+----------+----------+
    /// https://datatracker.ietf.org/doc/html/rfc1928#section-6
    pub async fn tcp_write_reply<T>(stream: &mut T, rep: u8) -> io::Result<()>
    where
        T: AsyncWrite + Unpin,
    {
        let mut buf = BinaryMut::with_capacity(32);
        buf.put_slice(&[SOCKS5_VERSION, rep, 0x00]);
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self::encode_socket_addr(&mut buf, &bind);
        stream.write_all(buf.chunk()).await?;
        Ok(())
    }
}
