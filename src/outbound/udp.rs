use std::{
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{ready, Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UdpSocket,
};
use webparse::{BinaryMut, Buf, BufMut};

use crate::trojan::UdpPacket;

type Lookup = Pin<Box<dyn Future<Output = io::Result<SocketAddr>> + Send>>;

/// 数据包的目标, 域名需先异步解析
enum Target {
    Addr(SocketAddr),
    Lookup(Lookup),
}

/// 以udp数据包格式读写的字节流
///
/// 写入的字节按`ATYP|ADDR|PORT|LEN|CRLF|DATA`拆成数据包, 每个包的DATA单独发送到包内的地址,
/// 收到的数据报按同样的格式带上来源地址后返回, 字节流的任意分段都不影响数据包的边界
pub struct UdpStream {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
    write_buf: BinaryMut,
    sending: Option<(Vec<u8>, Target)>,
    read_buf: BinaryMut,
    recv_buf: Vec<u8>,
    closed: bool,
}

impl UdpStream {
    pub fn new() -> UdpStream {
        Self {
            v4: None,
            v6: None,
            write_buf: BinaryMut::with_capacity(0x1000),
            sending: None,
            read_buf: BinaryMut::with_capacity(0x1000),
            recv_buf: vec![0u8; u16::MAX as usize],
            closed: false,
        }
    }

    fn target(host: String, port: u16) -> Target {
        match host.parse::<IpAddr>() {
            Ok(ip) => Target::Addr(SocketAddr::new(ip, port)),
            Err(_) => Target::Lookup(Box::pin(async move {
                let mut addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
                addrs.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("can't resolve {}", host))
                })
            })),
        }
    }

    /// 按目标地址族延迟绑定本地端口
    fn socket(slot: &mut Option<UdpSocket>, bind: &str) -> io::Result<()> {
        if slot.is_none() {
            let socket = std::net::UdpSocket::bind(bind)?;
            socket.set_nonblocking(true)?;
            *slot = Some(UdpSocket::from_std(socket)?);
        }
        Ok(())
    }

    /// 发送所有已完整的数据包, 返回Pending时当前包保留在sending中
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if self.sending.is_none() {
                match UdpPacket::parse(&mut self.write_buf) {
                    Ok(Some(packet)) => {
                        let target = Self::target(packet.host, packet.port);
                        self.sending = Some((packet.payload, target));
                    }
                    Ok(None) => return Poll::Ready(Ok(())),
                    Err(e) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid udp packet {:?}", e),
                        )))
                    }
                }
            }
            let (payload, target) = match &mut self.sending {
                Some(sending) => sending,
                None => continue,
            };
            let addr = match target {
                Target::Addr(addr) => *addr,
                Target::Lookup(lookup) => {
                    let addr = ready!(lookup.as_mut().poll(cx))?;
                    *target = Target::Addr(addr);
                    addr
                }
            };
            let slot = if addr.is_ipv4() {
                Self::socket(&mut self.v4, "0.0.0.0:0")?;
                &self.v4
            } else {
                Self::socket(&mut self.v6, "[::]:0")?;
                &self.v6
            };
            if let Some(socket) = slot {
                ready!(socket.poll_send_to(cx, &payload[..], addr))?;
            }
            self.sending = None;
        }
    }

    fn poll_recv(
        socket: &Option<UdpSocket>,
        cx: &mut Context<'_>,
        recv_buf: &mut [u8],
    ) -> Poll<io::Result<(SocketAddr, usize)>> {
        match socket {
            Some(socket) => {
                let mut buf = ReadBuf::new(recv_buf);
                let addr = ready!(socket.poll_recv_from(cx, &mut buf))?;
                Poll::Ready(Ok((addr, buf.filled().len())))
            }
            None => Poll::Pending,
        }
    }
}

impl Default for UdpStream {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.read_buf.has_remaining() {
            // 写入方向关闭后读取即结束, 不再等待回包
            if this.closed {
                return Poll::Ready(Ok(()));
            }
            let received = match Self::poll_recv(&this.v4, cx, &mut this.recv_buf) {
                Poll::Ready(v) => v,
                Poll::Pending => ready!(Self::poll_recv(&this.v6, cx, &mut this.recv_buf)),
            };
            let (addr, size) = received?;
            let packet = UdpPacket::new(
                addr.ip().to_string(),
                addr.port(),
                this.recv_buf[..size].to_vec(),
            );
            packet
                .encode(&mut this.read_buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e)))?;
        }
        let len = this.read_buf.remaining().min(buf.remaining());
        buf.put_slice(&this.read_buf.chunk()[..len]);
        this.read_buf.advance(len);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        ready!(self.poll_drain(cx))?;
        self.write_buf.put_slice(buf);
        // 尚未发送完的包在下次写入或刷新时继续
        if let Poll::Ready(Err(e)) = self.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.poll_drain(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        ready!(self.poll_drain(cx))?;
        self.closed = true;
        Poll::Ready(Ok(()))
    }
}
