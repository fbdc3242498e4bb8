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
// Created Date: 2024/03/04 14:40:51

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use webparse::{BinaryMut, Buf, BufMut};

use crate::{ProxyError, ProxyResult};

/// 密码摘要为sha224的十六进制, 28字节即56个字符
pub const HEX_PASSWORD_LEN: usize = 56;
pub const CRLF: &[u8; 2] = b"\r\n";

pub const TROJAN_CMD_CONNECT: u8 = 0x01;
pub const TROJAN_CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const TROJAN_ADDR_TYPE_IPV4: u8 = 0x01;
pub const TROJAN_ADDR_TYPE_DOMAIN: u8 = 0x03;
pub const TROJAN_ADDR_TYPE_IPV6: u8 = 0x04;

/// 最短的帧: 摘要 + CRLF + CMD + ATYP + 一字节域名 + 端口 + CRLF
pub const MIN_FRAME_LEN: usize = HEX_PASSWORD_LEN + 2 + 1 + 1 + 2 + 2 + 2;

/// +-----+------+----------+----------+
/// | CMD | ATYP | DST.ADDR | DST.PORT |
/// +-----+------+----------+----------+
/// |  1  |  1   | Variable |    2     |
/// +-----+------+----------+----------+
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRequest {
    pub cmd: u8,
    pub host: String,
    pub port: u16,
}

impl TrojanRequest {
    pub fn new(cmd: u8, host: String, port: u16) -> Self {
        Self { cmd, host, port }
    }

    pub fn is_connect(&self) -> bool {
        self.cmd == TROJAN_CMD_CONNECT
    }

    pub fn cmd_name(&self) -> &'static str {
        match self.cmd {
            TROJAN_CMD_CONNECT => "CONNECT",
            TROJAN_CMD_UDP_ASSOCIATE => "UDP_ASSOCIATE",
            _ => "UNKNOWN",
        }
    }

    pub fn encode_addr(&self, buf: &mut BinaryMut) -> ProxyResult<()> {
        write_addr(&self.host, self.port, buf)
    }
}

/// 将地址转化成二进制流, ip格式的地址按ip写入, 其它按域名写入
pub fn write_addr(host: &str, port: u16, buf: &mut BinaryMut) -> ProxyResult<()> {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.put_u8(TROJAN_ADDR_TYPE_IPV4);
            buf.put_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.put_u8(TROJAN_ADDR_TYPE_IPV6);
            buf.put_slice(&ip.octets());
        }
        Err(_) => {
            if host.is_empty() || host.len() > u8::MAX as usize {
                return Err(ProxyError::Extension("domain length out of range"));
            }
            buf.put_u8(TROJAN_ADDR_TYPE_DOMAIN);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host.as_bytes());
        }
    }
    buf.put_slice(&port.to_be_bytes());
    Ok(())
}

/// UDP_ASSOCIATE之后的每个数据包
///
/// +------+----------+----------+--------+---------+----------+
/// | ATYP | DST.ADDR | DST.PORT | Length |  CRLF   | Payload  |
/// +------+----------+----------+--------+---------+----------+
/// |  1   | Variable |    2     |   2    | X'0D0A' | Variable |
/// +------+----------+----------+--------+---------+----------+
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub host: String,
    pub port: u16,
    pub payload: Vec<u8>,
}

impl UdpPacket {
    pub fn new(host: String, port: u16, payload: Vec<u8>) -> Self {
        Self {
            host,
            port,
            payload,
        }
    }

    /// 从缓存头部解析一个完整的包, 数据不足时返回None且不消耗缓存
    pub fn parse(buf: &mut BinaryMut) -> ProxyResult<Option<UdpPacket>> {
        let data = buf.chunk();
        let (host, port, mut pos) = match Self::peek_addr(data)? {
            Some(v) => v,
            None => return Ok(None),
        };
        if data.len() < pos + 4 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        if &data[pos + 2..pos + 4] != CRLF {
            return Err(ProxyError::MalformedRequest("miss crlf"));
        }
        pos += 4;
        if data.len() < pos + len {
            return Ok(None);
        }
        let payload = data[pos..pos + len].to_vec();
        buf.advance(pos + len);
        Ok(Some(UdpPacket::new(host, port, payload)))
    }

    pub fn encode(&self, buf: &mut BinaryMut) -> ProxyResult<()> {
        if self.payload.len() > u16::MAX as usize {
            return Err(ProxyError::Extension("udp payload too large"));
        }
        write_addr(&self.host, self.port, buf)?;
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(CRLF);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// 返回地址, 端口及已读取的长度
    fn peek_addr(data: &[u8]) -> ProxyResult<Option<(String, u16, usize)>> {
        if data.is_empty() {
            return Ok(None);
        }
        let (host, pos) = match data[0] {
            TROJAN_ADDR_TYPE_IPV4 => {
                if data.len() < 5 {
                    return Ok(None);
                }
                (Ipv4Addr::new(data[1], data[2], data[3], data[4]).to_string(), 5)
            }
            TROJAN_ADDR_TYPE_DOMAIN => {
                if data.len() < 2 {
                    return Ok(None);
                }
                let len = data[1] as usize;
                if len == 0 {
                    return Err(ProxyError::MalformedRequest("empty domain"));
                }
                if data.len() < 2 + len {
                    return Ok(None);
                }
                let name = std::str::from_utf8(&data[2..2 + len])
                    .map_err(|_| ProxyError::MalformedRequest("domain not utf8"))?;
                (name.to_string(), 2 + len)
            }
            TROJAN_ADDR_TYPE_IPV6 => {
                if data.len() < 17 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                (Ipv6Addr::from(octets).to_string(), 17)
            }
            _ => return Err(ProxyError::MalformedRequest("invalid address type")),
        };
        if data.len() < pos + 2 {
            return Ok(None);
        }
        let port = u16::from_be_bytes([data[pos], data[pos + 1]]);
        Ok(Some((host, port, pos + 2)))
    }
}

/// 客户端的首个请求帧
///
/// +-----------------------+---------+----------------+---------+----------+
/// | hex(SHA224(password)) |  CRLF   | Trojan Request |  CRLF   | Payload  |
/// +-----------------------+---------+----------------+---------+----------+
/// |          56           | X'0D0A' |    Variable    | X'0D0A' | Variable |
/// +-----------------------+---------+----------------+---------+----------+
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanPackage {
    pub hex_password: String,
    pub request: TrojanRequest,
    pub payload: Vec<u8>,
}

impl TrojanPackage {
    /// 解析完整的一帧, 任何越界或非法的字段都返回MalformedRequest,
    /// 解析失败时不会产生部分填充的请求
    pub fn parse(buf: &mut BinaryMut) -> ProxyResult<TrojanPackage> {
        if buf.remaining() < MIN_FRAME_LEN {
            return Err(ProxyError::MalformedRequest("frame too short"));
        }
        let password = &buf.chunk()[..HEX_PASSWORD_LEN];
        if !password.iter().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProxyError::MalformedRequest("password not hex"));
        }
        let hex_password = String::from_utf8_lossy(password).to_string();
        buf.advance(HEX_PASSWORD_LEN);
        Self::read_crlf(buf)?;

        Self::need(buf, 2)?;
        let cmd = buf.get_u8();
        if cmd != TROJAN_CMD_CONNECT && cmd != TROJAN_CMD_UDP_ASSOCIATE {
            return Err(ProxyError::MalformedRequest("unsupported command"));
        }
        let (host, port) = Self::read_addr(buf)?;
        Self::read_crlf(buf)?;

        let payload = buf.chunk().to_vec();
        buf.advance(payload.len());
        Ok(TrojanPackage {
            hex_password,
            request: TrojanRequest::new(cmd, host, port),
            payload,
        })
    }

    /// 客户端方向的编码, 与parse互逆
    pub fn encode(&self, buf: &mut BinaryMut) -> ProxyResult<()> {
        if self.hex_password.len() != HEX_PASSWORD_LEN {
            return Err(ProxyError::Extension("password must be sha224 hex"));
        }
        buf.put_slice(self.hex_password.as_bytes());
        buf.put_slice(CRLF);
        buf.put_u8(self.request.cmd);
        self.request.encode_addr(buf)?;
        buf.put_slice(CRLF);
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn need(buf: &BinaryMut, size: usize) -> ProxyResult<()> {
        if buf.remaining() < size {
            return Err(ProxyError::MalformedRequest("frame truncated"));
        }
        Ok(())
    }

    fn read_crlf(buf: &mut BinaryMut) -> ProxyResult<()> {
        Self::need(buf, 2)?;
        if &buf.chunk()[..2] != CRLF {
            return Err(ProxyError::MalformedRequest("miss crlf"));
        }
        buf.advance(2);
        Ok(())
    }

    /// 读取通用地址格式，包含V4/V6/Domain三种格式
    fn read_addr(buf: &mut BinaryMut) -> ProxyResult<(String, u16)> {
        Self::need(buf, 1)?;
        let atyp = buf.get_u8();
        let host = match atyp {
            TROJAN_ADDR_TYPE_IPV4 => {
                Self::need(buf, 4 + 2)?;
                Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8()).to_string()
            }
            TROJAN_ADDR_TYPE_DOMAIN => {
                Self::need(buf, 1)?;
                let len = buf.get_u8() as usize;
                if len == 0 {
                    return Err(ProxyError::MalformedRequest("empty domain"));
                }
                Self::need(buf, len + 2)?;
                let name = std::str::from_utf8(&buf.chunk()[..len])
                    .map_err(|_| ProxyError::MalformedRequest("domain not utf8"))?
                    .to_string();
                buf.advance(len);
                name
            }
            TROJAN_ADDR_TYPE_IPV6 => {
                Self::need(buf, 16 + 2)?;
                Ipv6Addr::new(
                    buf.get_u16(),
                    buf.get_u16(),
                    buf.get_u16(),
                    buf.get_u16(),
                    buf.get_u16(),
                    buf.get_u16(),
                    buf.get_u16(),
                    buf.get_u16(),
                )
                .to_string()
            }
            _ => return Err(ProxyError::MalformedRequest("invalid address type")),
        };
        let port = buf.get_u16();
        Ok((host, port))
    }
}
