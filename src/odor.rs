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
// Created Date: 2024/03/04 11:02:15

use std::fmt::Display;

/// 协议类型, 既表示来源的代理协议, 也表示期望的传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Socks,
    Trojan,
    Tcp,
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Http => "http",
            Protocol::Socks => "socks",
            Protocol::Trojan => "trojan",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        f.write_str(name)
    }
}

/// 目标描述, 客户端想要连接的地址及方式
///
/// 每个请求只创建一次, 创建后不可修改, 交给出口选择后只用于日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Odor {
    host: String,
    port: u16,
    origin_protocol: Protocol,
    des_protocol: Protocol,
    from_channel: String,
}

impl Odor {
    pub fn new(
        host: String,
        port: u16,
        origin_protocol: Protocol,
        des_protocol: Protocol,
        from_channel: String,
    ) -> Self {
        Self {
            host,
            port,
            origin_protocol,
            des_protocol,
            from_channel,
        }
    }

    /// 以命令字决定传输方式, CONNECT为TCP, 其它已支持的命令为UDP
    pub fn with_command(
        host: String,
        port: u16,
        origin_protocol: Protocol,
        is_connect: bool,
        from_channel: String,
    ) -> Self {
        let des_protocol = if is_connect {
            Protocol::Tcp
        } else {
            Protocol::Udp
        };
        Self::new(host, port, origin_protocol, des_protocol, from_channel)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn origin_protocol(&self) -> Protocol {
        self.origin_protocol
    }

    pub fn des_protocol(&self) -> Protocol {
        self.des_protocol
    }

    pub fn from_channel(&self) -> &str {
        &self.from_channel
    }

    /// 用于连接的地址, ipv6需加上中括号
    pub fn target_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for Odor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "[{}] {} {} -> {}",
            self.from_channel,
            self.origin_protocol,
            self.des_protocol,
            self.target_addr()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{Odor, Protocol};

    #[test]
    fn des_protocol_by_command() {
        let odor = Odor::with_command("example.com".to_string(), 443, Protocol::Trojan, true, "a1".to_string());
        assert_eq!(odor.des_protocol(), Protocol::Tcp);
        assert_eq!(odor.target_addr(), "example.com:443");

        let odor = Odor::with_command("::1".to_string(), 53, Protocol::Socks, false, "a2".to_string());
        assert_eq!(odor.des_protocol(), Protocol::Udp);
        assert_eq!(odor.target_addr(), "[::1]:53");
    }
}
