use std::{fmt::Display, str::FromStr};

use bitflags::bitflags;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Flag: u8 {
        /// 使用HTTP代理类型, 包含CONNECT隧道
        const HTTP = 0x1;
        /// 使用SOCKS4及SOCKS4A代理类型
        const SOCKS4 = 0x2;
        /// 使用SOCKS5代理类型
        const SOCKS5 = 0x4;
        /// 使用Trojan协议, 不可与其它协议共用端口
        const TROJAN = 0x8;
    }
}

impl Default for Flag {
    fn default() -> Self {
        Flag::HTTP | Flag::SOCKS4 | Flag::SOCKS5
    }
}

impl FromStr for Flag {
    type Err = String;

    /// 支持以逗号分隔的多种协议, 如"http,socks5"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flag = Flag::empty();
        for name in s.split(',') {
            match &*name.trim().to_ascii_lowercase() {
                "http" | "https" => flag.set(Flag::HTTP, true),
                // socks4与socks5在同一端口上按首字节区分
                "socks" | "socks4" | "socks4a" | "socks5" => flag.set(Flag::SOCKS4 | Flag::SOCKS5, true),
                "trojan" => flag.set(Flag::TROJAN, true),
                "" => {}
                other => return Err(format!("unknown inbound protocol {}", other)),
            }
        }
        if flag.is_empty() {
            return Err("inbound protocol can't be empty".to_string());
        }
        Ok(flag)
    }
}

impl Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = vec![];
        if self.contains(Flag::HTTP) {
            names.push("http");
        }
        if self.contains(Flag::SOCKS4) {
            names.push("socks4");
        }
        if self.contains(Flag::SOCKS5) {
            names.push("socks5");
        }
        if self.contains(Flag::TROJAN) {
            names.push("trojan");
        }
        f.write_str(&names.join(","))
    }
}
