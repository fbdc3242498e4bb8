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
// Created Date: 2024/03/05 15:02:48

use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{self, BufReader},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use log::LevelFilter;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use tokio_rustls::{rustls, TlsAcceptor};

use crate::{Flag, ProxyError, ProxyResult};

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

/// trojan的用户配置, tag用于路由规则选择出口
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrojanSetting {
    pub password: String,
    #[serde(default)]
    pub tag: Option<String>,
}

impl TrojanSetting {
    pub fn new(password: &str, tag: Option<&str>) -> Self {
        Self {
            password: password.to_string(),
            tag: tag.map(|t| t.to_string()),
        }
    }
}

/// 入口配置, 每个入口监听独立的端口
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// 绑定的地址
    #[serde(default = "default_bind")]
    pub bind: String,
    pub port: u16,
    /// 入口协议, 如 http socks5 trojan
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub protocol: Flag,
    /// 路由标识, 未配置时为空
    #[serde(default)]
    pub tag: String,
    /// 用于http及socks验证
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub trojan_settings: Vec<TrojanSetting>,
    /// 配置时trojan承载在websocket之上
    pub ws_path: Option<String>,
    /// 公开的证书公钥文件
    pub cert: Option<String>,
    /// 隐私的证书私钥文件
    pub key: Option<String>,
}

impl InboundConfig {
    pub fn new(port: u16, protocol: Flag) -> Self {
        Self {
            bind: default_bind(),
            port,
            protocol,
            tag: String::new(),
            username: None,
            password: None,
            trojan_settings: vec![],
            ws_path: None,
            cert: None,
            key: None,
        }
    }

    pub fn bind_addr(&self) -> ProxyResult<SocketAddr> {
        let host = if self.bind.contains(':') && !self.bind.starts_with('[') {
            format!("[{}]", self.bind)
        } else {
            self.bind.clone()
        };
        format!("{}:{}", host, self.port).parse::<SocketAddr>().map_err(|_| {
            log::error!("入口绑定地址{}:{}错误", self.bind, self.port);
            ProxyError::Extension("bind address error")
        })
    }

    pub fn is_trojan(&self) -> bool {
        self.protocol.contains(Flag::TROJAN)
    }

    pub fn is_tls(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }

    fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()
    }

    fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        match rustls_pemfile::private_key(&mut reader)? {
            Some(key) => Ok(key),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("No private key found in {}", path),
            )),
        }
    }

    /// 获取入口的tls配置, 未配置证书时返回None
    pub fn get_tls_accept(&self) -> ProxyResult<Option<TlsAcceptor>> {
        let (cert, key) = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Ok(None),
        };
        let certs = Self::load_certs(cert)?;
        let key = Self::load_key(key)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    /// 直接连接目标地址
    Direct,
    /// 拒绝连接
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: OutboundKind,
}

impl OutboundConfig {
    pub fn new(tag: &str, protocol: OutboundKind) -> Self {
        Self {
            tag: tag.to_string(),
            protocol,
        }
    }
}

/// 路由规则, 空的条件表示匹配任意值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub port: Vec<u16>,
    pub outbound: String,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOption {
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub disable_stdout: bool,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub default_level: Option<LevelFilter>,
    /// 日志名称及路径等级, 如 "logs/proxy.log trace"
    #[serde(default)]
    pub log_names: HashMap<String, String>,
    /// 出口连接超时, 单位秒
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// 首帧等待及丢弃处理的空闲超时, 单位秒, 0表示不超时
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ConfigOption {
    fn default() -> Self {
        Self {
            inbounds: vec![],
            outbounds: vec![],
            rules: vec![],
            disable_stdout: false,
            default_level: None,
            log_names: HashMap::new(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl ConfigOption {
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout))
        }
    }

    /// 加载配置后的校验, 未配置出口时添加默认的直连出口
    pub fn after_load_option(&mut self) -> ProxyResult<()> {
        if self.outbounds.is_empty() {
            self.outbounds
                .push(OutboundConfig::new("direct", OutboundKind::Direct));
        }

        let mut tags = HashSet::new();
        for outbound in &self.outbounds {
            if !tags.insert(outbound.tag.as_str()) {
                log::error!("出口标识{}重复", outbound.tag);
                return Err(ProxyError::Extension("duplicate outbound tag"));
            }
        }

        let mut ports = HashSet::new();
        for inbound in &self.inbounds {
            // 端口0由系统分配, 不会冲突
            if inbound.port != 0 && !ports.insert(inbound.port) {
                log::error!("入口端口{}重复", inbound.port);
                return Err(ProxyError::Extension("duplicate inbound port"));
            }
            if inbound.protocol.is_empty() {
                return Err(ProxyError::Extension("inbound protocol empty"));
            }
            if inbound.is_trojan() {
                if inbound.protocol != Flag::TROJAN {
                    log::error!("trojan入口{}不能与其它协议共用端口", inbound.port);
                    return Err(ProxyError::Extension("trojan must own the port"));
                }
                if inbound.trojan_settings.is_empty() {
                    log::error!("trojan入口{}未配置密码", inbound.port);
                    return Err(ProxyError::Extension("trojan settings empty"));
                }
            } else if inbound.ws_path.is_some() {
                return Err(ProxyError::Extension("ws_path only for trojan"));
            }
            if inbound.cert.is_some() != inbound.key.is_some() {
                return Err(ProxyError::Extension("cert and key must be pair"));
            }
            inbound.bind_addr()?;
        }

        for rule in &self.rules {
            if !tags.contains(rule.outbound.as_str()) {
                log::error!("规则中的出口{}不存在", rule.outbound);
                return Err(ProxyError::Extension("rule outbound not found"));
            }
            for domain in &rule.domain {
                if regex::Regex::new(domain).is_err() {
                    log::error!("规则中的域名正则{}错误", domain);
                    return Err(ProxyError::Extension("rule domain regex error"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
default_level: debug
idle_timeout: 30
inbounds:
  - port: 1080
    protocol: socks5
  - port: 8443
    protocol: trojan
    tag: in-trojan
    ws_path: /ws
    trojan_settings:
      - password: s3cr3t
        tag: vip
outbounds:
  - tag: direct
    protocol: direct
  - tag: deny
    protocol: block
rules:
  - domain: ["ads\\.example$"]
    outbound: deny
"#;

    const TOML: &str = r#"
[[inbounds]]
bind = "127.0.0.1"
port = 8080
protocol = "http"
username = "user"
password = "pass"
"#;

    #[test]
    fn load_yaml() {
        let mut option: ConfigOption = serde_yaml::from_str(YAML).unwrap();
        option.after_load_option().unwrap();
        assert_eq!(option.default_level, Some(LevelFilter::Debug));
        assert_eq!(option.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(option.connect_timeout, 10);
        assert_eq!(option.inbounds.len(), 2);
        assert_eq!(option.inbounds[0].protocol, Flag::SOCKS4 | Flag::SOCKS5);
        assert_eq!(option.inbounds[0].bind, "0.0.0.0");
        let trojan = &option.inbounds[1];
        assert!(trojan.is_trojan());
        assert_eq!(trojan.ws_path.as_deref(), Some("/ws"));
        assert_eq!(trojan.trojan_settings[0].tag.as_deref(), Some("vip"));
        assert_eq!(option.outbounds[1].protocol, OutboundKind::Block);
        assert!(option.rules[0].tags.is_empty());
    }

    #[test]
    fn load_toml_default_outbound() {
        let mut option: ConfigOption = toml::from_str(TOML).unwrap();
        assert!(option.outbounds.is_empty());
        option.after_load_option().unwrap();
        assert_eq!(option.outbounds.len(), 1);
        assert_eq!(option.outbounds[0].tag, "direct");
        let inbound = &option.inbounds[0];
        assert_eq!(inbound.protocol, Flag::HTTP);
        assert_eq!(
            inbound.bind_addr().unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(!inbound.is_tls());
        assert!(inbound.get_tls_accept().unwrap().is_none());
    }

    #[test]
    fn reject_invalid() {
        let mut option = ConfigOption::default();
        option.inbounds.push(InboundConfig::new(443, Flag::TROJAN));
        assert!(option.after_load_option().is_err());

        let mut option = ConfigOption::default();
        let mut inbound = InboundConfig::new(443, Flag::TROJAN | Flag::HTTP);
        inbound.trojan_settings.push(TrojanSetting::new("pwd", None));
        option.inbounds.push(inbound);
        assert!(option.after_load_option().is_err());

        let mut option = ConfigOption::default();
        option.inbounds.push(InboundConfig::new(80, Flag::HTTP));
        option.inbounds.push(InboundConfig::new(80, Flag::SOCKS5));
        assert!(option.after_load_option().is_err());

        let mut option = ConfigOption::default();
        option.rules.push(RuleConfig {
            tags: vec![],
            domain: vec![],
            port: vec![],
            outbound: "missing".to_string(),
        });
        assert!(option.after_load_option().is_err());
    }

    #[test]
    fn ipv6_bind() {
        let mut inbound = InboundConfig::new(1080, Flag::SOCKS5);
        inbound.bind = "::1".to_string();
        assert_eq!(
            inbound.bind_addr().unwrap(),
            "[::1]:1080".parse::<SocketAddr>().unwrap()
        );
    }
}
