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
// Created Date: 2024/03/07 10:05:48

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use regex::Regex;

use super::{DirectOutbound, Outbound, OutboundResolver};
use crate::{ConfigOption, Odor, OutboundKind, ProxyError, ProxyResult, RuleConfig};

struct Rule {
    tags: Vec<String>,
    domain: Vec<Regex>,
    port: Vec<u16>,
    outbound: String,
}

impl Rule {
    fn new(config: &RuleConfig) -> ProxyResult<Self> {
        let mut domain = vec![];
        for d in &config.domain {
            let re = Regex::new(d).map_err(|e| {
                log::error!("规则中的域名正则{}错误: {}", d, e);
                ProxyError::Extension("rule domain regex error")
            })?;
            domain.push(re);
        }
        Ok(Self {
            tags: config.tags.clone(),
            domain,
            port: config.port.clone(),
            outbound: config.outbound.clone(),
        })
    }

    fn is_match(&self, tag: &str, odor: &Odor) -> bool {
        if !self.tags.is_empty() && !self.tags.iter().any(|t| t == tag) {
            return false;
        }
        if !self.port.is_empty() && !self.port.contains(&odor.port()) {
            return false;
        }
        if !self.domain.is_empty() && !self.domain.iter().any(|r| r.is_match(odor.host())) {
            return false;
        }
        true
    }
}

/// 按配置的规则选择出口, 第一个匹配的规则生效, 均不匹配时使用第一个出口
pub struct RuleResolver {
    /// 值为None的出口为阻断
    outbounds: HashMap<String, Option<Arc<dyn Outbound>>>,
    default_tag: Option<String>,
    rules: Vec<Rule>,
}

impl RuleResolver {
    pub fn new(option: &ConfigOption) -> ProxyResult<Self> {
        let timeout = Duration::from_secs(option.connect_timeout);
        let mut outbounds = HashMap::new();
        for config in &option.outbounds {
            let outbound: Option<Arc<dyn Outbound>> = match config.protocol {
                OutboundKind::Direct => {
                    Some(Arc::new(DirectOutbound::new(config.tag.clone(), timeout)))
                }
                OutboundKind::Block => None,
            };
            outbounds.insert(config.tag.clone(), outbound);
        }
        let mut rules = vec![];
        for config in &option.rules {
            if !outbounds.contains_key(&config.outbound) {
                log::error!("规则引用了不存在的出口: {}", config.outbound);
                return Err(ProxyError::Extension("rule outbound not exist"));
            }
            rules.push(Rule::new(config)?);
        }
        Ok(Self {
            outbounds,
            default_tag: option.outbounds.first().map(|o| o.tag.clone()),
            rules,
        })
    }
}

#[async_trait]
impl OutboundResolver for RuleResolver {
    async fn resolve(&self, tag: &str, odor: &Odor) -> Option<Arc<dyn Outbound>> {
        let outbound_tag = match self.rules.iter().find(|r| r.is_match(tag, odor)) {
            Some(rule) => &rule.outbound,
            None => self.default_tag.as_ref()?,
        };
        let outbound = self.outbounds.get(outbound_tag)?.clone();
        log::trace!(
            "[{}] 标签{}选中出口{}, 是否阻断:{}",
            odor.from_channel(),
            tag,
            outbound_tag,
            outbound.is_none()
        );
        outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutboundConfig, Protocol};

    fn option() -> ConfigOption {
        let mut option = ConfigOption::default();
        option.outbounds = vec![
            OutboundConfig::new("direct", OutboundKind::Direct),
            OutboundConfig::new("deny", OutboundKind::Block),
        ];
        option.rules = vec![
            RuleConfig {
                tags: vec![],
                domain: vec![r"(^|\.)ads\.example$".to_string()],
                port: vec![],
                outbound: "deny".to_string(),
            },
            RuleConfig {
                tags: vec!["guest".to_string()],
                domain: vec![],
                port: vec![25],
                outbound: "deny".to_string(),
            },
        ];
        option
    }

    fn odor(host: &str, port: u16) -> Odor {
        Odor::with_command(host.to_string(), port, Protocol::Trojan, true, "t".to_string())
    }

    #[tokio::test]
    async fn resolve_by_rules() {
        let resolver = RuleResolver::new(&option()).unwrap();
        assert!(resolver.resolve("any", &odor("cdn.ads.example", 443)).await.is_none());
        assert!(resolver.resolve("guest", &odor("mail.example", 25)).await.is_none());
        let outbound = resolver.resolve("vip", &odor("mail.example", 25)).await.unwrap();
        assert_eq!(outbound.tag(), "direct");
    }

    #[tokio::test]
    async fn no_outbound_denies() {
        let resolver = RuleResolver::new(&ConfigOption::default()).unwrap();
        assert!(resolver.resolve("any", &odor("example.com", 80)).await.is_none());
    }

    #[test]
    fn rule_with_unknown_outbound() {
        let mut option = option();
        option.rules[0].outbound = "missing".to_string();
        assert!(RuleResolver::new(&option).is_err());
    }
}
