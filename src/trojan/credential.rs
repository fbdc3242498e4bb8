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
// Created Date: 2024/03/05 09:12:44

use sha2::{Digest, Sha224};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::TrojanSetting;

/// 将密码转成uuid, 本身即为uuid时保持不变, 否则以空命名空间生成v5的uuid
pub fn password_to_uuid(password: &str) -> Uuid {
    match Uuid::parse_str(password) {
        Ok(uuid) => uuid,
        Err(_) => Uuid::new_v5(&Uuid::nil(), password.as_bytes()),
    }
}

/// 计算与客户端一致的密码摘要, sha224后的小写十六进制
pub fn password_digest(password: &str) -> String {
    let uuid = password_to_uuid(password).hyphenated().to_string();
    let mut hasher = Sha224::new();
    hasher.update(uuid.as_bytes());
    hex::encode(hasher.finalize())
}

/// 加载配置时生成的凭证, 运行期间只比较摘要
#[derive(Clone)]
pub struct Credential {
    digest: String,
    tag: Option<String>,
}

impl Credential {
    pub fn new(password: &str, tag: Option<String>) -> Self {
        Self {
            digest: password_digest(password),
            tag,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn matches(&self, hex_password: &str) -> bool {
        self.digest.as_bytes().ct_eq(hex_password.as_bytes()).into()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// 入口上的凭证集合, 加载后不可变, 各连接只读共享
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    entries: Vec<Credential>,
}

impl CredentialSet {
    pub fn new(entries: Vec<Credential>) -> Self {
        Self { entries }
    }

    pub fn from_settings(settings: &[TrojanSetting]) -> Self {
        Self::new(
            settings
                .iter()
                .map(|s| Credential::new(&s.password, s.tag.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按配置顺序查找, 返回第一个匹配的凭证, 未匹配时返回None
    pub fn authenticate(&self, hex_password: &str) -> Option<&Credential> {
        let mut found = None;
        // 比较所有条目, 耗时与匹配位置无关
        for entry in &self.entries {
            if entry.matches(hex_password) && found.is_none() {
                found = Some(entry);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let first = password_digest("s3cr3t");
        assert_eq!(first, password_digest("s3cr3t"));
        assert_eq!(first.len(), 56);
        assert!(first.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_ne!(first, password_digest("s3cr3t "));
    }

    #[test]
    fn uuid_password_kept() {
        let raw = "5a7a9f2c-3b41-4c6d-9e8f-0a1b2c3d4e5f";
        assert_eq!(password_to_uuid(raw).hyphenated().to_string(), raw);
        let derived = password_to_uuid("s3cr3t");
        assert_eq!(derived.get_version_num(), 5);
        assert_eq!(derived, password_to_uuid("s3cr3t"));
    }

    #[test]
    fn authenticate_first_match() {
        let set = CredentialSet::new(vec![
            Credential::new("other", Some("a".to_string())),
            Credential::new("s3cr3t", Some("b".to_string())),
            Credential::new("s3cr3t", Some("c".to_string())),
        ]);
        let found = set.authenticate(&password_digest("s3cr3t")).unwrap();
        assert_eq!(found.tag(), Some("b"));
        assert!(set.authenticate(&password_digest("nope")).is_none());
        assert!(set.authenticate("").is_none());
    }

    #[test]
    fn debug_hides_digest() {
        let cred = Credential::new("s3cr3t", None);
        assert!(!format!("{:?}", cred).contains(cred.digest()));
    }
}
