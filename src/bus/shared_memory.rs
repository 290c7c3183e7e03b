//! 共享内存条目
//!
//! 键唯一，归创建者所有；读写各带一个 ACL（agent id 列表，`*` 为通配）。
//! 新建键默认：所有人可读，仅创建者可写。过期条目在首次读取/列举时惰性删除。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const WILDCARD: &str = "*";

/// 读写权限列表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permissions {
    pub read: Vec<String>,
    pub write: Vec<String>,
}

impl Permissions {
    /// 默认权限：read 全员，write 仅创建者
    pub fn default_for(owner: &str) -> Self {
        Self {
            read: vec![WILDCARD.to_string()],
            write: vec![owner.to_string()],
        }
    }

    pub fn can_read(&self, agent_id: &str) -> bool {
        self.read.iter().any(|id| id == WILDCARD || id == agent_id)
    }

    pub fn can_write(&self, agent_id: &str) -> bool {
        self.write.iter().any(|id| id == WILDCARD || id == agent_id)
    }
}

/// 跨 Agent 可见、可选过期的 KV 条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedEntry {
    pub key: String,
    pub value: Value,
    /// 创建者
    pub owner: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub permissions: Permissions,
}

impl SharedEntry {
    pub fn new(
        key: impl Into<String>,
        value: Value,
        owner: impl Into<String>,
        permissions: Option<Permissions>,
        ttl_ms: Option<u64>,
    ) -> Self {
        let owner = owner.into();
        let permissions = permissions.unwrap_or_else(|| Permissions::default_for(&owner));
        Self {
            key: key.into(),
            value,
            owner,
            timestamp: Utc::now(),
            expires_at: ttl_ms.map(|ms| Utc::now() + Duration::milliseconds(ms as i64)),
            permissions,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() > at).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_permissions_read_all_write_creator() {
        let perms = Permissions::default_for("agent_a");
        assert!(perms.can_read("agent_a"));
        assert!(perms.can_read("agent_b"));
        assert!(perms.can_write("agent_a"));
        assert!(!perms.can_write("agent_b"));
    }

    #[test]
    fn entry_without_ttl_never_expires() {
        let entry = SharedEntry::new("k", serde_json::json!(1), "a", None, None);
        assert!(!entry.is_expired());
    }
}
