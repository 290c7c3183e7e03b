//! Agent 间消息
//!
//! 发送后不可变（仅 read 标志可翻转）。to 为具体 Agent id 或 broadcast；
//! 广播对除发送者外的所有 Agent 可见。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 收件方：具体 Agent 或广播（序列化为 agent id 字符串 / "broadcast"）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

impl From<String> for Recipient {
    fn from(s: String) -> Self {
        if s == "broadcast" {
            Recipient::Broadcast
        } else {
            Recipient::Agent(s)
        }
    }
}

impl From<Recipient> for String {
    fn from(r: Recipient) -> Self {
        match r {
            Recipient::Agent(id) => id,
            Recipient::Broadcast => "broadcast".to_string(),
        }
    }
}

impl Recipient {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Data,
}

/// 优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageMetadata {
    pub request_id: Option<String>,
    pub priority: Priority,
    pub requires_response: bool,
}

/// 点对点或广播消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: Recipient,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub metadata: MessageMetadata,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl AgentMessage {
    pub fn new(
        from: impl Into<String>,
        to: Recipient,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            from: from.into(),
            to,
            content: content.into(),
            kind,
            metadata,
            timestamp: Utc::now(),
            read: false,
        }
    }
}
