//! 事件总线：面向展示层的推送通知
//!
//! 单一 broadcast 主题，订阅者各自独立消费；发送为尽力而为（at-most-once），
//! 无订阅者或落后导致的丢失不影响正确性契约。

use tokio::sync::broadcast;

use crate::approval::UserPrompt;
use crate::bus::AgentMessage;
use crate::core::agent::AgentStatus;
use crate::core::decision::AutomationCommand;
use crate::executor::CommandResult;

/// 日志级别（agent:log 推送用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Error,
}

/// 推送给展示层的事件
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HiveEvent {
    AgentStatus {
        agent_id: String,
        status: AgentStatus,
    },
    AgentLog {
        agent_id: String,
        level: LogLevel,
        message: String,
    },
    MessageSent {
        message: AgentMessage,
    },
    MemoryUpdated {
        key: String,
    },
    CommandStarted {
        id: String,
        command: String,
        agent_id: Option<String>,
    },
    CommandStdout {
        id: String,
        chunk: String,
    },
    CommandStderr {
        id: String,
        chunk: String,
    },
    CommandCompleted {
        result: CommandResult,
    },
    PromptCreated {
        prompt: UserPrompt,
    },
    PromptActive {
        prompt: UserPrompt,
    },
    PromptResolved {
        prompt: UserPrompt,
    },
    /// computer_control 能力解析出的自动化指令；实际输入合成由外部协作者完成
    Automation {
        agent_id: String,
        command: AutomationCommand,
    },
}

/// broadcast 封装：publish 忽略「无订阅者」错误
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HiveEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HiveEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: HiveEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
