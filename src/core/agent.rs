//! Agent 与任务的数据模型
//!
//! Agent 由编排器独占持有：注册时创建，仅由所属循环或显式 update 调用修改，
//! running 状态下不可删除（须先 stop）。任务归属唯一 Agent，终态（completed/failed）不可复活。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Error,
}

/// 自治级别：low 时副作用动作（命令执行）需要人工批准
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    Low,
    Medium,
    High,
}

impl Default for AutonomyLevel {
    fn default() -> Self {
        Self::Medium
    }
}

/// 能力开关：缺失对应能力的动作会被跳过（记录 warning），不会中断循环
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCapabilities {
    pub computer_control: bool,
    pub file_system: bool,
    pub network: bool,
    pub agent_communication: bool,
    pub command_execution: bool,
}

/// 可调参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_iterations: u32,
    pub autonomy_level: AutonomyLevel,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2000,
            temperature: 0.7,
            max_iterations: 10,
            autonomy_level: AutonomyLevel::default(),
        }
    }
}

/// 运行统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentStats {
    pub total_runs: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub average_run_time_ms: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub commands_executed: u64,
}

impl AgentStats {
    /// 记录一次循环：`avg' = (avg*(n-1) + elapsed)/n`
    pub fn record_run(&mut self, elapsed_ms: f64) {
        self.total_runs += 1;
        let n = self.total_runs as f64;
        self.average_run_time_ms = (self.average_run_time_ms * (n - 1.0) + elapsed_ms) / n;
        self.last_run = Some(Utc::now());
    }
}

/// 创建 Agent 时的输入（id / status / stats 由编排器补全）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub provider_id: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub config: AgentConfig,
}

/// 显式更新 Agent 的字段集合（None 表示不变）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub provider_id: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub capabilities: Option<AgentCapabilities>,
    pub config: Option<AgentConfig>,
}

/// 独立调度的决策单元，绑定一个 Provider/Model 与能力集合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    pub provider_id: String,
    pub model: String,
    pub system_prompt: String,
    pub capabilities: AgentCapabilities,
    pub status: AgentStatus,
    pub config: AgentConfig,
    pub stats: AgentStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(draft: AgentDraft) -> Self {
        let now = Utc::now();
        Self {
            id: format!("agent_{}", uuid::Uuid::new_v4()),
            name: draft.name,
            description: draft.description,
            provider_id: draft.provider_id,
            model: draft.model,
            system_prompt: draft.system_prompt,
            capabilities: draft.capabilities,
            status: AgentStatus::Idle,
            config: draft.config,
            stats: AgentStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, update: AgentUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(provider_id) = update.provider_id {
            self.provider_id = provider_id;
        }
        if let Some(model) = update.model {
            self.model = model;
        }
        if let Some(system_prompt) = update.system_prompt {
            self.system_prompt = system_prompt;
        }
        if let Some(capabilities) = update.capabilities {
            self.capabilities = capabilities;
        }
        if let Some(config) = update.config {
            self.config = config;
        }
        self.updated_at = Utc::now();
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 归属单一 Agent 的工作单元，可由决策或委托创建
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub agent_id: String,
    pub description: String,
    pub status: TaskStatus,
    /// 同一 tick 内 FIFO 排序用的单调序号（时间戳可能相同）
    #[serde(default)]
    pub seq: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub delegated_from: Option<String>,
    pub delegated_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(agent_id: impl Into<String>, description: impl Into<String>, seq: u64) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            agent_id: agent_id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            seq,
            start_time: None,
            end_time: None,
            result: None,
            error: None,
            delegated_from: None,
            delegated_to: None,
            created_at: Utc::now(),
        }
    }

    /// 标记委托来源与接收方
    pub fn delegated(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.delegated_from = Some(from.into());
        self.delegated_to = Some(to.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_average_updates_incrementally() {
        let mut stats = AgentStats::default();
        stats.record_run(100.0);
        stats.record_run(200.0);
        stats.record_run(300.0);
        assert_eq!(stats.total_runs, 3);
        assert!((stats.average_run_time_ms - 200.0).abs() < f64::EPSILON);
        assert!(stats.last_run.is_some());
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
