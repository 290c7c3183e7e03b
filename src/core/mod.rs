//! 核心域模型与编排
//!
//! agent 定义数据模型，decision 是 LLM 输出的解析边界，orchestrator 驱动
//! 每个 Agent 的调度循环，events 把内部进展推给订阅方。

pub mod agent;
pub mod decision;
pub mod error;
pub mod events;
pub mod orchestrator;

pub use agent::{
    Agent, AgentCapabilities, AgentConfig, AgentDraft, AgentStats, AgentStatus, AgentTask,
    AgentUpdate, AutonomyLevel, TaskStatus,
};
pub use decision::{parse_decision, scan_automation, AgentAction, AutomationCommand, Decision};
pub use error::HiveError;
pub use events::{EventBus, HiveEvent, LogLevel};
pub use orchestrator::{AgentOrchestrator, CostModel, FlatCost, NoopProbe, ResourceProbe};
