//! Hive - 多智能体编排系统
//!
//! 模块结构:
//! - core: 域模型、决策解析、编排循环与事件总线
//! - llm: 多 Provider 补全网关（OpenAI 兼容 / Anthropic / Mock）
//! - bus: Agent 间消息与共享内存
//! - executor: 受控命令执行（校验 / 超时 / 信号升级）
//! - approval: 人工确认门（单活跃 + FIFO 队列 + 超时）
//! - storage: JSON 注册表持久化
//! - api: 进程内结构化 API 门面
//! - config: TOML + 环境变量配置

pub mod api;
pub mod approval;
pub mod bus;
pub mod config;
pub mod core;
pub mod executor;
pub mod llm;
pub mod storage;
