//! 错误类型
//!
//! 六类错误覆盖全系统：未找到 / 权限拒绝 / 超时 / 取消 / Provider / 解析，外加持久化 IO。
//! 循环内的 Provider 与解析错误按「记录并继续」策略处理，不会中断 Agent 循环。

use thiserror::Error;

/// Hive 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum HiveError {
    /// 未知的 Agent / Provider / 执行 / Prompt id
    #[error("Not found: {0}")]
    NotFound(String),

    /// 被阻止的命令、未授权的共享内存读写
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// 命令或 Prompt 超出时间预算
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 显式 kill 或 Prompt 被取消
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// LLM 后端传输 / 鉴权失败（本层不重试）
    #[error("Provider error: {0}")]
    Provider(String),

    /// 结构化决策或 Automation 负载格式错误
    #[error("Parse error: {0}")]
    Parse(String),

    /// 持久化读写失败
    #[error("Storage error: {0}")]
    Storage(String),
}

impl HiveError {
    /// API 层使用的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            HiveError::NotFound(_) => "not_found",
            HiveError::PermissionDenied(_) => "permission_denied",
            HiveError::Timeout(_) => "timeout",
            HiveError::Cancelled(_) => "cancelled",
            HiveError::Provider(_) => "provider_error",
            HiveError::Parse(_) => "parse_error",
            HiveError::Storage(_) => "storage_error",
        }
    }
}
