//! 配置加载
//!
//! TOML 文件 + `HIVE__` 前缀环境变量覆盖（双下划线分隔层级，如
//! `HIVE__ORCHESTRATOR__LOOP_INTERVAL_SECS=10`）。文件缺失时使用默认值。

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub executor: ExecutorSection,
    pub bus: BusSection,
    pub approval: ApprovalSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            orchestrator: OrchestratorSection::default(),
            executor: ExecutorSection::default(),
            bus: BusSection::default(),
            approval: ApprovalSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 持久化 JSON 注册表所在目录
    pub data_dir: String,
    /// 事件广播通道容量
    pub event_capacity: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            data_dir: "data".to_string(),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub loop_interval_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            loop_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub allowed_commands: Option<Vec<String>>,
    pub blocked_commands: Option<Vec<String>>,
    pub allow_package_managers: bool,
    pub default_timeout_ms: u64,
    pub kill_grace_secs: u64,
    pub working_dir: Option<String>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            allowed_commands: None,
            blocked_commands: None,
            allow_package_managers: true,
            default_timeout_ms: 300_000,
            kill_grace_secs: 5,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub retention_days: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            retention_days: 7,
            cleanup_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub timeout_secs: u64,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl ExecutorSection {
    /// 覆盖式合成执行策略：未配置的字段沿用默认
    pub fn permissions(&self) -> crate::executor::CommandPermissions {
        let mut permissions = crate::executor::CommandPermissions {
            allow_package_managers: self.allow_package_managers,
            max_execution_time_ms: self.default_timeout_ms,
            working_dir: self.working_dir.clone(),
            ..Default::default()
        };
        if let Some(allowed) = &self.allowed_commands {
            permissions.allowed_commands = allowed.clone();
        }
        if let Some(blocked) = &self.blocked_commands {
            permissions.blocked_commands = blocked.clone();
        }
        permissions
    }
}

/// 加载配置：`config/default.toml`（可缺失）+ 环境变量覆盖
pub fn load_config(path: &str) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix("HIVE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_file() {
        let cfg = load_config("config/nonexistent").unwrap();
        assert_eq!(cfg.orchestrator.loop_interval_secs, 5);
        assert_eq!(cfg.bus.retention_days, 7);
        assert_eq!(cfg.approval.timeout_secs, 300);
        assert_eq!(cfg.executor.default_timeout_ms, 300_000);
    }

    #[test]
    fn executor_section_builds_permissions() {
        let section = ExecutorSection {
            allowed_commands: Some(vec!["echo".to_string()]),
            allow_package_managers: true,
            ..Default::default()
        };
        let permissions = section.permissions();
        assert_eq!(permissions.allowed_commands, vec!["echo"]);
        assert!(permissions.allow_package_managers);
        // 未覆盖的阻止列表保持默认
        assert!(!permissions.blocked_commands.is_empty());
    }
}
