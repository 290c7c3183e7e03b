//! 受控命令执行器
//!
//! 所有命令经 `sh -c` 启动，执行前过三道静态校验（阻止子串、allowlist、包管理器
//! 开关），校验默认拒绝。超时或显式 kill 走 SIGTERM -> 宽限期 -> SIGKILL 升级。
//! stdout/stderr 边读边以事件推送，完整结果进入有界历史并持久化。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::events::{EventBus, HiveEvent};
use crate::core::HiveError;
use crate::storage::{load_records, save_records, StoreBackend};

const HISTORY: &str = "command_history";
const HISTORY_CAP: usize = 1000;

/// 执行策略（运行期可整体替换）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPermissions {
    /// 允许的命令首 token；`*` 放行所有
    pub allowed_commands: Vec<String>,
    /// 子串匹配的阻止列表（优先于 allowlist）
    pub blocked_commands: Vec<String>,
    pub allow_network: bool,
    pub allow_file_system: bool,
    pub allow_package_managers: bool,
    pub max_execution_time_ms: u64,
    pub working_dir: Option<String>,
}

impl Default for CommandPermissions {
    fn default() -> Self {
        Self {
            allowed_commands: vec!["*".to_string()],
            blocked_commands: vec![
                "rm -rf /".to_string(),
                "mkfs".to_string(),
                "dd if=".to_string(),
                "format".to_string(),
                ":(){:|:&};:".to_string(),
                "sudo rm".to_string(),
                "sudo dd".to_string(),
                "> /dev/sd".to_string(),
            ],
            allow_network: true,
            allow_file_system: true,
            allow_package_managers: true,
            max_execution_time_ms: 300_000,
            working_dir: None,
        }
    }
}

const PACKAGE_MANAGERS: &[&str] = &["npm", "pip", "apt", "apt-get", "yum", "brew", "cargo", "gem"];

/// 单次执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

/// 一次执行的完整记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub id: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// 被信号终止或 spawn 失败时为 None
    pub exit_code: Option<i32>,
    pub status: CommandStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub working_dir: String,
    pub agent_id: Option<String>,
}

/// 进行中命令的只读视图
#[derive(Debug, Clone, Serialize)]
pub struct RunningCommand {
    pub id: String,
    pub command: String,
    pub agent_id: Option<String>,
    pub start_time: DateTime<Utc>,
}

/// 单次执行的可选参数
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub agent_id: Option<String>,
    pub working_dir: Option<String>,
    pub timeout_ms: Option<u64>,
    /// 整体替换本次执行的策略（默认用执行器全局策略）
    pub permissions: Option<CommandPermissions>,
    pub env: HashMap<String, String>,
}

/// 命令执行器
pub struct CommandExecutor {
    permissions: RwLock<CommandPermissions>,
    history: RwLock<Vec<CommandResult>>,
    running: RwLock<HashMap<String, (CancellationToken, RunningCommand)>>,
    store: Arc<dyn StoreBackend>,
    events: EventBus,
    /// SIGTERM 后到 SIGKILL 的宽限期
    kill_grace: Duration,
}

impl CommandExecutor {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        events: EventBus,
        permissions: CommandPermissions,
        kill_grace: Duration,
    ) -> Self {
        let history: Vec<CommandResult> = load_records(store.as_ref(), HISTORY);
        if !history.is_empty() {
            tracing::info!("Restored {} command history entries", history.len());
        }
        Self {
            permissions: RwLock::new(permissions),
            history: RwLock::new(history),
            running: RwLock::new(HashMap::new()),
            store,
            events,
            kill_grace,
        }
    }

    /// 静态校验；Some(reason) 表示拒绝
    pub async fn is_command_safe(&self, command: &str) -> Option<String> {
        let permissions = self.permissions.read().await;
        validate(&permissions, command)
    }

    /// 执行命令。校验失败返回 PermissionDenied；spawn 失败折叠为 Failed 结果而非错误。
    pub async fn execute(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandResult, HiveError> {
        let permissions = match &opts.permissions {
            Some(overridden) => overridden.clone(),
            None => self.permissions.read().await.clone(),
        };
        if let Some(reason) = validate(&permissions, command) {
            tracing::warn!("Rejected command {:?}: {}", command, reason);
            return Err(HiveError::PermissionDenied(reason));
        }

        let id = format!("cmd_{}", uuid::Uuid::new_v4());
        let start_time = Utc::now();
        let started = std::time::Instant::now();
        // 未指定目录时落到家目录
        let working_dir = opts
            .working_dir
            .clone()
            .or_else(|| permissions.working_dir.clone())
            .or_else(|| std::env::var("HOME").ok())
            .unwrap_or_else(|| ".".to_string());
        let timeout_ms = opts.timeout_ms.unwrap_or(permissions.max_execution_time_ms);

        let token = CancellationToken::new();
        {
            let view = RunningCommand {
                id: id.clone(),
                command: command.to_string(),
                agent_id: opts.agent_id.clone(),
                start_time,
            };
            self.running
                .write()
                .await
                .insert(id.clone(), (token.clone(), view));
        }
        self.events.publish(HiveEvent::CommandStarted {
            id: id.clone(),
            command: command.to_string(),
            agent_id: opts.agent_id.clone(),
        });
        tracing::info!("Executing command {}: {}", id, command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .envs(&opts.env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        // 独立进程组：终止时整组发信号，连同 sh 派生的子进程一起回收
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let result = CommandResult {
                    id: id.clone(),
                    command: command.to_string(),
                    stdout: String::new(),
                    stderr: format!("Failed to spawn: {}", e),
                    exit_code: None,
                    status: CommandStatus::Failed,
                    start_time,
                    end_time: Some(Utc::now()),
                    duration_ms: started.elapsed().as_millis() as u64,
                    working_dir,
                    agent_id: opts.agent_id,
                };
                self.finalize(result.clone()).await;
                return Ok(result);
            }
        };

        let stdout_task = child.stdout.take().map(|out| {
            spawn_reader(out, id.clone(), self.events.clone(), true)
        });
        let stderr_task = child.stderr.take().map(|err| {
            spawn_reader(err, id.clone(), self.events.clone(), false)
        });

        let mut killed = false;
        let mut timed_out = false;
        let exit_status = tokio::select! {
            status = child.wait() => status,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                timed_out = true;
                self.terminate(&mut child).await
            }
            _ = token.cancelled() => {
                killed = true;
                self.terminate(&mut child).await
            }
        };

        // kill 路径下残留子进程可能仍握着管道写端，读端回收必须有界
        let bounded = killed || timed_out;
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(task) = stdout_task {
            stdout = drain_reader(task, bounded, self.kill_grace).await;
        }
        if let Some(task) = stderr_task {
            stderr = drain_reader(task, bounded, self.kill_grace).await;
        }
        if timed_out {
            stderr.push_str(&format!("\nCommand timed out after {}ms", timeout_ms));
        }

        let (exit_code, status) = match exit_status {
            Ok(status) if killed || timed_out => (status.code(), CommandStatus::Killed),
            Ok(status) if status.success() => (status.code(), CommandStatus::Completed),
            Ok(status) => (status.code(), CommandStatus::Failed),
            Err(e) => {
                stderr.push_str(&format!("\nWait failed: {}", e));
                (None, CommandStatus::Failed)
            }
        };

        let result = CommandResult {
            id,
            command: command.to_string(),
            stdout,
            stderr,
            exit_code,
            status,
            start_time,
            end_time: Some(Utc::now()),
            duration_ms: started.elapsed().as_millis() as u64,
            working_dir,
            agent_id: opts.agent_id,
        };
        self.finalize(result.clone()).await;
        Ok(result)
    }

    /// 对整个进程组 SIGTERM -> 宽限期 -> SIGKILL
    async fn terminate(&self, child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // spawn 时 process_group(0) 让 sh 成为组长，pgid == pid
                let group = nix::unistd::Pid::from_raw(pid as i32);
                if let Err(e) = nix::sys::signal::killpg(group, nix::sys::signal::Signal::SIGTERM) {
                    tracing::warn!("SIGTERM failed for process group {}: {}", group, e);
                }
                tokio::select! {
                    status = child.wait() => {
                        // 组长先退出时对整组补发 SIGKILL，回收残留子进程
                        let _ = nix::sys::signal::killpg(group, nix::sys::signal::Signal::SIGKILL);
                        return status;
                    }
                    _ = tokio::time::sleep(self.kill_grace) => {
                        tracing::warn!("Process group {} ignored SIGTERM, escalating to SIGKILL", pid);
                    }
                }
                let _ = nix::sys::signal::killpg(group, nix::sys::signal::Signal::SIGKILL);
            }
        }
        child.kill().await?;
        child.wait().await
    }

    /// 取消一个进行中的命令
    pub async fn kill(&self, id: &str) -> bool {
        let running = self.running.read().await;
        match running.get(id) {
            Some((token, _)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn running(&self) -> Vec<RunningCommand> {
        self.running
            .read()
            .await
            .values()
            .map(|(_, view)| view.clone())
            .collect()
    }

    /// 历史记录（时间顺序），可按 Agent 过滤、截取末尾 limit 条
    pub async fn history(&self, agent_id: Option<&str>, limit: Option<usize>) -> Vec<CommandResult> {
        let history = self.history.read().await;
        let filtered: Vec<CommandResult> = history
            .iter()
            .filter(|r| agent_id.map_or(true, |id| r.agent_id.as_deref() == Some(id)))
            .cloned()
            .collect();
        match limit {
            Some(limit) if filtered.len() > limit => filtered[filtered.len() - limit..].to_vec(),
            _ => filtered,
        }
    }

    /// 清除历史，可只清某个 Agent 的
    pub async fn clear_history(&self, agent_id: Option<&str>) {
        let mut history = self.history.write().await;
        match agent_id {
            Some(id) => history.retain(|r| r.agent_id.as_deref() != Some(id)),
            None => history.clear(),
        }
        save_records(self.store.as_ref(), HISTORY, history.iter());
    }

    pub async fn permissions(&self) -> CommandPermissions {
        self.permissions.read().await.clone()
    }

    pub async fn update_permissions(&self, permissions: CommandPermissions) {
        *self.permissions.write().await = permissions;
    }

    async fn finalize(&self, result: CommandResult) {
        self.running.write().await.remove(&result.id);
        {
            let mut history = self.history.write().await;
            history.push(result.clone());
            if history.len() > HISTORY_CAP {
                let drop = history.len() - HISTORY_CAP;
                history.drain(..drop);
            }
            save_records(self.store.as_ref(), HISTORY, history.iter());
        }
        tracing::info!(
            "Command {} finished: {:?} (exit {:?}, {}ms)",
            result.id,
            result.status,
            result.exit_code,
            result.duration_ms
        );
        self.events.publish(HiveEvent::CommandCompleted { result });
    }
}

fn validate(permissions: &CommandPermissions, command: &str) -> Option<String> {
    let lowered = command.to_lowercase();
    for blocked in &permissions.blocked_commands {
        if lowered.contains(&blocked.to_lowercase()) {
            return Some(format!("Command contains blocked pattern: {}", blocked));
        }
    }

    let first = match command.split_whitespace().next() {
        Some(first) => first,
        None => return Some("Empty command".to_string()),
    };

    let wildcard = permissions.allowed_commands.iter().any(|c| c == "*");
    if !wildcard && !permissions.allowed_commands.iter().any(|c| c == first) {
        return Some(format!("Command not in allowed list: {}", first));
    }

    if !permissions.allow_package_managers && PACKAGE_MANAGERS.contains(&first) {
        return Some(format!("Package manager commands are disabled: {}", first));
    }

    None
}

/// 回收读端任务；有界模式最多等一个宽限期，超时放弃残余输出
async fn drain_reader(mut task: JoinHandle<String>, bounded: bool, grace: Duration) -> String {
    if !bounded {
        return task.await.unwrap_or_default();
    }
    match tokio::time::timeout(grace, &mut task).await {
        Ok(collected) => collected.unwrap_or_default(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

fn spawn_reader<R>(reader: R, id: String, events: EventBus, is_stdout: bool) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
            let event = if is_stdout {
                HiveEvent::CommandStdout {
                    id: id.clone(),
                    chunk: line,
                }
            } else {
                HiveEvent::CommandStderr {
                    id: id.clone(),
                    chunk: line,
                }
            };
            events.publish(event);
        }
        collected
    })
}
