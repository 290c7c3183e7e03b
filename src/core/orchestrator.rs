//! Agent 编排器
//!
//! 每个 running Agent 一个可取消的调度任务：立即跑第一轮，之后按固定间隔推进。
//! 单轮顺序：先清洗消息（Request 且 requires_response 进入待办）、再按 seq 取
//! 最早 pending 任务执行、无任务则向 LLM 要一个结构化决策并立即派发。
//! 循环内的 Provider / 解析错误记录并继续，不会终止调度。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalGate;
use crate::bus::{MessageBus, MessageKind, MessageMetadata, Priority, Recipient};
use crate::core::agent::{Agent, AgentDraft, AgentStatus, AgentTask, AgentUpdate, AutonomyLevel, TaskStatus};
use crate::core::decision::{parse_decision, scan_automation, AgentAction};
use crate::core::events::{EventBus, HiveEvent, LogLevel};
use crate::core::HiveError;
use crate::executor::{CommandExecutor, ExecOptions};
use crate::llm::{ChatMessage, CompletionGateway, CompletionOptions, TokenUsage};
use crate::storage::{load_records, save_records, StoreBackend};

const AGENTS: &str = "agents";
const TASKS: &str = "tasks";

/// 环境快照提供方（注入给决策上下文；默认空快照）
pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self) -> Value;
}

/// 零信息探针
pub struct NoopProbe;

impl ResourceProbe for NoopProbe {
    fn snapshot(&self) -> Value {
        json!({})
    }
}

/// token 用量到成本的换算（默认恒为零）
pub trait CostModel: Send + Sync {
    fn cost(&self, provider_id: &str, model: &str, usage: &TokenUsage) -> f64;
}

/// 恒零成本
pub struct FlatCost;

impl CostModel for FlatCost {
    fn cost(&self, _provider_id: &str, _model: &str, _usage: &TokenUsage) -> f64 {
        0.0
    }
}

struct RunningHandle {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// 多 Agent 编排器
pub struct AgentOrchestrator {
    agents: RwLock<HashMap<String, Agent>>,
    tasks: RwLock<HashMap<String, AgentTask>>,
    /// 任务 FIFO 序号（时间戳分辨率不够）
    seq: AtomicU64,
    running: Mutex<HashMap<String, RunningHandle>>,
    gateway: Arc<CompletionGateway>,
    bus: Arc<MessageBus>,
    executor: Arc<CommandExecutor>,
    approval: Arc<ApprovalGate>,
    store: Arc<dyn StoreBackend>,
    events: EventBus,
    probe: Arc<dyn ResourceProbe>,
    cost_model: Arc<dyn CostModel>,
    loop_interval: Duration,
}

impl AgentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<CompletionGateway>,
        bus: Arc<MessageBus>,
        executor: Arc<CommandExecutor>,
        approval: Arc<ApprovalGate>,
        store: Arc<dyn StoreBackend>,
        events: EventBus,
        loop_interval: Duration,
    ) -> Self {
        // 重启后没有调度任务存活，所有 Agent 回到 idle
        let agents: HashMap<String, Agent> = load_records(store.as_ref(), AGENTS)
            .into_iter()
            .map(|mut agent: Agent| {
                agent.status = AgentStatus::Idle;
                (agent.id.clone(), agent)
            })
            .collect();
        let tasks: HashMap<String, AgentTask> = load_records(store.as_ref(), TASKS)
            .into_iter()
            .map(|task: AgentTask| (task.id.clone(), task))
            .collect();
        let seq = tasks.values().map(|t| t.seq).max().map_or(0, |s| s + 1);

        if !agents.is_empty() {
            tracing::info!("Restored {} agents, {} tasks", agents.len(), tasks.len());
        }

        Self {
            agents: RwLock::new(agents),
            tasks: RwLock::new(tasks),
            seq: AtomicU64::new(seq),
            running: Mutex::new(HashMap::new()),
            gateway,
            bus,
            executor,
            approval,
            store,
            events,
            probe: Arc::new(NoopProbe),
            cost_model: Arc::new(FlatCost),
            loop_interval,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }

    // ---- Agent CRUD ----

    pub async fn create_agent(&self, draft: AgentDraft) -> Agent {
        let agent = Agent::new(draft);
        let mut agents = self.agents.write().await;
        agents.insert(agent.id.clone(), agent.clone());
        save_records(self.store.as_ref(), AGENTS, agents.values());
        tracing::info!("Created agent {} ({})", agent.name, agent.id);
        agent
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        agents
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn update_agent(
        &self,
        agent_id: &str,
        update: AgentUpdate,
    ) -> Result<Agent, HiveError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| HiveError::NotFound(format!("agent {}", agent_id)))?;
        agent.apply(update);
        let updated = agent.clone();
        save_records(self.store.as_ref(), AGENTS, agents.values());
        Ok(updated)
    }

    /// 删除 Agent（running 时先停）及其全部任务
    pub async fn delete_agent(&self, agent_id: &str) -> Result<(), HiveError> {
        self.stop_agent(agent_id).await?;
        {
            let mut agents = self.agents.write().await;
            if agents.remove(agent_id).is_none() {
                return Err(HiveError::NotFound(format!("agent {}", agent_id)));
            }
            save_records(self.store.as_ref(), AGENTS, agents.values());
        }
        {
            let mut tasks = self.tasks.write().await;
            tasks.retain(|_, t| t.agent_id != agent_id);
            save_records(self.store.as_ref(), TASKS, tasks.values());
        }
        tracing::info!("Deleted agent {}", agent_id);
        Ok(())
    }

    // ---- 生命周期 ----

    /// 启动调度循环；已在运行时返回 false
    pub async fn start_agent(self: &Arc<Self>, agent_id: &str) -> Result<bool, HiveError> {
        if self.get_agent(agent_id).await.is_none() {
            return Err(HiveError::NotFound(format!("agent {}", agent_id)));
        }

        let mut running = self.running.lock().await;
        if running.contains_key(agent_id) {
            return Ok(false);
        }

        self.set_status(agent_id, AgentStatus::Running).await;
        tracing::info!("Starting agent {}", agent_id);

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let orchestrator = Arc::clone(self);
        let id = agent_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                orchestrator.run_iteration(&id).await;
                tokio::select! {
                    _ = tokio::time::sleep(orchestrator.loop_interval) => {}
                    _ = loop_token.cancelled() => break,
                }
            }
            tracing::debug!("Agent {} loop exited", id);
        });

        running.insert(
            agent_id.to_string(),
            RunningHandle {
                token,
                _handle: handle,
            },
        );
        Ok(true)
    }

    /// 停止调度循环：取消令牌保证不再有新一轮开始；未运行时返回 false
    pub async fn stop_agent(&self, agent_id: &str) -> Result<bool, HiveError> {
        if self.get_agent(agent_id).await.is_none() {
            return Err(HiveError::NotFound(format!("agent {}", agent_id)));
        }

        let handle = self.running.lock().await.remove(agent_id);
        match handle {
            Some(handle) => {
                handle.token.cancel();
                self.set_status(agent_id, AgentStatus::Idle).await;
                tracing::info!("Stopped agent {}", agent_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_agent(&id).await {
                tracing::warn!("Failed to stop agent {}: {}", id, e);
            }
        }
    }

    pub async fn running_agents(&self) -> Vec<String> {
        self.running.lock().await.keys().cloned().collect()
    }

    // ---- 任务 ----

    /// 手工创建待办任务
    pub async fn create_task(
        &self,
        agent_id: &str,
        description: &str,
    ) -> Result<AgentTask, HiveError> {
        if self.get_agent(agent_id).await.is_none() {
            return Err(HiveError::NotFound(format!("agent {}", agent_id)));
        }
        let task = AgentTask::new(agent_id, description, self.next_seq());
        self.insert_task(task.clone()).await;
        Ok(task)
    }

    /// 委托：目标侧一个待办任务 + 一条 requires_response 的 Request 消息
    pub async fn delegate_task(
        &self,
        from_id: &str,
        to_id: &str,
        description: &str,
    ) -> Result<AgentTask, HiveError> {
        let (from_name, _) = {
            let agents = self.agents.read().await;
            let from = agents
                .get(from_id)
                .ok_or_else(|| HiveError::NotFound(format!("agent {}", from_id)))?;
            let to = agents
                .get(to_id)
                .ok_or_else(|| HiveError::NotFound(format!("agent {}", to_id)))?;
            (from.name.clone(), to.name.clone())
        };

        let task = AgentTask::new(to_id, description, self.next_seq()).delegated(from_id, to_id);
        self.insert_task(task.clone()).await;

        self.bus
            .send(
                from_id,
                Recipient::Agent(to_id.to_string()),
                format!("Task delegated by {}: {}", from_name, description),
                MessageKind::Request,
                MessageMetadata {
                    request_id: Some(task.id.clone()),
                    priority: Priority::High,
                    requires_response: true,
                },
            )
            .await;
        self.with_agent(from_id, |a| a.stats.messages_sent += 1).await;

        tracing::info!("Agent {} delegated task {} to {}", from_id, task.id, to_id);
        Ok(task)
    }

    /// 任务列表（按 seq 排序），可按 Agent 过滤
    pub async fn get_tasks(&self, agent_id: Option<&str>) -> Vec<AgentTask> {
        let tasks = self.tasks.read().await;
        let mut result: Vec<AgentTask> = tasks
            .values()
            .filter(|t| agent_id.map_or(true, |id| t.agent_id == id))
            .cloned()
            .collect();
        result.sort_by_key(|t| t.seq);
        result
    }

    pub async fn get_task(&self, task_id: &str) -> Option<AgentTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    // ---- 调度循环 ----

    /// 单轮推进。永不返回错误：所有失败都折叠为日志 + 状态标记。
    async fn run_iteration(&self, agent_id: &str) {
        let agent = match self.get_agent(agent_id).await {
            Some(agent) => agent,
            None => return,
        };
        let started = std::time::Instant::now();

        // 循环仍在推进，上一轮的 Error 状态在新一轮开始时复位
        if agent.status == AgentStatus::Error {
            self.set_status(&agent.id, AgentStatus::Running).await;
        }

        if agent.capabilities.agent_communication {
            self.drain_messages(&agent).await;
        }

        let next_task = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.agent_id == agent.id && t.status == TaskStatus::Pending)
                .min_by_key(|t| t.seq)
                .cloned()
        };

        match next_task {
            Some(task) => self.execute_task(&agent, task).await,
            None => {
                let decision = self.make_decision(&agent).await;
                if !matches!(decision, AgentAction::Idle) {
                    self.dispatch_action(&agent, decision).await;
                }
            }
        }

        let elapsed = started.elapsed().as_millis() as f64;
        self.with_agent(agent_id, |a| a.stats.record_run(elapsed)).await;
    }

    /// 把未读消息标记已读；Request 且 requires_response 转成待办任务
    async fn drain_messages(&self, agent: &Agent) {
        let unread = self.bus.messages_for(&agent.id, false).await;
        if unread.is_empty() {
            return;
        }

        let mut received = 0u64;
        for message in unread {
            self.bus.mark_read(&message.id).await;
            received += 1;
            // request_id 已关联既有任务（委托路径），不再重复建任务
            if message.kind == MessageKind::Request
                && message.metadata.requires_response
                && message.metadata.request_id.is_none()
            {
                let task = AgentTask::new(
                    &agent.id,
                    format!("Handle request from {}: {}", message.from, message.content),
                    self.next_seq(),
                )
                .delegated(&message.from, &agent.id);
                tracing::info!("Agent {} queued task {} from message {}", agent.id, task.id, message.id);
                self.insert_task(task).await;
            }
        }
        self.with_agent(&agent.id, |a| a.stats.messages_received += received)
            .await;
    }

    /// 请求一个结构化决策；Provider 失败记录并退化为 Idle
    async fn make_decision(&self, agent: &Agent) -> AgentAction {
        let context = self.build_context(agent).await;
        let messages = [
            ChatMessage::system(format!("{}\n\n{}", agent.system_prompt, DECISION_PROTOCOL)),
            ChatMessage::user(format!(
                "Current context:\n{}\n\nDecide your next action.",
                context
            )),
        ];
        let options = CompletionOptions {
            temperature: Some(agent.config.temperature),
            max_tokens: Some(agent.config.max_tokens),
            top_p: None,
        };

        match self
            .gateway
            .complete(&agent.provider_id, &agent.model, &messages, &options)
            .await
        {
            Ok(response) => {
                self.track_usage(agent, &response.usage).await;
                let decision = parse_decision(&response.content);
                tracing::debug!("Agent {} decided: {:?}", agent.id, decision.action);
                decision.action
            }
            Err(e) => {
                tracing::warn!("Agent {} decision failed: {}", agent.id, e);
                self.log(agent, LogLevel::Error, format!("Decision failed: {}", e));
                self.set_status(&agent.id, AgentStatus::Error).await;
                AgentAction::Idle
            }
        }
    }

    async fn build_context(&self, agent: &Agent) -> String {
        // 只有 running 的同伴才是可委托目标
        let others: Vec<Value> = self
            .list_agents()
            .await
            .into_iter()
            .filter(|a| a.id != agent.id && a.status == AgentStatus::Running)
            .map(|a| json!({"id": a.id, "name": a.name, "status": a.status}))
            .collect();
        let shared_keys = self.bus.list_keys(&agent.id).await;
        // 消息只对具备通信能力的 Agent 可见
        let recent: Vec<Value> = if agent.capabilities.agent_communication {
            self.bus
                .messages_for(&agent.id, true)
                .await
                .into_iter()
                .rev()
                .take(5)
                .map(|m| json!({"from": m.from, "kind": m.kind, "content": m.content}))
                .collect()
        } else {
            Vec::new()
        };

        json!({
            "agent": {"id": agent.id, "name": agent.name, "description": agent.description},
            "capabilities": agent.capabilities,
            "stats": {
                "total_runs": agent.stats.total_runs,
                "messages_sent": agent.stats.messages_sent,
                "commands_executed": agent.stats.commands_executed,
            },
            "resources": self.probe.snapshot(),
            "other_agents": others,
            "shared_memory_keys": shared_keys,
            "recent_messages": recent,
        })
        .to_string()
    }

    /// 执行一个待办任务：第二次补全 + 响应内动作派发。终态不可逆。
    async fn execute_task(&self, agent: &Agent, mut task: AgentTask) {
        task.status = TaskStatus::Running;
        task.start_time = Some(chrono::Utc::now());
        self.insert_task(task.clone()).await;
        self.log(agent, LogLevel::Info, format!("Executing task: {}", task.description));

        let messages = [
            ChatMessage::system(format!("{}\n\n{}", agent.system_prompt, DECISION_PROTOCOL)),
            ChatMessage::user(format!(
                "Execute this task: {}\n\nDescribe what you did. If a follow-up action is \
                 needed, include a decision JSON object.",
                task.description
            )),
        ];
        let options = CompletionOptions {
            temperature: Some(agent.config.temperature),
            max_tokens: Some(agent.config.max_tokens),
            top_p: None,
        };

        match self
            .gateway
            .complete(&agent.provider_id, &agent.model, &messages, &options)
            .await
        {
            Ok(response) => {
                self.track_usage(agent, &response.usage).await;

                let mut outcomes = Vec::new();
                let decision = parse_decision(&response.content);
                if !matches!(decision.action, AgentAction::Idle) {
                    if let Some(outcome) = self.dispatch_action(agent, decision.action).await {
                        outcomes.push(outcome);
                    }
                }
                if agent.capabilities.computer_control {
                    for command in scan_automation(&response.content) {
                        self.events.publish(HiveEvent::Automation {
                            agent_id: agent.id.clone(),
                            command,
                        });
                    }
                }

                task.status = TaskStatus::Completed;
                task.end_time = Some(chrono::Utc::now());
                task.result = Some(json!({
                    "response": response.content,
                    "actions": outcomes,
                }));
                self.log(agent, LogLevel::Success, format!("Task completed: {}", task.id));
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.end_time = Some(chrono::Utc::now());
                task.error = Some(e.to_string());
                self.log(agent, LogLevel::Error, format!("Task failed: {}", e));
                self.set_status(&agent.id, AgentStatus::Error).await;
            }
        }
        self.insert_task(task).await;
    }

    /// 派发一个决策动作；能力缺失的动作跳过并告警。返回动作结果摘要。
    async fn dispatch_action(&self, agent: &Agent, action: AgentAction) -> Option<Value> {
        match action {
            AgentAction::SendMessage { to, content, kind } => {
                if !agent.capabilities.agent_communication {
                    self.skip(agent, "send_message", "agent_communication");
                    return None;
                }
                let message = self
                    .bus
                    .send(&agent.id, to, content, kind, MessageMetadata::default())
                    .await;
                self.with_agent(&agent.id, |a| a.stats.messages_sent += 1).await;
                Some(json!({"action": "send_message", "message_id": message.id}))
            }
            AgentAction::DelegateTask { to, description } => {
                if !agent.capabilities.agent_communication {
                    self.skip(agent, "delegate_task", "agent_communication");
                    return None;
                }
                match self.delegate_task(&agent.id, &to, &description).await {
                    Ok(task) => Some(json!({"action": "delegate_task", "task_id": task.id})),
                    Err(e) => {
                        tracing::warn!("Agent {} delegation failed: {}", agent.id, e);
                        None
                    }
                }
            }
            AgentAction::ExecuteCommand {
                command,
                working_dir,
                timeout_ms,
            } => {
                if !agent.capabilities.command_execution {
                    self.skip(agent, "execute_command", "command_execution");
                    return None;
                }
                if agent.config.autonomy_level == AutonomyLevel::Low {
                    let approved = self
                        .approval
                        .ask_approval(
                            &agent.id,
                            &agent.name,
                            "Approve command execution",
                            &format!("Agent {} wants to run: {}", agent.name, command),
                        )
                        .await
                        .unwrap_or(false);
                    if !approved {
                        self.log(agent, LogLevel::Info, format!("Command not approved: {}", command));
                        return None;
                    }
                }

                let opts = ExecOptions {
                    agent_id: Some(agent.id.clone()),
                    working_dir,
                    timeout_ms,
                    ..Default::default()
                };
                match self.executor.execute(&command, opts).await {
                    Ok(result) => {
                        self.with_agent(&agent.id, |a| a.stats.commands_executed += 1)
                            .await;
                        Some(json!({"action": "execute_command", "result": result}))
                    }
                    Err(e) => {
                        self.log(agent, LogLevel::Error, format!("Command rejected: {}", e));
                        None
                    }
                }
            }
            AgentAction::Automation(command) => {
                if !agent.capabilities.computer_control {
                    self.skip(agent, "automation", "computer_control");
                    return None;
                }
                self.events.publish(HiveEvent::Automation {
                    agent_id: agent.id.clone(),
                    command: command.clone(),
                });
                Some(json!({"action": "automation", "command": command}))
            }
            AgentAction::Idle => None,
        }
    }

    // ---- 内部辅助 ----

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn insert_task(&self, task: AgentTask) {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task);
        save_records(self.store.as_ref(), TASKS, tasks.values());
    }

    async fn with_agent<F>(&self, agent_id: &str, f: F)
    where
        F: FnOnce(&mut Agent),
    {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            f(agent);
            agent.updated_at = chrono::Utc::now();
        }
        save_records(self.store.as_ref(), AGENTS, agents.values());
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) {
        self.with_agent(agent_id, |a| a.status = status).await;
        self.events.publish(HiveEvent::AgentStatus {
            agent_id: agent_id.to_string(),
            status,
        });
    }

    async fn track_usage(&self, agent: &Agent, usage: &TokenUsage) {
        let cost = self.cost_model.cost(&agent.provider_id, &agent.model, usage);
        let tokens = usage.total_tokens;
        self.with_agent(&agent.id, |a| {
            a.stats.total_tokens += tokens;
            a.stats.total_cost += cost;
        })
        .await;
    }

    fn log(&self, agent: &Agent, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => tracing::warn!("Agent {}: {}", agent.id, message),
            _ => tracing::info!("Agent {}: {}", agent.id, message),
        }
        self.events.publish(HiveEvent::AgentLog {
            agent_id: agent.id.clone(),
            level,
            message,
        });
    }

    fn skip(&self, agent: &Agent, action: &str, capability: &str) {
        tracing::warn!(
            "Agent {} attempted {} without {} capability, skipping",
            agent.id,
            action,
            capability
        );
    }
}

/// 注入到 system prompt 的决策协议说明
const DECISION_PROTOCOL: &str = r#"You are an autonomous agent. Respond with a single JSON object:
{"action": "<send_message|delegate_task|execute_command|automation|idle>", "description": "...", "steps": [], "data": {...}}
data fields per action:
- send_message: {"to": "<agent id or broadcast>", "content": "...", "type": "<request|response|notification|data>"}
- delegate_task: {"to": "<agent id>", "description": "..."}
- execute_command: {"command": "...", "working_dir": "...", "timeout_ms": 0}
- automation: {"type": "<mouse_move|mouse_click|keyboard_type|keyboard_press|screenshot|get_mouse_pos|get_screen_size>", ...}
Use idle when nothing needs doing."#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::AgentCapabilities;
    use crate::executor::CommandPermissions;
    use crate::llm::{MockBackend, ProviderKind, ProviderSpec};
    use crate::storage::MemStore;

    struct Fixture {
        orchestrator: Arc<AgentOrchestrator>,
        gateway: Arc<CompletionGateway>,
        bus: Arc<MessageBus>,
        executor: Arc<CommandExecutor>,
    }

    async fn fixture(approval_timeout: Duration) -> (Fixture, String, Arc<MockBackend>) {
        let store: Arc<dyn StoreBackend> = Arc::new(MemStore::new());
        let events = EventBus::default();
        let gateway = Arc::new(CompletionGateway::new(Arc::clone(&store)));
        let bus = Arc::new(MessageBus::new(Arc::clone(&store), events.clone(), 7));
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&store),
            events.clone(),
            CommandPermissions::default(),
            Duration::from_millis(200),
        ));
        let approval = Arc::new(ApprovalGate::new(events.clone(), approval_timeout));

        let mock = Arc::new(MockBackend::idle());
        let provider_id = gateway
            .register_with_backend(
                ProviderSpec {
                    name: "mock".to_string(),
                    kind: ProviderKind::Custom,
                    api_key: None,
                    base_url: None,
                    models: vec!["test-model".to_string()],
                    enabled: true,
                },
                Arc::clone(&mock) as Arc<dyn crate::llm::CompletionBackend>,
            )
            .await;

        let orchestrator = Arc::new(AgentOrchestrator::new(
            Arc::clone(&gateway),
            Arc::clone(&bus),
            Arc::clone(&executor),
            approval,
            store,
            events,
            Duration::from_millis(50),
        ));

        (
            Fixture {
                orchestrator,
                gateway,
                bus,
                executor,
            },
            provider_id,
            mock,
        )
    }

    fn draft(provider_id: &str, name: &str) -> AgentDraft {
        AgentDraft {
            name: name.to_string(),
            description: String::new(),
            provider_id: provider_id.to_string(),
            model: "test-model".to_string(),
            system_prompt: "You are a test agent.".to_string(),
            capabilities: AgentCapabilities {
                agent_communication: true,
                command_execution: true,
                ..Default::default()
            },
            config: Default::default(),
        }
    }

    #[tokio::test]
    async fn agent_crud_round_trip() {
        let (fx, provider_id, _) = fixture(Duration::from_secs(5)).await;
        let agent = fx.orchestrator.create_agent(draft(&provider_id, "worker")).await;
        assert_eq!(agent.status, AgentStatus::Idle);

        let updated = fx
            .orchestrator
            .update_agent(&agent.id, AgentUpdate {
                name: Some("renamed".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");

        fx.orchestrator.delete_agent(&agent.id).await.unwrap();
        assert!(fx.orchestrator.get_agent(&agent.id).await.is_none());
        assert!(matches!(
            fx.orchestrator.update_agent(&agent.id, Default::default()).await,
            Err(HiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_halts() {
        let (fx, provider_id, _) = fixture(Duration::from_secs(5)).await;
        let agent = fx.orchestrator.create_agent(draft(&provider_id, "worker")).await;

        assert!(fx.orchestrator.start_agent(&agent.id).await.unwrap());
        assert!(!fx.orchestrator.start_agent(&agent.id).await.unwrap());
        assert_eq!(
            fx.orchestrator.get_agent(&agent.id).await.unwrap().status,
            AgentStatus::Running
        );

        assert!(fx.orchestrator.stop_agent(&agent.id).await.unwrap());
        assert!(!fx.orchestrator.stop_agent(&agent.id).await.unwrap());
        assert_eq!(
            fx.orchestrator.get_agent(&agent.id).await.unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn delegation_creates_task_and_request_message() {
        let (fx, provider_id, _) = fixture(Duration::from_secs(5)).await;
        let a = fx.orchestrator.create_agent(draft(&provider_id, "a")).await;
        let b = fx.orchestrator.create_agent(draft(&provider_id, "b")).await;

        let task = fx
            .orchestrator
            .delegate_task(&a.id, &b.id, "summarize logs")
            .await
            .unwrap();
        assert_eq!(task.agent_id, b.id);
        assert_eq!(task.delegated_from.as_deref(), Some(a.id.as_str()));
        assert_eq!(task.delegated_to.as_deref(), Some(b.id.as_str()));
        assert_eq!(task.status, TaskStatus::Pending);

        let inbox = fx.bus.messages_for(&b.id, false).await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, MessageKind::Request);
        assert!(inbox[0].metadata.requires_response);
        assert_eq!(inbox[0].metadata.request_id.as_deref(), Some(task.id.as_str()));

        assert!(matches!(
            fx.orchestrator.delegate_task(&a.id, "agent_missing", "x").await,
            Err(HiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn request_message_becomes_task_then_executes() {
        let (fx, provider_id, mock) = fixture(Duration::from_secs(5)).await;
        let agent = fx.orchestrator.create_agent(draft(&provider_id, "worker")).await;

        fx.bus
            .send(
                "agent_external",
                Recipient::Agent(agent.id.clone()),
                "please compute",
                MessageKind::Request,
                MessageMetadata {
                    requires_response: true,
                    ..Default::default()
                },
            )
            .await;

        // 第一轮：消息转任务（本轮内即被选中执行）
        mock.push("I computed the answer. Done.");
        fx.orchestrator.run_iteration(&agent.id).await;

        let tasks = fx.orchestrator.get_tasks(Some(&agent.id)).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert!(tasks[0].result.is_some());

        let stats = fx.orchestrator.get_agent(&agent.id).await.unwrap().stats;
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.total_runs, 1);
    }

    #[tokio::test]
    async fn decision_dispatches_send_message() {
        let (fx, provider_id, mock) = fixture(Duration::from_secs(5)).await;
        let a = fx.orchestrator.create_agent(draft(&provider_id, "a")).await;
        let b = fx.orchestrator.create_agent(draft(&provider_id, "b")).await;

        mock.push(format!(
            r#"{{"action": "send_message", "description": "ping", "data": {{"to": "{}", "content": "hello", "type": "notification"}}}}"#,
            b.id
        ));
        fx.orchestrator.run_iteration(&a.id).await;

        let inbox = fx.bus.messages_for(&b.id, false).await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].content, "hello");
        assert_eq!(
            fx.orchestrator.get_agent(&a.id).await.unwrap().stats.messages_sent,
            1
        );
    }

    #[tokio::test]
    async fn missing_capability_skips_action() {
        let (fx, provider_id, mock) = fixture(Duration::from_secs(5)).await;
        let mut d = draft(&provider_id, "restricted");
        d.capabilities.command_execution = false;
        let agent = fx.orchestrator.create_agent(d).await;

        mock.push(r#"{"action": "execute_command", "data": {"command": "echo hi"}}"#);
        fx.orchestrator.run_iteration(&agent.id).await;

        assert!(fx.executor.history(Some(&agent.id), None).await.is_empty());
    }

    #[tokio::test]
    async fn low_autonomy_requires_approval() {
        // 批准门超时很短：无人批准时命令不执行
        let (fx, provider_id, mock) = fixture(Duration::from_millis(100)).await;
        let mut d = draft(&provider_id, "careful");
        d.config.autonomy_level = AutonomyLevel::Low;
        let agent = fx.orchestrator.create_agent(d).await;

        mock.push(r#"{"action": "execute_command", "data": {"command": "echo hi"}}"#);
        fx.orchestrator.run_iteration(&agent.id).await;

        assert!(fx.executor.history(Some(&agent.id), None).await.is_empty());
    }

    #[tokio::test]
    async fn provider_failure_marks_error_but_keeps_agent() {
        let (fx, _, _) = fixture(Duration::from_secs(5)).await;
        let broken_provider = fx
            .gateway
            .register_with_backend(
                ProviderSpec {
                    name: "broken".to_string(),
                    kind: ProviderKind::Custom,
                    api_key: None,
                    base_url: None,
                    models: vec!["test-model".to_string()],
                    enabled: true,
                },
                Arc::new(MockBackend::failing()),
            )
            .await;
        let agent = fx
            .orchestrator
            .create_agent(draft(&broken_provider, "unlucky"))
            .await;

        fx.orchestrator.run_iteration(&agent.id).await;

        let after = fx.orchestrator.get_agent(&agent.id).await.unwrap();
        assert_eq!(after.status, AgentStatus::Error);
        assert_eq!(after.stats.total_runs, 1);
    }

    #[tokio::test]
    async fn tasks_execute_in_seq_order() {
        let (fx, provider_id, mock) = fixture(Duration::from_secs(5)).await;
        let agent = fx.orchestrator.create_agent(draft(&provider_id, "worker")).await;

        let first = fx.orchestrator.create_task(&agent.id, "first").await.unwrap();
        let second = fx.orchestrator.create_task(&agent.id, "second").await.unwrap();
        assert!(first.seq < second.seq);

        mock.push("did first");
        fx.orchestrator.run_iteration(&agent.id).await;
        assert_eq!(
            fx.orchestrator.get_task(&first.id).await.unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            fx.orchestrator.get_task(&second.id).await.unwrap().status,
            TaskStatus::Pending
        );

        mock.push("did second");
        fx.orchestrator.run_iteration(&agent.id).await;
        assert_eq!(
            fx.orchestrator.get_task(&second.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn cost_model_and_probe_feed_into_stats_and_context() {
        struct PerCallCost;
        impl CostModel for PerCallCost {
            fn cost(&self, _provider_id: &str, _model: &str, _usage: &TokenUsage) -> f64 {
                0.5
            }
        }
        struct StaticProbe;
        impl ResourceProbe for StaticProbe {
            fn snapshot(&self) -> Value {
                json!({"cpu": 12})
            }
        }

        let store: Arc<dyn StoreBackend> = Arc::new(MemStore::new());
        let events = EventBus::default();
        let gateway = Arc::new(CompletionGateway::new(Arc::clone(&store)));
        let bus = Arc::new(MessageBus::new(Arc::clone(&store), events.clone(), 7));
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&store),
            events.clone(),
            CommandPermissions::default(),
            Duration::from_millis(200),
        ));
        let approval = Arc::new(ApprovalGate::new(events.clone(), Duration::from_secs(5)));
        let provider_id = gateway
            .register_with_backend(
                ProviderSpec {
                    name: "mock".to_string(),
                    kind: ProviderKind::Custom,
                    api_key: None,
                    base_url: None,
                    models: vec!["test-model".to_string()],
                    enabled: true,
                },
                Arc::new(MockBackend::idle()),
            )
            .await;
        let orchestrator = Arc::new(
            AgentOrchestrator::new(
                gateway,
                bus,
                executor,
                approval,
                store,
                events,
                Duration::from_millis(50),
            )
            .with_cost_model(Arc::new(PerCallCost))
            .with_probe(Arc::new(StaticProbe)),
        );

        let agent = orchestrator.create_agent(draft(&provider_id, "billed")).await;
        let context = orchestrator.build_context(&agent).await;
        assert!(context.contains(r#""cpu":12"#));

        orchestrator.run_iteration(&agent.id).await;
        let stats = orchestrator.get_agent(&agent.id).await.unwrap().stats;
        assert!((stats.total_cost - 0.5).abs() < f64::EPSILON);
        assert!(stats.total_tokens > 0);
    }

    #[tokio::test]
    async fn context_hides_messages_without_communication_capability() {
        let (fx, provider_id, _) = fixture(Duration::from_secs(5)).await;
        let mut d = draft(&provider_id, "silo");
        d.capabilities.agent_communication = false;
        let silo = fx.orchestrator.create_agent(d).await;

        fx.bus
            .send(
                "agent_external",
                Recipient::Agent(silo.id.clone()),
                "classified",
                MessageKind::Notification,
                MessageMetadata::default(),
            )
            .await;

        let context = fx.orchestrator.build_context(&silo).await;
        assert!(!context.contains("classified"));
    }

    #[tokio::test]
    async fn context_lists_only_running_delegation_targets() {
        let (fx, provider_id, _) = fixture(Duration::from_secs(5)).await;
        let agent = fx.orchestrator.create_agent(draft(&provider_id, "a")).await;
        let peer = fx.orchestrator.create_agent(draft(&provider_id, "peer")).await;

        let context = fx.orchestrator.build_context(&agent).await;
        assert!(!context.contains(&peer.id));

        fx.orchestrator.start_agent(&peer.id).await.unwrap();
        let context = fx.orchestrator.build_context(&agent).await;
        assert!(context.contains(&peer.id));
        fx.orchestrator.stop_agent(&peer.id).await.unwrap();
    }

    #[tokio::test]
    async fn automation_markers_surface_as_events() {
        let (fx, provider_id, mock) = fixture(Duration::from_secs(5)).await;
        let mut d = draft(&provider_id, "driver");
        d.capabilities.computer_control = true;
        let agent = fx.orchestrator.create_agent(d).await;
        fx.orchestrator.create_task(&agent.id, "click things").await.unwrap();

        let mut rx = fx.orchestrator.events.subscribe();
        mock.push(r#"Clicking now. AUTOMATION: {"type": "mouse_move", "x": 5, "y": 6}"#);
        fx.orchestrator.run_iteration(&agent.id).await;

        let mut saw_automation = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, HiveEvent::Automation { .. }) {
                saw_automation = true;
            }
        }
        assert!(saw_automation);
    }
}
