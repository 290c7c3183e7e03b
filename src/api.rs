//! 进程内 API 门面
//!
//! 展示层（CLI / IPC / 未来的远程接口）通过结构化请求访问全部操作，
//! 错误以稳定错误码返回而不是透出内部错误类型。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::approval::ApprovalGate;
use crate::bus::{MessageBus, MessageKind, MessageMetadata, Permissions, Recipient};
use crate::core::{AgentDraft, AgentOrchestrator, AgentUpdate, HiveError};
use crate::executor::{CommandExecutor, CommandPermissions, ExecOptions};
use crate::llm::{CompletionGateway, ProviderSpec};

/// 结构化 API 请求
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    CreateAgent { draft: AgentDraft },
    ListAgents,
    GetAgent { agent_id: String },
    UpdateAgent { agent_id: String, update: AgentUpdate },
    DeleteAgent { agent_id: String },
    StartAgent { agent_id: String },
    StopAgent { agent_id: String },
    CreateTask { agent_id: String, description: String },
    DelegateTask { from: String, to: String, description: String },
    ListTasks {
        #[serde(default)]
        agent_id: Option<String>,
    },
    SendMessage {
        from: String,
        to: String,
        content: String,
        kind: MessageKind,
        #[serde(default)]
        metadata: MessageMetadata,
    },
    GetMessages {
        agent_id: String,
        #[serde(default)]
        include_read: bool,
    },
    MarkRead { message_id: String },
    SetShared {
        key: String,
        value: Value,
        agent_id: String,
        #[serde(default)]
        permissions: Option<Permissions>,
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    GetShared { key: String, agent_id: String },
    ListSharedKeys { agent_id: String },
    DeleteShared { key: String, agent_id: String },
    ExecuteCommand {
        command: String,
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    KillCommand { id: String },
    RunningCommands,
    IsCommandSafe { command: String },
    CommandHistory {
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    ClearCommandHistory {
        #[serde(default)]
        agent_id: Option<String>,
    },
    GetPermissions,
    UpdatePermissions { permissions: CommandPermissions },
    GetConversation { a: String, b: String },
    ClearMessages { agent_id: String },
    ActiveAgents,
    RespondPrompt { prompt_id: String, response: Value },
    CancelPrompt { prompt_id: String },
    ListPrompts,
    CurrentPrompt,
    PromptHistory {
        #[serde(default)]
        agent_id: Option<String>,
    },
    ClearPromptHistory,
    RegisterProvider { spec: ProviderSpec },
    ListProviders,
    TestProvider { provider_id: String },
    RemoveProvider { provider_id: String },
}

/// 结构化 API 响应
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiResponse {
    Ok { data: Value },
    Err { code: &'static str, message: String },
}

fn ok<T: Serialize>(data: T) -> ApiResponse {
    match serde_json::to_value(data) {
        Ok(data) => ApiResponse::Ok { data },
        Err(e) => ApiResponse::Err {
            code: "storage_error",
            message: format!("serialization failed: {}", e),
        },
    }
}

fn err(e: HiveError) -> ApiResponse {
    ApiResponse::Err {
        code: e.code(),
        message: e.to_string(),
    }
}

/// 全组件门面
pub struct Api {
    pub orchestrator: Arc<AgentOrchestrator>,
    pub bus: Arc<MessageBus>,
    pub executor: Arc<CommandExecutor>,
    pub approval: Arc<ApprovalGate>,
    pub gateway: Arc<CompletionGateway>,
}

impl Api {
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        match request {
            ApiRequest::CreateAgent { draft } => ok(self.orchestrator.create_agent(draft).await),
            ApiRequest::ListAgents => ok(self.orchestrator.list_agents().await),
            ApiRequest::GetAgent { agent_id } => match self.orchestrator.get_agent(&agent_id).await {
                Some(agent) => ok(agent),
                None => err(HiveError::NotFound(format!("agent {}", agent_id))),
            },
            ApiRequest::UpdateAgent { agent_id, update } => {
                match self.orchestrator.update_agent(&agent_id, update).await {
                    Ok(agent) => ok(agent),
                    Err(e) => err(e),
                }
            }
            ApiRequest::DeleteAgent { agent_id } => {
                match self.orchestrator.delete_agent(&agent_id).await {
                    Ok(()) => ok(json!({"deleted": agent_id})),
                    Err(e) => err(e),
                }
            }
            ApiRequest::StartAgent { agent_id } => {
                match self.orchestrator.start_agent(&agent_id).await {
                    Ok(started) => ok(json!({"started": started})),
                    Err(e) => err(e),
                }
            }
            ApiRequest::StopAgent { agent_id } => {
                match self.orchestrator.stop_agent(&agent_id).await {
                    Ok(stopped) => ok(json!({"stopped": stopped})),
                    Err(e) => err(e),
                }
            }
            ApiRequest::CreateTask { agent_id, description } => {
                match self.orchestrator.create_task(&agent_id, &description).await {
                    Ok(task) => ok(task),
                    Err(e) => err(e),
                }
            }
            ApiRequest::DelegateTask { from, to, description } => {
                match self.orchestrator.delegate_task(&from, &to, &description).await {
                    Ok(task) => ok(task),
                    Err(e) => err(e),
                }
            }
            ApiRequest::ListTasks { agent_id } => {
                ok(self.orchestrator.get_tasks(agent_id.as_deref()).await)
            }
            ApiRequest::SendMessage { from, to, content, kind, metadata } => ok(
                self.bus
                    .send(from, Recipient::from(to), content, kind, metadata)
                    .await,
            ),
            ApiRequest::GetMessages { agent_id, include_read } => {
                ok(self.bus.messages_for(&agent_id, include_read).await)
            }
            ApiRequest::MarkRead { message_id } => {
                ok(json!({"marked": self.bus.mark_read(&message_id).await}))
            }
            ApiRequest::SetShared { key, value, agent_id, permissions, ttl_ms } => {
                if self.bus.set_shared(&key, value, &agent_id, permissions, ttl_ms).await {
                    ok(json!({"key": key}))
                } else {
                    err(HiveError::PermissionDenied(format!(
                        "agent {} cannot write key {}",
                        agent_id, key
                    )))
                }
            }
            ApiRequest::GetShared { key, agent_id } => {
                match self.bus.get_shared(&key, &agent_id).await {
                    Some(value) => ok(value),
                    None => err(HiveError::NotFound(format!("shared key {}", key))),
                }
            }
            ApiRequest::ListSharedKeys { agent_id } => ok(self.bus.list_keys(&agent_id).await),
            ApiRequest::DeleteShared { key, agent_id } => {
                ok(json!({"deleted": self.bus.delete_shared(&key, &agent_id).await}))
            }
            ApiRequest::ExecuteCommand { command, agent_id, working_dir, timeout_ms } => {
                let opts = ExecOptions {
                    agent_id,
                    working_dir,
                    timeout_ms,
                    ..Default::default()
                };
                match self.executor.execute(&command, opts).await {
                    Ok(result) => ok(result),
                    Err(e) => err(e),
                }
            }
            ApiRequest::KillCommand { id } => {
                ok(json!({"killed": self.executor.kill(&id).await}))
            }
            ApiRequest::RunningCommands => ok(self.executor.running().await),
            ApiRequest::IsCommandSafe { command } => {
                match self.executor.is_command_safe(&command).await {
                    None => ok(json!({"safe": true})),
                    Some(reason) => ok(json!({"safe": false, "reason": reason})),
                }
            }
            ApiRequest::CommandHistory { agent_id, limit } => {
                ok(self.executor.history(agent_id.as_deref(), limit).await)
            }
            ApiRequest::ClearCommandHistory { agent_id } => {
                self.executor.clear_history(agent_id.as_deref()).await;
                ok(json!({"cleared": true}))
            }
            ApiRequest::GetPermissions => ok(self.executor.permissions().await),
            ApiRequest::UpdatePermissions { permissions } => {
                self.executor.update_permissions(permissions).await;
                ok(json!({"updated": true}))
            }
            ApiRequest::GetConversation { a, b } => ok(self.bus.conversation(&a, &b).await),
            ApiRequest::ClearMessages { agent_id } => {
                self.bus.clear_messages(&agent_id).await;
                ok(json!({"cleared": agent_id}))
            }
            ApiRequest::ActiveAgents => ok(self.bus.active_agents().await),
            ApiRequest::RespondPrompt { prompt_id, response } => {
                ok(json!({"accepted": self.approval.respond(&prompt_id, response).await}))
            }
            ApiRequest::CancelPrompt { prompt_id } => {
                ok(json!({"cancelled": self.approval.cancel(&prompt_id).await}))
            }
            ApiRequest::ListPrompts => ok(self.approval.pending().await),
            ApiRequest::CurrentPrompt => match self.approval.current().await {
                Some(prompt) => ok(prompt),
                None => ok(Value::Null),
            },
            ApiRequest::PromptHistory { agent_id } => {
                ok(self.approval.history(agent_id.as_deref()).await)
            }
            ApiRequest::ClearPromptHistory => {
                self.approval.clear_history().await;
                ok(json!({"cleared": true}))
            }
            ApiRequest::RegisterProvider { spec } => {
                ok(json!({"provider_id": self.gateway.register(spec).await}))
            }
            ApiRequest::ListProviders => ok(self.gateway.list().await),
            ApiRequest::TestProvider { provider_id } => {
                ok(json!({"ok": self.gateway.test_provider(&provider_id).await}))
            }
            ApiRequest::RemoveProvider { provider_id } => {
                ok(json!({"removed": self.gateway.remove(&provider_id).await}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventBus;
    use crate::executor::CommandPermissions;
    use crate::storage::{MemStore, StoreBackend};
    use std::time::Duration;

    fn api() -> Api {
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
        let orchestrator = Arc::new(AgentOrchestrator::new(
            Arc::clone(&gateway),
            Arc::clone(&bus),
            Arc::clone(&executor),
            Arc::clone(&approval),
            store,
            events,
            Duration::from_millis(50),
        ));
        Api {
            orchestrator,
            bus,
            executor,
            approval,
            gateway,
        }
    }

    #[tokio::test]
    async fn unknown_agent_maps_to_error_code() {
        let api = api();
        let response = api
            .handle(ApiRequest::GetAgent {
                agent_id: "agent_missing".to_string(),
            })
            .await;
        match response {
            ApiResponse::Err { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn requests_deserialize_from_tagged_json() {
        let api = api();
        let request: ApiRequest = serde_json::from_str(
            r#"{"op": "send_message", "from": "a", "to": "broadcast", "content": "hi", "kind": "notification"}"#,
        )
        .unwrap();
        let response = api.handle(request).await;
        assert!(matches!(response, ApiResponse::Ok { .. }));

        let inbox = api.bus.messages_for("b", false).await;
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn denied_shared_write_maps_to_permission_code() {
        let api = api();
        api.handle(ApiRequest::SetShared {
            key: "k".to_string(),
            value: json!(1),
            agent_id: "a".to_string(),
            permissions: None,
            ttl_ms: None,
        })
        .await;

        let response = api
            .handle(ApiRequest::SetShared {
                key: "k".to_string(),
                value: json!(2),
                agent_id: "b".to_string(),
                permissions: None,
                ttl_ms: None,
            })
            .await;
        match response {
            ApiResponse::Err { code, .. } => assert_eq!(code, "permission_denied"),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
