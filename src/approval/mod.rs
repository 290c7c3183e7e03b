//! 人工确认门
//!
//! Agent 侧 ask_* 挂起在 oneshot 上，直到人工 respond/cancel 或超时。
//! 同一时刻仅一个 active prompt，其余按创建顺序排队；超时从创建时刻起算，
//! 排队时间计入。回答后自动晋升下一个排队中的 prompt。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};

use crate::core::events::{EventBus, HiveEvent};
use crate::core::HiveError;

/// 提问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    Question,
    Confirmation,
    Choice,
    Approval,
}

/// 提问状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    Pending,
    Answered,
    Cancelled,
    Timeout,
}

/// 等待人工处理的提问
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPrompt {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub kind: PromptKind,
    pub title: String,
    pub message: String,
    /// choice 类型的候选项
    #[serde(default)]
    pub options: Vec<String>,
    pub status: PromptStatus,
    pub response: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum PromptOutcome {
    Answered(Value),
    Cancelled,
    Timeout,
}

/// 人工确认门
pub struct ApprovalGate {
    prompts: RwLock<HashMap<String, UserPrompt>>,
    queue: RwLock<VecDeque<String>>,
    current: RwLock<Option<String>>,
    waiters: StdMutex<HashMap<String, oneshot::Sender<PromptOutcome>>>,
    timeout: Duration,
    events: EventBus,
}

impl ApprovalGate {
    pub fn new(events: EventBus, timeout: Duration) -> Self {
        Self {
            prompts: RwLock::new(HashMap::new()),
            queue: RwLock::new(VecDeque::new()),
            current: RwLock::new(None),
            waiters: StdMutex::new(HashMap::new()),
            timeout,
            events,
        }
    }

    /// 自由文本提问
    pub async fn ask_question(
        self: &std::sync::Arc<Self>,
        agent_id: &str,
        agent_name: &str,
        title: &str,
        message: &str,
    ) -> Result<String, HiveError> {
        let value = self
            .ask(agent_id, agent_name, PromptKind::Question, title, message, Vec::new())
            .await?;
        Ok(value_to_string(&value))
    }

    /// 是/否确认：true / "yes" / "true" 视为肯定
    pub async fn ask_confirmation(
        self: &std::sync::Arc<Self>,
        agent_id: &str,
        agent_name: &str,
        title: &str,
        message: &str,
    ) -> Result<bool, HiveError> {
        let value = self
            .ask(agent_id, agent_name, PromptKind::Confirmation, title, message, Vec::new())
            .await?;
        Ok(is_affirmative(&value, &["yes", "true"]))
    }

    /// 多选一：响应必须是候选项之一
    pub async fn ask_choice(
        self: &std::sync::Arc<Self>,
        agent_id: &str,
        agent_name: &str,
        title: &str,
        message: &str,
        options: Vec<String>,
    ) -> Result<String, HiveError> {
        let value = self
            .ask(agent_id, agent_name, PromptKind::Choice, title, message, options)
            .await?;
        Ok(value_to_string(&value))
    }

    /// 动作批准：true / "approve" / "yes" 视为批准
    pub async fn ask_approval(
        self: &std::sync::Arc<Self>,
        agent_id: &str,
        agent_name: &str,
        title: &str,
        message: &str,
    ) -> Result<bool, HiveError> {
        let value = self
            .ask(agent_id, agent_name, PromptKind::Approval, title, message, Vec::new())
            .await?;
        Ok(is_affirmative(&value, &["approve", "yes"]))
    }

    async fn ask(
        self: &std::sync::Arc<Self>,
        agent_id: &str,
        agent_name: &str,
        kind: PromptKind,
        title: &str,
        message: &str,
        options: Vec<String>,
    ) -> Result<Value, HiveError> {
        let prompt = UserPrompt {
            id: format!("prompt_{}", uuid::Uuid::new_v4()),
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            kind,
            title: title.to_string(),
            message: message.to_string(),
            options,
            status: PromptStatus::Pending,
            response: None,
            created_at: Utc::now(),
        };
        let id = prompt.id.clone();
        let rx = self.enqueue(prompt).await;

        // 超时从创建时刻起算（排队也计时）
        let gate = std::sync::Arc::clone(self);
        let timeout_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(gate.timeout).await;
            if gate.resolve(&timeout_id, PromptOutcome::Timeout).await {
                tracing::warn!("Prompt {} timed out", timeout_id);
            }
        });

        match rx.await {
            Ok(PromptOutcome::Answered(value)) => Ok(value),
            Ok(PromptOutcome::Cancelled) => {
                Err(HiveError::Cancelled(format!("prompt {}", id)))
            }
            Ok(PromptOutcome::Timeout) => Err(HiveError::Timeout(format!("prompt {}", id))),
            Err(_) => Err(HiveError::Cancelled(format!("prompt {}", id))),
        }
    }

    async fn enqueue(&self, prompt: UserPrompt) -> oneshot::Receiver<PromptOutcome> {
        let (tx, rx) = oneshot::channel();
        let id = prompt.id.clone();
        {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.insert(id.clone(), tx);
        }
        self.prompts.write().await.insert(id.clone(), prompt.clone());
        self.events.publish(HiveEvent::PromptCreated {
            prompt: prompt.clone(),
        });

        let mut current = self.current.write().await;
        if current.is_none() {
            *current = Some(id);
            self.events.publish(HiveEvent::PromptActive { prompt });
        } else {
            self.queue.write().await.push_back(id);
        }
        rx
    }

    /// 人工回答。非 pending、未知 id、choice 响应不在候选项内时返回 false。
    pub async fn respond(&self, prompt_id: &str, response: Value) -> bool {
        {
            let prompts = self.prompts.read().await;
            match prompts.get(prompt_id) {
                Some(p) if p.status == PromptStatus::Pending => {
                    if p.kind == PromptKind::Choice {
                        let answer = value_to_string(&response);
                        if !p.options.contains(&answer) {
                            tracing::warn!("Prompt {} response not in options: {}", prompt_id, answer);
                            return false;
                        }
                    }
                }
                _ => return false,
            }
        }
        self.resolve(prompt_id, PromptOutcome::Answered(response)).await
    }

    /// 取消一个 pending 的提问
    pub async fn cancel(&self, prompt_id: &str) -> bool {
        self.resolve(prompt_id, PromptOutcome::Cancelled).await
    }

    /// 终结 prompt：更新状态、唤醒等待方、晋升队列中的下一个
    async fn resolve(&self, prompt_id: &str, outcome: PromptOutcome) -> bool {
        let resolved = {
            let mut prompts = self.prompts.write().await;
            match prompts.get_mut(prompt_id) {
                Some(p) if p.status == PromptStatus::Pending => {
                    match &outcome {
                        PromptOutcome::Answered(value) => {
                            p.status = PromptStatus::Answered;
                            p.response = Some(value.clone());
                        }
                        PromptOutcome::Cancelled => p.status = PromptStatus::Cancelled,
                        PromptOutcome::Timeout => p.status = PromptStatus::Timeout,
                    }
                    Some(p.clone())
                }
                _ => None,
            }
        };
        let resolved = match resolved {
            Some(p) => p,
            None => return false,
        };

        let waiter = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.remove(prompt_id)
        };
        if let Some(tx) = waiter {
            let _ = tx.send(outcome);
        }
        self.events.publish(HiveEvent::PromptResolved { prompt: resolved });

        let mut current = self.current.write().await;
        if current.as_deref() == Some(prompt_id) {
            *current = None;
            let mut queue = self.queue.write().await;
            let prompts = self.prompts.read().await;
            while let Some(next_id) = queue.pop_front() {
                if let Some(next) = prompts.get(&next_id) {
                    if next.status == PromptStatus::Pending {
                        *current = Some(next_id);
                        self.events.publish(HiveEvent::PromptActive {
                            prompt: next.clone(),
                        });
                        break;
                    }
                }
            }
        }
        true
    }

    /// 当前展示给人工的提问
    pub async fn current(&self) -> Option<UserPrompt> {
        let current = self.current.read().await;
        match current.as_deref() {
            Some(id) => self.prompts.read().await.get(id).cloned(),
            None => None,
        }
    }

    /// 所有 pending 的提问，按创建时间排序
    pub async fn pending(&self) -> Vec<UserPrompt> {
        let prompts = self.prompts.read().await;
        let mut result: Vec<UserPrompt> = prompts
            .values()
            .filter(|p| p.status == PromptStatus::Pending)
            .cloned()
            .collect();
        result.sort_by_key(|p| p.created_at);
        result
    }

    pub async fn get(&self, prompt_id: &str) -> Option<UserPrompt> {
        self.prompts.read().await.get(prompt_id).cloned()
    }

    /// 已终结的提问，最新在前，可按 Agent 过滤
    pub async fn history(&self, agent_id: Option<&str>) -> Vec<UserPrompt> {
        let prompts = self.prompts.read().await;
        let mut result: Vec<UserPrompt> = prompts
            .values()
            .filter(|p| p.status != PromptStatus::Pending)
            .filter(|p| agent_id.map_or(true, |id| p.agent_id == id))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }

    /// 清除已终结的提问，pending 保留
    pub async fn clear_history(&self) {
        let mut prompts = self.prompts.write().await;
        prompts.retain(|_, p| p.status == PromptStatus::Pending);
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_affirmative(value: &Value, words: &[&str]) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let s = s.to_lowercase();
            words.iter().any(|w| s == *w)
        }
        _ => false,
    }
}
