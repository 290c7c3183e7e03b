//! 消息总线与共享内存
//!
//! 点对点 / 广播消息外加访问控制的共享 KV。发送不设权限门槛；单收件人队列内
//! 保序（跨发送者、直发与广播之间不保证顺序）。每个逻辑操作在单一临界区内完成
//! 读-改-写，变更后整体写回持久化。

mod message;
mod shared_memory;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

pub use message::{AgentMessage, MessageKind, MessageMetadata, Priority, Recipient};
pub use shared_memory::{Permissions, SharedEntry, WILDCARD};

use crate::core::events::{EventBus, HiveEvent};
use crate::storage::{load_records, save_records, StoreBackend};

const MESSAGES: &str = "messages";
const SHARED_MEMORY: &str = "shared_memory";

/// 消息日志 + 每 Agent FIFO 队列（单锁保证操作原子性）
#[derive(Default)]
struct MessageLog {
    by_id: HashMap<String, AgentMessage>,
    /// 全局发送顺序（持久化与广播遍历用）
    order: Vec<String>,
    /// agent id -> 直发消息 id 队列
    queues: HashMap<String, Vec<String>>,
}

impl MessageLog {
    fn insert(&mut self, message: AgentMessage) {
        if let Recipient::Agent(to) = &message.to {
            self.queues
                .entry(to.clone())
                .or_default()
                .push(message.id.clone());
        }
        self.order.push(message.id.clone());
        self.by_id.insert(message.id.clone(), message);
    }

    fn in_order(&self) -> impl Iterator<Item = &AgentMessage> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }
}

/// 消息总线
pub struct MessageBus {
    log: RwLock<MessageLog>,
    memory: RwLock<HashMap<String, SharedEntry>>,
    store: Arc<dyn StoreBackend>,
    events: EventBus,
    /// 消息保留天数（清扫阈值）
    retention_days: i64,
}

impl MessageBus {
    pub fn new(store: Arc<dyn StoreBackend>, events: EventBus, retention_days: i64) -> Self {
        let mut log = MessageLog::default();
        let restored: Vec<AgentMessage> = load_records(store.as_ref(), MESSAGES);
        for message in restored {
            log.insert(message);
        }

        let memory: HashMap<String, SharedEntry> = load_records(store.as_ref(), SHARED_MEMORY)
            .into_iter()
            .map(|entry: SharedEntry| (entry.key.clone(), entry))
            .collect();

        if !log.by_id.is_empty() || !memory.is_empty() {
            tracing::info!(
                "Restored {} messages and {} shared entries",
                log.by_id.len(),
                memory.len()
            );
        }

        Self {
            log: RwLock::new(log),
            memory: RwLock::new(memory),
            store,
            events,
            retention_days: retention_days.max(1),
        }
    }

    /// 发送消息：永不失败，追加到全局日志与收件人队列
    pub async fn send(
        &self,
        from: impl Into<String>,
        to: Recipient,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: MessageMetadata,
    ) -> AgentMessage {
        let message = AgentMessage::new(from, to, content, kind, metadata);
        {
            let mut log = self.log.write().await;
            log.insert(message.clone());
            self.persist_messages(&log);
        }
        self.events.publish(HiveEvent::MessageSent {
            message: message.clone(),
        });
        message
    }

    /// 某 Agent 可见的消息：直发队列 + 非自己发出的广播；默认仅未读
    pub async fn messages_for(&self, agent_id: &str, include_read: bool) -> Vec<AgentMessage> {
        let log = self.log.read().await;

        let mut result: Vec<AgentMessage> = log
            .queues
            .get(agent_id)
            .map(|ids| ids.iter().filter_map(|id| log.by_id.get(id).cloned()).collect())
            .unwrap_or_default();

        result.extend(
            log.in_order()
                .filter(|m| m.to.is_broadcast() && m.from != agent_id)
                .cloned(),
        );

        if include_read {
            result
        } else {
            result.into_iter().filter(|m| !m.read).collect()
        }
    }

    /// 标记已读（幂等，仅作用于存在的消息）
    pub async fn mark_read(&self, message_id: &str) -> bool {
        let mut log = self.log.write().await;
        match log.by_id.get_mut(message_id) {
            Some(message) => {
                message.read = true;
                self.persist_messages(&log);
                true
            }
            None => false,
        }
    }

    /// 两个 Agent 之间的直发消息，按时间排序
    pub async fn conversation(&self, a: &str, b: &str) -> Vec<AgentMessage> {
        let log = self.log.read().await;
        let mut result: Vec<AgentMessage> = log
            .by_id
            .values()
            .filter(|m| {
                matches!(&m.to, Recipient::Agent(to) if (m.from == a && to == b) || (m.from == b && to == a))
            })
            .cloned()
            .collect();
        result.sort_by_key(|m| m.timestamp);
        result
    }

    /// 清空某 Agent 的队列与所有相关消息
    pub async fn clear_messages(&self, agent_id: &str) {
        let mut guard = self.log.write().await;
        let log = &mut *guard;
        log.queues.remove(agent_id);
        log.by_id.retain(|_, m| {
            m.from != agent_id && !matches!(&m.to, Recipient::Agent(to) if to == agent_id)
        });
        let by_id = &log.by_id;
        log.order.retain(|id| by_id.contains_key(id));
        self.persist_messages(log);
    }

    /// 出现在消息往来中的 Agent id
    pub async fn active_agents(&self) -> Vec<String> {
        let log = self.log.read().await;
        let mut agents: Vec<String> = Vec::new();
        for message in log.by_id.values() {
            if !agents.contains(&message.from) {
                agents.push(message.from.clone());
            }
            if let Recipient::Agent(to) = &message.to {
                if !agents.contains(to) {
                    agents.push(to.clone());
                }
            }
        }
        agents
    }

    /// 写共享内存：键已存在且调用者不在 write 列表时返回 false（不抛错）
    pub async fn set_shared(
        &self,
        key: &str,
        value: Value,
        agent_id: &str,
        permissions: Option<Permissions>,
        ttl_ms: Option<u64>,
    ) -> bool {
        let mut memory = self.memory.write().await;
        if let Some(existing) = memory.get(key) {
            if !existing.permissions.can_write(agent_id) {
                return false;
            }
        }
        let entry = SharedEntry::new(key, value, agent_id, permissions, ttl_ms);
        memory.insert(key.to_string(), entry);
        self.persist_memory(&memory);
        self.events.publish(HiveEvent::MemoryUpdated {
            key: key.to_string(),
        });
        true
    }

    /// 读共享内存：缺失 / 无读权限 / 已过期返回 None（过期条目在此处惰性删除）
    pub async fn get_shared(&self, key: &str, agent_id: &str) -> Option<Value> {
        let mut memory = self.memory.write().await;
        match memory.get(key) {
            None => None,
            Some(entry) if entry.is_expired() => {
                memory.remove(key);
                self.persist_memory(&memory);
                None
            }
            Some(entry) if !entry.permissions.can_read(agent_id) => None,
            Some(entry) => Some(entry.value.clone()),
        }
    }

    /// 调用者可读的键（列举前先驱逐过期条目）
    pub async fn list_keys(&self, agent_id: &str) -> Vec<String> {
        let mut memory = self.memory.write().await;
        let before = memory.len();
        memory.retain(|_, entry| !entry.is_expired());
        if memory.len() != before {
            self.persist_memory(&memory);
        }
        memory
            .values()
            .filter(|entry| entry.permissions.can_read(agent_id))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// 删除共享内存（需 write 权限）
    pub async fn delete_shared(&self, key: &str, agent_id: &str) -> bool {
        let mut memory = self.memory.write().await;
        match memory.get(key) {
            Some(entry) if entry.permissions.can_write(agent_id) => {
                memory.remove(key);
                self.persist_memory(&memory);
                true
            }
            _ => false,
        }
    }

    /// 周期清扫：过期共享内存 + 超过保留期的消息（含队列内引用）
    pub async fn cleanup(&self) -> (usize, usize) {
        let expired = {
            let mut memory = self.memory.write().await;
            let before = memory.len();
            memory.retain(|_, entry| !entry.is_expired());
            let removed = before - memory.len();
            if removed > 0 {
                self.persist_memory(&memory);
            }
            removed
        };

        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let aged = {
            let mut guard = self.log.write().await;
            let log = &mut *guard;
            let before = log.by_id.len();
            log.by_id.retain(|_, m| m.timestamp >= cutoff);
            let by_id = &log.by_id;
            log.order.retain(|id| by_id.contains_key(id));
            for queue in log.queues.values_mut() {
                queue.retain(|id| by_id.contains_key(id));
            }
            let removed = before - log.by_id.len();
            if removed > 0 {
                self.persist_messages(log);
            }
            removed
        };

        if expired > 0 || aged > 0 {
            tracing::info!("Cleanup removed {} shared entries, {} messages", expired, aged);
        }
        (expired, aged)
    }

    fn persist_messages(&self, log: &MessageLog) {
        let records: Vec<&AgentMessage> = log.in_order().collect();
        save_records(self.store.as_ref(), MESSAGES, records);
    }

    fn persist_memory(&self, memory: &HashMap<String, SharedEntry>) {
        save_records(self.store.as_ref(), SHARED_MEMORY, memory.values());
    }
}
