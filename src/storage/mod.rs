//! 注册表持久化
//!
//! 「全量读 / 全量写」的 KV 契约：启动时按注册表名读入一组记录，每次变更后整体写回。
//! FileStore 为每个注册表写一个 JSON 文件（父目录自动创建），MemStore 供测试使用。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::HiveError;

/// 持久化后端：按名字整存整取一组 JSON 记录
pub trait StoreBackend: Send + Sync {
    fn load(&self, registry: &str) -> Result<Vec<Value>, HiveError>;
    fn save(&self, registry: &str, records: &[Value]) -> Result<(), HiveError>;
}

/// 文件后端：`<dir>/<registry>.json`
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, registry: &str) -> PathBuf {
        self.dir.join(format!("{}.json", registry))
    }
}

impl StoreBackend for FileStore {
    fn load(&self, registry: &str) -> Result<Vec<Value>, HiveError> {
        let path = self.path_for(registry);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| HiveError::Storage(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| HiveError::Storage(format!("parse {}: {}", path.display(), e)))
    }

    fn save(&self, registry: &str, records: &[Value]) -> Result<(), HiveError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| HiveError::Storage(format!("mkdir {}: {}", self.dir.display(), e)))?;
        let path = self.path_for(registry);
        let data = serde_json::to_string_pretty(records)
            .map_err(|e| HiveError::Storage(e.to_string()))?;
        std::fs::write(&path, data)
            .map_err(|e| HiveError::Storage(format!("write {}: {}", path.display(), e)))
    }
}

/// 内存后端（测试用）
#[derive(Debug, Default)]
pub struct MemStore {
    registries: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemStore {
    fn load(&self, registry: &str) -> Result<Vec<Value>, HiveError> {
        let registries = self
            .registries
            .lock()
            .map_err(|_| HiveError::Storage("mem store poisoned".to_string()))?;
        Ok(registries.get(registry).cloned().unwrap_or_default())
    }

    fn save(&self, registry: &str, records: &[Value]) -> Result<(), HiveError> {
        let mut registries = self
            .registries
            .lock()
            .map_err(|_| HiveError::Storage("mem store poisoned".to_string()))?;
        registries.insert(registry.to_string(), records.to_vec());
        Ok(())
    }
}

/// 读入并反序列化一个注册表；单条记录损坏时跳过并告警，不让启动失败
pub fn load_records<T: DeserializeOwned>(backend: &dyn StoreBackend, registry: &str) -> Vec<T> {
    let values = match backend.load(registry) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Failed to load registry '{}': {}", registry, e);
            return Vec::new();
        }
    };
    values
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping malformed record in '{}': {}", registry, e);
                None
            }
        })
        .collect()
}

/// 序列化并整体写回一个注册表；失败记录日志（持久化属于尽力而为的外部协作者）
pub fn save_records<'a, T, I>(backend: &dyn StoreBackend, registry: &str, records: I)
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let values: Vec<Value> = records
        .into_iter()
        .filter_map(|r| serde_json::to_value(r).ok())
        .collect();
    if let Err(e) = backend.save(registry, &values) {
        tracing::error!("Failed to save registry '{}': {}", registry, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        id: String,
        n: u32,
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("data"));

        let records = vec![
            Rec {
                id: "a".to_string(),
                n: 1,
            },
            Rec {
                id: "b".to_string(),
                n: 2,
            },
        ];
        save_records(&store, "recs", &records);

        let loaded: Vec<Rec> = load_records(&store, "recs");
        assert_eq!(loaded, records);
    }

    #[test]
    fn terminal_records_survive_file_round_trip() {
        use crate::bus::{AgentMessage, MessageKind, MessageMetadata, Recipient};
        use crate::core::agent::{AgentTask, TaskStatus};
        use crate::executor::{CommandResult, CommandStatus};

        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("data"));

        let mut task = AgentTask::new("agent_1", "summarize logs", 7).delegated("agent_0", "agent_1");
        task.status = TaskStatus::Completed;
        task.start_time = Some(chrono::Utc::now());
        task.end_time = Some(chrono::Utc::now());
        task.result = Some(serde_json::json!({"response": "done", "actions": []}));

        let result = CommandResult {
            id: "cmd_1".to_string(),
            command: "echo hi".to_string(),
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            status: CommandStatus::Completed,
            start_time: chrono::Utc::now(),
            end_time: Some(chrono::Utc::now()),
            duration_ms: 12,
            working_dir: "/tmp".to_string(),
            agent_id: Some("agent_1".to_string()),
        };

        let mut message = AgentMessage::new(
            "agent_0",
            Recipient::Agent("agent_1".to_string()),
            "task done",
            MessageKind::Response,
            MessageMetadata {
                request_id: Some(task.id.clone()),
                ..Default::default()
            },
        );
        message.read = true;

        save_records(&store, "tasks", std::slice::from_ref(&task));
        save_records(&store, "command_history", std::slice::from_ref(&result));
        save_records(&store, "messages", std::slice::from_ref(&message));

        let tasks: Vec<AgentTask> = load_records(&store, "tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            serde_json::to_value(&tasks[0]).unwrap(),
            serde_json::to_value(&task).unwrap()
        );

        let history: Vec<CommandResult> = load_records(&store, "command_history");
        assert_eq!(history.len(), 1);
        assert_eq!(
            serde_json::to_value(&history[0]).unwrap(),
            serde_json::to_value(&result).unwrap()
        );

        let messages: Vec<AgentMessage> = load_records(&store, "messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(
            serde_json::to_value(&messages[0]).unwrap(),
            serde_json::to_value(&message).unwrap()
        );
    }

    #[test]
    fn missing_registry_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let loaded: Vec<Rec> = load_records(&store, "nope");
        assert!(loaded.is_empty());
    }
}
