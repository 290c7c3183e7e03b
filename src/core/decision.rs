//! 决策协议：LLM 输出到结构化动作的解析边界
//!
//! 决策是封闭的 tagged union（send_message / delegate_task / execute_command /
//! automation / idle）。未知 action 或格式错误一律确定性退化为 Idle，绝不让解析
//! 失败在循环中向上传播。`AUTOMATION: {...}` 是执行响应里的遗留自由文本标记，
//! 每个匹配独立解析与派发，坏的匹配跳过。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{MessageKind, Recipient};

/// 自动化指令（closed set；实际执行属外部协作者）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationCommand {
    MouseMove { x: i32, y: i32 },
    MouseClick {
        #[serde(default = "default_button")]
        button: String,
        #[serde(default)]
        double: bool,
    },
    KeyboardType { text: String },
    KeyboardPress {
        key: String,
        #[serde(default)]
        modifiers: Vec<String>,
    },
    Screenshot {
        #[serde(default)]
        region: Option<Value>,
    },
    GetMousePos,
    GetScreenSize,
}

fn default_button() -> String {
    "left".to_string()
}

/// 决策动作
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    SendMessage {
        to: Recipient,
        content: String,
        kind: MessageKind,
    },
    DelegateTask {
        to: String,
        description: String,
    },
    ExecuteCommand {
        command: String,
        working_dir: Option<String>,
        timeout_ms: Option<u64>,
    },
    Automation(AutomationCommand),
    Idle,
}

/// 解析后的决策：动作 + 描述 + 计划步骤
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: AgentAction,
    pub description: String,
    pub steps: Vec<String>,
}

impl Decision {
    pub fn idle() -> Self {
        Self {
            action: AgentAction::Idle,
            description: String::new(),
            steps: Vec::new(),
        }
    }
}

/// LLM 返回的原始决策负载
#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default)]
    data: Value,
}

/// 剥掉 Markdown 代码栅栏等噪声，截取首个 `{` 到末个 `}`
fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        Some(&content[start..=end])
    } else {
        None
    }
}

/// 解析决策文本；任何失败（非 JSON、未知 action、缺字段）退化为 Idle
pub fn parse_decision(content: &str) -> Decision {
    let json = match extract_json(content) {
        Some(j) => j,
        None => return Decision::idle(),
    };
    let raw: RawDecision = match serde_json::from_str(json) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("Decision payload is not structured ({}), treating as idle", e);
            return Decision::idle();
        }
    };

    let action = match raw.action.as_str() {
        "send_message" => {
            let to = raw
                .data
                .get("to")
                .and_then(|v| v.as_str())
                .map(|s| Recipient::from(s.to_string()));
            let content = raw
                .data
                .get("content")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let kind = raw
                .data
                .get("type")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or(MessageKind::Notification);
            match (to, content) {
                (Some(to), Some(content)) => AgentAction::SendMessage { to, content, kind },
                _ => AgentAction::Idle,
            }
        }
        "delegate_task" | "delegate" => {
            let to = raw
                .data
                .get("to")
                .or_else(|| raw.data.get("target"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let description = raw
                .data
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| {
                    if raw.description.is_empty() {
                        None
                    } else {
                        Some(raw.description.clone())
                    }
                });
            match (to, description) {
                (Some(to), Some(description)) => AgentAction::DelegateTask { to, description },
                _ => AgentAction::Idle,
            }
        }
        "execute_command" => {
            let command = raw
                .data
                .get("command")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match command {
                Some(command) => AgentAction::ExecuteCommand {
                    command,
                    working_dir: raw
                        .data
                        .get("working_dir")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    timeout_ms: raw.data.get("timeout_ms").and_then(|v| v.as_u64()),
                },
                None => AgentAction::Idle,
            }
        }
        "automation" => match serde_json::from_value::<AutomationCommand>(raw.data.clone()) {
            Ok(cmd) => AgentAction::Automation(cmd),
            Err(e) => {
                tracing::warn!("Malformed automation decision: {}", e);
                AgentAction::Idle
            }
        },
        "idle" => AgentAction::Idle,
        other => {
            tracing::debug!("Unknown decision action '{}', treating as idle", other);
            AgentAction::Idle
        }
    };

    Decision {
        action,
        description: raw.description,
        steps: raw.steps,
    }
}

/// 从执行响应中扫出 `AUTOMATION: {...}` 标记；坏的匹配记日志后跳过
pub fn scan_automation(content: &str) -> Vec<AutomationCommand> {
    // 负载为单层 JSON 对象，与原始标记格式一致
    let re = match regex::Regex::new(r"AUTOMATION:\s*(\{[^}]+\})") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };

    re.captures_iter(content)
        .filter_map(|cap| {
            let payload = cap.get(1)?.as_str();
            match serde_json::from_str::<AutomationCommand>(payload) {
                Ok(cmd) => Some(cmd),
                Err(e) => {
                    tracing::warn!("Skipping malformed AUTOMATION payload '{}': {}", payload, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_decision_degrades_to_idle() {
        assert_eq!(parse_decision("not json at all").action, AgentAction::Idle);
        assert_eq!(parse_decision("{\"action\":").action, AgentAction::Idle);
        assert_eq!(
            parse_decision(r#"{"action": "conquer_world"}"#).action,
            AgentAction::Idle
        );
    }

    #[test]
    fn parses_fenced_send_message() {
        let content = r#"Here is my decision:
```json
{"action": "send_message", "description": "ping", "data": {"to": "agent_b", "content": "hello", "type": "notification"}}
```"#;
        let decision = parse_decision(content);
        match decision.action {
            AgentAction::SendMessage { to, content, kind } => {
                assert_eq!(to, Recipient::Agent("agent_b".to_string()));
                assert_eq!(content, "hello");
                assert_eq!(kind, MessageKind::Notification);
            }
            other => panic!("expected SendMessage, got {:?}", other),
        }
    }

    #[test]
    fn parses_execute_command() {
        let decision = parse_decision(
            r#"{"action": "execute_command", "description": "list files", "data": {"command": "ls -la", "timeout_ms": 1000}}"#,
        );
        assert_eq!(
            decision.action,
            AgentAction::ExecuteCommand {
                command: "ls -la".to_string(),
                working_dir: None,
                timeout_ms: Some(1000),
            }
        );
    }

    #[test]
    fn delegate_without_target_is_idle() {
        let decision =
            parse_decision(r#"{"action": "delegate_task", "data": {"description": "do x"}}"#);
        assert_eq!(decision.action, AgentAction::Idle);
    }

    #[test]
    fn automation_scan_skips_malformed_matches() {
        let content = r#"Done.
AUTOMATION: {"type": "mouse_move", "x": 10, "y": 20}
AUTOMATION: {"type": "warp_drive", "x": 1}
AUTOMATION: {"type": "keyboard_type", "text": "hi"}"#;

        let commands = scan_automation(content);
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            commands[0],
            AutomationCommand::MouseMove { x: 10, y: 20 }
        ));
        assert!(matches!(commands[1], AutomationCommand::KeyboardType { .. }));
    }
}
