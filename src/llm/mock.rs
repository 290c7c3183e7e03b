//! Mock 补全后端（测试用，无需 API）
//!
//! 按 FIFO 吐出预置响应；脚本耗尽后回落到默认响应。usage 按内容长度粗估。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::HiveError;
use crate::llm::{ChatMessage, CompletionBackend, CompletionOptions, CompletionResponse, TokenUsage};

/// 脚本化 Mock 后端
pub struct MockBackend {
    scripted: Mutex<VecDeque<String>>,
    fallback: String,
    fail: bool,
}

impl MockBackend {
    /// 始终返回 idle 决策
    pub fn idle() -> Self {
        Self::with_fallback(r#"{"action": "idle", "description": "nothing to do"}"#)
    }

    pub fn with_fallback(fallback: impl Into<String>) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            fail: false,
        }
    }

    /// 每次调用都返回 Provider 错误（用于验证 log-and-continue 策略）
    pub fn failing() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            fallback: String::new(),
            fail: true,
        }
    }

    /// 追加一条脚本响应
    pub fn push(&self, response: impl Into<String>) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.push_back(response.into());
        }
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<CompletionResponse, HiveError> {
        if self.fail {
            return Err(HiveError::Provider("mock backend failure".to_string()));
        }

        let content = self
            .scripted
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| self.fallback.clone());

        let prompt_chars: usize = messages.iter().map(|m| m.content.len()).sum();
        let usage = TokenUsage::new((prompt_chars / 4) as u64, (content.len() / 4) as u64);

        Ok(CompletionResponse {
            content,
            usage,
            model: model.to_string(),
        })
    }
}
