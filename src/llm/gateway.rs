//! 补全网关：多后端归一
//!
//! 持有 Provider 注册表，把异构 LLM 后端归一为一个请求/响应契约。
//! 未知 id 报 NotFound，传输/鉴权失败报 Provider；本层不做重试（重试属调用方）。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::HiveError;
use crate::llm::{
    AnthropicBackend, ChatMessage, CompletionBackend, CompletionOptions, CompletionResponse,
    OpenAiBackend,
};
use crate::storage::{load_records, save_records, StoreBackend};

const REGISTRY: &str = "providers";

/// 后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    DeepSeek,
    Local,
    Custom,
}

/// Provider 注册输入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// 持久化的 Provider 记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProvider {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub models: Vec<String>,
    pub enabled: bool,
}

struct Entry {
    provider: LlmProvider,
    backend: Arc<dyn CompletionBackend>,
}

/// 多后端补全网关
pub struct CompletionGateway {
    providers: RwLock<HashMap<String, Entry>>,
    store: Arc<dyn StoreBackend>,
}

impl CompletionGateway {
    /// 从持久化恢复 Provider 注册表并重建客户端
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        let records: Vec<LlmProvider> = load_records(store.as_ref(), REGISTRY);
        let mut providers = HashMap::new();
        for provider in records {
            let backend = build_backend(&provider);
            providers.insert(
                provider.id.clone(),
                Entry { provider, backend },
            );
        }
        if !providers.is_empty() {
            tracing::info!("Restored {} LLM providers", providers.len());
        }
        Self {
            providers: RwLock::new(providers),
            store,
        }
    }

    /// 注册 Provider，返回其 id
    pub async fn register(&self, spec: ProviderSpec) -> String {
        let provider = LlmProvider {
            id: format!("provider_{}", uuid::Uuid::new_v4()),
            name: spec.name,
            kind: spec.kind,
            api_key: spec.api_key,
            base_url: spec.base_url,
            models: spec.models,
            enabled: spec.enabled,
        };
        let backend = build_backend(&provider);
        self.insert(provider, backend).await
    }

    /// 注册 Provider 并注入自定义后端（测试 / 进程内后端）
    pub async fn register_with_backend(
        &self,
        spec: ProviderSpec,
        backend: Arc<dyn CompletionBackend>,
    ) -> String {
        let provider = LlmProvider {
            id: format!("provider_{}", uuid::Uuid::new_v4()),
            name: spec.name,
            kind: spec.kind,
            api_key: spec.api_key,
            base_url: spec.base_url,
            models: spec.models,
            enabled: spec.enabled,
        };
        self.insert(provider, backend).await
    }

    async fn insert(&self, provider: LlmProvider, backend: Arc<dyn CompletionBackend>) -> String {
        let id = provider.id.clone();
        let mut providers = self.providers.write().await;
        providers.insert(id.clone(), Entry { provider, backend });
        self.persist(&providers);
        id
    }

    /// 统一补全入口
    pub async fn complete(
        &self,
        provider_id: &str,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse, HiveError> {
        let backend = {
            let providers = self.providers.read().await;
            let entry = providers
                .get(provider_id)
                .ok_or_else(|| HiveError::NotFound(format!("provider {}", provider_id)))?;
            if !entry.provider.enabled {
                return Err(HiveError::NotFound(format!(
                    "provider {} is disabled",
                    provider_id
                )));
            }
            Arc::clone(&entry.backend)
        };
        backend.complete(model, messages, options).await
    }

    /// 最小探针（小 max_tokens），返回布尔结果，从不抛错
    pub async fn test_provider(&self, provider_id: &str) -> bool {
        let model = {
            let providers = self.providers.read().await;
            match providers.get(provider_id) {
                Some(entry) => entry
                    .provider
                    .models
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "test".to_string()),
                None => return false,
            }
        };

        let options = CompletionOptions {
            max_tokens: Some(10),
            ..Default::default()
        };
        match self
            .complete(
                provider_id,
                &model,
                &[ChatMessage::user("Hello, respond with OK")],
                &options,
            )
            .await
        {
            Ok(response) => !response.content.is_empty(),
            Err(e) => {
                tracing::warn!("Provider {} test failed: {}", provider_id, e);
                false
            }
        }
    }

    pub async fn list(&self) -> Vec<LlmProvider> {
        self.providers
            .read()
            .await
            .values()
            .map(|e| e.provider.clone())
            .collect()
    }

    pub async fn get(&self, provider_id: &str) -> Option<LlmProvider> {
        self.providers
            .read()
            .await
            .get(provider_id)
            .map(|e| e.provider.clone())
    }

    pub async fn remove(&self, provider_id: &str) -> bool {
        let mut providers = self.providers.write().await;
        let removed = providers.remove(provider_id).is_some();
        if removed {
            self.persist(&providers);
        }
        removed
    }

    fn persist(&self, providers: &HashMap<String, Entry>) {
        let records: Vec<&LlmProvider> = providers.values().map(|e| &e.provider).collect();
        save_records(self.store.as_ref(), REGISTRY, records);
    }
}

fn build_backend(provider: &LlmProvider) -> Arc<dyn CompletionBackend> {
    let base_url = provider.base_url.as_deref();
    let api_key = provider.api_key.as_deref();
    match provider.kind {
        ProviderKind::OpenAi | ProviderKind::Custom => Arc::new(OpenAiBackend::new(base_url, api_key)),
        ProviderKind::DeepSeek => Arc::new(OpenAiBackend::new(
            Some(base_url.unwrap_or("https://api.deepseek.com/v1")),
            api_key,
        )),
        ProviderKind::Local => Arc::new(OpenAiBackend::new(
            Some(base_url.unwrap_or("http://localhost:8080/v1")),
            api_key,
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicBackend::new(base_url, api_key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;
    use crate::storage::MemStore;

    fn spec(name: &str) -> ProviderSpec {
        ProviderSpec {
            name: name.to_string(),
            kind: ProviderKind::Custom,
            api_key: None,
            base_url: None,
            models: vec!["test-model".to_string()],
            enabled: true,
        }
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let gateway = CompletionGateway::new(Arc::new(MemStore::new()));
        let err = gateway
            .complete("provider_missing", "m", &[ChatMessage::user("hi")], &Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn mock_backend_round_trip_and_probe() {
        let gateway = CompletionGateway::new(Arc::new(MemStore::new()));
        let id = gateway
            .register_with_backend(spec("mock"), Arc::new(MockBackend::with_fallback("OK")))
            .await;

        let response = gateway
            .complete(&id, "test-model", &[ChatMessage::user("hi")], &Default::default())
            .await
            .unwrap();
        assert_eq!(response.content, "OK");
        assert!(gateway.test_provider(&id).await);
        assert!(!gateway.test_provider("provider_missing").await);
    }

    #[tokio::test]
    async fn failing_backend_probe_reports_false_without_error() {
        let gateway = CompletionGateway::new(Arc::new(MemStore::new()));
        let id = gateway
            .register_with_backend(spec("broken"), Arc::new(MockBackend::failing()))
            .await;
        assert!(!gateway.test_provider(&id).await);
    }

    #[tokio::test]
    async fn remove_deletes_registration() {
        let gateway = CompletionGateway::new(Arc::new(MemStore::new()));
        let id = gateway
            .register_with_backend(spec("mock"), Arc::new(MockBackend::idle()))
            .await;
        assert!(gateway.remove(&id).await);
        assert!(!gateway.remove(&id).await);
        assert!(gateway.get(&id).await.is_none());
    }
}
