//! Hive - 多智能体编排系统
//!
//! 入口：初始化日志与配置，组装各组件，启动周期清扫与事件日志订阅，
//! 等待 Ctrl-C 后停掉所有 Agent 循环退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::approval::ApprovalGate;
use hive::bus::MessageBus;
use hive::config::load_config;
use hive::core::{AgentOrchestrator, EventBus, HiveEvent, LogLevel};
use hive::executor::CommandExecutor;
use hive::llm::CompletionGateway;
use hive::storage::{FileStore, StoreBackend};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(fmt::layer())
        .init();

    let config = load_config("config/default").context("Failed to load config")?;
    tracing::info!("Starting {} (data dir: {})", config.app.name, config.app.data_dir);

    let store: Arc<dyn StoreBackend> = Arc::new(FileStore::new(&config.app.data_dir));
    let events = EventBus::new(config.app.event_capacity);

    let gateway = Arc::new(CompletionGateway::new(Arc::clone(&store)));
    let bus = Arc::new(MessageBus::new(
        Arc::clone(&store),
        events.clone(),
        config.bus.retention_days,
    ));
    let executor = Arc::new(CommandExecutor::new(
        Arc::clone(&store),
        events.clone(),
        config.executor.permissions(),
        Duration::from_secs(config.executor.kill_grace_secs),
    ));
    let approval = Arc::new(ApprovalGate::new(
        events.clone(),
        Duration::from_secs(config.approval.timeout_secs),
    ));
    let orchestrator = Arc::new(AgentOrchestrator::new(
        Arc::clone(&gateway),
        Arc::clone(&bus),
        Arc::clone(&executor),
        Arc::clone(&approval),
        store,
        events.clone(),
        Duration::from_secs(config.orchestrator.loop_interval_secs),
    ));

    // 周期清扫：过期共享内存 + 超过保留期的消息
    {
        let bus = Arc::clone(&bus);
        let interval = Duration::from_secs(config.bus.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                bus.cleanup().await;
            }
        });
    }

    // 事件日志订阅（落后丢失可接受）
    {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(HiveEvent::AgentLog { agent_id, level, message }) => match level {
                        LogLevel::Error => tracing::warn!("[{}] {}", agent_id, message),
                        _ => tracing::info!("[{}] {}", agent_id, message),
                    },
                    Ok(HiveEvent::PromptActive { prompt }) => {
                        tracing::info!(
                            "Prompt {} awaiting response: {} - {}",
                            prompt.id,
                            prompt.title,
                            prompt.message
                        );
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Event subscriber lagged by {}", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    tracing::info!("Hive is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down, stopping all agents");
    orchestrator.stop_all().await;
    Ok(())
}
