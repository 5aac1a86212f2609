//! Service wiring: the startup container for the gateway and the
//! supervisor. Dependencies are built here and injected; nothing is a
//! global.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sonia_config::SoniaConfig;
use sonia_events::EventBus;
use sonia_gateway::{
    AppState, ConfirmationManager, HttpModelRouter, OutboxWorker, SessionManager, TurnPipeline,
};
use sonia_ledger::MemoryDatabase;
use sonia_policy::{default_safety_rules, ActionVerdict, PolicyEngine};
use sonia_retrieval::{HybridOptions, HybridSearchLayer};
use sonia_state::StateStore;
use sonia_supervisor::ServiceSupervisor;
use sonia_tools::{
    ExecutorPlane, FileExecutor, ParameterType, PlaneConfig, RiskTier, SandboxRoot, ShellExecutor,
    ToolCategory, ToolDefinition, ToolParameter, ToolRegistry,
};

/// Serve the gateway until interrupted.
pub(crate) async fn gateway(config: SoniaConfig) -> Result<()> {
    let store = StateStore::open(config.storage.gateway_db_path())
        .context("open gateway state store")?;
    let ledger =
        MemoryDatabase::open(config.storage.memory_db_path()).context("open memory ledger")?;

    let vector_index = if config.retrieval.vector_index.is_absolute() {
        config.retrieval.vector_index.clone()
    } else {
        config.storage.data_dir.join(&config.retrieval.vector_index)
    };
    let retrieval = Arc::new(HybridSearchLayer::new(
        ledger.clone(),
        HybridOptions {
            embeddings_url: config.retrieval.embeddings_url.clone(),
            embeddings_model: config.retrieval.embeddings_model.clone(),
            dimension: config.retrieval.dimension,
            index_path: vector_index,
            backfill_batch: config.retrieval.backfill_batch,
        },
    ));
    retrieval.initialize();
    // Vector bring-up is advisory and must not delay startup
    {
        let retrieval = Arc::clone(&retrieval);
        tokio::spawn(async move { retrieval.initialize_vector().await });
    }

    let events = EventBus::new();
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        config.gateway.session_ttl_seconds,
    ));
    let confirmations = Arc::new(ConfirmationManager::new(
        store.clone(),
        config.gateway.confirmation_ttl_seconds,
    ));
    let restored_sessions = sessions.restore().await;
    let restored_confirmations = confirmations.restore().await;
    let counts = store.restore_all().await;
    info!(
        sessions = restored_sessions,
        confirmations = restored_confirmations,
        dead_letters = counts.dead_letters,
        outbox_pending = counts.outbox_pending,
        "durable state restored"
    );

    let policy = Arc::new(PolicyEngine::new(
        default_safety_rules(),
        ActionVerdict::Confirm,
    ));
    let registry = Arc::new(ToolRegistry::new());
    register_builtin_tools(&registry)?;

    let mut plane = ExecutorPlane::new(
        Arc::clone(&registry),
        Arc::clone(&policy),
        Arc::clone(&confirmations) as Arc<dyn sonia_tools::ApprovalGate>,
        PlaneConfig {
            sandbox: SandboxRoot::new(&config.tools.sandbox_root),
            default_timeout: Duration::from_secs_f64(config.tools.default_timeout_seconds),
            max_timeout: Duration::from_secs_f64(config.tools.max_timeout_seconds),
            max_output_bytes: config.tools.max_output_bytes,
            max_file_bytes: config.tools.max_file_bytes,
            auto_approve_tier_1: config.tools.auto_approve_tier_1,
            mode: "conversation".to_string(),
        },
    );
    plane.register_executor("file.read", Arc::new(FileExecutor::new()));
    plane.register_executor("file.write", Arc::new(FileExecutor::new()));
    plane.register_executor("shell.run", Arc::new(ShellExecutor::approved()));
    let plane = Arc::new(plane);

    let router = Arc::new(HttpModelRouter::new(
        config.gateway.model_router_url.clone(),
        Duration::from_secs_f64(config.gateway.model_timeout_seconds),
    ));
    let pipeline = Arc::new(TurnPipeline::new(
        Arc::clone(&sessions),
        Arc::clone(&confirmations),
        store.clone(),
        Arc::clone(&retrieval),
        Arc::clone(&policy),
        Arc::clone(&plane),
        router,
        events.clone(),
        config.gateway.clone(),
    ));

    let cancel = CancellationToken::new();

    // Background workers: outbox drain, confirmation sweep, session
    // sweep, idempotency prune, decay sweep
    let ledger_sweep = ledger.clone();
    let worker = OutboxWorker::new(
        store.clone(),
        ledger,
        Arc::clone(&retrieval),
        events.clone(),
        Duration::from_secs_f64(config.gateway.outbox_poll_seconds),
    );
    tokio::spawn(worker.run(cancel.clone()));

    // Forgotten memories move to the soft archive once an hour
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(3600)) => {
                        match ledger_sweep.archive_forgotten() {
                            Ok(archived) if !archived.is_empty() => {
                                info!(count = archived.len(), "decay sweep archived memories");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "decay sweep failed"),
                        }
                    }
                }
            }
        });
    }

    {
        let confirmations = Arc::clone(&confirmations);
        let sessions = Arc::clone(&sessions);
        let store = store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(30)) => {
                        confirmations.expire_pending().await;
                        sessions.expire_stale().await;
                        store.prune_expired_idempotency_keys().await;
                    }
                }
            }
        });
    }

    let state = AppState::new(
        pipeline,
        confirmations,
        MemoryDatabase::open(config.storage.memory_db_path())?,
        Arc::clone(&retrieval),
        plane,
        registry,
        events,
    );
    let app = sonia_gateway::router(state);

    let listener = tokio::net::TcpListener::bind(&config.gateway.bind)
        .await
        .with_context(|| format!("bind {}", config.gateway.bind))?;
    info!(bind = config.gateway.bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    retrieval.save_index().await;
    info!("gateway stopped");
    Ok(())
}

/// Serve the supervisor until interrupted.
pub(crate) async fn supervisor(config: SoniaConfig) -> Result<()> {
    let events = EventBus::new();
    let supervisor = ServiceSupervisor::new(config.supervisor.clone(), events);
    let cancel = CancellationToken::new();

    {
        let supervisor = Arc::clone(&supervisor);
        let cancel = cancel.clone();
        tokio::spawn(supervisor.run(cancel));
    }

    let app = sonia_supervisor::router(Arc::clone(&supervisor));
    let listener = tokio::net::TcpListener::bind(&config.supervisor.bind)
        .await
        .with_context(|| format!("bind {}", config.supervisor.bind))?;
    info!(bind = config.supervisor.bind, "supervisor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    cancel.cancel();
    info!("supervisor stopped");
    Ok(())
}

fn register_builtin_tools(registry: &ToolRegistry) -> Result<()> {
    let tools = [
        ToolDefinition {
            name: "file.read".to_string(),
            description: "Read a file inside the sandbox".to_string(),
            category: ToolCategory::File,
            risk_tier: RiskTier::Tier0,
            parameters: vec![ToolParameter::required("path", ParameterType::String)],
            requires_approval: false,
            requires_auth: false,
            rate_limit_per_minute: 120,
            timeout_seconds: 5.0,
        },
        ToolDefinition {
            name: "file.write".to_string(),
            description: "Write a file inside the sandbox".to_string(),
            category: ToolCategory::File,
            risk_tier: RiskTier::Tier1,
            parameters: vec![
                ToolParameter::required("path", ParameterType::String),
                ToolParameter::required("content", ParameterType::String),
            ],
            requires_approval: false,
            requires_auth: false,
            rate_limit_per_minute: 60,
            timeout_seconds: 5.0,
        },
        ToolDefinition {
            name: "shell.run".to_string(),
            description: "Run a shell command in the sandbox".to_string(),
            category: ToolCategory::Shell,
            risk_tier: RiskTier::Tier2,
            parameters: vec![ToolParameter::required("command", ParameterType::String)],
            requires_approval: false,
            requires_auth: false,
            rate_limit_per_minute: 30,
            timeout_seconds: 5.0,
        },
    ];
    for tool in tools {
        registry
            .register(tool)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
