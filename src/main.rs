use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crew_orchestrator::events::{EventObserver, TaskEvent};
use crew_orchestrator::store::InMemoryStore;
use crew_orchestrator::tasks::TaskDraft;
use crew_orchestrator::workers::Worker;
use crew_orchestrator::{Orchestrator, OrchestratorConfig};

/// Logs every task event.
struct LogObserver;

#[async_trait]
impl EventObserver for LogObserver {
    async fn on_event(&self, event: TaskEvent) {
        info!(
            sequence = event.sequence,
            task_id = %event.task_id,
            kind = ?event.kind,
            from = %event.previous_state,
            to = %event.new_state,
            extra = %event.extra,
            "Task event"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────
    let file_sink = std::env::var("ORCHESTRATOR_LOG_DIR").ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "crew-orchestrator.log");
        tracing_appender::non_blocking(appender)
    });
    let (file_writer, _log_guard) = match file_sink {
        Some((writer, guard)) => (Some(writer), Some(guard)),
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
        .init();

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;

    // ── Roster ───────────────────────────────────────────────────────────
    let roster: Vec<Worker> = match std::env::var("ORCHESTRATOR_WORKERS") {
        Ok(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read worker roster {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("malformed worker roster {path}"))?
        }
        Err(_) => Vec::new(),
    };

    let store = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(config, store.clone(), store)?;
    for worker in roster {
        orchestrator.register_worker(worker).await?;
    }

    eprintln!("Crew Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", orchestrator.list_workers().await?.len());
    eprintln!(
        "   Rebalance every {}s",
        orchestrator.config().rebalance_interval.as_secs()
    );
    eprintln!("   One task draft (JSON) per line. /optimize, /rebalance, /quit.\n");

    let _events = orchestrator.subscribe(Arc::new(LogObserver)).await;
    let rebalance = orchestrator.spawn_rebalance_loop();

    // ── Input loop ───────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" => break,
            "/optimize" => {
                let report = orchestrator.optimize_assignments().await?;
                println!("{}", serde_json::to_string(&report)?);
            }
            "/rebalance" => {
                let report = orchestrator.rebalance_workload().await?;
                println!("{}", serde_json::to_string(&report)?);
            }
            draft => match serde_json::from_str::<TaskDraft>(draft) {
                Ok(draft) => match orchestrator.submit_task(draft).await {
                    Ok(task) => println!("{}", serde_json::to_string(&task)?),
                    Err(e) => warn!(error = %e, "Task rejected"),
                },
                Err(e) => warn!(error = %e, "Ignoring malformed task draft"),
            },
        }
    }

    rebalance.abort();
    info!("Shutting down");
    Ok(())
}
