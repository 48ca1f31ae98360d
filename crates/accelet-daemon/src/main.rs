//! accelet daemon
//!
//! Loads the node's accelerator configuration, wires the dispatcher,
//! scheduler, launcher and task bookkeeping together, runs the tasks given
//! on the command line and shuts down in order.

use accelet_core::{DaemonConfig, EventType};
use accelet_event::AsyncDispatcher;
use accelet_runtime::{TaskLauncher, TaskManager};
use accelet_scheduler::FairScheduler;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// accelet daemon - fair scheduler for accelerator cards
#[derive(Parser, Debug)]
#[command(name = "acceletd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "accelet.toml")]
    config: PathBuf,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,

    /// Task to run as <workload>:<user_app_id>, may be repeated
    #[arg(long = "submit", value_parser = parse_submission)]
    submit: Vec<Submission>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Submission {
    workload: String,
    user_app_id: String,
}

fn parse_submission(s: &str) -> Result<Submission, String> {
    match s.split_once(':') {
        Some((workload, user_app_id)) if !workload.is_empty() && !user_app_id.is_empty() => {
            Ok(Submission {
                workload: workload.to_string(),
                user_app_id: user_app_id.to_string(),
            })
        }
        _ => Err(format!("expected <workload>:<user_app_id>, got {:?}", s)),
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if format != "text" {
        warn!(format = %format, "Unsupported log format, using text");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = DaemonConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    info!("Starting accelet daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut dispatcher = AsyncDispatcher::new(&config.dispatcher);
    let publisher = dispatcher.event_handler();
    let scheduler = Arc::new(FairScheduler::new(
        &config.scheduler,
        &config.accelerators,
        publisher.clone(),
    )?);
    let launcher = Arc::new(TaskLauncher::new(&config.launcher, publisher.clone()));
    let manager = Arc::new(TaskManager::new(config.workloads.clone(), publisher));

    // the scheduler releases cores before bookkeeping marks a task ended
    for event_type in [
        EventType::TaskAdded,
        EventType::TaskRemoved,
        EventType::TaskFinished,
        EventType::TaskFailed,
    ] {
        dispatcher.register(event_type, scheduler.clone()).await;
    }
    dispatcher.register(EventType::LaunchTask, launcher.clone()).await;
    dispatcher.register(EventType::CleanupTask, launcher.clone()).await;
    for event_type in [
        EventType::LaunchTask,
        EventType::TaskFinished,
        EventType::TaskFailed,
    ] {
        dispatcher.register(event_type, manager.clone()).await;
    }

    dispatcher.start()?;
    launcher.start().await?;
    let heartbeat = scheduler.start();

    let mut submitted = 0;
    for submission in &args.submit {
        if !scheduler.supports_workload(&submission.workload) {
            warn!(
                workload = %submission.workload,
                app = %submission.user_app_id,
                "No accelerator serves this workload, skipping"
            );
            continue;
        }
        match manager
            .create_task(&submission.user_app_id, &submission.workload)
            .await
        {
            Ok(task_id) => {
                info!(task_id = %task_id, "Task submitted");
                submitted += 1;
            }
            Err(e) => error!(
                workload = %submission.workload,
                app = %submission.user_app_id,
                error = %e,
                "Failed to submit task"
            ),
        }
    }

    if submitted > 0 {
        tokio::select! {
            _ = manager.wait_all() => info!(tasks = submitted, "All submitted tasks ended"),
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Received Ctrl-C, shutting down");
            }
        }
    } else {
        info!("No tasks submitted, waiting for Ctrl-C");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    let report = serde_json::json!({
        "cards": scheduler.card_reports().await,
        "queues": scheduler.queue_lengths().await,
        "tasks": manager.records().await,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    scheduler.stop();
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "Scheduler loop ended abnormally");
    }
    dispatcher.stop().await;
    launcher.stop().await;

    info!("accelet daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submission() {
        assert_eq!(
            parse_submission("kmeans:app1").unwrap(),
            Submission {
                workload: "kmeans".to_string(),
                user_app_id: "app1".to_string(),
            }
        );
        assert!(parse_submission("kmeans").is_err());
        assert!(parse_submission(":app1").is_err());
        assert!(parse_submission("kmeans:").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "acceletd",
            "--config",
            "/etc/accelet.toml",
            "--submit",
            "kmeans:app1",
            "--submit",
            "loopback:app2",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/accelet.toml"));
        assert_eq!(args.submit.len(), 2);
        assert!(args.log_level.is_none());
    }
}
