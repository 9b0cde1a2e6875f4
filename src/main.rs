//! Claw Agent Runtime
//!
//! The entry point for the agent. Handles CLI args, bootstrapping, and
//! running the alarm loop. The message transport binds externally through
//! `AgentBrain::handle_message`; the stock binary delivers notifications
//! to stdout.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::signal;
use tracing::info;

use claw::approval::ApprovalQueue;
use claw::brain::AgentBrain;
use claw::config;
use claw::reasoning::CommandReasoning;
use claw::schedule::{format_schedule, ScheduleEngine};
use claw::types::{LogLevel, NotificationClient, PlatformClient};
use claw::usage::RateLimiter;

const VERSION: &str = "0.1.0";

/// Claw -- Autonomous Agent Runtime
#[derive(Parser, Debug)]
#[command(
    name = "claw",
    version = VERSION,
    about = "Claw -- Autonomous Agent Runtime"
)]
struct Cli {
    /// Start the agent: alarm loop plus externally-bound message handling
    #[arg(long)]
    run: bool,

    /// Show usage counters, schedules, and pending approvals
    #[arg(long)]
    status: bool,
}

/// Notification transport that prints to stdout. Real deployments bind a
/// chat transport instead.
struct StdoutNotifier;

#[async_trait]
impl NotificationClient for StdoutNotifier {
    async fn send(&self, channel_id: u64, text: &str) -> Result<()> {
        println!("[channel {}] {}", channel_id, text);
        Ok(())
    }
}

fn init_tracing(level: &LogLevel) {
    let level = match level {
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

// ---- Status Command ---------------------------------------------------------

/// Display usage counters, registered schedules, and pending approvals.
async fn show_status() {
    let Some(config) = config::load_config() else {
        println!(
            "Agent is not configured. Write {} first.",
            config::get_config_path().display()
        );
        return;
    };

    let dir = PathBuf::from(config::resolve_path(&config.storage_dir));
    let usage = RateLimiter::open(config.usage_limits.clone(), &dir).status();
    let scheduler = ScheduleEngine::open(&config.name, &dir);
    let pending = ApprovalQueue::open(&dir).pending().await;

    println!(
        r#"
=== CLAW STATUS ===
Name:       {}
Model:      {}
Storage:    {}
Version:    {}
Usage:      {}/min {}/hr {}/day (limits {}/{}/{}, total {})
"#,
        config.name,
        config.model,
        dir.display(),
        config.version,
        usage.calls_this_minute,
        usage.calls_this_hour,
        usage.calls_today,
        usage.limits.max_calls_per_minute,
        usage.limits.max_calls_per_hour,
        usage.limits.max_calls_per_day,
        usage.total_calls_all_time,
    );

    let entries = scheduler.list();
    if entries.is_empty() {
        println!("No alarms registered.");
    } else {
        println!("Alarms:");
        for entry in entries {
            println!(
                "  {} {} ({}): {}",
                entry.id,
                format_schedule(&entry),
                entry.tz,
                entry.prompt
            );
        }
    }

    if pending.is_empty() {
        println!("No pending approvals.");
    } else {
        println!("Pending approvals:");
        for record in pending {
            println!("  {} [{}] {}", record.id, record.platform, record.text);
        }
    }
}

// ---- Main Run ---------------------------------------------------------------

/// Load config, build the brain, start the alarm loop, and wait for a
/// shutdown signal.
async fn run() -> Result<()> {
    let config = config::load_config().with_context(|| {
        format!(
            "no config found at {}; write one first",
            config::get_config_path().display()
        )
    })?;
    init_tracing(&config.log_level);
    info!("claw v{} starting as [{}]", config.version, config.name);

    let dir = PathBuf::from(config::resolve_path(&config.storage_dir));
    fs::create_dir_all(&dir).context("Failed to create storage directory")?;

    let reasoning = Arc::new(CommandReasoning::new(
        &config.reasoning_command,
        &config.model,
        config.reasoning_timeout_secs,
    ));
    let notify = Arc::new(StdoutNotifier);
    // Platform executors are registered by the embedding transport; the
    // stock binary runs with none, so post actions queue for approval.
    let clients: HashMap<String, Arc<dyn PlatformClient>> = HashMap::new();

    let brain = AgentBrain::new(config, &dir, reasoning, notify, clients);
    let alarm_loop = brain.clone().spawn_alarm_loop();

    // Graceful shutdown on SIGINT/SIGTERM.
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.context("Failed to register Ctrl+C handler")?;
        info!("Received shutdown signal");
    }

    alarm_loop.abort();
    Ok(())
}

// ---- Entry Point -----------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.status {
        show_status().await;
        return;
    }

    if cli.run {
        if let Err(e) = run().await {
            eprintln!("Fatal: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    // Default: show help
    println!("Run \"claw --help\" for usage information.");
    println!("Run \"claw --run\" to start the agent.");
}
