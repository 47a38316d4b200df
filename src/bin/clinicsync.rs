use clap::{Parser, Subcommand};
use std::sync::Arc;

use clinicsync::{ClinicSync, Database, EnvCredentialProvider, RunStatus, SyncConfig};

#[derive(Parser)]
#[command(name = "clinicsync", about = "Practice-management sync engine CLI")]
struct Cli {
    /// Database path (default: ~/.clinicsync/clinicsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync for a tenant and wait for it to finish
    Sync {
        /// Tenant identifier
        #[arg(long)]
        tenant: String,
        /// Force a full sync regardless of the watermark
        #[arg(long)]
        full: bool,
        /// Wall-clock budget in seconds
        #[arg(long)]
        budget_secs: Option<u64>,
        /// Cooldown in seconds before a repeat sync is skipped
        #[arg(long)]
        cooldown_secs: Option<u64>,
    },
    /// Show a tenant's current sync state
    Status {
        #[arg(long)]
        tenant: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a tenant's sync history
    History {
        #[arg(long)]
        tenant: String,
        /// Maximum runs to list
        #[arg(long, default_value = "10")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a running sync
    Cancel {
        /// Sync run id
        sync_id: String,
        /// Cancel regardless of current state
        #[arg(long)]
        force: bool,
    },
    /// Fail and clean up stale sync runs
    Cleanup,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };

    match cli.command {
        Commands::Sync {
            tenant,
            full,
            budget_secs,
            cooldown_secs,
        } => {
            let mut config = SyncConfig::default();
            if let Some(budget) = budget_secs {
                config.budget_secs = budget;
            }
            if let Some(cooldown) = cooldown_secs {
                config.cooldown_secs = cooldown;
            }
            let engine = ClinicSync::new(db, Arc::new(EnvCredentialProvider), config);
            run_sync(&engine, &tenant, full).await?;
        }
        Commands::Status { tenant, json } => {
            let engine = engine(db);
            match engine.tenant_sync_status(&tenant) {
                Some(state) if json => println!("{}", serde_json::to_string_pretty(&state)?),
                Some(state) => {
                    println!(
                        "{} [{}] {} — step {} ({}/{}, {:.0}%)",
                        state.sync_id,
                        state.mode,
                        state.status,
                        state.step,
                        state.step_index,
                        state.total_steps,
                        state.percent()
                    );
                }
                None => {
                    // Fall back to the durable history for past runs.
                    let history = engine.sync_history(&tenant, 1).await?;
                    match history.recent.first() {
                        Some(run) => println!(
                            "no active sync; last run {} [{}] {} at {}",
                            run.id, run.mode, run.status, run.started_at
                        ),
                        None => println!("no sync found for tenant {tenant}"),
                    }
                }
            }
        }
        Commands::History {
            tenant,
            limit,
            json,
        } => {
            let engine = engine(db);
            let history = engine.sync_history(&tenant, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else {
                let t = &history.totals;
                println!(
                    "{} runs: {} completed, {} failed, {} timeout, {} cancelled, {} records synced",
                    t.total_runs, t.completed, t.failed, t.timed_out, t.cancelled,
                    t.records_succeeded
                );
                for run in &history.recent {
                    println!(
                        "  {}  {:<12} {:<10} {}  +{}/-{}",
                        run.started_at,
                        run.mode,
                        run.status,
                        run.id,
                        run.records_succeeded,
                        run.records_failed
                    );
                }
            }
        }
        Commands::Cancel { sync_id, force } => {
            let engine = engine(db);
            let cancelled = if force {
                engine.force_cancel_sync(&sync_id)
            } else {
                engine.cancel_sync(&sync_id)
            };
            if cancelled {
                println!("cancellation requested for {sync_id}");
            } else {
                anyhow::bail!("sync {sync_id} is not active in this process");
            }
        }
        Commands::Cleanup => {
            let engine = engine(db);
            let count = engine.cleanup_stale_syncs().await?;
            println!("cleaned up {count} stale sync run(s)");
        }
        Commands::Config { action } => {
            let engine = engine(db);
            match action {
                ConfigAction::Get { key } => match engine.config_get(&key).await? {
                    Some(value) => println!("{value}"),
                    None => anyhow::bail!("config key '{key}' not set"),
                },
                ConfigAction::Set { key, value } => {
                    engine.config_set(&key, &value).await?;
                    println!("{key} = {value}");
                }
                ConfigAction::List => {
                    for (key, value) in engine.config_list().await? {
                        println!("{key} = {value}");
                    }
                }
            }
        }
    }

    Ok(())
}

fn engine(db: Database) -> ClinicSync {
    ClinicSync::new(db, Arc::new(EnvCredentialProvider), SyncConfig::default())
}

/// Start a sync and follow its progress on stderr until it finishes.
async fn run_sync(engine: &ClinicSync, tenant: &str, force_full: bool) -> anyhow::Result<()> {
    let started = engine.start_sync(tenant, force_full).await?;
    if started.already_running {
        eprintln!(
            "sync {} already running for {tenant}, attaching...",
            started.sync_id
        );
    } else {
        eprintln!("started {} sync {}", started.mode, started.sync_id);
    }

    let mut last_step = String::new();
    let final_state = loop {
        let Some(state) = engine.sync_status(&started.sync_id) else {
            anyhow::bail!("sync {} vanished from the tracker", started.sync_id);
        };
        if state.step != last_step {
            eprintln!(
                "  [{}/{}] {}",
                state.step_index, state.total_steps, state.step
            );
            last_step = state.step.clone();
        }
        if state.status.is_terminal() {
            break state;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    };

    println!(
        "{}: {} processed, {} succeeded, {} failed",
        final_state.status,
        final_state.counters.records_processed,
        final_state.counters.records_succeeded,
        final_state.counters.records_failed
    );
    for error in &final_state.errors {
        eprintln!("  error: {error}");
    }

    match final_state.status {
        RunStatus::Completed | RunStatus::Timeout => Ok(()),
        status => anyhow::bail!("sync finished as {status}"),
    }
}
