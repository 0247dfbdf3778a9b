//! `flowrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: validate a flow JSON file.
//! - `run`: execute a flow from a JSON file or the database.
//! - `migrate`: run pending database migrations.
//! - `recover`: finalize runs orphaned by a previous process.
//! - `import`: store a flow JSON file in the database.
//! - `list`: list an owner's flows.
//! - `check`: validate a stored flow and persist its issues.
//! - `activate`: move a stored draft flow to active.
//! - `dismiss`: resolve one validation issue.
//! - `stats`: summarize a stored flow's recent runs.
//! - `errors`: list a stored flow's recent failed runs.

mod settings;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use db::repository::{credentials, flows, issues};
use db::{DbPool, PgCredentialResolver, PgRunStore, PoolSettings};
use engine::{
    recent_errors, recover_orphaned_runs, reconcile, run_stats, validate, Flow, FlowStatus, MemoryRunStore, RunStatus, RunStore, Scheduler,
    SchedulerConfig, TriggerEvent, ValidationReport,
};
use nodes::{Credential, CredentialResolver, MemoryCredentialResolver, NodeRegistry};
use queue::RunQueue;

use settings::Settings;

#[derive(Parser)]
#[command(name = "flowrun", about = "Flow execution engine", version)]
struct Cli {
    /// Settings file (TOML). Defaults to ./flowrun.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `database.url` from settings.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a flow definition JSON file.
    Validate {
        path: PathBuf,
        /// JSON array of credentials connected by the flow's owner.
        #[arg(long)]
        credentials: Option<PathBuf>,
    },
    /// Execute a flow once and print the finished run.
    Run(RunArgs),
    /// Run pending database migrations.
    Migrate,
    /// Finalize runs left pending or running by a previous process.
    Recover,
    /// Store a flow definition JSON file.
    Import { path: PathBuf },
    /// List flows owned by a user.
    List {
        owner: Uuid,
        #[arg(long)]
        status: Option<FlowStatus>,
    },
    /// Validate a stored flow and reconcile its stored issues.
    Check { flow_id: Uuid },
    /// Activate a stored draft flow.
    Activate { flow_id: Uuid },
    /// Resolve a validation issue until the next check finds it again.
    Dismiss { issue_id: Uuid },
    /// Summarize the runs of a stored flow.
    Stats {
        flow_id: Uuid,
        /// Only runs started within this many days.
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Show recent failed runs of a stored flow, grouped by message.
    Errors {
        flow_id: Uuid,
        /// Only runs started within this many hours.
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Flow JSON file, executed against an in-memory run store.
    #[arg(long, conflicts_with = "flow", required_unless_present = "flow")]
    file: Option<PathBuf>,

    /// Stored flow id, executed against the database.
    #[arg(long)]
    flow: Option<Uuid>,

    /// Fire only triggers of this type.
    #[arg(long, conflicts_with = "trigger_node")]
    trigger_type: Option<String>,

    /// Fire this trigger node.
    #[arg(long)]
    trigger_node: Option<String>,

    /// Trigger payload as inline JSON.
    #[arg(long, default_value = "{}")]
    payload: String,

    /// JSON array of credentials for file runs; each stored token is used as the secret.
    #[arg(long, requires = "file")]
    credentials: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path, credentials } => {
            let flow = read_flow(&path)?;
            let credentials = match credentials {
                Some(path) => read_credentials(&path)?,
                None => Vec::new(),
            };
            let report = ValidationReport::new(
                flow.id,
                validate(&flow, &NodeRegistry::with_builtins(), &credentials, Utc::now()),
            );
            print_json(&report)?;
            Ok(exit_code(report.can_activate()))
        }
        Command::Run(args) => {
            let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
            let status = run_flow(args, settings, cli.database_url).await?;
            Ok(exit_code(status == RunStatus::Success))
        }
        Command::Migrate => {
            let pool = connect(cli.config.as_deref(), cli.database_url).await?;
            db::run_migrations(&pool).await.context("migration failed")?;
            info!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Command::Recover => {
            let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
            let config = SchedulerConfig::try_from(settings.engine.clone())?;
            let pool = connect_with(&settings, cli.database_url).await?;
            let store = PgRunStore::new(pool);
            let recovered = recover_orphaned_runs(&store, config.run_timeout, Utc::now()).await?;
            for run in &recovered {
                println!("{} {} -> {}", run.flow_id, run.run_id, run.status);
            }
            info!(count = recovered.len(), "recovery finished");
            Ok(ExitCode::SUCCESS)
        }
        Command::Import { path } => {
            let flow = read_flow(&path)?;
            let pool = connect(cli.config.as_deref(), cli.database_url).await?;
            flows::insert_flow(&pool, &flow)
                .await
                .with_context(|| format!("failed to import flow {}", flow.id))?;
            println!("{}", flow.id);
            Ok(ExitCode::SUCCESS)
        }
        Command::List { owner, status } => {
            let pool = connect(cli.config.as_deref(), cli.database_url).await?;
            for flow in flows::list_flows(&pool, owner, status).await? {
                println!("{}\t{}\t{}\t{}", flow.id, flow.status, flow.flow_type, flow.name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { flow_id } => {
            let pool = connect(cli.config.as_deref(), cli.database_url).await?;
            let report = check_flow(&pool, flow_id).await?;
            print_json(&report)?;
            Ok(exit_code(report.can_activate()))
        }
        Command::Activate { flow_id } => {
            let pool = connect(cli.config.as_deref(), cli.database_url).await?;
            let report = check_flow(&pool, flow_id).await?;
            let mut flow = flows::load_flow(&pool, flow_id).await?;
            flow.activate(&report.issues)
                .with_context(|| format!("flow {flow_id} cannot be activated"))?;
            flows::set_flow_status(&pool, flow_id, flow.status).await?;
            info!(%flow_id, "flow activated");
            Ok(ExitCode::SUCCESS)
        }
        Command::Dismiss { issue_id } => {
            let pool = connect(cli.config.as_deref(), cli.database_url).await?;
            issues::dismiss_issue(&pool, issue_id, Utc::now())
                .await
                .with_context(|| format!("no open issue {issue_id}"))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats { flow_id, days } => {
            let pool = connect(cli.config.as_deref(), cli.database_url).await?;
            let store = PgRunStore::new(pool);
            let now = Utc::now();
            let stats = run_stats(&store, flow_id, now - window(Duration::try_days(days))?, now).await?;
            print_json(&stats)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Errors { flow_id, hours, limit } => {
            let pool = connect(cli.config.as_deref(), cli.database_url).await?;
            let store = PgRunStore::new(pool);
            let since = Utc::now() - window(Duration::try_hours(hours))?;
            let digest = recent_errors(&store, flow_id, since, limit).await?;
            print_json(&digest)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_flow(args: RunArgs, settings: Settings, database_url: Option<String>) -> Result<RunStatus> {
    let config = SchedulerConfig::try_from(settings.engine.clone())?;
    let payload: Value = serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;
    let event = match (args.trigger_node, args.trigger_type) {
        (Some(node_id), _) => TriggerEvent::at_node(node_id, payload),
        (None, Some(node_type)) => TriggerEvent::of_type(node_type, payload),
        (None, None) => TriggerEvent::manual(payload),
    };

    let (flow, store, resolver): (Flow, Arc<dyn RunStore>, Arc<dyn CredentialResolver>) =
        match (args.file, args.flow) {
            (Some(path), _) => {
                let flow = read_flow(&path)?;
                let resolver = MemoryCredentialResolver::new();
                if let Some(path) = args.credentials {
                    for credential in read_credentials(&path)? {
                        let secret = credential.encrypted_token.clone();
                        resolver.insert(credential, secret);
                    }
                }
                (flow, Arc::new(MemoryRunStore::new()), Arc::new(resolver))
            }
            (None, Some(flow_id)) => {
                let pool = connect_with(&settings, database_url).await?;
                let flow = flows::load_flow(&pool, flow_id)
                    .await
                    .with_context(|| format!("failed to load flow {flow_id}"))?;
                if flow.status != FlowStatus::Active {
                    warn!(%flow_id, status = %flow.status, "running a flow that is not active");
                }
                let resolver = PgCredentialResolver::new(pool.clone(), flow.owner);
                (flow, Arc::new(PgRunStore::new(pool)), Arc::new(resolver))
            }
            (None, None) => bail!("either --file or --flow is required"),
        };

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(NodeRegistry::with_builtins()),
        store,
        resolver,
        config,
    ));
    let queue = RunQueue::start(scheduler, settings.queue)?;
    let ticket = queue.submit(&flow, event).await?;
    let run_id = ticket.run_id();
    info!(%run_id, flow_id = %flow.id, "run submitted");

    let wait = ticket.wait();
    tokio::pin!(wait);
    let run = tokio::select! {
        run = &mut wait => run?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%run_id, "interrupted; cancelling runs");
            queue.cancel_all();
            wait.await?
        }
    };
    queue.shutdown().await;

    print_json(&run)?;
    Ok(run.status)
}

/// Validate a stored flow against its owner's credentials and persist the
/// reconciled issue list.
async fn check_flow(pool: &DbPool, flow_id: Uuid) -> Result<ValidationReport> {
    let flow = flows::load_flow(pool, flow_id)
        .await
        .with_context(|| format!("failed to load flow {flow_id}"))?;
    let owned = credentials::list_credentials(pool, flow.owner).await?;
    let now = Utc::now();

    let fresh = validate(&flow, &NodeRegistry::with_builtins(), &owned, now);
    let existing = issues::list_issues(pool, flow_id).await?;
    let merged = reconcile(existing, fresh, now);
    issues::save_issues(pool, &merged).await?;

    Ok(ValidationReport::new(flow_id, merged))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_flow(path: &Path) -> Result<Flow> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not a valid flow", path.display()))
}

fn read_credentials(path: &Path) -> Result<Vec<Credential>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not a credential list", path.display()))
}

async fn connect(config: Option<&Path>, database_url: Option<String>) -> Result<DbPool> {
    let database = Settings::load_database(config).context("failed to load settings")?;
    open_pool(&database, database_url).await
}

async fn connect_with(settings: &Settings, database_url: Option<String>) -> Result<DbPool> {
    open_pool(&settings.database, database_url).await
}

async fn open_pool(database: &PoolSettings, database_url: Option<String>) -> Result<DbPool> {
    db::connect(database, database_url.as_deref())
        .await
        .context("failed to connect to database")
}

fn window(span: Option<Duration>) -> Result<Duration> {
    match span {
        Some(span) if span > Duration::zero() => Ok(span),
        _ => bail!("the time window must be positive"),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
