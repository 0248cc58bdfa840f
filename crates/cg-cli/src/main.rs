use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{error, info};

use cg_config::Config;
use cg_core::{Observers, ProtectedEndpoint, ShutdownCoordinator};
use cg_db::{AuditRepository, Database, IncidentRepository};
use cg_types::{CallError, IncidentStatus, RequestId};

#[derive(Parser)]
#[command(name = "callguard", about = "CallGuard - resilience layer for rate-limited APIs", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive traffic through a protected endpoint backed by a flaky fake provider
    Simulate {
        /// Number of logical requests to submit
        #[arg(long, default_value_t = 20)]
        requests: u32,
        /// Probability that a provider call fails with a server error
        #[arg(long, default_value_t = 0.2)]
        failure_rate: f64,
        /// Probability that a provider call is throttled (429)
        #[arg(long, default_value_t = 0.1)]
        throttle_rate: f64,
        /// Priorities are drawn from 0..=spread
        #[arg(long, default_value_t = 0)]
        priority_spread: i32,
    },
    /// Show recent audit log entries
    Audit {
        #[arg(long)]
        component: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// List incidents (open only unless --all)
    Incidents {
        #[arg(long)]
        all: bool,
    },
    /// Mark an incident resolved
    Resolve { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("Failed to load configuration")?;
    cg_core::init_logging(
        &config.log_level,
        config.log_file.as_deref(),
        config.log_structured,
    )
    .context("Failed to initialize logging")?;

    let db = open_database(&config).await?;
    let result = match cli.command {
        Commands::Simulate {
            requests,
            failure_rate,
            throttle_rate,
            priority_spread,
        } => {
            let provider = FlakyProvider::new(failure_rate, throttle_rate)?;
            simulate(&config, Arc::clone(&db), provider, requests, priority_spread).await
        }
        Commands::Audit { component, limit } => audit(&db, component.as_deref(), limit).await,
        Commands::Incidents { all } => incidents(&db, all).await,
        Commands::Resolve { id } => resolve(&db, id).await,
    };

    db.close().await;
    result
}

async fn open_database(config: &Config) -> anyhow::Result<Arc<Database>> {
    config
        .create_directories()
        .context("Failed to create database directory")?;
    let db = Database::new(&config.db_path)
        .await
        .context("Failed to connect to database")?;
    db.initialize()
        .await
        .context("Failed to initialize database schema")?;
    Ok(Arc::new(db))
}

/// Stand-in for the remote API: random latency, random failures and throttles.
#[derive(Clone)]
struct FlakyProvider {
    failure_rate: f64,
    throttle_rate: f64,
}

impl FlakyProvider {
    fn new(failure_rate: f64, throttle_rate: f64) -> anyhow::Result<Self> {
        for (name, rate) in [("failure-rate", failure_rate), ("throttle-rate", throttle_rate)] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("--{name} must be between 0 and 1, got {rate}");
            }
        }
        if failure_rate + throttle_rate > 1.0 {
            bail!("--failure-rate and --throttle-rate must not add up to more than 1");
        }
        Ok(Self {
            failure_rate,
            throttle_rate,
        })
    }

    fn call(&self, request: u32) -> impl Future<Output = Result<u32, CallError>> + Send {
        let mut rng = rand::thread_rng();
        let roll: f64 = rng.gen();
        let latency = Duration::from_millis(rng.gen_range(20..120));
        let outcome = if roll < self.throttle_rate {
            Err(CallError::from_status(429, "Too Many Requests"))
        } else if roll < self.throttle_rate + self.failure_rate {
            Err(CallError::from_status(503, "Service Unavailable"))
        } else {
            Ok(request)
        };

        async move {
            tokio::time::sleep(latency).await;
            outcome
        }
    }
}

async fn simulate(
    config: &Config,
    db: Arc<Database>,
    provider: FlakyProvider,
    requests: u32,
    priority_spread: i32,
) -> anyhow::Result<()> {
    let endpoint = ProtectedEndpoint::new(
        config.endpoint_name.clone(),
        config,
        Observers::database(db),
    )
    .context("Failed to set up protected endpoint")?;

    let shutdown = Arc::new(ShutdownCoordinator::new());
    shutdown.register(Arc::clone(&endpoint));
    let signal_listener = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = shutdown.wait_for_signal().await {
                error!(error = %e, "Signal listener failed");
            }
        })
    };

    info!(
        endpoint = endpoint.name(),
        requests, "Simulation starting. Press Ctrl+C to abandon queued work."
    );

    let mut tasks = JoinSet::new();
    for i in 0..requests {
        let priority = if priority_spread > 0 {
            rand::thread_rng().gen_range(0..=priority_spread)
        } else {
            0
        };
        let endpoint = Arc::clone(&endpoint);
        let provider = provider.clone();
        tasks.spawn(async move {
            let outcome = endpoint
                .execute_with_retry(
                    RequestId::generate(),
                    priority,
                    move || provider.call(i),
                    None,
                    None,
                )
                .await;
            (i, outcome)
        });
    }

    let mut succeeded = 0u32;
    let mut failures: BTreeMap<&'static str, u32> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (i, outcome) = joined.context("Simulation task panicked")?;
        match outcome.error {
            None => {
                succeeded += 1;
                info!(request = i, attempts = outcome.attempts, "Request succeeded");
            }
            Some(e) => {
                *failures.entry(e.kind()).or_default() += 1;
                info!(request = i, attempts = outcome.attempts, error = %e, "Request failed");
            }
        }
    }
    signal_listener.abort();

    let metrics = endpoint.metrics();
    let breaker = endpoint.breaker_state().await;
    println!("Requests: {requests}  succeeded: {succeeded}");
    for (kind, count) in &failures {
        println!("  failed ({kind}): {count}");
    }
    println!(
        "Metrics:\n{}",
        serde_json::to_string_pretty(&metrics).context("Failed to render metrics")?
    );
    println!(
        "Breaker:\n{}",
        serde_json::to_string_pretty(&breaker).context("Failed to render breaker state")?
    );
    Ok(())
}

async fn audit(db: &Database, component: Option<&str>, limit: i64) -> anyhow::Result<()> {
    let repo = AuditRepository::new(db);
    let entries = match component {
        Some(component) => repo.recent_for(component, limit).await?,
        None => repo.recent(limit).await?,
    };

    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}  {:<8} {:<18} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.component,
            entry.event,
            entry.detail
        );
    }

    if let Some(component) = component {
        println!();
        for count in repo.count_by_event(component).await? {
            println!("{:<18} {}", count.event, count.count);
        }
    }
    Ok(())
}

async fn incidents(db: &Database, all: bool) -> anyhow::Result<()> {
    let status = if all { None } else { Some(IncidentStatus::Open) };
    let incidents = IncidentRepository::new(db).list(status).await?;

    if incidents.is_empty() {
        println!("No incidents.");
        return Ok(());
    }
    for incident in &incidents {
        println!(
            "#{:<5} {:<8} {:<8} {}  {}",
            incident.id,
            incident.severity.as_str(),
            incident.status.as_str(),
            incident.created_at.format("%Y-%m-%d %H:%M:%S"),
            incident.title
        );
        println!("       {}", incident.error_message);
    }
    Ok(())
}

async fn resolve(db: &Database, id: i64) -> anyhow::Result<()> {
    if IncidentRepository::new(db).resolve(id).await? {
        println!("Incident #{id} resolved.");
        Ok(())
    } else {
        bail!("Incident #{id} not found or already resolved")
    }
}
