//! weka-reconcile: converge a Weka cluster to a declared set of entities.
//!
//! Logs in once, then for every entity in the desired file creates, reads,
//! updates or deletes it through the Weka REST API, tracking identifiers in
//! a local state file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weka_reconcile::host::{self, StateStore};
use weka_reconcile::{Driver, ProviderConfig, Session};

/// Weka cluster reconciler
#[derive(Parser, Debug)]
#[command(name = "weka-reconcile", version, about)]
struct Args {
    /// Weka user to authenticate as
    #[arg(long, env = "WEKA_USERNAME")]
    username: String,

    /// Password of the Weka user
    #[arg(long, env = "WEKA_PASSWORD", hide_env_values = true)]
    password: String,

    /// Organization to log in to
    #[arg(long, env = "WEKA_ORG")]
    org: String,

    /// API endpoint (e.g., https://weka01:14000/api/v2)
    #[arg(long, env = "WEKA_ENDPOINT")]
    endpoint: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge the cluster to the desired file
    Apply(Files),
    /// Show what apply would do
    Plan(Files),
}

#[derive(clap::Args, Debug)]
struct Files {
    /// JSON list of desired entities
    #[arg(long)]
    desired: PathBuf,

    /// State file tracking created entities
    #[arg(long, default_value = "weka-state.json")]
    state: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weka_reconcile=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = ProviderConfig::new(args.username, args.password, args.org, args.endpoint);
    config.timeout = Duration::from_secs(args.timeout_secs);
    config.tls_verify = !args.insecure;

    let files = match &args.command {
        Command::Apply(files) | Command::Plan(files) => files,
    };

    let mut desired = host::load_desired(&files.desired)?;
    host::apply_env_defaults(&mut desired, |var| std::env::var(var).ok());
    let store = StateStore::new(&files.state);

    let http = config.http_client().context("Failed to set up HTTP client")?;
    let session = Session::login(&http, &config)
        .await
        .context("Failed to log in to Weka")?;
    info!("Logged in to {} as {}", config.endpoint, config.username);

    let driver = Driver::from_session(http, session);

    match args.command {
        Command::Plan(_) => {
            for entity in host::plan(&driver, &desired, &store).await? {
                println!("{entity}");
            }
        }
        Command::Apply(_) => {
            let report = host::apply(&driver, &desired, &store).await?;
            for entity in &report.entities {
                println!("{entity}");
            }

            let failed = report.failures().count();
            if failed > 0 {
                error!("{} of {} entities failed", failed, report.entities.len());
                bail!("{failed} entities failed to reconcile");
            }
            info!("State written to {}", store.path().display());
        }
    }

    Ok(())
}
