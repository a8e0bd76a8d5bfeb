//! CLI entry point for the nutrisense analyzer.
//!
//! The heavy lifting lives in the library; this binary wires settings,
//! store, console client and sync engine together and exposes the
//! operations a field technician or a supervising process needs:
//!
//! ```bash
//! nutrisense list --pending
//! nutrisense pending
//! nutrisense hello
//! nutrisense sync 1600000000 --new-sample
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use nutrisense::config::Settings;
use nutrisense::store::ResultStore;
use nutrisense::sync::{ConsoleApi, HttpConsoleClient, ReconcileOptions, SyncEngine};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "nutrisense")]
#[command(about = "Field nutrient analyzer control", long_about = None)]
struct Cli {
    /// Configuration name under config/ (without extension)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored analysis results as JSON
    List {
        /// Only results that still await upload
        #[arg(long)]
        pending: bool,
        /// Restrict to one account id
        #[arg(long)]
        account: Option<String>,
    },

    /// Report whether any result still awaits upload
    Pending {
        /// Restrict to one account id
        #[arg(long)]
        account: Option<String>,
    },

    /// Probe console reachability
    Hello,

    /// Reconcile one stored result with the console
    Sync {
        /// Local id of the stored result
        local_id: String,

        /// Create a new remote sample instead of looking one up
        #[arg(long)]
        new_sample: bool,

        /// Explicit sample id to look up or assign
        #[arg(long, conflicts_with = "store_local")]
        sample_id: Option<String>,

        /// Keep the result local, skip the console
        #[arg(long)]
        store_local: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.log_level),
    )
    .init();

    let store = Arc::new(ResultStore::new(&settings.storage)?);

    match cli.command {
        Commands::List { pending, account } => {
            let records: Vec<_> = store
                .list(account.as_deref())?
                .into_iter()
                .filter(|r| !pending || !r.uploaded)
                .collect();
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Pending { account } => {
            println!("{}", store.has_pending(account.as_deref())?);
        }
        Commands::Hello => {
            let client = HttpConsoleClient::new(settings.console.clone())?;
            let status = if client.hello().await {
                "reachable"
            } else {
                "unreachable"
            };
            println!("{status}");
        }
        Commands::Sync {
            local_id,
            new_sample,
            sample_id,
            store_local,
        } => {
            let client = Arc::new(HttpConsoleClient::new(settings.console.clone())?);
            let engine = SyncEngine::new(
                store,
                client,
                settings.device_name.clone(),
                settings.sync.max_concurrent,
            );
            let opts = ReconcileOptions {
                new_sample,
                sample_id,
                store_local,
            };
            let outcome = engine.reconcile(&local_id, &opts).await?;
            match outcome.case_id() {
                Some(id) => println!("case {id}: {outcome}"),
                None => println!("{outcome}"),
            }
        }
    }
    Ok(())
}
