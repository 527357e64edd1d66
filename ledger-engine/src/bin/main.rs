use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use common::error::{Error, Result};
use ledger_engine::{LedgerConfig, LedgerEngine, PostgresLedgerStore, ReconcileReport};

/// Ledger engine operator CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Commands
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the accounts and transactions tables if they do not exist
    InitSchema {
        /// Database URL (falls back to DATABASE_URL)
        #[arg(short, long)]
        database_url: Option<String>,
    },
    /// Recompute account balances from transaction history and repair drift
    Reconcile {
        /// Workspace to sweep
        #[arg(short, long)]
        workspace_id: Uuid,

        /// Restrict the pass to a single account
        #[arg(short, long)]
        account_id: Option<Uuid>,

        /// Report drift without writing corrections
        #[arg(long)]
        check: bool,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,

        /// Database URL (falls back to DATABASE_URL)
        #[arg(short, long)]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "ledger_engine={}",
            cli.log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::InitSchema { database_url } => {
            let store = PostgresLedgerStore::with_config(&config_for(database_url)).await?;
            store.ensure_schema().await?;
            info!("ledger schema is in place");
        }
        Commands::Reconcile {
            workspace_id,
            account_id,
            check,
            json,
            database_url,
        } => {
            let engine = LedgerEngine::with_config(&config_for(database_url)).await?;
            let reports = run_reconcile(&engine, workspace_id, account_id, check).await?;
            print_reports(&reports, json)?;

            let drifted = reports.iter().filter(|r| r.drifted()).count();
            if check && drifted > 0 {
                // Non-zero exit so cron jobs notice unrepaired drift
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn config_for(database_url: Option<String>) -> LedgerConfig {
    match database_url {
        Some(url) => {
            let defaults = LedgerConfig::from_env();
            LedgerConfig::new(url, defaults.db_pool_size, defaults.statement_timeout_ms)
        }
        None => LedgerConfig::from_env(),
    }
}

async fn run_reconcile(
    engine: &LedgerEngine,
    workspace_id: Uuid,
    account_id: Option<Uuid>,
    check: bool,
) -> Result<Vec<ReconcileReport>> {
    let store = engine.store();

    let accounts = match account_id {
        Some(id) => {
            let account = store
                .get_account(id)
                .await?
                .ok_or_else(|| Error::AccountNotFound(format!("account not found: {}", id)))?;
            if account.workspace_id != workspace_id {
                return Err(Error::CrossWorkspace(format!(
                    "account {} does not belong to workspace {}",
                    id, workspace_id
                )));
            }
            vec![account]
        }
        None => store.list_accounts(workspace_id).await?,
    };

    let reconciliation = engine.reconciliation();
    let mut reports = Vec::with_capacity(accounts.len());
    for account in accounts {
        let report = if check {
            let recomputed = reconciliation.recompute_balance(account.id).await?;
            ReconcileReport {
                account_id: account.id,
                previous: account.balance,
                recomputed,
                corrected: false,
            }
        } else {
            reconciliation.reconcile(account.id).await?
        };
        reports.push(report);
    }

    Ok(reports)
}

fn print_reports(reports: &[ReconcileReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }

    for report in reports {
        if report.drifted() {
            println!(
                "account {}: stored {} recomputed {} ({})",
                report.account_id,
                report.previous,
                report.recomputed,
                if report.corrected { "corrected" } else { "drift detected" }
            );
        } else {
            println!("account {}: balance {} consistent", report.account_id, report.previous);
        }
    }
    println!(
        "{} account(s) checked, {} drifted",
        reports.len(),
        reports.iter().filter(|r| r.drifted()).count()
    );

    Ok(())
}
