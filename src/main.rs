//! Bookkeeper operator CLI.
//!
//! Maintenance entry points for a ledger database: team setup, aggregate
//! rebuilds, manual payload application and the outbox dispatch worker.

use std::path::PathBuf;
use std::process;

use chrono::Utc;
use clap::{Parser, Subcommand};

use bookkeeper_lib::aggregator::receive_daily_update;
use bookkeeper_lib::balance::{account_balance_by_key, account_key_closing};
use bookkeeper_lib::config::{load_config, LedgerConfig};
use bookkeeper_lib::dispatch_queue::run_dispatch_worker;
use bookkeeper_lib::labels::seed_type_labels;
use bookkeeper_lib::resync::{rebuild_daily_balances, resync_account_key_balances, Actor};
use bookkeeper_lib::setup::setup_team;
use bookkeeper_lib::{Context, LedgerDb, LedgerError};

#[derive(Parser)]
#[command(name = "bookkeeper")]
#[command(about = "Maintenance tool for the bookkeeper ledger")]
#[command(version)]
struct Cli {
    /// Database path (overrides `databasePath` in config)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the reserved accounts for a team
    Setup {
        #[arg(long)]
        team: u64,
    },

    /// Insert the type-label enumeration
    SeedLabels,

    /// Rebuild the account-key daily table from the journal
    Resync {
        /// Operator user id
        #[arg(long, default_value = "0")]
        user: u64,
        #[arg(long)]
        superuser: bool,
    },

    /// Truncate and replay the account and label daily tables
    RebuildDaily {
        #[arg(long, default_value = "0")]
        user: u64,
        #[arg(long)]
        superuser: bool,
    },

    /// Apply a daily-update payload from a JSON file
    ApplyPayload { file: PathBuf },

    /// Deliver queued aggregator payloads until killed
    Worker,

    /// Print the balance of a reserved account
    Balance {
        #[arg(long)]
        account_key: String,
        #[arg(long)]
        team: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let default_filter = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(e) = run(cli, config) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn open_db(cli_path: Option<PathBuf>, config: &LedgerConfig) -> Result<LedgerDb, LedgerError> {
    let path = match cli_path {
        Some(path) => path,
        None => config.database_path()?,
    };
    Ok(LedgerDb::open_at(path)?)
}

fn run(cli: Cli, config: LedgerConfig) -> Result<(), LedgerError> {
    let db = open_db(cli.database, &config)?;
    let mut print_progress = |message: &str| println!("  {}", message);

    match cli.command {
        Commands::Setup { team } => {
            let created = setup_team(&db, team)?;
            println!("Team {}: {} accounts created", team, created);
        }
        Commands::SeedLabels => {
            let count = seed_type_labels(&db)?;
            println!("{} type labels registered", count);
        }
        Commands::Resync { user, superuser } => {
            let actor = Actor {
                user_id: user,
                superuser,
            };
            let summary = resync_account_key_balances(&db, &actor, &mut print_progress)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::RebuildDaily { user, superuser } => {
            let actor = Actor {
                user_id: user,
                superuser,
            };
            let summary = rebuild_daily_balances(&db, &actor, &mut print_progress)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ApplyPayload { file } => {
            let body = std::fs::read(&file).map_err(|e| {
                LedgerError::Config(format!("Failed to read {}: {}", file.display(), e))
            })?;
            let summary = receive_daily_update(&db, &body)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Worker => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| LedgerError::Config(format!("Failed to start runtime: {}", e)))?;
            runtime.block_on(run_dispatch_worker(db, config.dispatch.queue, Context::new()))?;
        }
        Commands::Balance { account_key, team } => {
            let now = Utc::now();
            let balance = account_balance_by_key(&db, &account_key, team, now)?;
            let closing = account_key_closing(&db, &account_key, team, now)?;
            println!("{}", serde_json::to_string_pretty(&balance)?);
            println!("closing ({}): {}", account_key, closing);
        }
    }
    Ok(())
}
