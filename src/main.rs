use analytics::PortfolioValuator;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use configuration::{load_config_from, Config, LoggingSettings};
use core_types::{OrderRequest, OrderSide, OrderStatus, OrderType};
use database::{connect, run_migrations, DbRepository, Repository};
use executor::{ExecutionEngine, ExecutorError};
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

mod demo;

/// The main entry point for the brokerage order execution service.
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse command-line arguments
    let cli = Cli::parse();

    let config = load_config_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let _log_guard = init_tracing(&config.logging)?;

    // Execute the appropriate command
    match cli.command {
        Commands::Migrate => {
            if cli.memory {
                bail!("migrate needs a database; drop --memory");
            }
            let pool = connect(&config.database).await?;
            run_migrations(&pool).await?;
            tracing::info!("Migrations applied.");
            Ok(())
        }
        command => {
            let repo = open_repository(&config, cli.memory).await?;
            let output = handle_command(command, repo, &config).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Order execution and position ledger for brokerage accounts.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Run against a seeded in-memory market instead of the database.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the database migrations, including the seed catalog.
    Migrate,
    /// Place an order and print it as persisted.
    PlaceOrder(PlaceOrderArgs),
    /// Cancel a pending order.
    CancelOrder {
        #[arg(long)]
        order_id: Uuid,
        #[arg(long)]
        account: i64,
    },
    /// List an account's orders, most recent first.
    Orders {
        #[arg(long)]
        account: i64,
        /// Only orders in this status (NEW lists oldest first).
        #[arg(long)]
        status: Option<OrderStatus>,
    },
    /// List an account's raw ledger rows.
    Positions {
        #[arg(long)]
        account: i64,
    },
    /// Value an account's holdings at the latest quotes.
    Portfolio {
        #[arg(long)]
        account: i64,
        /// Print totals and a position count instead of every position.
        #[arg(long)]
        summary: bool,
    },
    /// Value a single holding.
    Position {
        #[arg(long)]
        account: i64,
        #[arg(long)]
        instrument: i64,
    },
    /// Fill every pending limit order whose price has been reached.
    SweepLimits,
    /// Write current valuations into the cached position columns.
    RefreshValuations {
        #[arg(long)]
        account: i64,
    },
}

#[derive(Parser)]
struct PlaceOrderArgs {
    #[arg(long)]
    account: i64,

    #[arg(long)]
    instrument: i64,

    /// BUY, SELL, CASH_IN or CASH_OUT.
    #[arg(long)]
    side: OrderSide,

    /// MARKET or LIMIT.
    #[arg(long = "type", default_value = "MARKET")]
    order_type: OrderType,

    /// Number of shares (or currency units for cash moves).
    #[arg(long)]
    size: Option<i64>,

    /// Amount of cash to spend; converted to whole shares.
    #[arg(long)]
    amount: Option<Decimal>,

    /// Limit price.
    #[arg(long)]
    price: Option<Decimal>,
}

impl From<PlaceOrderArgs> for OrderRequest {
    fn from(args: PlaceOrderArgs) -> Self {
        Self {
            account_id: args.account,
            instrument_id: args.instrument,
            side: args.side,
            order_type: args.order_type,
            size: args.size,
            amount: args.amount,
            price: args.price,
        }
    }
}

// ==============================================================================
// Wiring
// ==============================================================================

/// Logs go to stderr, and additionally to a daily file when a directory is
/// configured. `RUST_LOG` overrides the configured level.
fn init_tracing(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level))
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "brokerage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

async fn open_repository(config: &Config, memory: bool) -> Result<Arc<dyn Repository>> {
    if memory {
        tracing::info!("Using the in-memory demo market.");
        let repo = demo::seeded_repository(config.ledger.cash_instrument_id).await;
        return Ok(Arc::new(repo));
    }
    let pool = connect(&config.database).await?;
    Ok(Arc::new(DbRepository::new(pool)))
}

/// Prefixes an engine error with the HTTP status it maps to.
fn describe(error: ExecutorError) -> anyhow::Error {
    anyhow::anyhow!("[{}] {}", error.http_status(), error)
}

async fn handle_command(
    command: Commands,
    repo: Arc<dyn Repository>,
    config: &Config,
) -> Result<Value> {
    let engine = ExecutionEngine::new(repo.clone(), config.ledger.clone());
    let valuator = PortfolioValuator::new(repo, config.ledger.cash_instrument_id);

    let output = match command {
        Commands::Migrate => bail!("migrate is handled before a repository is opened"),
        Commands::PlaceOrder(args) => {
            let order = engine.create_order(args.into()).await.map_err(describe)?;
            serde_json::to_value(order)?
        }
        Commands::CancelOrder { order_id, account } => {
            let order = engine.cancel_order(order_id, account).await.map_err(describe)?;
            serde_json::to_value(order)?
        }
        Commands::Orders { account, status } => {
            serde_json::to_value(engine.list_orders(account, status).await.map_err(describe)?)?
        }
        Commands::Positions { account } => {
            serde_json::to_value(engine.list_positions(account).await.map_err(describe)?)?
        }
        Commands::Portfolio { account, summary } => {
            if summary {
                serde_json::to_value(valuator.summarize(account).await?)?
            } else {
                serde_json::to_value(valuator.valuate(account).await?)?
            }
        }
        Commands::Position {
            account,
            instrument,
        } => serde_json::to_value(valuator.position_details(account, instrument).await?)?,
        Commands::SweepLimits => {
            serde_json::to_value(engine.execute_limit_orders().await.map_err(describe)?)?
        }
        Commands::RefreshValuations { account } => {
            let rows = valuator.refresh_valuations(account).await?;
            serde_json::json!({ "account_id": account, "rows_updated": rows })
        }
    };

    Ok(output)
}
