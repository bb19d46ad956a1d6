use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use tradesim::{
    commands::{account, backtest, execute, export_market_data, order, report, risk, snapshot},
    config::AppSettings,
    context::AppContext,
    models::parse_date,
};

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";
const DEFAULT_ACCOUNT_BALANCE: f64 = 100_000.0;

#[derive(Parser)]
#[command(name = "tradesim")]
#[command(about = "Daily-bar backtesting and paper trading simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a strategy over historical daily bars
    Backtest {
        /// Strategy name (breakout, mean_reversion, buy_and_hold)
        strategy: String,
        /// First trading day (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        start: NaiveDate,
        /// Last trading day (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        end: NaiveDate,
        /// Strategy parameter override, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = backtest::parse_parameter)]
        params: Vec<(String, f64)>,
        /// Restrict the run to these symbols
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Optional run name
        #[arg(long)]
        name: Option<String>,
        /// Starting capital
        #[arg(long)]
        capital: Option<f64>,
        /// Fraction of equity per new position
        #[arg(long)]
        position_size: Option<f64>,
        /// Maximum simultaneous positions
        #[arg(long)]
        max_positions: Option<usize>,
        /// Ignore commission and slippage
        #[arg(long)]
        frictionless: bool,
        /// Run against a market data snapshot instead of the database
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Print every closed trade
        #[arg(long)]
        trades: bool,
    },
    /// Export a market data snapshot for offline backtests
    ExportMarketData {
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        #[arg(long, value_parser = parse_date)]
        start: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date)]
        end: Option<NaiveDate>,
    },
    /// Manage paper trading accounts
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Submit, cancel and list paper orders
    Order {
        #[command(subcommand)]
        command: OrderCommand,
    },
    /// Fill pending orders at the day's close
    Execute {
        /// Execution date (defaults to today)
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        /// Only execute orders for this account (id or name)
        #[arg(long)]
        account: Option<String>,
        /// Apply configured commission and slippage to market orders
        #[arg(long)]
        with_costs: bool,
    },
    /// Record portfolio snapshots
    Snapshot {
        /// Account id or name (defaults to every account)
        #[arg(long)]
        account: Option<String>,
        /// Snapshot date (defaults to today)
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// Portfolio performance report
    Report {
        /// Account id or name
        account: String,
        /// Also print the equity curve for the last N days (0 for the default window)
        #[arg(long, value_name = "DAYS")]
        curve: Option<usize>,
    },
    /// Risk report with an optional pre-trade check
    Risk {
        /// Account id or name
        account: String,
        /// Symbol of a proposed order to check
        #[arg(long, requires_all = ["check_side", "check_quantity", "check_price"])]
        check_symbol: Option<String>,
        #[arg(long)]
        check_side: Option<String>,
        #[arg(long)]
        check_quantity: Option<i64>,
        #[arg(long)]
        check_price: Option<f64>,
    },
}

#[derive(Subcommand)]
enum AccountCommand {
    /// Create a paper trading account
    Create {
        name: String,
        /// Starting cash balance
        #[arg(long, default_value_t = DEFAULT_ACCOUNT_BALANCE)]
        balance: f64,
    },
    /// List accounts
    List,
    /// Show balances and open positions
    Show {
        /// Account id or name
        account: String,
    },
}

#[derive(Subcommand)]
enum OrderCommand {
    /// Queue an order for end-of-day execution
    Submit {
        /// Account id or name
        #[arg(long)]
        account: String,
        symbol: String,
        /// buy or sell
        side: String,
        quantity: i64,
        /// market or limit
        #[arg(long = "type", default_value = "market")]
        order_type: String,
        #[arg(long)]
        limit: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
        /// Run the pre-trade risk check first
        #[arg(long)]
        risk_check: bool,
    },
    /// Cancel a pending order
    Cancel { order_id: i64 },
    /// List orders, newest first
    List {
        /// Account id or name
        #[arg(long)]
        account: String,
        /// pending, filled, partial, cancelled or rejected
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = AppSettings::from_env()?;
    if settings.database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!(
            "DATABASE_URL must be set for this command. For offline backtests, use --data-file with a market data snapshot."
        ));
    }
    let app_context = AppContext::initialize(settings);

    info!("Starting tradesim. Simulated trading only; no orders reach a broker.");

    match command {
        Commands::Backtest {
            strategy,
            start,
            end,
            params,
            symbols,
            name,
            capital,
            position_size,
            max_positions,
            frictionless,
            data_file,
            trades,
        } => {
            let args = backtest::BacktestArgs {
                strategy,
                start_date: start,
                end_date: end,
                parameters: params,
                symbols,
                name,
                initial_capital: capital,
                position_size_pct: position_size,
                max_positions,
                frictionless,
                data_file,
                show_trades: trades,
            };
            backtest::run(&app_context, &args)?;
        }
        Commands::ExportMarketData { output, start, end } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
            export_market_data::run(&app_context, &output_path, start, end)?;
        }
        Commands::Account { command } => match command {
            AccountCommand::Create { name, balance } => {
                account::create(&app_context, &name, balance)?;
            }
            AccountCommand::List => account::list(&app_context)?,
            AccountCommand::Show { account: reference } => {
                account::show(&app_context, &reference)?;
            }
        },
        Commands::Order { command } => match command {
            OrderCommand::Submit {
                account,
                symbol,
                side,
                quantity,
                order_type,
                limit,
                notes,
                risk_check,
            } => {
                let args = order::SubmitArgs {
                    account,
                    symbol,
                    side,
                    order_type,
                    quantity,
                    limit_price: limit,
                    notes,
                    risk_check,
                };
                order::submit(&app_context, &args)?;
            }
            OrderCommand::Cancel { order_id } => order::cancel(&app_context, order_id)?,
            OrderCommand::List {
                account,
                status,
                limit,
            } => {
                order::list(&app_context, &account, status.as_deref(), limit)?;
            }
        },
        Commands::Execute {
            date,
            account,
            with_costs,
        } => {
            execute::run(&app_context, date, account.as_deref(), with_costs)?;
        }
        Commands::Snapshot { account, date } => {
            snapshot::run(&app_context, account.as_deref(), date)?;
        }
        Commands::Report { account, curve } => {
            report::run(&app_context, &account, curve)?;
        }
        Commands::Risk {
            account,
            check_symbol,
            check_side,
            check_quantity,
            check_price,
        } => {
            let proposed = match (check_symbol, check_side, check_quantity, check_price) {
                (Some(symbol), Some(side), Some(quantity), Some(price)) => Some(risk::ProposedOrder {
                    symbol,
                    side,
                    quantity,
                    price,
                }),
                _ => None,
            };
            risk::run(&app_context, &account, proposed.as_ref())?;
        }
    }

    Ok(())
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::Backtest { data_file, .. } => data_file.is_none(),
        Commands::ExportMarketData { .. }
        | Commands::Account { .. }
        | Commands::Order { .. }
        | Commands::Execute { .. }
        | Commands::Snapshot { .. }
        | Commands::Report { .. }
        | Commands::Risk { .. } => true,
    }
}
