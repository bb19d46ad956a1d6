use crate::analyzer::format_currency;
use crate::config::BacktestConfig;
use crate::context::{AppContext, MarketDataFilters};
use crate::engine::{BacktestEngine, BacktestResult};
use crate::error::EngineError;
use crate::strategy::create_strategy;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct BacktestArgs {
    pub strategy: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub parameters: Vec<(String, f64)>,
    pub symbols: Vec<String>,
    pub name: Option<String>,
    pub initial_capital: Option<f64>,
    pub position_size_pct: Option<f64>,
    pub max_positions: Option<usize>,
    pub frictionless: bool,
    /// Run against a market data snapshot instead of the database.
    pub data_file: Option<PathBuf>,
    pub show_trades: bool,
}

/// Parse a `key=value` strategy parameter.
pub fn parse_parameter(raw: &str) -> Result<(String, f64)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Parameter must be key=value (value: {})", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Parameter name is empty (value: {})", raw));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Parameter {} must be numeric (value: {})", key, value.trim()))?;
    if !value.is_finite() {
        return Err(anyhow!("Parameter {} must be finite", key));
    }
    Ok((key.to_string(), value))
}

pub fn build_config(app: &AppContext, args: &BacktestArgs) -> BacktestConfig {
    let mut config = BacktestConfig::from_settings(app.settings(), args.start_date, args.end_date);
    if let Some(capital) = args.initial_capital {
        config.initial_capital = capital;
    }
    if let Some(pct) = args.position_size_pct {
        config.position_size_pct = pct;
    }
    if let Some(max_positions) = args.max_positions {
        config.max_positions = max_positions;
    }
    config.name = args.name.clone();
    if args.frictionless {
        config = config.frictionless();
    }
    config
}

pub fn run(app: &AppContext, args: &BacktestArgs) -> Result<()> {
    let parameters: HashMap<String, f64> = args.parameters.iter().cloned().collect();
    let mut strategy = create_strategy(&args.strategy, parameters)?;
    let mut config = build_config(app, args);
    config.validate()?;

    let filters = MarketDataFilters {
        start_date: Some(args.start_date),
        end_date: Some(args.end_date),
    };
    let mut store = app.store(args.data_file.as_deref(), filters)?;

    if !args.symbols.is_empty() {
        let mut ids = Vec::with_capacity(args.symbols.len());
        for symbol in &args.symbols {
            let instrument = store
                .get_instrument_by_symbol(symbol)?
                .ok_or_else(|| EngineError::InstrumentNotFound(symbol.clone()))?;
            ids.push(instrument.id);
        }
        config.instrument_ids = Some(ids);
    }

    let result = BacktestEngine::new(store.as_mut()).run(strategy.as_mut(), &config)?;
    if args.data_file.is_some() {
        info!("Run {} was recorded in memory only", result.run_id);
    }
    print_result(&result, args.show_trades);
    Ok(())
}

fn optional_ratio(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "n/a".to_string())
}

fn print_result(result: &BacktestResult, show_trades: bool) {
    let metrics = &result.metrics;
    let config = &result.config;
    println!(
        "Backtest {} ({}): {} to {}",
        result.run_id, result.strategy_name, config.start_date, config.end_date
    );
    if let Some(name) = &config.name {
        println!("Name:             {}", name);
    }
    println!("Initial Capital:  {:>16}", format_currency(result.initial_capital));
    println!("Final Capital:    {:>16}", format_currency(result.final_capital));
    println!("Total Return:     {:>15.2}%", metrics.total_return * 100.0);
    println!("Annualized:       {:>15.2}%", metrics.annualized_return * 100.0);
    println!("Sharpe:           {:>16}", optional_ratio(metrics.sharpe_ratio));
    println!("Sortino:          {:>16}", optional_ratio(metrics.sortino_ratio));
    println!("Max Drawdown:     {:>15.2}%", metrics.max_drawdown * 100.0);
    println!("DD Duration:      {:>13} days", metrics.max_drawdown_duration);
    println!("Trades:           {:>16}", metrics.total_trades);
    println!("Win Rate:         {:>15.2}%", metrics.win_rate * 100.0);
    println!("Profit Factor:    {:>16}", optional_ratio(metrics.profit_factor));
    println!("Exposure:         {:>15.2}%", metrics.exposure_time * 100.0);
    println!("Trading Days:     {:>16}", metrics.trading_days);
    for (reason, count) in &result.skipped_entries {
        println!("Skipped entries ({}): {}", reason, count);
    }

    if !show_trades || result.trades.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<8} {:<10} {:>10} {:<10} {:>10} {:>8} {:>14} {:>8}  {}",
        "Symbol", "Entry", "Price", "Exit", "Price", "Qty", "P&L", "P&L %", "Reason"
    );
    for trade in &result.trades {
        println!(
            "{:<8} {:<10} {:>10.2} {:<10} {:>10.2} {:>8} {:>14} {:>7.2}%  {}",
            trade.symbol,
            trade.entry_date,
            trade.entry_price,
            trade.exit_date,
            trade.exit_price,
            trade.quantity,
            format_currency(trade.pnl),
            trade.pnl_percent * 100.0,
            trade.exit_reason.as_deref().unwrap_or("")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppSettings;

    #[test]
    fn parses_key_value_parameters() {
        assert_eq!(
            parse_parameter("lookback_days = 20").unwrap(),
            ("lookback_days".to_string(), 20.0)
        );
        assert!(parse_parameter("lookback_days").is_err());
        assert!(parse_parameter("=3").is_err());
        assert!(parse_parameter("stop_loss_pct=abc").is_err());
        assert!(parse_parameter("stop_loss_pct=inf").is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_settings() {
        let app = AppContext::initialize(AppSettings::default());
        let args = BacktestArgs {
            strategy: "buy_and_hold".to_string(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 28).unwrap(),
            parameters: Vec::new(),
            symbols: Vec::new(),
            name: Some("q1".to_string()),
            initial_capital: Some(25_000.0),
            position_size_pct: None,
            max_positions: Some(3),
            frictionless: true,
            data_file: None,
            show_trades: false,
        };
        let config = build_config(&app, &args);
        assert_eq!(config.initial_capital, 25_000.0);
        assert_eq!(config.max_positions, 3);
        assert_eq!(config.commission_pct, 0.0);
        assert_eq!(config.slippage_pct, 0.0);
        assert_eq!(config.name.as_deref(), Some("q1"));
        assert!(config.validate().is_ok());
    }
}
