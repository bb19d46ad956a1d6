use crate::config::{BacktestConfig, FillCosts};
use crate::data_context::trading_calendar;
use crate::error::EngineError;
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::store::TradingStore;
use crate::strategy::Strategy;
use crate::trading_rules::{
    closed_trade_pnl, sell_fill, size_for_notional, PositionSizingOutcome,
};
use anyhow::Result;
use chrono::NaiveDate;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;

pub const BACKTEST_END_REASON: &str = "backtest_end";
const STRATEGY_EXIT_REASON: &str = "strategy_exit";

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub run_id: i64,
    pub strategy_name: String,
    pub config: BacktestConfig,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: BacktestMetrics,
    /// Buy signals that were not acted on, by reason.
    pub skipped_entries: BTreeMap<&'static str, usize>,
}

#[derive(Debug, PartialEq)]
enum EntrySignalOutcome {
    Executed,
    Skipped { reason: &'static str },
}

#[derive(Debug, PartialEq)]
enum SellSignalOutcome {
    Executed,
    NoPosition,
}

/// Mutable state of one replay: cash, open positions and what has been
/// recorded so far.
struct Simulation {
    costs: FillCosts,
    initial_capital: f64,
    position_size_pct: f64,
    max_positions: usize,
    cash: f64,
    positions: BTreeMap<i64, Position>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    days_with_positions: usize,
    skipped_entries: BTreeMap<&'static str, usize>,
}

impl Simulation {
    fn new(config: &BacktestConfig) -> Self {
        Self {
            costs: config.fill_costs(),
            initial_capital: config.initial_capital,
            position_size_pct: config.position_size_pct,
            max_positions: config.max_positions,
            cash: config.initial_capital,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            days_with_positions: 0,
            skipped_entries: BTreeMap::new(),
        }
    }

    fn position_info(&self, instrument_id: i64, close: f64) -> Option<PositionInfo> {
        self.positions.get(&instrument_id).map(|position| PositionInfo {
            quantity: position.quantity,
            entry_price: position.entry_price,
            entry_date: position.entry_date,
            unrealized_pnl: (close - position.entry_price) * position.quantity as f64,
        })
    }

    /// Sells first so closed positions free cash and slots for the day's buys.
    fn apply_signals(&mut self, date: NaiveDate, signals: Vec<StrategySignal>) {
        let (sells, buys): (Vec<_>, Vec<_>) = signals
            .into_iter()
            .partition(|signal| signal.action == SignalAction::Sell);

        for signal in sells {
            if self.apply_sell(&signal, date) == SellSignalOutcome::NoPosition {
                debug!(
                    "Ignoring sell for {} on {}: no open position",
                    signal.symbol, date
                );
            }
        }

        for signal in buys {
            if let EntrySignalOutcome::Skipped { reason } = self.apply_buy(&signal, date) {
                debug!("Skipping buy for {} on {}: {}", signal.symbol, date, reason);
                *self.skipped_entries.entry(reason).or_insert(0) += 1;
            }
        }
    }

    fn apply_sell(&mut self, signal: &StrategySignal, date: NaiveDate) -> SellSignalOutcome {
        let Some(position) = self.positions.remove(&signal.instrument_id) else {
            return SellSignalOutcome::NoPosition;
        };
        let reason = signal
            .reason
            .clone()
            .unwrap_or_else(|| STRATEGY_EXIT_REASON.to_string());
        self.close_position(position, signal.price, date, reason);
        SellSignalOutcome::Executed
    }

    fn apply_buy(&mut self, signal: &StrategySignal, date: NaiveDate) -> EntrySignalOutcome {
        if self.positions.contains_key(&signal.instrument_id) {
            return EntrySignalOutcome::Skipped {
                reason: "position_open",
            };
        }
        if self.positions.len() >= self.max_positions {
            return EntrySignalOutcome::Skipped {
                reason: "max_positions",
            };
        }

        let target_value = (self.initial_capital * self.position_size_pct).min(self.cash);
        if target_value <= 0.0 {
            return EntrySignalOutcome::Skipped {
                reason: "insufficient_cash",
            };
        }

        match size_for_notional(signal.price, target_value, self.cash, &self.costs) {
            PositionSizingOutcome::Sized(fill) => {
                self.cash -= fill.total_cost;
                self.positions.insert(
                    signal.instrument_id,
                    Position {
                        instrument_id: signal.instrument_id,
                        symbol: signal.symbol.clone(),
                        quantity: fill.quantity,
                        entry_price: fill.execution_price,
                        entry_date: date,
                        entry_value: fill.total_cost,
                    },
                );
                EntrySignalOutcome::Executed
            }
            PositionSizingOutcome::TooSmall => EntrySignalOutcome::Skipped {
                reason: "position_too_small",
            },
            PositionSizingOutcome::InsufficientCash { .. } => EntrySignalOutcome::Skipped {
                reason: "insufficient_cash",
            },
        }
    }

    fn close_position(&mut self, position: Position, price: f64, date: NaiveDate, reason: String) {
        let exit = sell_fill(price, position.quantity, &self.costs);
        let pnl = closed_trade_pnl(&position, &exit);
        self.cash += exit.net_proceeds;
        self.trades.push(Trade {
            instrument_id: position.instrument_id,
            symbol: position.symbol,
            entry_date: position.entry_date,
            entry_price: position.entry_price,
            exit_date: date,
            exit_price: exit.execution_price,
            quantity: position.quantity,
            side: OrderSide::Buy,
            pnl: pnl.pnl,
            pnl_percent: pnl.pnl_percent,
            exit_reason: Some(reason),
            commission: pnl.commission,
        });
    }

    /// Cash plus open positions at the day's close. Positions without a bar
    /// on `date` are not marked.
    fn mark_to_market(&mut self, date: NaiveDate, bars: &BTreeMap<i64, Vec<PriceBar>>) {
        let positions_value: f64 = self
            .positions
            .iter()
            .filter_map(|(instrument_id, position)| {
                bar_on(bars.get(instrument_id)?, date)
                    .map(|bar| bar.close * position.quantity as f64)
            })
            .sum();
        self.equity_curve.push(EquityPoint {
            date,
            value: self.cash + positions_value,
        });
        if !self.positions.is_empty() {
            self.days_with_positions += 1;
        }
    }

    fn force_close_all(&mut self, end_date: NaiveDate, bars: &BTreeMap<i64, Vec<PriceBar>>) {
        let open: Vec<Position> = std::mem::take(&mut self.positions).into_values().collect();
        for position in open {
            let last_close = bars.get(&position.instrument_id).and_then(|series| {
                series
                    .iter()
                    .rev()
                    .find(|bar| bar.date <= end_date)
                    .map(|bar| bar.close)
            });
            match last_close {
                Some(close) => {
                    self.close_position(position, close, end_date, BACKTEST_END_REASON.to_string())
                }
                None => warn!(
                    "No closing price for {} on or before {}; position left unclosed",
                    position.symbol, end_date
                ),
            }
        }
    }
}

fn bar_index(series: &[PriceBar], date: NaiveDate) -> Option<usize> {
    series.binary_search_by_key(&date, |bar| bar.date).ok()
}

fn bar_on(series: &[PriceBar], date: NaiveDate) -> Option<&PriceBar> {
    bar_index(series, date).map(|index| &series[index])
}

/// Replays daily bars against a strategy and records the run in the store.
pub struct BacktestEngine<'a, S: TradingStore + ?Sized> {
    store: &'a mut S,
}

impl<'a, S: TradingStore + ?Sized> BacktestEngine<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    pub fn run(
        &mut self,
        strategy: &mut dyn Strategy,
        config: &BacktestConfig,
    ) -> Result<BacktestResult> {
        config.validate()?;
        info!(
            "Starting backtest of {} from {} to {} with {:.2} capital",
            strategy.name(),
            config.start_date,
            config.end_date,
            config.initial_capital
        );

        let parameters = strategy.get_parameters();
        let description = strategy.description();
        let strategy_id = self.store.get_or_create_strategy(
            strategy.name(),
            Some(description.as_str()),
            strategy.version(),
            &parameters,
        )?;
        let run_id = self.store.create_backtest_run(&NewBacktestRun {
            strategy_id,
            name: config.name.clone(),
            start_date: config.start_date,
            end_date: config.end_date,
            initial_capital: config.initial_capital,
            parameters,
        })?;

        let outcome = self
            .simulate(strategy, config, run_id)
            .and_then(|result| self.persist(&result).map(|_| result));

        match outcome {
            Ok(result) => {
                info!(
                    "Backtest run {} completed: return {:.2}%, {} trades, win rate {:.2}%",
                    run_id,
                    result.metrics.total_return * 100.0,
                    result.metrics.total_trades,
                    result.metrics.win_rate * 100.0
                );
                Ok(result)
            }
            Err(err) => {
                error!("Backtest run {} failed: {}", run_id, err);
                if let Err(mark_err) = self.store.complete_backtest_run(
                    run_id,
                    config.initial_capital,
                    RunStatus::Failed,
                    Some(&err.to_string()),
                ) {
                    warn!(
                        "Failed to record failure status for backtest run {}: {}",
                        run_id, mark_err
                    );
                }
                Err(err)
            }
        }
    }

    fn simulate(
        &mut self,
        strategy: &mut dyn Strategy,
        config: &BacktestConfig,
        run_id: i64,
    ) -> Result<BacktestResult> {
        let instruments = match &config.instrument_ids {
            Some(ids) => {
                let mut resolved = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.store.get_instrument(*id)? {
                        Some(instrument) => resolved.push(instrument),
                        None => warn!("Instrument {} not found; excluded from backtest", id),
                    }
                }
                resolved
            }
            None => self.store.get_active_instruments()?,
        };
        let symbols: BTreeMap<i64, String> = instruments
            .iter()
            .map(|instrument| (instrument.id, instrument.symbol.clone()))
            .collect();
        let ids: Vec<i64> = symbols.keys().copied().collect();

        info!(
            "Loading price data for {} instruments ({} - {})",
            ids.len(),
            config.start_date,
            config.end_date
        );
        let bars = self
            .store
            .get_price_history_range(&ids, config.start_date, config.end_date)?;
        let calendar = trading_calendar(&bars);
        if calendar.is_empty() {
            return Err(EngineError::NoTradingDays {
                start: config.start_date,
                end: config.end_date,
            }
            .into());
        }
        info!("Simulating {} trading days", calendar.len());

        let mut sim = Simulation::new(config);
        strategy.on_start(config.start_date, config.end_date);

        for date in &calendar {
            let mut signals = Vec::new();
            for (instrument_id, series) in &bars {
                let Some(index) = bar_index(series, *date) else {
                    continue;
                };
                let bar = &series[index];
                let position = sim.position_info(*instrument_id, bar.close);
                let symbol = symbols
                    .get(instrument_id)
                    .map(String::as_str)
                    .unwrap_or_default();
                if let Some(signal) = strategy.on_bar(
                    *instrument_id,
                    symbol,
                    bar,
                    &series[..index],
                    position.as_ref(),
                ) {
                    signals.push(signal);
                }
            }
            sim.apply_signals(*date, signals);
            sim.mark_to_market(*date, &bars);
        }

        sim.force_close_all(config.end_date, &bars);
        strategy.on_end();

        let final_capital = sim.cash;
        let metrics = PerformanceCalculator::calculate_metrics(
            &sim.trades,
            &sim.equity_curve,
            config.initial_capital,
            final_capital,
            sim.days_with_positions,
        );

        Ok(BacktestResult {
            run_id,
            strategy_name: strategy.name().to_string(),
            config: config.clone(),
            initial_capital: config.initial_capital,
            final_capital,
            trades: sim.trades,
            equity_curve: sim.equity_curve,
            metrics,
            skipped_entries: sim.skipped_entries,
        })
    }

    fn persist(&mut self, result: &BacktestResult) -> Result<()> {
        self.store.complete_backtest_run(
            result.run_id,
            result.final_capital,
            RunStatus::Completed,
            None,
        )?;
        if !result.trades.is_empty() {
            self.store
                .insert_backtest_trades(result.run_id, &result.trades)?;
        }
        self.store
            .insert_backtest_metrics(result.run_id, &result.metrics)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use serde_json::Value;

    /// Emits scripted signals keyed by the bar's offset from the first bar.
    struct MockStrategy {
        buys: Vec<(i64, i64)>,
        sells: Vec<(i64, i64)>,
        start: NaiveDate,
    }

    impl Strategy for MockStrategy {
        fn name(&self) -> &str {
            "Mock"
        }

        fn description(&self) -> String {
            "scripted".to_string()
        }

        fn on_bar(
            &mut self,
            instrument_id: i64,
            symbol: &str,
            bar: &PriceBar,
            _history: &[PriceBar],
            _position: Option<&PositionInfo>,
        ) -> Option<StrategySignal> {
            let offset = (bar.date - self.start).num_days();
            if self.sells.contains(&(instrument_id, offset)) {
                return Some(StrategySignal::sell(instrument_id, symbol, bar.close, "exit"));
            }
            if self.buys.contains(&(instrument_id, offset)) {
                return Some(StrategySignal::buy(instrument_id, symbol, bar.close, "entry"));
            }
            None
        }

        fn get_parameters(&self) -> BTreeMap<String, Value> {
            BTreeMap::new()
        }
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn bar(instrument_id: i64, offset: i64, close: f64) -> PriceBar {
        PriceBar {
            instrument_id,
            date: start() + Duration::days(offset),
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close,
            volume: 1_000,
            adjusted_close: None,
        }
    }

    fn config(days: i64) -> BacktestConfig {
        BacktestConfig::new(start(), start() + Duration::days(days)).frictionless()
    }

    #[test]
    fn sells_are_applied_before_buys_on_the_same_day() {
        let mut store = MemoryStore::new();
        let a = store.add_instrument("AAA", None);
        let b = store.add_instrument("BBB", None);
        store.add_bars((0..3).flat_map(|d| [bar(a, d, 10.0), bar(b, d, 20.0)]));

        let mut strategy = MockStrategy {
            buys: vec![(a, 0), (b, 1)],
            sells: vec![(a, 1)],
            start: start(),
        };
        let mut cfg = config(2);
        cfg.max_positions = 1;

        let result = BacktestEngine::new(&mut store)
            .run(&mut strategy, &cfg)
            .unwrap();
        assert!(result.skipped_entries.is_empty());
        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[0].instrument_id, a);
        assert_eq!(result.trades[1].instrument_id, b);
        assert_eq!(result.trades[1].exit_reason.as_deref(), Some(BACKTEST_END_REASON));
    }

    #[test]
    fn buy_rejected_when_slots_are_full() {
        let mut store = MemoryStore::new();
        let a = store.add_instrument("AAA", None);
        let b = store.add_instrument("BBB", None);
        store.add_bars((0..2).flat_map(|d| [bar(a, d, 10.0), bar(b, d, 20.0)]));

        let mut strategy = MockStrategy {
            buys: vec![(a, 0), (b, 0), (a, 1)],
            sells: vec![],
            start: start(),
        };
        let mut cfg = config(1);
        cfg.max_positions = 1;

        let result = BacktestEngine::new(&mut store)
            .run(&mut strategy, &cfg)
            .unwrap();
        assert_eq!(result.skipped_entries.get("max_positions"), Some(&1));
        assert_eq!(result.skipped_entries.get("position_open"), Some(&1));
        assert_eq!(result.trades.len(), 1);
    }

    #[test]
    fn gaps_in_series_follow_the_union_calendar() {
        let mut store = MemoryStore::new();
        let a = store.add_instrument("AAA", None);
        let b = store.add_instrument("BBB", None);
        store.add_bars([bar(a, 0, 10.0), bar(a, 2, 10.0), bar(b, 1, 5.0), bar(b, 2, 5.0)]);

        let mut strategy = MockStrategy {
            buys: vec![(a, 0)],
            sells: vec![],
            start: start(),
        };
        let result = BacktestEngine::new(&mut store)
            .run(&mut strategy, &config(5))
            .unwrap();
        assert_eq!(result.equity_curve.len(), 3);
        // Day 1 has no AAA bar, so the open position is not marked.
        assert!((result.equity_curve[1].value - 90_000.0).abs() < 1e-9);
        assert!((result.equity_curve[2].value - 100_000.0).abs() < 1e-9);
        assert_eq!(result.trades[0].exit_date, start() + Duration::days(5));
    }

    #[test]
    fn empty_range_fails_and_marks_run_failed() {
        let mut store = MemoryStore::new();
        store.add_instrument("AAA", None);
        let mut strategy = MockStrategy {
            buys: vec![],
            sells: vec![],
            start: start(),
        };
        let err = BacktestEngine::new(&mut store)
            .run(&mut strategy, &config(3))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NoTradingDays { .. })
        ));

        let run = store.backtest_runs().next().expect("run recorded");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.final_capital, Some(100_000.0));
        assert!(run.error_message.as_deref().unwrap_or_default().contains("No trading days"));
    }

    #[test]
    fn invalid_config_is_rejected_before_recording_a_run() {
        let mut store = MemoryStore::new();
        let mut strategy = MockStrategy {
            buys: vec![],
            sells: vec![],
            start: start(),
        };
        let mut cfg = config(3);
        cfg.initial_capital = 0.0;
        assert!(BacktestEngine::new(&mut store)
            .run(&mut strategy, &cfg)
            .is_err());
        assert_eq!(store.backtest_runs().count(), 0);
    }
}
