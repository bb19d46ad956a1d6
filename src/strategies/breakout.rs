use crate::models::*;
use crate::param_utils::{get_param_bool, get_param_f64, get_param_usize_at_least};
use crate::strategy::percent_change;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Buys a close that clears the N-day high, exits on a fixed stop, a trailing
/// stop from the highest close since entry, or a time stop.
pub struct BreakoutStrategy {
    lookback_days: usize,
    trailing_stop_pct: f64,
    stop_loss_pct: f64,
    max_holding_days: i64,
    min_breakout_pct: f64,
    require_volume_confirmation: bool,
    volume_multiplier: f64,
    min_price: f64,
    peak_prices: HashMap<i64, f64>,
}

impl BreakoutStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        Self {
            lookback_days: get_param_usize_at_least(&parameters, "lookback_days", 20, 1),
            trailing_stop_pct: get_param_f64(&parameters, "trailing_stop_pct", 5.0),
            stop_loss_pct: get_param_f64(&parameters, "stop_loss_pct", 3.0),
            max_holding_days: get_param_usize_at_least(&parameters, "max_holding_days", 20, 1)
                as i64,
            min_breakout_pct: get_param_f64(&parameters, "min_breakout_pct", 1.0),
            require_volume_confirmation: get_param_bool(
                &parameters,
                "require_volume_confirmation",
                true,
            ),
            volume_multiplier: get_param_f64(&parameters, "volume_multiplier", 1.5),
            min_price: get_param_f64(&parameters, "min_price", 0.5),
            peak_prices: HashMap::new(),
        }
    }

    fn check_entry(
        &mut self,
        instrument_id: i64,
        symbol: &str,
        bar: &PriceBar,
        history: &[PriceBar],
    ) -> Option<StrategySignal> {
        let price = bar.close;
        if price < self.min_price || history.len() < self.lookback_days {
            return None;
        }

        let window = &history[history.len() - self.lookback_days..];
        let prior_high = window
            .iter()
            .map(PriceBar::high_or_close)
            .fold(f64::NEG_INFINITY, f64::max);
        if prior_high <= 0.0 {
            return None;
        }

        let breakout_pct = percent_change(price, prior_high);
        if breakout_pct < self.min_breakout_pct {
            return None;
        }

        if self.require_volume_confirmation {
            if bar.volume <= 0 {
                return None;
            }
            let volumes: Vec<f64> = window
                .iter()
                .filter(|h| h.volume > 0)
                .map(|h| h.volume as f64)
                .collect();
            if volumes.is_empty() {
                return None;
            }
            let avg_volume = volumes.iter().sum::<f64>() / volumes.len() as f64;
            if (bar.volume as f64) < avg_volume * self.volume_multiplier {
                return None;
            }
        }

        self.peak_prices.insert(instrument_id, price);
        Some(
            StrategySignal::buy(
                instrument_id,
                symbol,
                price,
                format!(
                    "Breakout: {:.1}% above {}-day high",
                    breakout_pct, self.lookback_days
                ),
            )
            .with_metadata(json!({
                "breakout_pct": breakout_pct,
                "prior_high": prior_high,
                "entry_price": price,
            })),
        )
    }

    fn check_exit(
        &self,
        instrument_id: i64,
        symbol: &str,
        bar: &PriceBar,
        position: &PositionInfo,
    ) -> Option<StrategySignal> {
        let price = bar.close;
        let pnl_pct = percent_change(price, position.entry_price);

        if pnl_pct <= -self.stop_loss_pct {
            return Some(
                StrategySignal::sell(
                    instrument_id,
                    symbol,
                    price,
                    format!("Stop loss hit: {:.1}%", pnl_pct),
                )
                .with_metadata(json!({"pnl_pct": pnl_pct, "exit_type": "stop_loss"})),
            );
        }

        let peak = self
            .peak_prices
            .get(&instrument_id)
            .copied()
            .unwrap_or(position.entry_price);
        let drawdown_from_peak = if peak > 0.0 {
            ((peak - price) / peak) * 100.0
        } else {
            0.0
        };
        if drawdown_from_peak >= self.trailing_stop_pct {
            return Some(
                StrategySignal::sell(
                    instrument_id,
                    symbol,
                    price,
                    format!("Trailing stop hit: {:.1}% from peak", drawdown_from_peak),
                )
                .with_metadata(json!({
                    "pnl_pct": pnl_pct,
                    "peak_price": peak,
                    "drawdown_pct": drawdown_from_peak,
                    "exit_type": "trailing_stop",
                })),
            );
        }

        let holding_days = (bar.date - position.entry_date).num_days();
        if holding_days >= self.max_holding_days {
            return Some(
                StrategySignal::sell(
                    instrument_id,
                    symbol,
                    price,
                    format!("Time stop: {} days", holding_days),
                )
                .with_metadata(json!({
                    "pnl_pct": pnl_pct,
                    "holding_days": holding_days,
                    "exit_type": "time_stop",
                })),
            );
        }

        None
    }
}

impl crate::strategy::Strategy for BreakoutStrategy {
    fn name(&self) -> &str {
        "Breakout"
    }

    fn description(&self) -> String {
        format!(
            "Buy {}-day breakout, exit with {}% trailing stop",
            self.lookback_days, self.trailing_stop_pct
        )
    }

    fn on_start(&mut self, _start_date: chrono::NaiveDate, _end_date: chrono::NaiveDate) {
        self.peak_prices.clear();
    }

    fn on_bar(
        &mut self,
        instrument_id: i64,
        symbol: &str,
        bar: &PriceBar,
        history: &[PriceBar],
        position: Option<&PositionInfo>,
    ) -> Option<StrategySignal> {
        match position {
            Some(position) => {
                let peak = self.peak_prices.entry(instrument_id).or_insert(bar.close);
                *peak = peak.max(bar.close);
                self.check_exit(instrument_id, symbol, bar, position)
            }
            None => {
                self.peak_prices.remove(&instrument_id);
                self.check_entry(instrument_id, symbol, bar, history)
            }
        }
    }

    fn get_parameters(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("lookback_days".to_string(), json!(self.lookback_days)),
            ("trailing_stop_pct".to_string(), json!(self.trailing_stop_pct)),
            ("stop_loss_pct".to_string(), json!(self.stop_loss_pct)),
            ("max_holding_days".to_string(), json!(self.max_holding_days)),
            ("min_breakout_pct".to_string(), json!(self.min_breakout_pct)),
            (
                "require_volume_confirmation".to_string(),
                json!(self.require_volume_confirmation),
            ),
            ("volume_multiplier".to_string(), json!(self.volume_multiplier)),
            ("min_price".to_string(), json!(self.min_price)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use chrono::{Duration, NaiveDate};

    fn bar(offset: i64, close: f64, volume: i64) -> PriceBar {
        PriceBar {
            instrument_id: 1,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(offset),
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close,
            volume,
            adjusted_close: None,
        }
    }

    fn strategy(require_volume: bool) -> BreakoutStrategy {
        let mut params = HashMap::new();
        params.insert("lookback_days".to_string(), 3.0);
        params.insert(
            "require_volume_confirmation".to_string(),
            if require_volume { 1.0 } else { 0.0 },
        );
        BreakoutStrategy::new(params)
    }

    #[test]
    fn buys_when_close_clears_prior_high() {
        let mut strategy = strategy(false);
        let history: Vec<PriceBar> = (0..3).map(|i| bar(i, 10.0, 1_000)).collect();

        let flat = bar(3, 10.05, 1_000);
        assert!(strategy.on_bar(1, "AAA", &flat, &history, None).is_none());

        let breakout = bar(3, 10.5, 1_000);
        let signal = strategy
            .on_bar(1, "AAA", &breakout, &history, None)
            .expect("breakout signal");
        assert_eq!(signal.action, SignalAction::Buy);
        assert!((signal.price - 10.5).abs() < 1e-9);
    }

    #[test]
    fn volume_confirmation_blocks_quiet_breakouts() {
        let mut strategy = strategy(true);
        let history: Vec<PriceBar> = (0..3).map(|i| bar(i, 10.0, 1_000)).collect();
        assert!(strategy
            .on_bar(1, "AAA", &bar(3, 11.0, 1_200), &history, None)
            .is_none());
        assert!(strategy
            .on_bar(1, "AAA", &bar(3, 11.0, 2_000), &history, None)
            .is_some());
    }

    #[test]
    fn trailing_stop_uses_peak_since_entry() {
        let mut strategy = strategy(false);
        let position = PositionInfo {
            quantity: 10,
            entry_price: 10.0,
            entry_date: bar(0, 10.0, 0).date,
            unrealized_pnl: 0.0,
        };
        assert!(strategy
            .on_bar(1, "AAA", &bar(1, 12.0, 0), &[], Some(&position))
            .is_none());
        let signal = strategy
            .on_bar(1, "AAA", &bar(2, 11.3, 0), &[], Some(&position))
            .expect("trailing stop");
        assert_eq!(signal.metadata["exit_type"], "trailing_stop");
    }

    #[test]
    fn stop_loss_and_time_stop() {
        let mut strategy = strategy(false);
        let position = PositionInfo {
            quantity: 10,
            entry_price: 10.0,
            entry_date: bar(0, 10.0, 0).date,
            unrealized_pnl: 0.0,
        };
        let stop = strategy
            .on_bar(1, "AAA", &bar(1, 9.6, 0), &[], Some(&position))
            .expect("stop loss");
        assert_eq!(stop.metadata["exit_type"], "stop_loss");

        strategy.on_start(position.entry_date, position.entry_date);
        let timed = strategy
            .on_bar(1, "AAA", &bar(20, 10.0, 0), &[], Some(&position))
            .expect("time stop");
        assert_eq!(timed.metadata["exit_type"], "time_stop");
    }
}
