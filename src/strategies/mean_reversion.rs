use crate::models::*;
use crate::param_utils::{get_param_f64, get_param_usize_at_least};
use crate::strategy::percent_change;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

const VOLUME_LOOKBACK: usize = 20;

/// Buys after a run of consecutive lower closes with a minimum total drop and
/// sells on a bounce target, a stop loss, or a time stop.
pub struct MeanReversionStrategy {
    consecutive_down_days: usize,
    target_bounce_pct: f64,
    max_holding_days: i64,
    stop_loss_pct: f64,
    min_drop_pct: f64,
    min_price: f64,
    min_volume: f64,
}

impl MeanReversionStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        Self {
            consecutive_down_days: get_param_usize_at_least(
                &parameters,
                "consecutive_down_days",
                3,
                1,
            ),
            target_bounce_pct: get_param_f64(&parameters, "target_bounce_pct", 2.0),
            max_holding_days: get_param_usize_at_least(&parameters, "max_holding_days", 10, 1)
                as i64,
            stop_loss_pct: get_param_f64(&parameters, "stop_loss_pct", 5.0),
            min_drop_pct: get_param_f64(&parameters, "min_drop_pct", 3.0),
            min_price: get_param_f64(&parameters, "min_price", 0.10),
            min_volume: get_param_f64(&parameters, "min_volume", 100_000.0),
        }
    }

    fn check_entry(
        &self,
        instrument_id: i64,
        symbol: &str,
        bar: &PriceBar,
        history: &[PriceBar],
    ) -> Option<StrategySignal> {
        let price = bar.close;
        if price < self.min_price || history.len() < self.consecutive_down_days + 1 {
            return None;
        }

        if self.min_volume > 0.0 {
            let volumes: Vec<f64> = history
                .iter()
                .rev()
                .take(VOLUME_LOOKBACK)
                .filter(|h| h.volume > 0)
                .map(|h| h.volume as f64)
                .collect();
            if !volumes.is_empty() {
                let avg_volume = volumes.iter().sum::<f64>() / volumes.len() as f64;
                if avg_volume < self.min_volume {
                    return None;
                }
            }
        }

        // Newest first: today's close, then the prior N closes.
        let closes: Vec<f64> = std::iter::once(price)
            .chain(
                history
                    .iter()
                    .rev()
                    .take(self.consecutive_down_days)
                    .map(|h| h.close),
            )
            .collect();
        let down_days = closes
            .windows(2)
            .take_while(|pair| pair[0] < pair[1])
            .count();
        if down_days < self.consecutive_down_days {
            return None;
        }

        let start_price = history[history.len() - self.consecutive_down_days].close;
        if start_price <= 0.0 {
            return None;
        }
        let total_drop_pct = ((start_price - price) / start_price) * 100.0;
        if total_drop_pct < self.min_drop_pct {
            return None;
        }

        Some(
            StrategySignal::buy(
                instrument_id,
                symbol,
                price,
                format!(
                    "Mean reversion: {} down days, -{:.1}% drop",
                    down_days, total_drop_pct
                ),
            )
            .with_metadata(json!({
                "down_days": down_days,
                "total_drop_pct": total_drop_pct,
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

        if pnl_pct >= self.target_bounce_pct {
            return Some(
                StrategySignal::sell(
                    instrument_id,
                    symbol,
                    price,
                    format!("Profit target hit: {:.1}%", pnl_pct),
                )
                .with_metadata(json!({"pnl_pct": pnl_pct, "exit_type": "profit_target"})),
            );
        }

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

impl crate::strategy::Strategy for MeanReversionStrategy {
    fn name(&self) -> &str {
        "Mean Reversion"
    }

    fn description(&self) -> String {
        format!(
            "Buy after {} down days, sell on {}% bounce",
            self.consecutive_down_days, self.target_bounce_pct
        )
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
            Some(position) => self.check_exit(instrument_id, symbol, bar, position),
            None => self.check_entry(instrument_id, symbol, bar, history),
        }
    }

    fn get_parameters(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            (
                "consecutive_down_days".to_string(),
                json!(self.consecutive_down_days),
            ),
            ("target_bounce_pct".to_string(), json!(self.target_bounce_pct)),
            ("max_holding_days".to_string(), json!(self.max_holding_days)),
            ("stop_loss_pct".to_string(), json!(self.stop_loss_pct)),
            ("min_drop_pct".to_string(), json!(self.min_drop_pct)),
            ("min_price".to_string(), json!(self.min_price)),
            ("min_volume".to_string(), json!(self.min_volume)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use chrono::{Duration, NaiveDate};

    fn bar(offset: i64, close: f64) -> PriceBar {
        PriceBar {
            instrument_id: 3,
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap() + Duration::days(offset),
            open: None,
            high: None,
            low: None,
            close,
            volume: 500_000,
            adjusted_close: None,
        }
    }

    #[test]
    fn buys_after_consecutive_down_days_with_enough_drop() {
        let mut strategy = MeanReversionStrategy::new(HashMap::new());
        let history = vec![bar(0, 10.0), bar(1, 9.9), bar(2, 9.8), bar(3, 9.7)];

        let signal = strategy
            .on_bar(3, "XYZ", &bar(4, 9.5), &history, None)
            .expect("entry");
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.metadata["down_days"], 3);

        // Still three lower closes, but only ~2.1% below 9.9.
        assert!(strategy
            .on_bar(3, "XYZ", &bar(4, 9.69), &history, None)
            .is_none());
        // Not enough history for three down days plus a reference close.
        assert!(strategy
            .on_bar(3, "XYZ", &bar(3, 9.0), &history[..3], None)
            .is_none());
    }

    #[test]
    fn a_higher_close_breaks_the_streak() {
        let mut strategy = MeanReversionStrategy::new(HashMap::new());
        let history = vec![bar(0, 10.0), bar(1, 9.0), bar(2, 9.5), bar(3, 9.2)];
        assert!(strategy
            .on_bar(3, "XYZ", &bar(4, 8.0), &history, None)
            .is_none());
    }

    #[test]
    fn thin_volume_is_skipped() {
        let mut strategy = MeanReversionStrategy::new(HashMap::new());
        let history: Vec<PriceBar> = [10.0, 9.9, 9.8, 9.7]
            .iter()
            .enumerate()
            .map(|(i, close)| PriceBar {
                volume: 1_000,
                ..bar(i as i64, *close)
            })
            .collect();
        assert!(strategy
            .on_bar(3, "XYZ", &bar(4, 9.0), &history, None)
            .is_none());
    }

    #[test]
    fn exits_on_bounce_stop_or_time() {
        let mut strategy = MeanReversionStrategy::new(HashMap::new());
        let position = PositionInfo {
            quantity: 100,
            entry_price: 10.0,
            entry_date: bar(0, 10.0).date,
            unrealized_pnl: 0.0,
        };
        let exit_type = |signal: Option<StrategySignal>| {
            signal
                .map(|s| s.metadata["exit_type"].as_str().unwrap_or_default().to_string())
                .unwrap_or_default()
        };
        assert_eq!(
            exit_type(strategy.on_bar(3, "XYZ", &bar(1, 10.25), &[], Some(&position))),
            "profit_target"
        );
        assert_eq!(
            exit_type(strategy.on_bar(3, "XYZ", &bar(1, 9.4), &[], Some(&position))),
            "stop_loss"
        );
        assert_eq!(
            exit_type(strategy.on_bar(3, "XYZ", &bar(10, 10.0), &[], Some(&position))),
            "time_stop"
        );
        assert!(strategy
            .on_bar(3, "XYZ", &bar(2, 10.1), &[], Some(&position))
            .is_none());
    }
}
