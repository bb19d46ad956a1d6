use crate::models::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Buys every instrument on its first bar and never sells; positions are
/// closed by the end-of-run liquidation.
pub struct BuyAndHoldStrategy {
    target_instrument: Option<i64>,
}

impl BuyAndHoldStrategy {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        let target_instrument = parameters
            .get("instrument_id")
            .copied()
            .filter(|value| value.is_finite() && *value > 0.0)
            .map(|value| value.round() as i64);
        Self { target_instrument }
    }
}

impl crate::strategy::Strategy for BuyAndHoldStrategy {
    fn name(&self) -> &str {
        "Buy and Hold"
    }

    fn description(&self) -> String {
        match self.target_instrument {
            Some(id) => format!("Buy instrument {} and hold to the end", id),
            None => "Buy every instrument and hold to the end".to_string(),
        }
    }

    fn on_bar(
        &mut self,
        instrument_id: i64,
        symbol: &str,
        bar: &PriceBar,
        _history: &[PriceBar],
        position: Option<&PositionInfo>,
    ) -> Option<StrategySignal> {
        if position.is_some() {
            return None;
        }
        if let Some(expected) = self.target_instrument {
            if expected != instrument_id {
                return None;
            }
        }
        Some(StrategySignal::buy(
            instrument_id,
            symbol,
            bar.close,
            "Buy and hold entry",
        ))
    }

    fn get_parameters(&self) -> BTreeMap<String, Value> {
        let mut params = BTreeMap::new();
        if let Some(id) = self.target_instrument {
            params.insert("instrument_id".to_string(), json!(id));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use chrono::NaiveDate;

    #[test]
    fn only_targets_configured_instrument() {
        let mut params = HashMap::new();
        params.insert("instrument_id".to_string(), 7.0);
        let mut strategy = BuyAndHoldStrategy::new(params);
        let bar = PriceBar {
            instrument_id: 7,
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            open: None,
            high: None,
            low: None,
            close: 4.2,
            volume: 0,
            adjusted_close: None,
        };
        assert!(strategy.on_bar(8, "OTHER", &bar, &[], None).is_none());
        let signal = strategy.on_bar(7, "SEVEN", &bar, &[], None).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);

        let held = PositionInfo {
            quantity: 1,
            entry_price: 4.2,
            entry_date: bar.date,
            unrealized_pnl: 0.0,
        };
        assert!(strategy.on_bar(7, "SEVEN", &bar, &[], Some(&held)).is_none());
    }
}
