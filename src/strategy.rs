use crate::models::*;
use anyhow::Result;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A decision unit polled once per instrument per bar.
///
/// `history` holds the bars before `bar`, oldest first. `position` is the
/// currently open position for the instrument, if any.
pub trait Strategy {
    fn name(&self) -> &str;
    fn description(&self) -> String;
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn on_start(&mut self, _start_date: NaiveDate, _end_date: NaiveDate) {}
    fn on_bar(
        &mut self,
        instrument_id: i64,
        symbol: &str,
        bar: &PriceBar,
        history: &[PriceBar],
        position: Option<&PositionInfo>,
    ) -> Option<StrategySignal>;
    fn on_end(&mut self) {}
    /// Persisted with the run; never interpreted by the engine.
    fn get_parameters(&self) -> BTreeMap<String, Value>;
}

#[path = "strategies/breakout.rs"]
pub mod breakout;

pub use breakout::BreakoutStrategy;

#[path = "strategies/mean_reversion.rs"]
pub mod mean_reversion;

pub use mean_reversion::MeanReversionStrategy;

#[path = "strategies/buy_and_hold.rs"]
pub mod buy_and_hold;

pub use buy_and_hold::BuyAndHoldStrategy;

pub fn create_strategy(
    name: &str,
    parameters: HashMap<String, f64>,
) -> Result<Box<dyn Strategy + Send>> {
    match name.trim().to_lowercase().replace('-', "_").as_str() {
        "breakout" => Ok(Box::new(BreakoutStrategy::new(parameters))),
        "mean_reversion" => Ok(Box::new(MeanReversionStrategy::new(parameters))),
        "buy_and_hold" => Ok(Box::new(BuyAndHoldStrategy::new(parameters))),
        other => Err(anyhow::anyhow!("Unknown strategy: {}", other)),
    }
}

/// Percent change of `price` relative to `reference`, in percent units.
pub(crate) fn percent_change(price: f64, reference: f64) -> f64 {
    if reference == 0.0 {
        return 0.0;
    }
    ((price - reference) / reference) * 100.0
}
