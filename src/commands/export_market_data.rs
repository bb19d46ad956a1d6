use crate::context::AppContext;
use crate::data_context::MarketData;
use crate::retry::retry_store_operation;
use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDate};
use log::info;
use std::path::Path;

/// Earliest date exported when no start is given.
const DEFAULT_HISTORY_START: (i32, u32, u32) = (2000, 1, 1);

pub fn run(
    app: &AppContext,
    output_path: &Path,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<()> {
    info!(
        "Generating market data snapshot at {}",
        output_path.display()
    );

    let (year, month, day) = DEFAULT_HISTORY_START;
    let start = match start_date {
        Some(date) => date,
        None => NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| anyhow!("Invalid default history start"))?,
    };
    let end = end_date.unwrap_or_else(|| Local::now().date_naive());
    if start > end {
        return Err(anyhow!("Start date {} is after end date {}", start, end));
    }

    let db = app.database()?;
    let market_data = retry_store_operation("market data export", || MarketData::load(&db, start, end))?;
    if !market_data.has_data() {
        return Err(anyhow!(
            "No active instruments with bars between {} and {}",
            start,
            end
        ));
    }

    market_data.save_to_file(output_path)?;
    let trading_days = market_data.unique_dates();
    println!(
        "Wrote {} bars for {} instruments to {}",
        market_data.bar_count(),
        market_data.instruments().len(),
        output_path.display()
    );
    if let (Some(first), Some(last)) = (trading_days.first(), trading_days.last()) {
        println!(
            "Covers {} trading days from {} to {}",
            trading_days.len(),
            first,
            last
        );
    }

    Ok(())
}
