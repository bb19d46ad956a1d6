use crate::analyzer::{format_currency, format_report, PortfolioAnalyzer, DEFAULT_EQUITY_CURVE_LIMIT};
use crate::commands::account::resolve_account;
use crate::context::AppContext;
use crate::retry::retry_store_operation;
use anyhow::Result;

pub fn run(app: &AppContext, account: &str, curve_days: Option<usize>) -> Result<()> {
    let db = app.database()?;
    let account = resolve_account(&db, account)?;
    let analyzer = PortfolioAnalyzer::new(&db);

    let metrics = retry_store_operation("portfolio metrics", || analyzer.compute_metrics(account.id))?;
    println!("{}", format_report(&metrics));

    let Some(limit) = curve_days else {
        return Ok(());
    };
    let limit = if limit == 0 { DEFAULT_EQUITY_CURVE_LIMIT } else { limit };
    let curve = retry_store_operation("equity curve", || analyzer.get_equity_curve(account.id, limit))?;
    println!();
    if curve.is_empty() {
        println!("No snapshots recorded yet.");
        return Ok(());
    }
    println!(
        "{:<10} {:>16} {:>14} {:>9} {:>9} {:>9}",
        "Date", "Total", "Daily P&L", "Daily %", "Cum %", "DD %"
    );
    for point in &curve {
        println!(
            "{:<10} {:>16} {:>14} {:>8.2}% {:>8.2}% {:>8.2}%",
            point.date,
            format_currency(point.total_value),
            format_currency(point.daily_pnl),
            point.daily_return * 100.0,
            point.cumulative_return * 100.0,
            point.drawdown_pct * 100.0
        );
    }
    Ok(())
}
