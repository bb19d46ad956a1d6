use crate::analyzer::format_currency;
use crate::commands::account::resolve_account;
use crate::config::FillCosts;
use crate::context::AppContext;
use crate::executor::{EodExecutor, ExecutionSummary};
use anyhow::Result;
use chrono::NaiveDate;

pub fn run(
    app: &AppContext,
    execution_date: Option<NaiveDate>,
    account: Option<&str>,
    with_costs: bool,
) -> Result<()> {
    let mut db = app.database()?;
    let account_id = match account {
        Some(reference) => Some(resolve_account(&db, reference)?.id),
        None => None,
    };

    let costs = if with_costs {
        let settings = app.settings();
        FillCosts::new(settings.commission_rate, settings.slippage_rate)
    } else {
        FillCosts::default()
    };

    let summary = EodExecutor::new(&mut db)
        .with_costs(costs)?
        .execute_orders(execution_date, account_id)?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &ExecutionSummary) {
    println!("EOD execution for {}", summary.execution_date);
    println!(
        "Processed {} order(s): {} filled, {} rejected",
        summary.orders_processed, summary.orders_filled, summary.orders_rejected
    );
    println!("Total bought: {}", format_currency(summary.total_buy_value));
    println!("Total sold:   {}", format_currency(summary.total_sell_value));

    for fill in &summary.fills {
        if fill.is_success() {
            let pnl = fill
                .realized_pnl
                .map(|pnl| format!(", realized {}", format_currency(pnl)))
                .unwrap_or_default();
            println!(
                "  #{} {} {} {} @ {:.2} ({}, commission {:.2}{})",
                fill.order_id,
                fill.side.as_str(),
                fill.quantity,
                fill.symbol,
                fill.fill_price,
                format_currency(fill.total_value),
                fill.commission,
                pnl
            );
        } else {
            println!(
                "  #{} {} {} {}: {}",
                fill.order_id,
                fill.side.as_str(),
                fill.quantity,
                fill.symbol,
                fill.message
            );
        }
    }
}
