use crate::commands::account::resolve_account;
use crate::context::AppContext;
use crate::models::OrderSide;
use crate::retry::retry_store_operation;
use crate::risk::RiskManager;
use anyhow::{anyhow, Result};
use log::warn;

/// A proposed order to run through the pre-trade check.
#[derive(Debug, Clone)]
pub struct ProposedOrder {
    pub symbol: String,
    pub side: String,
    pub quantity: i64,
    pub price: f64,
}

pub fn run(app: &AppContext, account: &str, proposed: Option<&ProposedOrder>) -> Result<()> {
    let db = app.database()?;
    let account = resolve_account(&db, account)?;
    let manager = RiskManager::new(&db, app.settings().risk_limits.clone());

    let metrics = retry_store_operation("risk metrics", || manager.compute_risk_metrics(account.id))?;
    println!("{}", manager.format_report(&metrics));
    if !metrics.is_compliant() {
        warn!(
            "Account {} has {} risk violation(s)",
            account.id,
            metrics.violations.len()
        );
    }

    let Some(proposed) = proposed else {
        return Ok(());
    };
    let side: OrderSide = proposed
        .side
        .parse()
        .map_err(|err| anyhow!("Invalid side for risk check: {}", err))?;
    let check = manager.check_order_risk(
        account.id,
        &proposed.symbol,
        side,
        proposed.quantity,
        proposed.price,
    )?;
    println!();
    println!(
        "Pre-trade check for {} {} {} @ {:.2}: {}",
        side.as_str(),
        proposed.quantity,
        proposed.symbol,
        proposed.price,
        if check.allowed { "ALLOWED" } else { "BLOCKED" }
    );
    for warning in &check.warnings {
        println!("  - {}", warning);
    }
    Ok(())
}
