use crate::analyzer::format_currency;
use crate::context::AppContext;
use crate::models::{Account, Outcome};
use crate::paper::PaperTradingEngine;
use crate::retry::retry_store_operation;
use crate::store::TradingStore;
use anyhow::Result;
use log::info;

/// Look an account up by numeric id first, then by name.
pub(crate) fn resolve_account<S: TradingStore + ?Sized>(store: &S, reference: &str) -> Result<Account> {
    let reference = reference.trim();
    if let Ok(account_id) = reference.parse::<i64>() {
        if let Some(account) = store.get_account(account_id)? {
            return Ok(account);
        }
    }
    match store.get_account_by_name(reference)? {
        Some(account) => Ok(account),
        None => Err(anyhow::anyhow!("Account '{}' not found", reference)),
    }
}

pub fn create(app: &AppContext, name: &str, initial_balance: f64) -> Result<()> {
    let mut db = app.database()?;
    let mut engine = PaperTradingEngine::new(&mut db);
    match engine.create_account(name, initial_balance)? {
        Outcome::Accepted(account) => {
            println!(
                "Created account '{}' (ID: {}) with {}",
                account.name,
                account.id,
                format_currency(account.initial_balance)
            );
        }
        Outcome::Rejected(rejection) => {
            println!("Account not created: {}", rejection.message);
        }
    }
    Ok(())
}

pub fn list(app: &AppContext) -> Result<()> {
    let db = app.database()?;
    let accounts = retry_store_operation("list accounts", || db.list_accounts())?;
    if accounts.is_empty() {
        println!("No paper trading accounts.");
        return Ok(());
    }
    println!("{:>6}  {:<24} {:>16} {:>16}", "ID", "Name", "Cash", "Initial");
    for account in &accounts {
        println!(
            "{:>6}  {:<24} {:>16} {:>16}",
            account.id,
            account.name,
            format_currency(account.cash_balance),
            format_currency(account.initial_balance)
        );
    }
    Ok(())
}

pub fn show(app: &AppContext, reference: &str) -> Result<()> {
    let mut db = app.database()?;
    let account = resolve_account(&db, reference)?;
    let mut engine = PaperTradingEngine::new(&mut db);
    let updated = engine.update_position_prices(account.id)?;
    info!("Refreshed {} position price(s) for account {}", updated, account.id);

    let valuation = engine.get_portfolio_value(account.id)?;
    println!("Account: {} (ID: {})", account.name, account.id);
    println!("Cash Balance:     {:>16}", format_currency(valuation.cash_balance));
    println!("Positions Value:  {:>16}", format_currency(valuation.positions_value));
    println!("Total Value:      {:>16}", format_currency(valuation.total_value));
    println!("Initial Balance:  {:>16}", format_currency(valuation.initial_balance));
    println!(
        "Total Return:     {:>15.2}%",
        valuation.total_return * 100.0
    );

    if valuation.positions.is_empty() {
        println!("No open positions.");
        return Ok(());
    }
    println!();
    println!(
        "{:<8} {:>10} {:>12} {:>12} {:>16} {:>14} {:>9}",
        "Symbol", "Qty", "Avg Price", "Price", "Value", "Unrealized", "P&L %"
    );
    for position in &valuation.positions {
        println!(
            "{:<8} {:>10} {:>12.2} {:>12.2} {:>16} {:>14} {:>8.2}%",
            position.symbol,
            position.quantity,
            position.avg_entry_price,
            position.current_price,
            format_currency(position.market_value),
            format_currency(position.unrealized_pnl),
            position.unrealized_pnl_pct * 100.0
        );
    }
    Ok(())
}
