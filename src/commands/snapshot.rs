use crate::analyzer::format_currency;
use crate::commands::account::resolve_account;
use crate::context::AppContext;
use crate::models::Account;
use crate::paper::PaperTradingEngine;
use crate::retry::retry_store_operation;
use crate::store::TradingStore;
use anyhow::Result;
use chrono::NaiveDate;
use log::{error, info};

/// Snapshot one account, or every account when none is named. Snapshots
/// upsert by date, so a failed pass can be retried.
pub fn run(app: &AppContext, account: Option<&str>, snapshot_date: Option<NaiveDate>) -> Result<()> {
    let mut db = app.database()?;
    let accounts: Vec<Account> = match account {
        Some(reference) => vec![resolve_account(&db, reference)?],
        None => db.list_accounts()?,
    };
    if accounts.is_empty() {
        info!("No accounts to snapshot");
        return Ok(());
    }

    let mut failures = 0;
    for account in &accounts {
        let result = retry_store_operation(format!("snapshot for account {}", account.id), || {
            let mut engine = PaperTradingEngine::new(&mut db);
            engine.update_position_prices(account.id)?;
            engine.create_snapshot(account.id, snapshot_date)
        });
        match result {
            Ok(snapshot) => {
                let change = snapshot
                    .daily_pnl
                    .map(|pnl| {
                        let pct = snapshot
                            .daily_return
                            .map(|ret| format!(" ({:+.2}%)", ret * 100.0))
                            .unwrap_or_default();
                        format!(", day {}{}", format_currency(pnl), pct)
                    })
                    .unwrap_or_default();
                println!(
                    "{} on {}: total {} (cash {}, positions {}){}",
                    account.name,
                    snapshot.snapshot_date,
                    format_currency(snapshot.total_value),
                    format_currency(snapshot.cash_balance),
                    format_currency(snapshot.positions_value),
                    change
                );
            }
            Err(err) => {
                failures += 1;
                error!("Snapshot for account {} failed: {:#}", account.id, err);
            }
        }
    }

    if failures > 0 {
        return Err(anyhow::anyhow!(
            "{} of {} snapshot(s) failed",
            failures,
            accounts.len()
        ));
    }
    Ok(())
}
