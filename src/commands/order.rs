use crate::commands::account::resolve_account;
use crate::context::AppContext;
use crate::models::{Order, OrderStatus, Outcome};
use crate::paper::{OrderRequest, PaperTradingEngine};
use crate::retry::retry_store_operation;
use crate::risk::RiskManager;
use crate::store::TradingStore;
use anyhow::{anyhow, Result};
use log::{info, warn};

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct SubmitArgs {
    pub account: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: i64,
    pub limit_price: Option<f64>,
    pub notes: Option<String>,
    /// Run the advisory pre-trade risk check before recording the order.
    pub risk_check: bool,
}

pub fn submit(app: &AppContext, args: &SubmitArgs) -> Result<()> {
    let mut db = app.database()?;
    let account = resolve_account(&db, &args.account)?;

    let request = match OrderRequest::parse(
        account.id,
        &args.symbol,
        &args.side,
        &args.order_type,
        args.quantity,
        args.limit_price,
    ) {
        Outcome::Accepted(request) => request,
        Outcome::Rejected(rejection) => {
            println!("Order rejected: {}", rejection.message);
            return Ok(());
        }
    };
    let request = match &args.notes {
        Some(notes) => request.with_notes(notes.clone()),
        None => request,
    };

    if args.risk_check {
        let Some(estimated_price) = estimate_price(&db, &request)? else {
            warn!("No quote for {}; skipping pre-trade risk check", request.symbol);
            return submit_request(&mut db, &request);
        };
        let manager = RiskManager::new(&db, app.settings().risk_limits.clone());
        let check = manager.check_order_risk(
            account.id,
            &request.symbol,
            request.side,
            request.quantity,
            estimated_price,
        )?;
        for warning in &check.warnings {
            println!("Risk warning: {}", warning);
        }
        if !check.allowed {
            println!("Order blocked by pre-trade risk check.");
            return Ok(());
        }
    }

    submit_request(&mut db, &request)
}

fn estimate_price<S: TradingStore + ?Sized>(store: &S, request: &OrderRequest) -> Result<Option<f64>> {
    if let Some(limit_price) = request.limit_price {
        return Ok(Some(limit_price));
    }
    let Some(instrument) = store.get_instrument_by_symbol(&request.symbol)? else {
        return Ok(None);
    };
    Ok(store.get_latest_price(instrument.id)?.map(|bar| bar.close))
}

fn submit_request<S: TradingStore + ?Sized>(store: &mut S, request: &OrderRequest) -> Result<()> {
    let mut engine = PaperTradingEngine::new(store);
    match engine.submit_order(request)? {
        Outcome::Accepted(order) => {
            println!(
                "Submitted order {}: {} {} {} ({}) for execution at end of day",
                order.id,
                order.side.as_str(),
                order.quantity,
                order.symbol,
                describe_type(&order)
            );
        }
        Outcome::Rejected(rejection) => {
            println!("Order rejected: {}", rejection.message);
        }
    }
    Ok(())
}

pub fn cancel(app: &AppContext, order_id: i64) -> Result<()> {
    let mut db = app.database()?;
    let mut engine = PaperTradingEngine::new(&mut db);
    if engine.cancel_order(order_id)? {
        println!("Cancelled order {}", order_id);
    } else {
        println!("Order {} is not pending and was left unchanged", order_id);
    }
    Ok(())
}

pub fn list(
    app: &AppContext,
    account: &str,
    status: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let status = status
        .map(|raw| raw.parse::<OrderStatus>())
        .transpose()
        .map_err(|err| anyhow!("Invalid order status filter: {}", err))?;
    let db = app.database()?;
    let account = resolve_account(&db, account)?;
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let orders = retry_store_operation("list orders", || {
        db.get_orders(account.id, status, Some(limit))
    })?;
    info!("Loaded {} order(s) for account {}", orders.len(), account.id);

    if orders.is_empty() {
        println!("No orders for account '{}'.", account.name);
        return Ok(());
    }
    println!(
        "{:>6}  {:<8} {:<5} {:<14} {:>8} {:<10} {:>10} {:>12} {:<10}",
        "ID", "Symbol", "Side", "Type", "Qty", "Status", "Filled", "Fill Price", "Filled On"
    );
    for order in &orders {
        println!(
            "{:>6}  {:<8} {:<5} {:<14} {:>8} {:<10} {:>10} {:>12} {:<10}",
            order.id,
            order.symbol,
            order.side.as_str(),
            describe_type(order),
            order.quantity,
            order.status.as_str(),
            order.filled_quantity,
            order
                .filled_avg_price
                .map(|price| format!("{:.2}", price))
                .unwrap_or_default(),
            order
                .filled_date
                .map(|date| date.to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn describe_type(order: &Order) -> String {
    match order.limit_price {
        Some(limit) => format!("{} @ {:.2}", order.order_type.as_str(), limit),
        None => order.order_type.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, PriceBar};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    #[test]
    fn estimate_prefers_limit_then_latest_close() {
        let mut store = MemoryStore::new();
        let id = store.add_instrument("NVO", None);
        store.add_bars([PriceBar {
            instrument_id: id,
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            open: None,
            high: None,
            low: None,
            close: 61.5,
            volume: 0,
            adjusted_close: None,
        }]);

        let market = OrderRequest::market(1, "NVO", OrderSide::Buy, 10);
        assert_eq!(estimate_price(&store, &market).unwrap(), Some(61.5));

        let limit = OrderRequest::limit(1, "NVO", OrderSide::Buy, 10, 60.0);
        assert_eq!(estimate_price(&store, &limit).unwrap(), Some(60.0));

        let unknown = OrderRequest::market(1, "ZZZ", OrderSide::Buy, 10);
        assert_eq!(estimate_price(&store, &unknown).unwrap(), None);
    }
}
