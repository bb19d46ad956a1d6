use crate::error::EngineError;
use crate::models::*;
use crate::store::TradingStore;
use anyhow::Result;
use chrono::{Local, NaiveDate};
use log::{info, warn};
use serde::Serialize;

/// An order as requested by a caller, before account and symbol resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub account_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<f64>,
    pub notes: Option<String>,
}

impl OrderRequest {
    pub fn market(account_id: i64, symbol: &str, side: OrderSide, quantity: i64) -> Self {
        Self {
            account_id,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            notes: None,
        }
    }

    pub fn limit(
        account_id: i64,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        limit_price: f64,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(account_id, symbol, side, quantity)
        }
    }

    /// Build a request from untyped input; an unknown side or order type is a
    /// rejection rather than an error.
    pub fn parse(
        account_id: i64,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: i64,
        limit_price: Option<f64>,
    ) -> Outcome<Self> {
        let Ok(side) = side.parse::<OrderSide>() else {
            return Outcome::rejected(RejectionReason::InvalidSide, format!("Invalid side: {}", side));
        };
        let Ok(order_type) = order_type.parse::<OrderType>() else {
            return Outcome::rejected(
                RejectionReason::InvalidOrderType,
                format!("Invalid order type: {}", order_type),
            );
        };
        Outcome::Accepted(Self {
            account_id,
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            limit_price,
            notes: None,
        })
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioValuation {
    pub account_id: i64,
    pub cash_balance: f64,
    pub positions_value: f64,
    pub total_value: f64,
    pub initial_balance: f64,
    pub total_return: f64,
    pub positions: Vec<PositionDetail>,
}

/// Account, order and position bookkeeping for simulated trading. Orders are
/// only recorded here; fills happen in the end-of-day executor.
pub struct PaperTradingEngine<'a, S: TradingStore + ?Sized> {
    store: &'a mut S,
}

impl<'a, S: TradingStore + ?Sized> PaperTradingEngine<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    pub fn create_account(&mut self, name: &str, initial_balance: f64) -> Result<Outcome<Account>> {
        if !initial_balance.is_finite() || initial_balance <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "initial balance must be positive (value: {})",
                initial_balance
            ))
            .into());
        }
        if self.store.get_account_by_name(name)?.is_some() {
            return Ok(Outcome::rejected(
                RejectionReason::DuplicateAccountName,
                format!("Account '{}' already exists", name),
            ));
        }
        let account = self.store.create_account(name, initial_balance)?;
        info!(
            "Created paper account {} ({}) with balance {:.2}",
            account.id, account.name, account.initial_balance
        );
        Ok(Outcome::Accepted(account))
    }

    pub fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        self.store.get_account(account_id)
    }

    pub fn get_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        self.store.get_account_by_name(name)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.store.list_accounts()
    }

    /// Validate and record a pending order. Nothing is filled here.
    pub fn submit_order(&mut self, request: &OrderRequest) -> Result<Outcome<Order>> {
        if request.quantity <= 0 {
            return Ok(Outcome::rejected(
                RejectionReason::InvalidQuantity,
                "Quantity must be positive",
            ));
        }
        if request.order_type == OrderType::Limit && request.limit_price.is_none() {
            return Ok(Outcome::rejected(
                RejectionReason::MissingLimitPrice,
                "Limit price required for limit orders",
            ));
        }
        if self.store.get_account(request.account_id)?.is_none() {
            return Ok(Outcome::rejected(
                RejectionReason::AccountNotFound,
                format!("Account {} not found", request.account_id),
            ));
        }
        let Some(instrument) = self.store.get_instrument_by_symbol(&request.symbol)? else {
            return Ok(Outcome::rejected(
                RejectionReason::InstrumentNotFound,
                format!("Symbol {} not found", request.symbol),
            ));
        };

        if request.side == OrderSide::Sell {
            let available = self
                .store
                .get_position(request.account_id, instrument.id)?
                .map(|position| position.quantity)
                .unwrap_or(0);
            if available < request.quantity {
                return Ok(Outcome::rejected(
                    RejectionReason::InsufficientPosition,
                    format!(
                        "Insufficient position: have {}, need {}",
                        available, request.quantity
                    ),
                ));
            }
        }

        let order = self.store.insert_order(&NewOrder {
            account_id: request.account_id,
            instrument_id: instrument.id,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            limit_price: request.limit_price,
            notes: request.notes.clone(),
        })?;
        info!(
            "Submitted {} {} order {} for {} x {} (account {})",
            order.order_type.as_str(),
            order.side,
            order.id,
            order.quantity,
            instrument.symbol,
            order.account_id
        );
        Ok(Outcome::Accepted(order))
    }

    /// Cancel a pending order. Returns false when the order does not exist or
    /// is no longer pending.
    pub fn cancel_order(&mut self, order_id: i64) -> Result<bool> {
        let Some(order) = self.store.get_order(order_id)? else {
            return Ok(false);
        };
        if order.status.is_terminal() {
            warn!("Order {} is already {}", order_id, order.status.as_str());
            return Ok(false);
        }
        // The store re-checks the status, so a fill that lands first wins.
        if !self.store.mark_order_cancelled(order_id)? {
            warn!(
                "Order {} cannot be cancelled in status {}",
                order_id,
                order.status.as_str()
            );
            return Ok(false);
        }
        info!("Cancelled order {}", order_id);
        Ok(true)
    }

    pub fn get_orders(
        &self,
        account_id: i64,
        status: Option<OrderStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Order>> {
        self.store.get_orders(account_id, status, limit)
    }

    pub fn get_positions(&self, account_id: i64, include_closed: bool) -> Result<Vec<PaperPosition>> {
        self.store.get_positions(account_id, include_closed)
    }

    /// Cash plus open positions at the latest known close, falling back to the
    /// average entry price for instruments without a quote.
    pub fn get_portfolio_value(&self, account_id: i64) -> Result<PortfolioValuation> {
        let account = self
            .store
            .get_account(account_id)?
            .ok_or(EngineError::AccountNotFound(account_id))?;

        let mut positions = Vec::new();
        let mut positions_value = 0.0;
        for position in self.store.get_positions(account_id, false)? {
            let current_price = self
                .store
                .get_latest_price(position.instrument_id)?
                .map(|bar| bar.close)
                .unwrap_or(position.avg_entry_price);
            let detail = position_detail(&position, current_price);
            positions_value += detail.market_value;
            positions.push(detail);
        }

        let total_value = account.cash_balance + positions_value;
        let total_return = if account.initial_balance > 0.0 {
            (total_value - account.initial_balance) / account.initial_balance
        } else {
            0.0
        };

        Ok(PortfolioValuation {
            account_id,
            cash_balance: account.cash_balance,
            positions_value,
            total_value,
            initial_balance: account.initial_balance,
            total_return,
            positions,
        })
    }

    /// Refresh `current_price` on open positions from the latest close.
    pub fn update_position_prices(&mut self, account_id: i64) -> Result<usize> {
        let mut updated = 0;
        for mut position in self.store.get_positions(account_id, false)? {
            if let Some(bar) = self.store.get_latest_price(position.instrument_id)? {
                position.current_price = Some(bar.close);
                self.store.upsert_position(&position)?;
                updated += 1;
            }
        }
        info!("Updated prices on {} positions for account {}", updated, account_id);
        Ok(updated)
    }

    /// Value the account and store it as the snapshot for `snapshot_date`
    /// (today when omitted). Re-running for the same date replaces the row.
    pub fn create_snapshot(
        &mut self,
        account_id: i64,
        snapshot_date: Option<NaiveDate>,
    ) -> Result<PortfolioSnapshot> {
        let snapshot_date = snapshot_date.unwrap_or_else(|| Local::now().date_naive());
        let valuation = self.get_portfolio_value(account_id)?;

        let previous = self
            .store
            .get_latest_snapshot_before(account_id, snapshot_date)?;
        let (daily_pnl, daily_return) = match previous {
            Some(previous) => {
                let pnl = valuation.total_value - previous.total_value;
                let ret = (previous.total_value > 0.0).then(|| pnl / previous.total_value);
                (Some(pnl), ret)
            }
            None => (None, None),
        };

        let snapshot = PortfolioSnapshot {
            account_id,
            snapshot_date,
            cash_balance: valuation.cash_balance,
            positions_value: valuation.positions_value,
            total_value: valuation.total_value,
            daily_pnl,
            daily_return,
            positions_detail: valuation.positions,
        };
        self.store.upsert_snapshot(&snapshot)?;
        info!(
            "Created snapshot for account {} on {}: total value {:.2}",
            account_id, snapshot_date, snapshot.total_value
        );
        Ok(snapshot)
    }
}

pub(crate) fn position_detail(position: &PaperPosition, current_price: f64) -> PositionDetail {
    let market_value = current_price * position.quantity as f64;
    let unrealized_pnl = (current_price - position.avg_entry_price) * position.quantity as f64;
    let cost_basis = position.avg_entry_price * position.quantity as f64;
    PositionDetail {
        instrument_id: position.instrument_id,
        symbol: position.symbol.clone(),
        quantity: position.quantity,
        avg_entry_price: position.avg_entry_price,
        current_price,
        market_value,
        unrealized_pnl,
        unrealized_pnl_pct: if cost_basis > 0.0 {
            unrealized_pnl / cost_basis
        } else {
            0.0
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, day).unwrap()
    }

    fn setup() -> (MemoryStore, i64, i64) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut store = MemoryStore::new();
        let instrument = store.add_instrument("BHP", Some("BHP Group"));
        let account = store.create_account("paper", 10_000.0).unwrap();
        (store, account.id, instrument)
    }

    fn rejection<T: std::fmt::Debug>(outcome: Outcome<T>) -> Rejection {
        match outcome {
            Outcome::Rejected(rejection) => rejection,
            Outcome::Accepted(value) => panic!("expected rejection, got {:?}", value),
        }
    }

    #[test]
    fn duplicate_account_names_are_rejected() {
        let (mut store, _, _) = setup();
        let mut engine = PaperTradingEngine::new(&mut store);
        let outcome = engine.create_account("paper", 5_000.0).unwrap();
        assert_eq!(rejection(outcome).reason, RejectionReason::DuplicateAccountName);
        assert!(engine.create_account("other", 5_000.0).unwrap().is_success());
        assert!(engine.create_account("broke", 0.0).is_err());
        assert_eq!(engine.list_accounts().unwrap().len(), 2);
    }

    #[test]
    fn submit_validates_in_order() {
        let (mut store, account, _) = setup();
        let mut engine = PaperTradingEngine::new(&mut store);

        let bad_side = OrderRequest::parse(account, "BHP", "short", "market", 1, None);
        assert_eq!(rejection(bad_side).message, "Invalid side: short");

        let zero = OrderRequest::market(account, "BHP", OrderSide::Buy, 0);
        let rejected = rejection(engine.submit_order(&zero).unwrap());
        assert_eq!(rejected.message, "Quantity must be positive");

        let mut no_limit = OrderRequest::market(account, "BHP", OrderSide::Buy, 5);
        no_limit.order_type = OrderType::Limit;
        let rejected = rejection(engine.submit_order(&no_limit).unwrap());
        assert_eq!(rejected.reason, RejectionReason::MissingLimitPrice);

        let ghost = OrderRequest::market(999, "BHP", OrderSide::Buy, 5);
        let rejected = rejection(engine.submit_order(&ghost).unwrap());
        assert_eq!(rejected.message, "Account 999 not found");

        let unknown = OrderRequest::market(account, "ZZZ", OrderSide::Buy, 5);
        let rejected = rejection(engine.submit_order(&unknown).unwrap());
        assert_eq!(rejected.message, "Symbol ZZZ not found");

        let naked = OrderRequest::market(account, "BHP", OrderSide::Sell, 5);
        let rejected = rejection(engine.submit_order(&naked).unwrap());
        assert_eq!(rejected.message, "Insufficient position: have 0, need 5");
    }

    #[test]
    fn accepted_orders_are_pending_and_cancellable_once() {
        let (mut store, account, _) = setup();
        let mut engine = PaperTradingEngine::new(&mut store);
        let request =
            OrderRequest::limit(account, "bhp", OrderSide::Buy, 10, 40.0).with_notes("dip buy");
        let order = engine
            .submit_order(&request)
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.notes.as_deref(), Some("dip buy"));
        assert_eq!(order.filled_quantity, 0);

        assert!(engine.cancel_order(order.id).unwrap());
        assert!(!engine.cancel_order(order.id).unwrap());
        assert!(!engine.cancel_order(12345).unwrap());
        let orders = engine
            .get_orders(account, Some(OrderStatus::Cancelled), None)
            .unwrap();
        assert_eq!(orders.len(), 1);
    }

    #[test]
    fn valuation_falls_back_to_entry_price_without_quotes() {
        let (mut store, account, instrument) = setup();
        let other = store.add_instrument("RIO", None);
        store
            .upsert_position(&PaperPosition {
                account_id: account,
                instrument_id: instrument,
                symbol: "BHP".to_string(),
                quantity: 10,
                avg_entry_price: 40.0,
                current_price: None,
                realized_pnl: 0.0,
            })
            .unwrap();
        store
            .upsert_position(&PaperPosition {
                account_id: account,
                instrument_id: other,
                symbol: "RIO".to_string(),
                quantity: 5,
                avg_entry_price: 100.0,
                current_price: None,
                realized_pnl: 0.0,
            })
            .unwrap();
        store.add_bars([PriceBar {
            instrument_id: instrument,
            date: date(1),
            open: None,
            high: None,
            low: None,
            close: 44.0,
            volume: 0,
            adjusted_close: None,
        }]);

        let mut engine = PaperTradingEngine::new(&mut store);
        let value = engine.get_portfolio_value(account).unwrap();
        assert!((value.positions_value - (440.0 + 500.0)).abs() < 1e-9);
        assert!((value.total_value - 10_940.0).abs() < 1e-9);
        assert!((value.total_return - 0.094).abs() < 1e-9);
        let bhp = &value.positions[0];
        assert!((bhp.unrealized_pnl - 40.0).abs() < 1e-9);
        assert!((bhp.unrealized_pnl_pct - 0.1).abs() < 1e-9);

        assert_eq!(engine.update_position_prices(account).unwrap(), 1);
        assert!(engine.get_portfolio_value(9_999).is_err());
    }

    #[test]
    fn snapshots_diff_against_prior_day_and_upsert() {
        let (mut store, account, _) = setup();
        let mut engine = PaperTradingEngine::new(&mut store);

        let first = engine.create_snapshot(account, Some(date(1))).unwrap();
        assert!(first.daily_pnl.is_none());

        engine.store.update_account_balance(account, 10_500.0).unwrap();
        let second = engine.create_snapshot(account, Some(date(2))).unwrap();
        assert!((second.daily_pnl.unwrap() - 500.0).abs() < 1e-9);
        assert!((second.daily_return.unwrap() - 0.05).abs() < 1e-12);

        let again = engine.create_snapshot(account, Some(date(2))).unwrap();
        assert_eq!(again, second);
        assert_eq!(store.get_snapshots(account, 10).unwrap().len(), 2);
    }
}
