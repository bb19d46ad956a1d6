use crate::error::EngineError;
use crate::models::*;
use anyhow::Result;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::BTreeMap;

/// Record store the engines read from and write to.
///
/// Calls are blocking and assume a single writer. Implementations report
/// collaborator failures as `Err`; missing rows come back as `None`.
pub trait TradingStore {
    // Instruments
    fn get_instrument(&self, instrument_id: i64) -> Result<Option<Instrument>>;
    fn get_instrument_by_symbol(&self, symbol: &str) -> Result<Option<Instrument>>;
    fn get_active_instruments(&self) -> Result<Vec<Instrument>>;

    // Prices
    /// Bars per instrument within `[start, end]`, ascending by date.
    fn get_price_history_range(
        &self,
        instrument_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<i64, Vec<PriceBar>>>;
    fn get_prices_for_date(&self, date: NaiveDate) -> Result<Vec<PriceBar>>;
    fn get_latest_price(&self, instrument_id: i64) -> Result<Option<PriceBar>>;

    // Strategies and backtests
    fn get_or_create_strategy(
        &mut self,
        name: &str,
        description: Option<&str>,
        version: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<i64>;
    fn create_backtest_run(&mut self, run: &NewBacktestRun) -> Result<i64>;
    fn complete_backtest_run(
        &mut self,
        run_id: i64,
        final_capital: f64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<()>;
    fn insert_backtest_trades(&mut self, run_id: i64, trades: &[Trade]) -> Result<()>;
    fn insert_backtest_metrics(&mut self, run_id: i64, metrics: &BacktestMetrics) -> Result<()>;

    // Accounts
    fn create_account(&mut self, name: &str, initial_balance: f64) -> Result<Account>;
    fn get_account(&self, account_id: i64) -> Result<Option<Account>>;
    fn get_account_by_name(&self, name: &str) -> Result<Option<Account>>;
    fn list_accounts(&self) -> Result<Vec<Account>>;
    fn update_account_balance(&mut self, account_id: i64, cash_balance: f64) -> Result<()>;

    // Orders
    fn insert_order(&mut self, order: &NewOrder) -> Result<Order>;
    fn get_order(&self, order_id: i64) -> Result<Option<Order>>;
    /// Pending orders in submission order.
    fn get_pending_orders(&self, account_id: Option<i64>) -> Result<Vec<Order>>;
    /// Orders newest first.
    fn get_orders(
        &self,
        account_id: i64,
        status: Option<OrderStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Order>>;
    /// Record a fill together with the account's new cash balance and the
    /// resulting position. Either all three change or none does; the order
    /// must still be pending (`EngineError::OrderNotPending` otherwise).
    fn apply_fill(
        &mut self,
        fill: &OrderFill,
        cash_balance: f64,
        position: &PaperPosition,
    ) -> Result<()>;
    /// Returns false when the order is no longer pending.
    fn mark_order_cancelled(&mut self, order_id: i64) -> Result<bool>;

    // Positions
    fn get_position(&self, account_id: i64, instrument_id: i64) -> Result<Option<PaperPosition>>;
    fn get_positions(&self, account_id: i64, include_closed: bool) -> Result<Vec<PaperPosition>>;
    fn upsert_position(&mut self, position: &PaperPosition) -> Result<()>;

    // Snapshots
    fn upsert_snapshot(&mut self, snapshot: &PortfolioSnapshot) -> Result<()>;
    /// The most recent `limit` snapshots, oldest first.
    fn get_snapshots(&self, account_id: i64, limit: usize) -> Result<Vec<PortfolioSnapshot>>;
    fn get_latest_snapshot_before(
        &self,
        account_id: i64,
        date: NaiveDate,
    ) -> Result<Option<PortfolioSnapshot>>;
}

/// In-process store used for tests and offline runs over a market data
/// snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next_id: i64,
    instruments: BTreeMap<i64, Instrument>,
    prices: BTreeMap<i64, BTreeMap<NaiveDate, PriceBar>>,
    strategies: BTreeMap<i64, StrategyRecord>,
    runs: BTreeMap<i64, BacktestRunRecord>,
    run_trades: BTreeMap<i64, Vec<Trade>>,
    run_metrics: BTreeMap<i64, BacktestMetrics>,
    accounts: BTreeMap<i64, Account>,
    orders: BTreeMap<i64, Order>,
    positions: BTreeMap<(i64, i64), PaperPosition>,
    snapshots: BTreeMap<(i64, NaiveDate), PortfolioSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_instrument(&mut self, symbol: &str, name: Option<&str>) -> i64 {
        let id = self.allocate_id();
        self.insert_instrument(Instrument {
            id,
            symbol: symbol.to_string(),
            name: name.map(str::to_string),
            active: true,
        });
        id
    }

    /// Insert with an explicit id, keeping the id allocator ahead of it.
    pub fn insert_instrument(&mut self, instrument: Instrument) {
        self.next_id = self.next_id.max(instrument.id);
        self.instruments.insert(instrument.id, instrument);
    }

    pub fn add_bars<I: IntoIterator<Item = PriceBar>>(&mut self, bars: I) {
        for bar in bars {
            self.prices
                .entry(bar.instrument_id)
                .or_default()
                .insert(bar.date, bar);
        }
    }

    pub fn backtest_run(&self, run_id: i64) -> Option<&BacktestRunRecord> {
        self.runs.get(&run_id)
    }

    pub fn backtest_runs(&self) -> impl Iterator<Item = &BacktestRunRecord> {
        self.runs.values()
    }

    pub fn backtest_trades(&self, run_id: i64) -> &[Trade] {
        self.run_trades
            .get(&run_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn backtest_metrics(&self, run_id: i64) -> Option<&BacktestMetrics> {
        self.run_metrics.get(&run_id)
    }

    fn symbol_for(&self, instrument_id: i64) -> String {
        self.instruments
            .get(&instrument_id)
            .map(|instrument| instrument.symbol.clone())
            .unwrap_or_default()
    }
}

impl TradingStore for MemoryStore {
    fn get_instrument(&self, instrument_id: i64) -> Result<Option<Instrument>> {
        Ok(self.instruments.get(&instrument_id).cloned())
    }

    fn get_instrument_by_symbol(&self, symbol: &str) -> Result<Option<Instrument>> {
        Ok(self
            .instruments
            .values()
            .find(|instrument| instrument.symbol.eq_ignore_ascii_case(symbol))
            .cloned())
    }

    fn get_active_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(self
            .instruments
            .values()
            .filter(|instrument| instrument.active)
            .cloned()
            .collect())
    }

    fn get_price_history_range(
        &self,
        instrument_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<i64, Vec<PriceBar>>> {
        let mut result = BTreeMap::new();
        if start > end {
            return Ok(result);
        }
        for id in instrument_ids {
            if let Some(series) = self.prices.get(id) {
                let bars: Vec<PriceBar> = series.range(start..=end).map(|(_, bar)| bar.clone()).collect();
                if !bars.is_empty() {
                    result.insert(*id, bars);
                }
            }
        }
        Ok(result)
    }

    fn get_prices_for_date(&self, date: NaiveDate) -> Result<Vec<PriceBar>> {
        Ok(self
            .prices
            .values()
            .filter_map(|series| series.get(&date).cloned())
            .collect())
    }

    fn get_latest_price(&self, instrument_id: i64) -> Result<Option<PriceBar>> {
        Ok(self
            .prices
            .get(&instrument_id)
            .and_then(|series| series.values().next_back().cloned()))
    }

    fn get_or_create_strategy(
        &mut self,
        name: &str,
        description: Option<&str>,
        version: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<i64> {
        if let Some(existing) = self
            .strategies
            .values_mut()
            .find(|record| record.name == name && record.version == version)
        {
            existing.parameters = parameters.clone();
            return Ok(existing.id);
        }
        let id = self.allocate_id();
        self.strategies.insert(
            id,
            StrategyRecord {
                id,
                name: name.to_string(),
                description: description.map(str::to_string),
                version: version.to_string(),
                parameters: parameters.clone(),
            },
        );
        Ok(id)
    }

    fn create_backtest_run(&mut self, run: &NewBacktestRun) -> Result<i64> {
        let id = self.allocate_id();
        self.runs.insert(
            id,
            BacktestRunRecord {
                id,
                strategy_id: run.strategy_id,
                name: run.name.clone(),
                start_date: run.start_date,
                end_date: run.end_date,
                initial_capital: run.initial_capital,
                final_capital: None,
                status: RunStatus::Running,
                error_message: None,
                parameters: run.parameters.clone(),
            },
        );
        Ok(id)
    }

    fn complete_backtest_run(
        &mut self,
        run_id: i64,
        final_capital: f64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let run = self.runs.get_mut(&run_id).ok_or_else(|| {
            EngineError::invalid_record("backtest run", format!("run {} does not exist", run_id))
        })?;
        run.final_capital = Some(final_capital);
        run.status = status;
        run.error_message = error_message.map(str::to_string);
        Ok(())
    }

    fn insert_backtest_trades(&mut self, run_id: i64, trades: &[Trade]) -> Result<()> {
        self.run_trades
            .entry(run_id)
            .or_default()
            .extend(trades.iter().cloned());
        Ok(())
    }

    fn insert_backtest_metrics(&mut self, run_id: i64, metrics: &BacktestMetrics) -> Result<()> {
        self.run_metrics.insert(run_id, metrics.clone());
        Ok(())
    }

    fn create_account(&mut self, name: &str, initial_balance: f64) -> Result<Account> {
        let id = self.allocate_id();
        let account = Account {
            id,
            name: name.to_string(),
            cash_balance: initial_balance,
            initial_balance,
        };
        self.accounts.insert(id, account.clone());
        Ok(account)
    }

    fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        Ok(self.accounts.get(&account_id).cloned())
    }

    fn get_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .values()
            .find(|account| account.name == name)
            .cloned())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(accounts)
    }

    fn update_account_balance(&mut self, account_id: i64, cash_balance: f64) -> Result<()> {
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or(EngineError::AccountNotFound(account_id))?;
        account.cash_balance = cash_balance;
        Ok(())
    }

    fn insert_order(&mut self, order: &NewOrder) -> Result<Order> {
        let id = self.allocate_id();
        let record = Order {
            id,
            account_id: order.account_id,
            instrument_id: order.instrument_id,
            symbol: self.symbol_for(order.instrument_id),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            limit_price: order.limit_price,
            status: OrderStatus::Pending,
            filled_quantity: 0,
            filled_avg_price: None,
            commission: 0.0,
            realized_pnl: None,
            filled_date: None,
            notes: order.notes.clone(),
        };
        self.orders.insert(id, record.clone());
        Ok(record)
    }

    fn get_order(&self, order_id: i64) -> Result<Option<Order>> {
        Ok(self.orders.get(&order_id).cloned())
    }

    fn get_pending_orders(&self, account_id: Option<i64>) -> Result<Vec<Order>> {
        Ok(self
            .orders
            .values()
            .filter(|order| order.status == OrderStatus::Pending)
            .filter(|order| account_id.is_none_or(|id| order.account_id == id))
            .cloned()
            .collect())
    }

    fn get_orders(
        &self,
        account_id: i64,
        status: Option<OrderStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Order>> {
        Ok(self
            .orders
            .values()
            .rev()
            .filter(|order| order.account_id == account_id)
            .filter(|order| status.is_none_or(|status| order.status == status))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn apply_fill(
        &mut self,
        fill: &OrderFill,
        cash_balance: f64,
        position: &PaperPosition,
    ) -> Result<()> {
        let order = self
            .orders
            .get(&fill.order_id)
            .ok_or(EngineError::OrderNotFound(fill.order_id))?;
        if order.status != OrderStatus::Pending {
            return Err(EngineError::OrderNotPending(fill.order_id).into());
        }
        if !self.accounts.contains_key(&position.account_id) {
            return Err(EngineError::AccountNotFound(position.account_id).into());
        }

        // Every check is done; the three writes below cannot fail.
        if let Some(order) = self.orders.get_mut(&fill.order_id) {
            order.status = if fill.filled_quantity < order.quantity {
                OrderStatus::Partial
            } else {
                OrderStatus::Filled
            };
            order.filled_quantity = fill.filled_quantity;
            order.filled_avg_price = Some(fill.fill_price);
            order.commission = fill.commission;
            order.realized_pnl = fill.realized_pnl;
            order.filled_date = Some(fill.filled_date);
        }
        if let Some(account) = self.accounts.get_mut(&position.account_id) {
            account.cash_balance = cash_balance;
        }
        self.positions.insert(
            (position.account_id, position.instrument_id),
            position.clone(),
        );
        Ok(())
    }

    fn mark_order_cancelled(&mut self, order_id: i64) -> Result<bool> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::Pending {
            return Ok(false);
        }
        order.status = OrderStatus::Cancelled;
        Ok(true)
    }

    fn get_position(&self, account_id: i64, instrument_id: i64) -> Result<Option<PaperPosition>> {
        Ok(self.positions.get(&(account_id, instrument_id)).cloned())
    }

    fn get_positions(&self, account_id: i64, include_closed: bool) -> Result<Vec<PaperPosition>> {
        Ok(self
            .positions
            .range((account_id, i64::MIN)..=(account_id, i64::MAX))
            .map(|(_, position)| position)
            .filter(|position| include_closed || position.is_open())
            .cloned()
            .collect())
    }

    fn upsert_position(&mut self, position: &PaperPosition) -> Result<()> {
        self.positions.insert(
            (position.account_id, position.instrument_id),
            position.clone(),
        );
        Ok(())
    }

    fn upsert_snapshot(&mut self, snapshot: &PortfolioSnapshot) -> Result<()> {
        self.snapshots.insert(
            (snapshot.account_id, snapshot.snapshot_date),
            snapshot.clone(),
        );
        Ok(())
    }

    fn get_snapshots(&self, account_id: i64, limit: usize) -> Result<Vec<PortfolioSnapshot>> {
        let mut recent: Vec<PortfolioSnapshot> = self
            .snapshots
            .range((account_id, NaiveDate::MIN)..=(account_id, NaiveDate::MAX))
            .rev()
            .take(limit)
            .map(|(_, snapshot)| snapshot.clone())
            .collect();
        recent.reverse();
        Ok(recent)
    }

    fn get_latest_snapshot_before(
        &self,
        account_id: i64,
        date: NaiveDate,
    ) -> Result<Option<PortfolioSnapshot>> {
        Ok(self
            .snapshots
            .range((account_id, NaiveDate::MIN)..(account_id, date))
            .next_back()
            .map(|(_, snapshot)| snapshot.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, day).unwrap()
    }

    fn bar(instrument_id: i64, day: u32, close: f64) -> PriceBar {
        PriceBar {
            instrument_id,
            date: date(day),
            open: None,
            high: None,
            low: None,
            close,
            volume: 0,
            adjusted_close: None,
        }
    }

    fn snapshot(account_id: i64, day: u32, total: f64) -> PortfolioSnapshot {
        PortfolioSnapshot {
            account_id,
            snapshot_date: date(day),
            cash_balance: total,
            positions_value: 0.0,
            total_value: total,
            daily_pnl: None,
            daily_return: None,
            positions_detail: Vec::new(),
        }
    }

    #[test]
    fn price_history_is_ranged_and_ascending() {
        let mut store = MemoryStore::new();
        let id = store.add_instrument("AAA", None);
        store.add_bars([bar(id, 3, 3.0), bar(id, 1, 1.0), bar(id, 2, 2.0), bar(id, 9, 9.0)]);

        let history = store
            .get_price_history_range(&[id, 999], date(1), date(3))
            .unwrap();
        let closes: Vec<f64> = history[&id].iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![1.0, 2.0, 3.0]);
        assert!(!history.contains_key(&999));
        assert_eq!(store.get_latest_price(id).unwrap().unwrap().close, 9.0);
    }

    #[test]
    fn pending_orders_keep_submission_order_and_listing_is_newest_first() {
        let mut store = MemoryStore::new();
        let instrument = store.add_instrument("AAA", None);
        let account = store.create_account("main", 1_000.0).unwrap();
        let mut ids = Vec::new();
        for qty in [1, 2, 3] {
            let order = store
                .insert_order(&NewOrder {
                    account_id: account.id,
                    instrument_id: instrument,
                    side: OrderSide::Buy,
                    order_type: OrderType::Market,
                    quantity: qty,
                    limit_price: None,
                    notes: None,
                })
                .unwrap();
            assert_eq!(order.symbol, "AAA");
            ids.push(order.id);
        }
        store.mark_order_cancelled(ids[1]).unwrap();

        let pending: Vec<i64> = store
            .get_pending_orders(Some(account.id))
            .unwrap()
            .iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(pending, vec![ids[0], ids[2]]);

        let listed: Vec<i64> = store
            .get_orders(account.id, None, Some(2))
            .unwrap()
            .iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(listed, vec![ids[2], ids[1]]);
    }

    #[test]
    fn snapshots_upsert_by_date_and_query_chronologically() {
        let mut store = MemoryStore::new();
        store.upsert_snapshot(&snapshot(1, 2, 100.0)).unwrap();
        store.upsert_snapshot(&snapshot(1, 1, 90.0)).unwrap();
        store.upsert_snapshot(&snapshot(1, 3, 110.0)).unwrap();
        store.upsert_snapshot(&snapshot(1, 3, 120.0)).unwrap();
        store.upsert_snapshot(&snapshot(2, 3, 5.0)).unwrap();

        let recent = store.get_snapshots(1, 2).unwrap();
        let values: Vec<f64> = recent.iter().map(|s| s.total_value).collect();
        assert_eq!(values, vec![100.0, 120.0]);

        let before = store.get_latest_snapshot_before(1, date(3)).unwrap().unwrap();
        assert_eq!(before.snapshot_date, date(2));
        assert!(store.get_latest_snapshot_before(1, date(1)).unwrap().is_none());
    }

    fn pending_buy(store: &mut MemoryStore, account_id: i64, instrument_id: i64, quantity: i64) -> Order {
        store
            .insert_order(&NewOrder {
                account_id,
                instrument_id,
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity,
                limit_price: None,
                notes: None,
            })
            .unwrap()
    }

    fn fill_of(order: &Order, quantity: i64, price: f64) -> OrderFill {
        OrderFill {
            order_id: order.id,
            fill_price: price,
            filled_quantity: quantity,
            commission: 0.0,
            realized_pnl: None,
            filled_date: date(1),
        }
    }

    fn holding(account_id: i64, instrument_id: i64, quantity: i64, price: f64) -> PaperPosition {
        PaperPosition {
            account_id,
            instrument_id,
            symbol: "AAA".to_string(),
            quantity,
            avg_entry_price: price,
            current_price: Some(price),
            realized_pnl: 0.0,
        }
    }

    #[test]
    fn filling_less_than_requested_marks_partial() {
        let mut store = MemoryStore::new();
        let instrument = store.add_instrument("AAA", None);
        let account = store.create_account("main", 100.0).unwrap();
        let order = pending_buy(&mut store, account.id, instrument, 10);

        store
            .apply_fill(&fill_of(&order, 4, 5.0), 80.0, &holding(account.id, instrument, 4, 5.0))
            .unwrap();
        let stored = store.get_order(order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Partial);
        assert_eq!(stored.filled_quantity, 4);
        assert_eq!(store.get_account(account.id).unwrap().unwrap().cash_balance, 80.0);
        assert_eq!(store.get_position(account.id, instrument).unwrap().unwrap().quantity, 4);
    }

    #[test]
    fn failed_fill_changes_nothing() {
        let mut store = MemoryStore::new();
        let instrument = store.add_instrument("AAA", None);
        let account = store.create_account("main", 100.0).unwrap();
        let order = pending_buy(&mut store, account.id, instrument, 10);

        // Unknown account: the order stays pending and no position appears.
        let err = store
            .apply_fill(&fill_of(&order, 10, 5.0), 50.0, &holding(999, instrument, 10, 5.0))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::AccountNotFound(999))
        ));
        assert_eq!(store.get_order(order.id).unwrap().unwrap().status, OrderStatus::Pending);
        assert!(store.get_position(999, instrument).unwrap().is_none());

        store
            .apply_fill(&fill_of(&order, 10, 5.0), 50.0, &holding(account.id, instrument, 10, 5.0))
            .unwrap();
        // A second fill of the same order is refused and cash is debited once.
        let err = store
            .apply_fill(&fill_of(&order, 10, 5.0), 0.0, &holding(account.id, instrument, 20, 5.0))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::OrderNotPending(id)) if *id == order.id
        ));
        assert_eq!(store.get_account(account.id).unwrap().unwrap().cash_balance, 50.0);
        assert_eq!(store.get_position(account.id, instrument).unwrap().unwrap().quantity, 10);
    }

    #[test]
    fn filled_orders_cannot_be_cancelled() {
        let mut store = MemoryStore::new();
        let instrument = store.add_instrument("AAA", None);
        let account = store.create_account("main", 100.0).unwrap();
        let order = pending_buy(&mut store, account.id, instrument, 10);
        store
            .apply_fill(&fill_of(&order, 10, 5.0), 50.0, &holding(account.id, instrument, 10, 5.0))
            .unwrap();

        assert!(!store.mark_order_cancelled(order.id).unwrap());
        assert_eq!(store.get_order(order.id).unwrap().unwrap().status, OrderStatus::Filled);
        assert!(store.mark_order_cancelled(12345).is_err());
    }
}
