use crate::error::EngineError;
use crate::models::*;
use crate::store::TradingStore;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{debug, error};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::runtime::{Builder, Runtime};
use tokio_postgres::{Client, NoTls, Row};

pub const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

const ORDER_SELECT: &str = "SELECT o.id, o.account_id, o.instrument_id, i.symbol, o.side, o.order_type, o.quantity,
        o.limit_price, o.status, o.filled_quantity, o.filled_avg_price, o.commission, o.realized_pnl,
        o.filled_date, o.notes
     FROM paper_orders o
     JOIN instruments i ON i.id = o.instrument_id";

const POSITION_SELECT: &str = "SELECT p.account_id, p.instrument_id, i.symbol, p.quantity, p.avg_entry_price,
        p.current_price, p.realized_pnl
     FROM paper_positions p
     JOIN instruments i ON i.id = p.instrument_id";

const SNAPSHOT_SELECT: &str = "SELECT account_id, snapshot_date, cash_balance, positions_value, total_value,
        daily_pnl, daily_return, positions_detail
     FROM portfolio_snapshots";

const PRICE_SELECT: &str =
    "SELECT instrument_id, date, open, high, low, close, volume, adjusted_close FROM daily_prices";

/// Postgres-backed store. The async client is driven by a private
/// current-thread runtime so every call blocks until the query completes.
pub struct Database {
    runtime: Runtime,
    client: Client,
}

impl Database {
    pub fn connect<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start database runtime")?;

        let (client, connection) = runtime
            .block_on(tokio_postgres::connect(&database_url, NoTls))
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        runtime.spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { runtime, client })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Create any missing tables and indexes.
    pub fn ensure_schema(&self) -> Result<()> {
        self.block_on(self.client.batch_execute(SCHEMA_SQL))
            .context("failed to apply database schema")?;
        debug!("Database schema is up to date");
        Ok(())
    }

    fn query_orders(&self, where_clause: &str, params: &[&(dyn tokio_postgres::types::ToSql + Sync)]) -> Result<Vec<Order>> {
        let sql = format!("{} {}", ORDER_SELECT, where_clause);
        let rows = self.block_on(self.client.query(sql.as_str(), params))?;
        rows.iter().map(map_order_row).collect()
    }
}

impl TradingStore for Database {
    fn get_instrument(&self, instrument_id: i64) -> Result<Option<Instrument>> {
        let row = self.block_on(self.client.query_opt(
            "SELECT id, symbol, name, is_active FROM instruments WHERE id = $1",
            &[&instrument_id],
        ))?;
        Ok(row.as_ref().map(map_instrument_row))
    }

    fn get_instrument_by_symbol(&self, symbol: &str) -> Result<Option<Instrument>> {
        let row = self.block_on(self.client.query_opt(
            "SELECT id, symbol, name, is_active FROM instruments WHERE UPPER(symbol) = UPPER($1)",
            &[&symbol],
        ))?;
        Ok(row.as_ref().map(map_instrument_row))
    }

    fn get_active_instruments(&self) -> Result<Vec<Instrument>> {
        let rows = self.block_on(self.client.query(
            "SELECT id, symbol, name, is_active FROM instruments WHERE is_active ORDER BY id",
            &[],
        ))?;
        Ok(rows.iter().map(map_instrument_row).collect())
    }

    fn get_price_history_range(
        &self,
        instrument_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<i64, Vec<PriceBar>>> {
        let mut result: BTreeMap<i64, Vec<PriceBar>> = BTreeMap::new();
        if instrument_ids.is_empty() || start > end {
            return Ok(result);
        }
        let sql = format!(
            "{} WHERE instrument_id = ANY($1) AND date BETWEEN $2 AND $3 ORDER BY instrument_id, date",
            PRICE_SELECT
        );
        let ids = instrument_ids.to_vec();
        let rows = self.block_on(self.client.query(sql.as_str(), &[&ids, &start, &end]))?;
        for row in &rows {
            let bar = map_price_row(row)?;
            result.entry(bar.instrument_id).or_default().push(bar);
        }
        Ok(result)
    }

    fn get_prices_for_date(&self, date: NaiveDate) -> Result<Vec<PriceBar>> {
        let sql = format!("{} WHERE date = $1 ORDER BY instrument_id", PRICE_SELECT);
        let rows = self.block_on(self.client.query(sql.as_str(), &[&date]))?;
        rows.iter().map(map_price_row).collect()
    }

    fn get_latest_price(&self, instrument_id: i64) -> Result<Option<PriceBar>> {
        let sql = format!(
            "{} WHERE instrument_id = $1 ORDER BY date DESC LIMIT 1",
            PRICE_SELECT
        );
        let row = self.block_on(self.client.query_opt(sql.as_str(), &[&instrument_id]))?;
        row.as_ref().map(map_price_row).transpose()
    }

    fn get_or_create_strategy(
        &mut self,
        name: &str,
        description: Option<&str>,
        version: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<i64> {
        let parameters_json = serde_json::to_value(parameters)?;
        let row = self.block_on(self.client.query_one(
            "INSERT INTO strategies (name, description, version, parameters)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name, version) DO UPDATE SET
                description = COALESCE(EXCLUDED.description, strategies.description),
                parameters = EXCLUDED.parameters
             RETURNING id",
            &[&name, &description, &version, &parameters_json],
        ))?;
        Ok(row.get(0))
    }

    fn create_backtest_run(&mut self, run: &NewBacktestRun) -> Result<i64> {
        let parameters_json = serde_json::to_value(&run.parameters)?;
        let row = self.block_on(self.client.query_one(
            "INSERT INTO backtest_runs (strategy_id, name, start_date, end_date, initial_capital, status, parameters)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
            &[
                &run.strategy_id,
                &run.name,
                &run.start_date,
                &run.end_date,
                &run.initial_capital,
                &RunStatus::Running.as_str(),
                &parameters_json,
            ],
        ))?;
        Ok(row.get(0))
    }

    fn complete_backtest_run(
        &mut self,
        run_id: i64,
        final_capital: f64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let updated = self.block_on(self.client.execute(
            "UPDATE backtest_runs
             SET final_capital = $2, status = $3, error_message = $4, completed_at = NOW()
             WHERE id = $1",
            &[&run_id, &final_capital, &status.as_str(), &error_message],
        ))?;
        if updated == 0 {
            return Err(anyhow!("Backtest run {} not found", run_id));
        }
        Ok(())
    }

    fn insert_backtest_trades(&mut self, run_id: i64, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let Database { runtime, client } = self;
        runtime.block_on(async {
            let tx = client.transaction().await?;
            let statement = tx
                .prepare(
                    "INSERT INTO backtest_trades (run_id, instrument_id, entry_date, entry_price, exit_date, exit_price,
                        quantity, side, pnl, pnl_percent, commission, exit_reason)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                )
                .await?;
            for trade in trades {
                tx.execute(
                    &statement,
                    &[
                        &run_id,
                        &trade.instrument_id,
                        &trade.entry_date,
                        &trade.entry_price,
                        &trade.exit_date,
                        &trade.exit_price,
                        &trade.quantity,
                        &trade.side.as_str(),
                        &trade.pnl,
                        &trade.pnl_percent,
                        &trade.commission,
                        &trade.exit_reason,
                    ],
                )
                .await?;
            }
            tx.commit().await?;
            Ok::<(), anyhow::Error>(())
        })
        .with_context(|| format!("failed to insert {} trades for run {}", trades.len(), run_id))
    }

    fn insert_backtest_metrics(&mut self, run_id: i64, metrics: &BacktestMetrics) -> Result<()> {
        self.block_on(self.client.execute(
            "INSERT INTO backtest_metrics (run_id, total_return, annualized_return, sharpe_ratio, sortino_ratio,
                max_drawdown, max_drawdown_duration, win_rate, profit_factor, total_trades, winning_trades,
                losing_trades, avg_win, avg_loss, largest_win, largest_loss, avg_holding_period_days,
                exposure_time, trading_days)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
             ON CONFLICT (run_id) DO UPDATE SET
                total_return = EXCLUDED.total_return,
                annualized_return = EXCLUDED.annualized_return,
                sharpe_ratio = EXCLUDED.sharpe_ratio,
                sortino_ratio = EXCLUDED.sortino_ratio,
                max_drawdown = EXCLUDED.max_drawdown,
                max_drawdown_duration = EXCLUDED.max_drawdown_duration,
                win_rate = EXCLUDED.win_rate,
                profit_factor = EXCLUDED.profit_factor,
                total_trades = EXCLUDED.total_trades,
                winning_trades = EXCLUDED.winning_trades,
                losing_trades = EXCLUDED.losing_trades,
                avg_win = EXCLUDED.avg_win,
                avg_loss = EXCLUDED.avg_loss,
                largest_win = EXCLUDED.largest_win,
                largest_loss = EXCLUDED.largest_loss,
                avg_holding_period_days = EXCLUDED.avg_holding_period_days,
                exposure_time = EXCLUDED.exposure_time,
                trading_days = EXCLUDED.trading_days",
            &[
                &run_id,
                &metrics.total_return,
                &metrics.annualized_return,
                &metrics.sharpe_ratio,
                &metrics.sortino_ratio,
                &metrics.max_drawdown,
                &(metrics.max_drawdown_duration as i64),
                &metrics.win_rate,
                &metrics.profit_factor,
                &(metrics.total_trades as i64),
                &(metrics.winning_trades as i64),
                &(metrics.losing_trades as i64),
                &metrics.avg_win,
                &metrics.avg_loss,
                &metrics.largest_win,
                &metrics.largest_loss,
                &metrics.avg_holding_period_days,
                &metrics.exposure_time,
                &(metrics.trading_days as i64),
            ],
        ))?;
        Ok(())
    }

    fn create_account(&mut self, name: &str, initial_balance: f64) -> Result<Account> {
        let row = self.block_on(self.client.query_one(
            "INSERT INTO paper_accounts (name, initial_balance, cash_balance)
             VALUES ($1, $2, $2)
             RETURNING id, name, cash_balance, initial_balance",
            &[&name, &initial_balance],
        ))?;
        Ok(map_account_row(&row))
    }

    fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        let row = self.block_on(self.client.query_opt(
            "SELECT id, name, cash_balance, initial_balance FROM paper_accounts WHERE id = $1",
            &[&account_id],
        ))?;
        Ok(row.as_ref().map(map_account_row))
    }

    fn get_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        let row = self.block_on(self.client.query_opt(
            "SELECT id, name, cash_balance, initial_balance FROM paper_accounts WHERE name = $1",
            &[&name],
        ))?;
        Ok(row.as_ref().map(map_account_row))
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = self.block_on(self.client.query(
            "SELECT id, name, cash_balance, initial_balance FROM paper_accounts ORDER BY id",
            &[],
        ))?;
        Ok(rows.iter().map(map_account_row).collect())
    }

    fn update_account_balance(&mut self, account_id: i64, cash_balance: f64) -> Result<()> {
        let updated = self.block_on(self.client.execute(
            "UPDATE paper_accounts SET cash_balance = $2 WHERE id = $1",
            &[&account_id, &cash_balance],
        ))?;
        if updated == 0 {
            return Err(EngineError::AccountNotFound(account_id).into());
        }
        Ok(())
    }

    fn insert_order(&mut self, order: &NewOrder) -> Result<Order> {
        let row = self.block_on(self.client.query_one(
            "INSERT INTO paper_orders (account_id, instrument_id, side, order_type, quantity, limit_price, status, notes)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
            &[
                &order.account_id,
                &order.instrument_id,
                &order.side.as_str(),
                &order.order_type.as_str(),
                &order.quantity,
                &order.limit_price,
                &OrderStatus::Pending.as_str(),
                &order.notes,
            ],
        ))?;
        let order_id: i64 = row.get(0);
        self.get_order(order_id)?
            .ok_or_else(|| EngineError::OrderNotFound(order_id).into())
    }

    fn get_order(&self, order_id: i64) -> Result<Option<Order>> {
        Ok(self.query_orders("WHERE o.id = $1", &[&order_id])?.into_iter().next())
    }

    fn get_pending_orders(&self, account_id: Option<i64>) -> Result<Vec<Order>> {
        self.query_orders(
            "WHERE o.status = 'pending' AND ($1::BIGINT IS NULL OR o.account_id = $1) ORDER BY o.id",
            &[&account_id],
        )
    }

    fn get_orders(
        &self,
        account_id: i64,
        status: Option<OrderStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Order>> {
        let status = status.map(|status| status.as_str());
        let limit = limit.map(|limit| limit as i64);
        self.query_orders(
            "WHERE o.account_id = $1 AND ($2::TEXT IS NULL OR o.status = $2)
             ORDER BY o.id DESC
             LIMIT $3",
            &[&account_id, &status, &limit],
        )
    }

    fn apply_fill(
        &mut self,
        fill: &OrderFill,
        cash_balance: f64,
        position: &PaperPosition,
    ) -> Result<()> {
        let order_id = fill.order_id;
        let account_id = position.account_id;
        let Database { runtime, client } = self;
        runtime
            .block_on(async {
                let tx = client.transaction().await?;
                let updated = tx
                    .execute(
                        "UPDATE paper_orders
                         SET status = CASE WHEN $2 < quantity THEN 'partial' ELSE 'filled' END,
                             filled_quantity = $2,
                             filled_avg_price = $3,
                             commission = $4,
                             realized_pnl = $5,
                             filled_date = $6
                         WHERE id = $1 AND status = 'pending'",
                        &[
                            &order_id,
                            &fill.filled_quantity,
                            &fill.fill_price,
                            &fill.commission,
                            &fill.realized_pnl,
                            &fill.filled_date,
                        ],
                    )
                    .await?;
                if updated == 0 {
                    return Err(anyhow::Error::from(EngineError::OrderNotPending(order_id)));
                }

                let updated = tx
                    .execute(
                        "UPDATE paper_accounts SET cash_balance = $2 WHERE id = $1",
                        &[&account_id, &cash_balance],
                    )
                    .await?;
                if updated == 0 {
                    return Err(anyhow::Error::from(EngineError::AccountNotFound(account_id)));
                }

                tx.execute(
                    "INSERT INTO paper_positions (account_id, instrument_id, quantity, avg_entry_price, current_price, realized_pnl)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (account_id, instrument_id) DO UPDATE SET
                        quantity = EXCLUDED.quantity,
                        avg_entry_price = EXCLUDED.avg_entry_price,
                        current_price = EXCLUDED.current_price,
                        realized_pnl = EXCLUDED.realized_pnl,
                        updated_at = NOW()",
                    &[
                        &account_id,
                        &position.instrument_id,
                        &position.quantity,
                        &position.avg_entry_price,
                        &position.current_price,
                        &position.realized_pnl,
                    ],
                )
                .await?;
                tx.commit().await?;
                Ok::<(), anyhow::Error>(())
            })
            .with_context(|| format!("failed to apply fill for order {}", order_id))
    }

    fn mark_order_cancelled(&mut self, order_id: i64) -> Result<bool> {
        let updated = self.block_on(self.client.execute(
            "UPDATE paper_orders SET status = 'cancelled' WHERE id = $1 AND status = 'pending'",
            &[&order_id],
        ))?;
        if updated > 0 {
            return Ok(true);
        }
        match self.get_order(order_id)? {
            Some(_) => Ok(false),
            None => Err(EngineError::OrderNotFound(order_id).into()),
        }
    }

    fn get_position(&self, account_id: i64, instrument_id: i64) -> Result<Option<PaperPosition>> {
        let sql = format!("{} WHERE p.account_id = $1 AND p.instrument_id = $2", POSITION_SELECT);
        let row = self.block_on(self.client.query_opt(sql.as_str(), &[&account_id, &instrument_id]))?;
        row.as_ref().map(map_position_row).transpose()
    }

    fn get_positions(&self, account_id: i64, include_closed: bool) -> Result<Vec<PaperPosition>> {
        let sql = format!(
            "{} WHERE p.account_id = $1 AND ($2 OR p.quantity > 0) ORDER BY p.instrument_id",
            POSITION_SELECT
        );
        let rows = self.block_on(self.client.query(sql.as_str(), &[&account_id, &include_closed]))?;
        rows.iter().map(map_position_row).collect()
    }

    fn upsert_position(&mut self, position: &PaperPosition) -> Result<()> {
        self.block_on(self.client.execute(
            "INSERT INTO paper_positions (account_id, instrument_id, quantity, avg_entry_price, current_price, realized_pnl)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (account_id, instrument_id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                avg_entry_price = EXCLUDED.avg_entry_price,
                current_price = EXCLUDED.current_price,
                realized_pnl = EXCLUDED.realized_pnl,
                updated_at = NOW()",
            &[
                &position.account_id,
                &position.instrument_id,
                &position.quantity,
                &position.avg_entry_price,
                &position.current_price,
                &position.realized_pnl,
            ],
        ))?;
        Ok(())
    }

    fn upsert_snapshot(&mut self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let detail_json = serde_json::to_value(&snapshot.positions_detail)?;
        self.block_on(self.client.execute(
            "INSERT INTO portfolio_snapshots (account_id, snapshot_date, cash_balance, positions_value, total_value,
                daily_pnl, daily_return, positions_detail)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (account_id, snapshot_date) DO UPDATE SET
                cash_balance = EXCLUDED.cash_balance,
                positions_value = EXCLUDED.positions_value,
                total_value = EXCLUDED.total_value,
                daily_pnl = EXCLUDED.daily_pnl,
                daily_return = EXCLUDED.daily_return,
                positions_detail = EXCLUDED.positions_detail",
            &[
                &snapshot.account_id,
                &snapshot.snapshot_date,
                &snapshot.cash_balance,
                &snapshot.positions_value,
                &snapshot.total_value,
                &snapshot.daily_pnl,
                &snapshot.daily_return,
                &detail_json,
            ],
        ))?;
        Ok(())
    }

    fn get_snapshots(&self, account_id: i64, limit: usize) -> Result<Vec<PortfolioSnapshot>> {
        let sql = format!(
            "{} WHERE account_id = $1 ORDER BY snapshot_date DESC LIMIT $2",
            SNAPSHOT_SELECT
        );
        let rows = self.block_on(self.client.query(sql.as_str(), &[&account_id, &(limit as i64)]))?;
        let mut snapshots = rows
            .iter()
            .map(map_snapshot_row)
            .collect::<Result<Vec<_>>>()?;
        snapshots.reverse();
        Ok(snapshots)
    }

    fn get_latest_snapshot_before(
        &self,
        account_id: i64,
        date: NaiveDate,
    ) -> Result<Option<PortfolioSnapshot>> {
        let sql = format!(
            "{} WHERE account_id = $1 AND snapshot_date < $2 ORDER BY snapshot_date DESC LIMIT 1",
            SNAPSHOT_SELECT
        );
        let row = self.block_on(self.client.query_opt(sql.as_str(), &[&account_id, &date]))?;
        row.as_ref().map(map_snapshot_row).transpose()
    }
}

fn map_instrument_row(row: &Row) -> Instrument {
    Instrument {
        id: row.get(0),
        symbol: row.get(1),
        name: row.get(2),
        active: row.get(3),
    }
}

fn map_account_row(row: &Row) -> Account {
    Account {
        id: row.get(0),
        name: row.get(1),
        cash_balance: row.get(2),
        initial_balance: row.get(3),
    }
}

fn map_price_row(row: &Row) -> Result<PriceBar> {
    let bar = PriceBar {
        instrument_id: row.get(0),
        date: row.get(1),
        open: row.get(2),
        high: row.get(3),
        low: row.get(4),
        close: row.get(5),
        volume: row.get(6),
        adjusted_close: row.get(7),
    };
    validate_price_bar(&bar)?;
    Ok(bar)
}

/// Bars entering the engines must carry a usable close.
pub fn validate_price_bar(bar: &PriceBar) -> Result<(), EngineError> {
    if !bar.close.is_finite() || bar.close <= 0.0 {
        return Err(EngineError::invalid_record(
            "price bar",
            format!(
                "instrument {} on {} has close {}",
                bar.instrument_id, bar.date, bar.close
            ),
        ));
    }
    if let (Some(high), Some(low)) = (bar.high, bar.low) {
        if high < low {
            return Err(EngineError::invalid_record(
                "price bar",
                format!(
                    "instrument {} on {} has high {} below low {}",
                    bar.instrument_id, bar.date, high, low
                ),
            ));
        }
    }
    Ok(())
}

fn parse_field<T>(entity: &'static str, raw: &str) -> Result<T, EngineError>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    raw.parse::<T>()
        .map_err(|err| EngineError::invalid_record(entity, err.to_string()))
}

fn map_order_row(row: &Row) -> Result<Order> {
    let side: String = row.get(4);
    let order_type: String = row.get(5);
    let status: String = row.get(8);
    let order = Order {
        id: row.get(0),
        account_id: row.get(1),
        instrument_id: row.get(2),
        symbol: row.get(3),
        side: parse_field("order", &side)?,
        order_type: parse_field("order", &order_type)?,
        quantity: row.get(6),
        limit_price: row.get(7),
        status: parse_field("order", &status)?,
        filled_quantity: row.get(9),
        filled_avg_price: row.get(10),
        commission: row.get(11),
        realized_pnl: row.get(12),
        filled_date: row.get(13),
        notes: row.get(14),
    };
    if order.quantity <= 0 {
        return Err(EngineError::invalid_record(
            "order",
            format!("order {} has quantity {}", order.id, order.quantity),
        )
        .into());
    }
    Ok(order)
}

fn map_position_row(row: &Row) -> Result<PaperPosition> {
    let position = PaperPosition {
        account_id: row.get(0),
        instrument_id: row.get(1),
        symbol: row.get(2),
        quantity: row.get(3),
        avg_entry_price: row.get(4),
        current_price: row.get(5),
        realized_pnl: row.get(6),
    };
    if position.quantity < 0 {
        return Err(EngineError::invalid_record(
            "position",
            format!(
                "account {} instrument {} has quantity {}",
                position.account_id, position.instrument_id, position.quantity
            ),
        )
        .into());
    }
    Ok(position)
}

fn map_snapshot_row(row: &Row) -> Result<PortfolioSnapshot> {
    let detail_json: Value = row.get(7);
    let positions_detail: Vec<PositionDetail> = serde_json::from_value(detail_json)
        .map_err(|err| EngineError::invalid_record("snapshot", format!("positions_detail: {}", err)))?;
    Ok(PortfolioSnapshot {
        account_id: row.get(0),
        snapshot_date: row.get(1),
        cash_balance: row.get(2),
        positions_value: row.get(3),
        total_value: row.get(4),
        daily_pnl: row.get(5),
        daily_return: row.get(6),
        positions_detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64, high: Option<f64>, low: Option<f64>) -> PriceBar {
        PriceBar {
            instrument_id: 3,
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            open: None,
            high,
            low,
            close,
            volume: 0,
            adjusted_close: None,
        }
    }

    #[test]
    fn price_bars_need_a_positive_close() {
        assert!(validate_price_bar(&bar(10.0, Some(11.0), Some(9.0))).is_ok());
        assert!(validate_price_bar(&bar(10.0, None, None)).is_ok());
        let err = validate_price_bar(&bar(0.0, None, None)).unwrap_err();
        assert!(err.to_string().starts_with("Invalid price bar record"));
        assert!(validate_price_bar(&bar(f64::NAN, None, None)).is_err());
        assert!(validate_price_bar(&bar(10.0, Some(9.0), Some(11.0))).is_err());
    }

    #[test]
    fn unknown_enum_text_is_an_invalid_record() {
        let err = parse_field::<OrderStatus>("order", "expired").unwrap_err();
        match err {
            EngineError::InvalidRecord { entity, message } => {
                assert_eq!(entity, "order");
                assert!(message.contains("expired"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(parse_field::<OrderSide>("order", "SELL").unwrap(), OrderSide::Sell);
    }

    #[test]
    fn schema_declares_every_table() {
        for table in [
            "instruments",
            "daily_prices",
            "strategies",
            "backtest_runs",
            "backtest_trades",
            "backtest_metrics",
            "paper_accounts",
            "paper_orders",
            "paper_positions",
            "portfolio_snapshots",
        ] {
            assert!(
                SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table)),
                "missing table {}",
                table
            );
        }
    }
}
