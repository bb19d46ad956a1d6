use crate::config::FillCosts;
use crate::error::EngineError;
use crate::models::*;
use crate::store::TradingStore;
use crate::trading_rules::{buy_fill, sell_fill, weighted_average_price};
use anyhow::Result;
use chrono::{Local, NaiveDate};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;

pub const FILLED_MESSAGE: &str = "Filled at EOD close";

/// What happened to one pending order during an execution pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillResult {
    pub order_id: i64,
    pub account_id: i64,
    pub instrument_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub fill_price: f64,
    pub total_value: f64,
    pub commission: f64,
    pub realized_pnl: Option<f64>,
    pub rejection: Option<Rejection>,
    pub message: String,
}

impl FillResult {
    pub fn is_success(&self) -> bool {
        self.rejection.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub execution_date: NaiveDate,
    pub orders_processed: usize,
    pub orders_filled: usize,
    pub orders_rejected: usize,
    pub total_buy_value: f64,
    pub total_sell_value: f64,
    pub fills: Vec<FillResult>,
}

/// A fill that passed every check and is ready to be written.
struct PlannedFill {
    fill_price: f64,
    total_value: f64,
    commission: f64,
    cash_after: f64,
    position: PaperPosition,
    realized_pnl: Option<f64>,
}

/// Matches pending paper orders against one day's bars.
pub struct EodExecutor<'a, S: TradingStore + ?Sized> {
    store: &'a mut S,
    costs: FillCosts,
}

impl<'a, S: TradingStore + ?Sized> EodExecutor<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self {
            store,
            costs: FillCosts::default(),
        }
    }

    pub fn with_costs(mut self, costs: FillCosts) -> Result<Self> {
        costs.validate()?;
        self.costs = costs;
        Ok(self)
    }

    /// Process every pending order (optionally for one account) in submission
    /// order against the bars of `execution_date`, defaulting to today.
    /// Rejected orders stay pending.
    pub fn execute_orders(
        &mut self,
        execution_date: Option<NaiveDate>,
        account_id: Option<i64>,
    ) -> Result<ExecutionSummary> {
        let execution_date = execution_date.unwrap_or_else(|| Local::now().date_naive());
        let pending = self.store.get_pending_orders(account_id)?;
        let prices: HashMap<i64, PriceBar> = self
            .store
            .get_prices_for_date(execution_date)?
            .into_iter()
            .map(|bar| (bar.instrument_id, bar))
            .collect();

        debug!(
            "Executing {} pending orders against {} bars for {}",
            pending.len(),
            prices.len(),
            execution_date
        );

        let mut summary = ExecutionSummary {
            execution_date,
            orders_processed: pending.len(),
            orders_filled: 0,
            orders_rejected: 0,
            total_buy_value: 0.0,
            total_sell_value: 0.0,
            fills: Vec::with_capacity(pending.len()),
        };

        for order in &pending {
            let result = self.process_order(order, prices.get(&order.instrument_id), execution_date)?;
            if result.is_success() {
                summary.orders_filled += 1;
                match result.side {
                    OrderSide::Buy => summary.total_buy_value += result.total_value,
                    OrderSide::Sell => summary.total_sell_value += result.total_value,
                }
            } else {
                summary.orders_rejected += 1;
            }
            summary.fills.push(result);
        }

        info!(
            "EOD execution for {}: {} processed, {} filled, {} rejected (buys {:.2}, sells {:.2})",
            execution_date,
            summary.orders_processed,
            summary.orders_filled,
            summary.orders_rejected,
            summary.total_buy_value,
            summary.total_sell_value
        );
        Ok(summary)
    }

    fn process_order(
        &mut self,
        order: &Order,
        bar: Option<&PriceBar>,
        execution_date: NaiveDate,
    ) -> Result<FillResult> {
        let planned = match self.plan_fill(order, bar, execution_date)? {
            Outcome::Accepted(planned) => planned,
            Outcome::Rejected(rejection) => {
                info!(
                    "Order {} ({} {} x {}) rejected: {}",
                    order.id, order.side, order.quantity, order.symbol, rejection.message
                );
                return Ok(rejected_result(order, rejection));
            }
        };

        // Validation is complete; order, cash and position are written together.
        let fill = OrderFill {
            order_id: order.id,
            fill_price: planned.fill_price,
            filled_quantity: order.quantity,
            commission: planned.commission,
            realized_pnl: planned.realized_pnl,
            filled_date: execution_date,
        };
        if let Err(err) = self
            .store
            .apply_fill(&fill, planned.cash_after, &planned.position)
        {
            if let Some(EngineError::OrderNotPending(_)) = err.downcast_ref::<EngineError>() {
                warn!("Order {} was no longer pending at fill time", order.id);
                return Ok(rejected_result(
                    order,
                    Rejection::new(RejectionReason::OrderNotPending, "Order is no longer pending"),
                ));
            }
            return Err(err);
        }

        info!(
            "Filled order {}: {} {} x {} @ {:.4}",
            order.id, order.side, order.quantity, order.symbol, planned.fill_price
        );

        Ok(FillResult {
            order_id: order.id,
            account_id: order.account_id,
            instrument_id: order.instrument_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            fill_price: planned.fill_price,
            total_value: planned.total_value,
            commission: planned.commission,
            realized_pnl: planned.realized_pnl,
            rejection: None,
            message: FILLED_MESSAGE.to_string(),
        })
    }

    fn plan_fill(
        &self,
        order: &Order,
        bar: Option<&PriceBar>,
        execution_date: NaiveDate,
    ) -> Result<Outcome<PlannedFill>> {
        let Some(bar) = bar else {
            return Ok(Outcome::rejected(
                RejectionReason::NoPriceData,
                format!("No price data for {}", execution_date),
            ));
        };

        // Limit orders fill at exactly the limit, without slippage.
        let (quote, costs) = match (order.order_type, order.limit_price) {
            (OrderType::Limit, Some(limit)) => {
                if !limit_reached(order.side, limit, bar) {
                    return Ok(Outcome::rejected(
                        RejectionReason::LimitNotReached,
                        format!("Limit price {:.2} not reached", limit),
                    ));
                }
                (
                    limit,
                    FillCosts {
                        slippage_rate: 0.0,
                        ..self.costs
                    },
                )
            }
            _ => (bar.close, self.costs),
        };

        let Some(account) = self.store.get_account(order.account_id)? else {
            return Ok(Outcome::rejected(
                RejectionReason::AccountNotFound,
                "Account not found",
            ));
        };
        let existing = self.store.get_position(order.account_id, order.instrument_id)?;
        let carried_pnl = existing.as_ref().map(|p| p.realized_pnl).unwrap_or(0.0);

        let planned = match order.side {
            OrderSide::Buy => {
                let fill = buy_fill(quote, order.quantity, &costs);
                if account.cash_balance < fill.total_cost {
                    return Ok(Outcome::rejected(
                        RejectionReason::InsufficientCash,
                        format!(
                            "Insufficient cash: need {:.2}, have {:.2}",
                            fill.total_cost, account.cash_balance
                        ),
                    ));
                }
                let position = match existing.filter(PaperPosition::is_open) {
                    Some(current) => PaperPosition {
                        quantity: current.quantity + order.quantity,
                        avg_entry_price: weighted_average_price(
                            current.quantity,
                            current.avg_entry_price,
                            order.quantity,
                            fill.execution_price,
                        ),
                        current_price: Some(bar.close),
                        ..current
                    },
                    None => PaperPosition {
                        account_id: order.account_id,
                        instrument_id: order.instrument_id,
                        symbol: order.symbol.clone(),
                        quantity: order.quantity,
                        avg_entry_price: fill.execution_price,
                        current_price: Some(bar.close),
                        realized_pnl: carried_pnl,
                    },
                };
                PlannedFill {
                    fill_price: fill.execution_price,
                    total_value: fill.cost,
                    commission: fill.commission,
                    cash_after: account.cash_balance - fill.total_cost,
                    position,
                    realized_pnl: None,
                }
            }
            OrderSide::Sell => {
                let held = existing.as_ref().map(|p| p.quantity).unwrap_or(0);
                let Some(current) = existing.filter(|p| p.quantity >= order.quantity) else {
                    return Ok(Outcome::rejected(
                        RejectionReason::InsufficientPosition,
                        format!(
                            "Insufficient position: need {}, have {}",
                            order.quantity, held
                        ),
                    ));
                };
                let fill = sell_fill(quote, order.quantity, &costs);
                let realized =
                    fill.net_proceeds - current.avg_entry_price * order.quantity as f64;
                PlannedFill {
                    fill_price: fill.execution_price,
                    total_value: fill.gross_proceeds,
                    commission: fill.commission,
                    cash_after: account.cash_balance + fill.net_proceeds,
                    position: PaperPosition {
                        quantity: current.quantity - order.quantity,
                        current_price: Some(bar.close),
                        realized_pnl: current.realized_pnl + realized,
                        ..current
                    },
                    realized_pnl: Some(realized),
                }
            }
        };
        Ok(Outcome::Accepted(planned))
    }
}

/// A buy limit needs the day's low at or below the limit, a sell limit needs
/// the high at or above it. Missing high/low fall back to the close.
pub fn limit_reached(side: OrderSide, limit_price: f64, bar: &PriceBar) -> bool {
    match side {
        OrderSide::Buy => bar.low_or_close() <= limit_price,
        OrderSide::Sell => bar.high_or_close() >= limit_price,
    }
}

fn rejected_result(order: &Order, rejection: Rejection) -> FillResult {
    FillResult {
        order_id: order.id,
        account_id: order.account_id,
        instrument_id: order.instrument_id,
        symbol: order.symbol.clone(),
        side: order.side,
        quantity: order.quantity,
        fill_price: 0.0,
        total_value: 0.0,
        commission: 0.0,
        realized_pnl: None,
        message: rejection.message.clone(),
        rejection: Some(rejection),
    }
}
