use crate::error::EngineError;
use crate::models::*;
use crate::store::TradingStore;
use anyhow::Result;
use chrono::NaiveDate;
use log::info;
use serde::Serialize;
use std::collections::HashMap;

pub const METRICS_SNAPSHOT_LIMIT: usize = 500;
pub const DEFAULT_EQUITY_CURVE_LIMIT: usize = 365;
const TRADE_ORDER_LIMIT: usize = 1000;

/// One day of a paper account's equity curve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquityCurvePoint {
    pub date: NaiveDate,
    pub total_value: f64,
    pub cash_balance: f64,
    pub positions_value: f64,
    pub daily_pnl: f64,
    pub daily_return: f64,
    pub cumulative_return: f64,
    pub drawdown: f64,
    pub drawdown_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawdownSummary {
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_date: Option<NaiveDate>,
    pub peak_value: f64,
    pub peak_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// None when there were no losing trades.
    pub profit_factor: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExposureStats {
    pub avg_exposure: f64,
    pub current_exposure: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioMetrics {
    pub account_id: i64,
    pub account_name: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub initial_value: f64,
    pub final_value: f64,
    pub total_return: f64,
    pub total_return_pct: f64,
    pub drawdown: DrawdownSummary,
    pub trading_days: usize,
    pub trades: TradeStats,
    pub exposure: ExposureStats,
}

/// Performance figures for a paper account, derived from its snapshots and
/// filled orders.
pub struct PortfolioAnalyzer<'a, S: TradingStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: TradingStore + ?Sized> PortfolioAnalyzer<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn compute_metrics(&self, account_id: i64) -> Result<PortfolioMetrics> {
        let account = self
            .store
            .get_account(account_id)?
            .ok_or(EngineError::AccountNotFound(account_id))?;
        let snapshots = self.store.get_snapshots(account_id, METRICS_SNAPSHOT_LIMIT)?;

        let initial_value = account.initial_balance;
        let Some(last) = snapshots.last() else {
            return Ok(empty_metrics(&account));
        };
        let final_value = last.total_value;

        let curve = build_equity_curve(&snapshots, initial_value);
        let orders = self
            .store
            .get_orders(account_id, Some(OrderStatus::Filled), Some(TRADE_ORDER_LIMIT))?;
        let positions = self.store.get_positions(account_id, true)?;

        let total_return = final_value - initial_value;
        let metrics = PortfolioMetrics {
            account_id,
            account_name: account.name.clone(),
            start_date: snapshots.first().map(|s| s.snapshot_date),
            end_date: Some(last.snapshot_date),
            initial_value,
            final_value,
            total_return,
            total_return_pct: if initial_value > 0.0 {
                total_return / initial_value
            } else {
                0.0
            },
            drawdown: calculate_drawdown(&curve),
            trading_days: snapshots.len(),
            trades: calculate_trade_stats(&orders, &positions),
            exposure: calculate_exposure(&curve),
        };

        info!(
            "Computed metrics for account {}: return {:.2}%, max drawdown {:.2}%, {} trades",
            account_id,
            metrics.total_return_pct * 100.0,
            metrics.drawdown.max_drawdown_pct * 100.0,
            metrics.trades.total_trades
        );
        Ok(metrics)
    }

    /// Most recent `limit` days of the account's equity curve, oldest first.
    pub fn get_equity_curve(&self, account_id: i64, limit: usize) -> Result<Vec<EquityCurvePoint>> {
        let account = self
            .store
            .get_account(account_id)?
            .ok_or(EngineError::AccountNotFound(account_id))?;
        let snapshots = self.store.get_snapshots(account_id, limit)?;
        Ok(build_equity_curve(&snapshots, account.initial_balance))
    }
}

fn empty_metrics(account: &Account) -> PortfolioMetrics {
    PortfolioMetrics {
        account_id: account.id,
        account_name: account.name.clone(),
        start_date: None,
        end_date: None,
        initial_value: account.initial_balance,
        final_value: account.initial_balance,
        total_return: 0.0,
        total_return_pct: 0.0,
        drawdown: DrawdownSummary {
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            max_drawdown_date: None,
            peak_value: account.initial_balance,
            peak_date: None,
        },
        trading_days: 0,
        trades: TradeStats::default(),
        exposure: ExposureStats::default(),
    }
}

/// Snapshots must be oldest first. The running peak starts at the initial
/// balance.
pub fn build_equity_curve(snapshots: &[PortfolioSnapshot], initial_value: f64) -> Vec<EquityCurvePoint> {
    let mut peak = initial_value;
    snapshots
        .iter()
        .map(|snapshot| {
            let total_value = snapshot.total_value;
            if total_value > peak {
                peak = total_value;
            }
            let drawdown = peak - total_value;
            EquityCurvePoint {
                date: snapshot.snapshot_date,
                total_value,
                cash_balance: snapshot.cash_balance,
                positions_value: snapshot.positions_value,
                daily_pnl: snapshot.daily_pnl.unwrap_or(0.0),
                daily_return: snapshot.daily_return.unwrap_or(0.0),
                cumulative_return: if initial_value > 0.0 {
                    (total_value - initial_value) / initial_value
                } else {
                    0.0
                },
                drawdown,
                drawdown_pct: if peak > 0.0 { drawdown / peak } else { 0.0 },
            }
        })
        .collect()
}

pub fn calculate_drawdown(curve: &[EquityCurvePoint]) -> DrawdownSummary {
    let Some(first) = curve.first() else {
        return DrawdownSummary {
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            max_drawdown_date: None,
            peak_value: 0.0,
            peak_date: None,
        };
    };

    let mut summary = DrawdownSummary {
        max_drawdown: 0.0,
        max_drawdown_pct: 0.0,
        max_drawdown_date: None,
        peak_value: first.total_value,
        peak_date: Some(first.date),
    };
    for point in curve {
        if point.total_value > summary.peak_value {
            summary.peak_value = point.total_value;
            summary.peak_date = Some(point.date);
        }
        if point.drawdown > summary.max_drawdown {
            summary.max_drawdown = point.drawdown;
            summary.max_drawdown_pct = point.drawdown_pct;
            summary.max_drawdown_date = Some(point.date);
        }
    }
    summary
}

/// Realized P&L of a filled sell. Orders filled before realized P&L was
/// recorded fall back to the position's average entry price.
pub(crate) fn sell_order_pnl(order: &Order, positions: &HashMap<i64, &PaperPosition>) -> Option<f64> {
    if let Some(pnl) = order.realized_pnl {
        return Some(pnl);
    }
    let position = positions.get(&order.instrument_id)?;
    let fill_price = order.filled_avg_price.unwrap_or(0.0);
    Some((fill_price - position.avg_entry_price) * order.quantity as f64)
}

pub(crate) fn positions_by_instrument(positions: &[PaperPosition]) -> HashMap<i64, &PaperPosition> {
    positions
        .iter()
        .map(|position| (position.instrument_id, position))
        .collect()
}

/// Win/loss statistics over filled sells. A zero P&L sell is a loss.
pub fn calculate_trade_stats(orders: &[Order], positions: &[PaperPosition]) -> TradeStats {
    let by_instrument = positions_by_instrument(positions);
    let (wins, losses): (Vec<f64>, Vec<f64>) = orders
        .iter()
        .filter(|order| order.side == OrderSide::Sell && order.status == OrderStatus::Filled)
        .filter_map(|order| sell_order_pnl(order, &by_instrument))
        .partition(|pnl| *pnl > 0.0);

    let total_trades = wins.len() + losses.len();
    if total_trades == 0 {
        return TradeStats::default();
    }
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().map(|pnl| pnl.abs()).sum();

    TradeStats {
        total_trades,
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        win_rate: wins.len() as f64 / total_trades as f64,
        avg_win: if wins.is_empty() {
            0.0
        } else {
            gross_profit / wins.len() as f64
        },
        avg_loss: if losses.is_empty() {
            0.0
        } else {
            gross_loss / losses.len() as f64
        },
        profit_factor: (gross_loss > 0.0).then(|| gross_profit / gross_loss),
    }
}

pub fn calculate_exposure(curve: &[EquityCurvePoint]) -> ExposureStats {
    let exposures: Vec<f64> = curve
        .iter()
        .map(|point| {
            if point.total_value > 0.0 {
                point.positions_value / point.total_value
            } else {
                0.0
            }
        })
        .collect();
    let Some(current) = exposures.last() else {
        return ExposureStats::default();
    };
    ExposureStats {
        avg_exposure: exposures.iter().sum::<f64>() / exposures.len() as f64,
        current_exposure: *current,
    }
}

/// Dollar amount with thousands separators and two decimals.
pub(crate) fn format_currency(value: f64) -> String {
    let formatted = format!("{:.2}", value.abs());
    let (whole, fraction) = formatted.split_once('.').unwrap_or((formatted.as_str(), "00"));
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if value < 0.0 && formatted != "0.00" { "-" } else { "" };
    format!("{}${}.{}", sign, grouped, fraction)
}

fn optional_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.to_string()).unwrap_or_default()
}

pub fn format_report(metrics: &PortfolioMetrics) -> String {
    let profit_factor = metrics
        .trades
        .profit_factor
        .map(|pf| format!("{:.2}", pf))
        .unwrap_or_else(|| "n/a".to_string());
    let lines = [
        "Portfolio Performance Report".to_string(),
        "=".repeat(50),
        format!("Account: {} (ID: {})", metrics.account_name, metrics.account_id),
        format!(
            "Period: {} to {}",
            optional_date(metrics.start_date),
            optional_date(metrics.end_date)
        ),
        String::new(),
        "Returns".to_string(),
        "-".repeat(30),
        format!("Initial Value:    {:>16}", format_currency(metrics.initial_value)),
        format!("Final Value:      {:>16}", format_currency(metrics.final_value)),
        format!("Total Return:     {:>16}", format_currency(metrics.total_return)),
        format!("Total Return %:   {:>15.2}%", metrics.total_return_pct * 100.0),
        String::new(),
        "Risk Metrics".to_string(),
        "-".repeat(30),
        format!("Max Drawdown:     {:>16}", format_currency(metrics.drawdown.max_drawdown)),
        format!("Max Drawdown %:   {:>15.2}%", metrics.drawdown.max_drawdown_pct * 100.0),
        format!("Peak Value:       {:>16}", format_currency(metrics.drawdown.peak_value)),
        String::new(),
        "Trade Statistics".to_string(),
        "-".repeat(30),
        format!("Total Trades:     {:>16}", metrics.trades.total_trades),
        format!("Winning Trades:   {:>16}", metrics.trades.winning_trades),
        format!("Losing Trades:    {:>16}", metrics.trades.losing_trades),
        format!("Win Rate:         {:>15.2}%", metrics.trades.win_rate * 100.0),
        format!("Avg Win:          {:>16}", format_currency(metrics.trades.avg_win)),
        format!("Avg Loss:         {:>16}", format_currency(metrics.trades.avg_loss)),
        format!("Profit Factor:    {:>16}", profit_factor),
        String::new(),
        "Exposure".to_string(),
        "-".repeat(30),
        format!("Avg Exposure:     {:>15.2}%", metrics.exposure.avg_exposure * 100.0),
        format!("Current Exposure: {:>15.2}%", metrics.exposure.current_exposure * 100.0),
        format!("Trading Days:     {:>16}", metrics.trading_days),
    ];
    lines.join("\n")
}
