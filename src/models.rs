use anyhow::{anyhow, Result as AnyResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A single daily OHLCV bar. Only the close is guaranteed; the other prices
/// may be missing for thinly traded instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub instrument_id: i64,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: i64,
    pub adjusted_close: Option<f64>,
}

impl PriceBar {
    pub fn high_or_close(&self) -> f64 {
        self.high.unwrap_or(self.close)
    }

    pub fn low_or_close(&self) -> f64 {
        self.low.unwrap_or(self.close)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: i64,
    pub symbol: String,
    pub name: Option<String>,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Backtest value types
// ---------------------------------------------------------------------------

/// An open backtest position. `entry_value` is the cash paid including the
/// entry commission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: i64,
    pub symbol: String,
    pub quantity: i64,
    pub entry_price: f64,
    pub entry_date: NaiveDate,
    pub entry_value: f64,
}

/// What a strategy sees about the position it already holds.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionInfo {
    pub quantity: i64,
    pub entry_price: f64,
    pub entry_date: NaiveDate,
    pub unrealized_pnl: f64,
}

/// A closed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument_id: i64,
    pub symbol: String,
    pub entry_date: NaiveDate,
    pub entry_price: f64,
    pub exit_date: NaiveDate,
    pub exit_price: f64,
    pub quantity: i64,
    pub side: OrderSide,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub exit_reason: Option<String>,
    pub commission: f64,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }

    pub fn holding_days(&self) -> i64 {
        (self.exit_date - self.entry_date).num_days()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

/// A buy or sell intent emitted by a strategy for one instrument on one bar.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySignal {
    pub action: SignalAction,
    pub instrument_id: i64,
    pub symbol: String,
    pub price: f64,
    pub reason: Option<String>,
    pub metadata: Value,
}

impl StrategySignal {
    pub fn buy(instrument_id: i64, symbol: &str, price: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Buy,
            instrument_id,
            symbol: symbol.to_string(),
            price,
            reason: Some(reason.into()),
            metadata: Value::Null,
        }
    }

    pub fn sell(instrument_id: i64, symbol: &str, price: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Sell,
            instrument_id,
            symbol: symbol.to_string(),
            price,
            reason: Some(reason.into()),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow!("Unknown backtest run status '{}'", other)),
        }
    }
}

/// Summary statistics of a finished backtest. Ratios are fractions, not
/// percentages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub max_drawdown: f64,
    pub max_drawdown_duration: usize,
    pub win_rate: f64,
    pub profit_factor: Option<f64>,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_win: Option<f64>,
    pub avg_loss: Option<f64>,
    pub largest_win: Option<f64>,
    pub largest_loss: Option<f64>,
    pub avg_holding_period_days: Option<f64>,
    pub exposure_time: f64,
    pub trading_days: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBacktestRun {
    pub strategy_id: i64,
    pub name: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRunRecord {
    pub id: i64,
    pub strategy_id: i64,
    pub name: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub final_capital: Option<f64>,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub parameters: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Paper trading records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(anyhow!("Invalid side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

impl FromStr for OrderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            other => Err(anyhow!("Invalid order type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "partial" => Ok(OrderStatus::Partial),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(anyhow!("Unknown order status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub cash_balance: f64,
    pub initial_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub account_id: i64,
    pub instrument_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<f64>,
    pub status: OrderStatus,
    pub filled_quantity: i64,
    pub filled_avg_price: Option<f64>,
    pub commission: f64,
    pub realized_pnl: Option<f64>,
    pub filled_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub account_id: i64,
    pub instrument_id: i64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<f64>,
    pub notes: Option<String>,
}

/// Fill details written back to an order by the EOD executor.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_id: i64,
    pub fill_price: f64,
    pub filled_quantity: i64,
    pub commission: f64,
    pub realized_pnl: Option<f64>,
    pub filled_date: NaiveDate,
}

/// Durable paper position keyed by (account, instrument). Fully closed
/// positions keep `quantity == 0` along with their realized P&L history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperPosition {
    pub account_id: i64,
    pub instrument_id: i64,
    pub symbol: String,
    pub quantity: i64,
    pub avg_entry_price: f64,
    pub current_price: Option<f64>,
    pub realized_pnl: f64,
}

impl PaperPosition {
    pub fn is_open(&self) -> bool {
        self.quantity > 0
    }

    /// Latest known mark, falling back to the average entry price.
    pub fn mark_price(&self) -> f64 {
        self.current_price.unwrap_or(self.avg_entry_price)
    }

    pub fn market_value(&self) -> f64 {
        self.quantity as f64 * self.mark_price()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDetail {
    pub instrument_id: i64,
    pub symbol: String,
    pub quantity: i64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub account_id: i64,
    pub snapshot_date: NaiveDate,
    pub cash_balance: f64,
    pub positions_value: f64,
    pub total_value: f64,
    pub daily_pnl: Option<f64>,
    pub daily_return: Option<f64>,
    pub positions_detail: Vec<PositionDetail>,
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidSide,
    InvalidOrderType,
    InvalidQuantity,
    MissingLimitPrice,
    AccountNotFound,
    InstrumentNotFound,
    InsufficientPosition,
    InsufficientCash,
    NoPriceData,
    LimitNotReached,
    OrderNotPending,
    DuplicateAccountName,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InvalidSide => "invalid_side",
            RejectionReason::InvalidOrderType => "invalid_order_type",
            RejectionReason::InvalidQuantity => "invalid_quantity",
            RejectionReason::MissingLimitPrice => "missing_limit_price",
            RejectionReason::AccountNotFound => "account_not_found",
            RejectionReason::InstrumentNotFound => "instrument_not_found",
            RejectionReason::InsufficientPosition => "insufficient_position",
            RejectionReason::InsufficientCash => "insufficient_cash",
            RejectionReason::NoPriceData => "no_price_data",
            RejectionReason::LimitNotReached => "limit_not_reached",
            RejectionReason::OrderNotPending => "order_not_pending",
            RejectionReason::DuplicateAccountName => "duplicate_account_name",
        }
    }
}

/// An expected refusal, reported to the caller as a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub message: String,
}

impl Rejection {
    pub fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.reason.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Accepted(T),
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    pub fn rejected(reason: RejectionReason, message: impl Into<String>) -> Self {
        Outcome::Rejected(Rejection::new(reason, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }

    pub fn accepted(&self) -> Option<&T> {
        match self {
            Outcome::Accepted(value) => Some(value),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Accepted(_) => None,
            Outcome::Rejected(rejection) => Some(rejection),
        }
    }

    pub fn into_result(self) -> Result<T, Rejection> {
        match self {
            Outcome::Accepted(value) => Ok(value),
            Outcome::Rejected(rejection) => Err(rejection),
        }
    }
}

pub fn parse_date(raw: &str) -> AnyResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| anyhow!("Date must be in YYYY-MM-DD format (value: {})", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_enums_parse_case_insensitively() {
        assert_eq!("BUY".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert_eq!(" limit ".parse::<OrderType>().unwrap(), OrderType::Limit);
        assert_eq!(
            "Cancelled".parse::<OrderStatus>().unwrap(),
            OrderStatus::Cancelled
        );
        assert!("short".parse::<OrderSide>().is_err());
    }

    #[test]
    fn terminal_statuses_are_filled_and_cancelled() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn paper_position_marks_fall_back_to_entry_price() {
        let mut position = PaperPosition {
            account_id: 1,
            instrument_id: 7,
            symbol: "BHP".to_string(),
            quantity: 10,
            avg_entry_price: 40.0,
            current_price: None,
            realized_pnl: 0.0,
        };
        assert!((position.market_value() - 400.0).abs() < 1e-9);
        position.current_price = Some(42.5);
        assert!((position.market_value() - 425.0).abs() < 1e-9);
    }

    #[test]
    fn zero_pnl_trade_is_not_a_win() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let trade = Trade {
            instrument_id: 1,
            symbol: "CBA".to_string(),
            entry_date: date,
            entry_price: 10.0,
            exit_date: date + chrono::Duration::days(3),
            exit_price: 10.0,
            quantity: 100,
            side: OrderSide::Buy,
            pnl: 0.0,
            pnl_percent: 0.0,
            exit_reason: None,
            commission: 0.0,
        };
        assert!(!trade.is_win());
        assert_eq!(trade.holding_days(), 3);
    }
}
