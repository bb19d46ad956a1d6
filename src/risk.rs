use crate::analyzer::{format_currency, positions_by_instrument, sell_order_pnl};
use crate::config::RiskLimits;
use crate::error::EngineError;
use crate::models::*;
use crate::store::TradingStore;
use anyhow::Result;
use log::{info, warn};
use serde::Serialize;

pub const RISK_SNAPSHOT_LIMIT: usize = 100;
pub const LOSING_STREAK_LOOKBACK: usize = 50;
const REPORT_POSITION_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRule {
    MaxTotalExposure,
    MinCashReserve,
    MaxDrawdown,
    MaxLosingStreak,
    MaxPositionConcentration,
}

impl RiskRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskRule::MaxTotalExposure => "max_total_exposure",
            RiskRule::MinCashReserve => "min_cash_reserve",
            RiskRule::MaxDrawdown => "max_drawdown",
            RiskRule::MaxLosingStreak => "max_losing_streak",
            RiskRule::MaxPositionConcentration => "max_position_concentration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskViolation {
    pub rule: RiskRule,
    pub severity: Severity,
    pub current_value: f64,
    pub limit_value: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionRisk {
    pub instrument_id: i64,
    pub symbol: String,
    pub quantity: i64,
    pub market_value: f64,
    pub concentration_pct: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskMetrics {
    pub account_id: i64,
    pub account_name: String,
    pub total_value: f64,
    pub cash_balance: f64,
    pub positions_value: f64,
    pub total_exposure: f64,
    pub cash_reserve_pct: f64,
    pub current_drawdown: f64,
    pub current_drawdown_pct: f64,
    pub peak_value: f64,
    pub losing_streak: usize,
    /// Largest concentration first.
    pub position_risks: Vec<PositionRisk>,
    pub violations: Vec<RiskViolation>,
}

impl RiskMetrics {
    pub fn is_compliant(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Advisory result of a pre-trade check. Only insufficient cash or an
/// unknown account disallow the order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRiskCheck {
    pub allowed: bool,
    pub warnings: Vec<String>,
}

pub struct RiskManager<'a, S: TradingStore + ?Sized> {
    store: &'a S,
    limits: RiskLimits,
}

impl<'a, S: TradingStore + ?Sized> RiskManager<'a, S> {
    pub fn new(store: &'a S, limits: RiskLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn set_limits(&mut self, limits: RiskLimits) {
        info!("Risk limits updated: {:?}", limits);
        self.limits = limits;
    }

    pub fn compute_risk_metrics(&self, account_id: i64) -> Result<RiskMetrics> {
        let account = self
            .store
            .get_account(account_id)?
            .ok_or(EngineError::AccountNotFound(account_id))?;
        let positions = self.store.get_positions(account_id, false)?;
        let snapshots = self.store.get_snapshots(account_id, RISK_SNAPSHOT_LIMIT)?;

        let cash_balance = account.cash_balance;
        let positions_value: f64 = positions.iter().map(PaperPosition::market_value).sum();
        let total_value = cash_balance + positions_value;

        let peak_value = snapshots
            .iter()
            .map(|snapshot| snapshot.total_value)
            .fold(account.initial_balance.max(total_value), f64::max);
        let current_drawdown = peak_value - total_value;

        let mut metrics = RiskMetrics {
            account_id,
            account_name: account.name.clone(),
            total_value,
            cash_balance,
            positions_value,
            total_exposure: ratio_or(positions_value, total_value, 0.0),
            cash_reserve_pct: ratio_or(cash_balance, total_value, 1.0),
            current_drawdown,
            current_drawdown_pct: ratio_or(current_drawdown, peak_value, 0.0),
            peak_value,
            losing_streak: self.losing_streak(account_id)?,
            position_risks: position_risks(&positions, total_value),
            violations: Vec::new(),
        };
        metrics.violations = check_violations(&metrics, &self.limits);

        info!(
            "Risk for account {}: exposure {:.1}%, drawdown {:.1}%, losing streak {}, {} violations",
            account_id,
            metrics.total_exposure * 100.0,
            metrics.current_drawdown_pct * 100.0,
            metrics.losing_streak,
            metrics.violations.len()
        );
        for violation in &metrics.violations {
            warn!("[{}] {}", violation.rule.as_str(), violation.message);
        }
        Ok(metrics)
    }

    /// Consecutive losing sells, newest first, stopping at the first non-loss.
    fn losing_streak(&self, account_id: i64) -> Result<usize> {
        let orders = self.store.get_orders(
            account_id,
            Some(OrderStatus::Filled),
            Some(LOSING_STREAK_LOOKBACK),
        )?;
        let positions = self.store.get_positions(account_id, true)?;
        let by_instrument = positions_by_instrument(&positions);

        let mut streak = 0;
        for order in orders.iter().filter(|order| order.side == OrderSide::Sell) {
            match sell_order_pnl(order, &by_instrument) {
                Some(pnl) if pnl < 0.0 => streak += 1,
                Some(_) => break,
                None => continue,
            }
        }
        Ok(streak)
    }

    /// Simulate the post-fill state of a proposed buy. Sells always pass.
    pub fn check_order_risk(
        &self,
        account_id: i64,
        symbol: &str,
        side: OrderSide,
        quantity: i64,
        estimated_price: f64,
    ) -> Result<OrderRiskCheck> {
        if side == OrderSide::Sell {
            return Ok(OrderRiskCheck {
                allowed: true,
                warnings: Vec::new(),
            });
        }
        let Some(account) = self.store.get_account(account_id)? else {
            return Ok(OrderRiskCheck {
                allowed: false,
                warnings: vec!["Account not found".to_string()],
            });
        };

        let positions = self.store.get_positions(account_id, false)?;
        let cash_balance = account.cash_balance;
        let positions_value: f64 = positions.iter().map(PaperPosition::market_value).sum();
        let order_value = quantity as f64 * estimated_price;

        if order_value > cash_balance {
            return Ok(OrderRiskCheck {
                allowed: false,
                warnings: vec![format!(
                    "Insufficient cash: need {}, have {}",
                    format_currency(order_value),
                    format_currency(cash_balance)
                )],
            });
        }

        let new_cash = cash_balance - order_value;
        let new_positions_value = positions_value + order_value;
        let new_total = new_cash + new_positions_value;
        let limits = &self.limits;
        let mut warnings = Vec::new();

        let new_exposure = ratio_or(new_positions_value, new_total, 0.0);
        if new_exposure > limits.max_total_exposure {
            warnings.push(format!(
                "Order would increase exposure to {:.1}% (limit: {:.1}%)",
                new_exposure * 100.0,
                limits.max_total_exposure * 100.0
            ));
        }

        let new_cash_reserve = ratio_or(new_cash, new_total, 0.0);
        if new_cash_reserve < limits.min_cash_reserve {
            warnings.push(format!(
                "Order would reduce cash reserve to {:.1}% (minimum: {:.1}%)",
                new_cash_reserve * 100.0,
                limits.min_cash_reserve * 100.0
            ));
        }

        let existing_value = positions
            .iter()
            .find(|position| position.symbol.eq_ignore_ascii_case(symbol))
            .map(PaperPosition::market_value)
            .unwrap_or(0.0);
        let new_concentration = ratio_or(existing_value + order_value, new_total, 0.0);
        if new_concentration > limits.max_position_concentration {
            warnings.push(format!(
                "Order would increase {} concentration to {:.1}% (limit: {:.1}%)",
                symbol,
                new_concentration * 100.0,
                limits.max_position_concentration * 100.0
            ));
        }

        Ok(OrderRiskCheck {
            allowed: true,
            warnings,
        })
    }

    pub fn format_report(&self, metrics: &RiskMetrics) -> String {
        let limits = &self.limits;
        let status = if metrics.is_compliant() {
            "COMPLIANT"
        } else {
            "VIOLATIONS DETECTED"
        };
        let mut lines = vec![
            "Risk Report".to_string(),
            "=".repeat(50),
            format!("Account: {} (ID: {})", metrics.account_name, metrics.account_id),
            format!("Status: {}", status),
            String::new(),
            "Portfolio Summary".to_string(),
            "-".repeat(30),
            format!("Total Value:      {:>16}", format_currency(metrics.total_value)),
            format!("Cash Balance:     {:>16}", format_currency(metrics.cash_balance)),
            format!("Positions Value:  {:>16}", format_currency(metrics.positions_value)),
            String::new(),
            "Risk Metrics".to_string(),
            "-".repeat(30),
            format!(
                "Total Exposure:   {:>15.1}% (limit: {:.0}%)",
                metrics.total_exposure * 100.0,
                limits.max_total_exposure * 100.0
            ),
            format!(
                "Cash Reserve:     {:>15.1}% (min: {:.0}%)",
                metrics.cash_reserve_pct * 100.0,
                limits.min_cash_reserve * 100.0
            ),
            format!(
                "Current Drawdown: {:>15.1}% (limit: {:.0}%)",
                metrics.current_drawdown_pct * 100.0,
                limits.max_drawdown_pct * 100.0
            ),
            format!("Peak Value:       {:>16}", format_currency(metrics.peak_value)),
            format!(
                "Losing Streak:    {:>16} (limit: {})",
                metrics.losing_streak, limits.max_losing_streak
            ),
        ];

        if !metrics.position_risks.is_empty() {
            lines.extend([String::new(), "Position Concentration".to_string(), "-".repeat(30)]);
            for position in metrics.position_risks.iter().take(REPORT_POSITION_LIMIT) {
                let flag = if position.concentration_pct > limits.max_position_concentration {
                    "*"
                } else {
                    " "
                };
                lines.push(format!(
                    "{}{:<7} {:>6.1}%  {:>13}  P&L: {:>+6.1}%",
                    flag,
                    position.symbol,
                    position.concentration_pct * 100.0,
                    format_currency(position.market_value),
                    position.unrealized_pnl_pct * 100.0
                ));
            }
        }

        if !metrics.violations.is_empty() {
            lines.extend([
                String::new(),
                format!("Violations ({})", metrics.violations.len()),
                "-".repeat(30),
            ]);
            for violation in &metrics.violations {
                let marker = match violation.severity {
                    Severity::Critical => "!!",
                    Severity::Warning => "!",
                };
                lines.push(format!(
                    "{} [{}] {}",
                    marker,
                    violation.rule.as_str(),
                    violation.message
                ));
            }
        }

        lines.join("\n")
    }
}

fn ratio_or(numerator: f64, denominator: f64, fallback: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        fallback
    }
}

/// Per-position risk at the stored mark, largest concentration first.
pub fn position_risks(positions: &[PaperPosition], total_value: f64) -> Vec<PositionRisk> {
    let mut risks: Vec<PositionRisk> = positions
        .iter()
        .map(|position| {
            let price = position.mark_price();
            let avg = position.avg_entry_price;
            let market_value = position.market_value();
            PositionRisk {
                instrument_id: position.instrument_id,
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                market_value,
                concentration_pct: ratio_or(market_value, total_value, 0.0),
                unrealized_pnl: (price - avg) * position.quantity as f64,
                unrealized_pnl_pct: ratio_or(price - avg, avg, 0.0),
            }
        })
        .collect();
    risks.sort_by(|a, b| b.concentration_pct.total_cmp(&a.concentration_pct));
    risks
}

/// Every rule is evaluated; one concentration violation per offending position.
pub fn check_violations(metrics: &RiskMetrics, limits: &RiskLimits) -> Vec<RiskViolation> {
    let mut violations = Vec::new();

    if metrics.total_exposure > limits.max_total_exposure {
        violations.push(RiskViolation {
            rule: RiskRule::MaxTotalExposure,
            severity: Severity::Warning,
            current_value: metrics.total_exposure,
            limit_value: limits.max_total_exposure,
            message: format!(
                "Total exposure {:.1}% exceeds limit of {:.1}%",
                metrics.total_exposure * 100.0,
                limits.max_total_exposure * 100.0
            ),
        });
    }

    if metrics.cash_reserve_pct < limits.min_cash_reserve {
        violations.push(RiskViolation {
            rule: RiskRule::MinCashReserve,
            severity: Severity::Warning,
            current_value: metrics.cash_reserve_pct,
            limit_value: limits.min_cash_reserve,
            message: format!(
                "Cash reserve {:.1}% below minimum of {:.1}%",
                metrics.cash_reserve_pct * 100.0,
                limits.min_cash_reserve * 100.0
            ),
        });
    }

    if metrics.current_drawdown_pct > limits.max_drawdown_pct {
        violations.push(RiskViolation {
            rule: RiskRule::MaxDrawdown,
            severity: Severity::Critical,
            current_value: metrics.current_drawdown_pct,
            limit_value: limits.max_drawdown_pct,
            message: format!(
                "Drawdown {:.1}% exceeds limit of {:.1}%",
                metrics.current_drawdown_pct * 100.0,
                limits.max_drawdown_pct * 100.0
            ),
        });
    }

    if metrics.losing_streak >= limits.max_losing_streak {
        violations.push(RiskViolation {
            rule: RiskRule::MaxLosingStreak,
            severity: Severity::Warning,
            current_value: metrics.losing_streak as f64,
            limit_value: limits.max_losing_streak as f64,
            message: format!(
                "Losing streak of {} trades meets/exceeds limit of {}",
                metrics.losing_streak, limits.max_losing_streak
            ),
        });
    }

    for position in &metrics.position_risks {
        if position.concentration_pct > limits.max_position_concentration {
            violations.push(RiskViolation {
                rule: RiskRule::MaxPositionConcentration,
                severity: Severity::Warning,
                current_value: position.concentration_pct,
                limit_value: limits.max_position_concentration,
                message: format!(
                    "Position {} concentration {:.1}% exceeds limit of {:.1}%",
                    position.symbol,
                    position.concentration_pct * 100.0,
                    limits.max_position_concentration * 100.0
                ),
            });
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn position(account_id: i64, instrument_id: i64, symbol: &str, qty: i64, avg: f64, mark: f64) -> PaperPosition {
        PaperPosition {
            account_id,
            instrument_id,
            symbol: symbol.to_string(),
            quantity: qty,
            avg_entry_price: avg,
            current_price: Some(mark),
            realized_pnl: 0.0,
        }
    }

    fn store_with_account(initial: f64, cash: f64) -> (MemoryStore, i64) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut store = MemoryStore::new();
        let account = store.create_account("risk", initial).unwrap();
        store.update_account_balance(account.id, cash).unwrap();
        (store, account.id)
    }

    fn record_sell(store: &mut MemoryStore, account_id: i64, instrument_id: i64, pnl: f64) {
        let order = store
            .insert_order(&NewOrder {
                account_id,
                instrument_id,
                side: OrderSide::Sell,
                order_type: OrderType::Market,
                quantity: 1,
                limit_price: None,
                notes: None,
            })
            .unwrap();
        // Cash and holdings stay as the test set them up.
        let cash = store.get_account(account_id).unwrap().unwrap().cash_balance;
        let held = store
            .get_position(account_id, instrument_id)
            .unwrap()
            .unwrap_or_else(|| position(account_id, instrument_id, &order.symbol, 0, 10.0, 10.0));
        store
            .apply_fill(
                &OrderFill {
                    order_id: order.id,
                    fill_price: 10.0,
                    filled_quantity: 1,
                    commission: 0.0,
                    realized_pnl: Some(pnl),
                    filled_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                },
                cash,
                &held,
            )
            .unwrap();
    }

    #[test]
    fn concentrated_position_and_drawdown_are_flagged() {
        let (mut store, account) = store_with_account(100_000.0, 20_000.0);
        let a = store.add_instrument("AAA", None);
        let b = store.add_instrument("BBB", None);
        store.upsert_position(&position(account, a, "AAA", 100, 400.0, 500.0)).unwrap();
        store.upsert_position(&position(account, b, "BBB", 100, 100.0, 100.0)).unwrap();

        let manager = RiskManager::new(&store, RiskLimits::default());
        let metrics = manager.compute_risk_metrics(account).unwrap();
        assert!((metrics.total_value - 80_000.0).abs() < 1e-9);
        assert!((metrics.current_drawdown_pct - 0.2).abs() < 1e-12);
        assert_eq!(metrics.position_risks[0].symbol, "AAA");
        assert!((metrics.position_risks[0].unrealized_pnl_pct - 0.25).abs() < 1e-12);

        let rules: Vec<RiskRule> = metrics.violations.iter().map(|v| v.rule).collect();
        // Drawdown sits exactly at the limit and is not a breach.
        assert_eq!(rules, vec![RiskRule::MaxPositionConcentration]);
        assert!(!metrics.is_compliant());

        let report = manager.format_report(&metrics);
        assert!(report.contains("VIOLATIONS DETECTED"));
        assert!(report.contains("*AAA"));
    }

    #[test]
    fn losing_streak_counts_newest_losses_until_a_win() {
        let (mut store, account) = store_with_account(10_000.0, 10_000.0);
        let a = store.add_instrument("AAA", None);
        for pnl in [-5.0, 12.0, -1.0, -2.0, -3.0, -4.0, -5.0] {
            record_sell(&mut store, account, a, pnl);
        }
        let manager = RiskManager::new(&store, RiskLimits::default());
        let metrics = manager.compute_risk_metrics(account).unwrap();
        assert_eq!(metrics.losing_streak, 5);
        assert_eq!(metrics.violations.len(), 1);
        assert_eq!(metrics.violations[0].rule, RiskRule::MaxLosingStreak);
    }

    #[test]
    fn empty_account_has_full_cash_reserve() {
        let (store, account) = store_with_account(10_000.0, 0.0);
        let mut manager = RiskManager::new(&store, RiskLimits::default());
        let metrics = manager.compute_risk_metrics(account).unwrap();
        assert_eq!(metrics.cash_reserve_pct, 1.0);
        assert_eq!(metrics.total_exposure, 0.0);
        // Value fell from 10k to zero.
        assert_eq!(metrics.violations[0].rule, RiskRule::MaxDrawdown);
        assert_eq!(metrics.violations[0].severity, Severity::Critical);

        manager.set_limits(RiskLimits {
            max_drawdown_pct: 1.0,
            ..RiskLimits::default()
        });
        assert!(manager.compute_risk_metrics(account).unwrap().is_compliant());
        assert!(manager.compute_risk_metrics(31_337).is_err());
    }

    #[test]
    fn pre_trade_check_warns_but_only_blocks_on_cash() {
        let (mut store, account) = store_with_account(100_000.0, 100_000.0);
        let a = store.add_instrument("AAA", None);
        store.upsert_position(&position(account, a, "AAA", 100, 100.0, 100.0)).unwrap();
        let manager = RiskManager::new(&store, RiskLimits::default());

        let sell = manager
            .check_order_risk(account, "AAA", OrderSide::Sell, 1_000_000, 1.0)
            .unwrap();
        assert!(sell.allowed && sell.warnings.is_empty());

        let too_big = manager
            .check_order_risk(account, "AAA", OrderSide::Buy, 2_000, 100.0)
            .unwrap();
        assert!(!too_big.allowed);
        assert_eq!(
            too_big.warnings,
            vec!["Insufficient cash: need $200,000.00, have $100,000.00".to_string()]
        );

        let concentrated = manager
            .check_order_risk(account, "aaa", OrderSide::Buy, 200, 100.0)
            .unwrap();
        assert!(concentrated.allowed);
        assert_eq!(concentrated.warnings.len(), 1);
        assert!(concentrated.warnings[0].contains("concentration to 27.3%"));

        let small = manager
            .check_order_risk(account, "BBB", OrderSide::Buy, 10, 100.0)
            .unwrap();
        assert!(small.allowed && small.warnings.is_empty());

        let ghost = manager
            .check_order_risk(999, "AAA", OrderSide::Buy, 1, 1.0)
            .unwrap();
        assert!(!ghost.allowed);
    }
}
