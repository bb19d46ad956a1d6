use crate::models::*;
use statrs::statistics::Statistics;

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawdownInfo {
    /// Largest peak-to-trough decline as a fraction of the peak.
    pub max_drawdown: f64,
    /// Bars between the peak and the deepest point of that drawdown.
    pub max_drawdown_duration: usize,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate_metrics(
        trades: &[Trade],
        equity_curve: &[EquityPoint],
        initial_capital: f64,
        final_capital: f64,
        days_with_positions: usize,
    ) -> BacktestMetrics {
        let trading_days = equity_curve.len();
        let total_return = if initial_capital > 0.0 {
            (final_capital - initial_capital) / initial_capital
        } else {
            0.0
        };
        let annualized_return = Self::calculate_annualized_return(total_return, trading_days);

        let winning: Vec<f64> = trades.iter().filter(|t| t.is_win()).map(|t| t.pnl).collect();
        let losing: Vec<f64> = trades.iter().filter(|t| !t.is_win()).map(|t| t.pnl).collect();

        let win_rate = if trades.is_empty() {
            0.0
        } else {
            winning.len() as f64 / trades.len() as f64
        };

        let gross_profit: f64 = winning.iter().sum();
        let gross_loss: f64 = losing.iter().sum::<f64>().abs();
        let profit_factor = if gross_loss > 0.0 {
            Some(gross_profit / gross_loss)
        } else {
            None
        };

        let avg_win = (!winning.is_empty()).then(|| gross_profit / winning.len() as f64);
        let avg_loss = (!losing.is_empty()).then(|| gross_loss / losing.len() as f64);
        let largest_win = trades.iter().map(|t| t.pnl).reduce(f64::max);
        let largest_loss = trades.iter().map(|t| t.pnl).reduce(f64::min);

        let drawdown = Self::calculate_max_drawdown(equity_curve, initial_capital);

        let exposure_time = if trading_days > 0 {
            days_with_positions as f64 / trading_days as f64
        } else {
            0.0
        };

        let holding_periods: Vec<f64> = trades.iter().map(|t| t.holding_days() as f64).collect();
        let avg_holding_period_days = (!holding_periods.is_empty())
            .then(|| holding_periods.iter().sum::<f64>() / holding_periods.len() as f64);

        let returns = Self::daily_returns(equity_curve);

        BacktestMetrics {
            total_return,
            annualized_return,
            sharpe_ratio: Self::calculate_sharpe_ratio(&returns),
            sortino_ratio: Self::calculate_sortino_ratio(&returns),
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_duration: drawdown.max_drawdown_duration,
            win_rate,
            profit_factor,
            total_trades: trades.len(),
            winning_trades: winning.len(),
            losing_trades: losing.len(),
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            avg_holding_period_days,
            exposure_time,
            trading_days,
        }
    }

    pub fn calculate_annualized_return(total_return: f64, trading_days: usize) -> f64 {
        let years = if trading_days > 0 {
            trading_days as f64 / TRADING_DAYS_PER_YEAR
        } else {
            1.0
        };
        let growth = 1.0 + total_return;
        if growth <= 0.0 {
            return -1.0;
        }
        growth.powf(1.0 / years) - 1.0
    }

    /// Day-over-day returns, skipping days whose previous value is not positive.
    pub fn daily_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
        equity_curve
            .windows(2)
            .filter(|window| window[0].value > 0.0)
            .map(|window| (window[1].value - window[0].value) / window[0].value)
            .collect()
    }

    pub fn calculate_sharpe_ratio(returns: &[f64]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let std_dev = returns.iter().std_dev();
        if !std_dev.is_finite() || std_dev <= 0.0 {
            return None;
        }
        let mean_return = returns.iter().mean();
        Some((mean_return * TRADING_DAYS_PER_YEAR) / (std_dev * TRADING_DAYS_PER_YEAR.sqrt()))
    }

    /// Same shape as Sharpe with the deviation taken over negative returns only.
    pub fn calculate_sortino_ratio(returns: &[f64]) -> Option<f64> {
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.len() < 2 {
            return None;
        }
        let downside_std = downside.iter().std_dev();
        if !downside_std.is_finite() || downside_std <= 0.0 {
            return None;
        }
        let mean_return = returns.iter().mean();
        Some((mean_return * TRADING_DAYS_PER_YEAR) / (downside_std * TRADING_DAYS_PER_YEAR.sqrt()))
    }

    pub fn calculate_max_drawdown(equity_curve: &[EquityPoint], initial_capital: f64) -> DrawdownInfo {
        let mut max_drawdown = 0.0;
        let mut max_drawdown_duration = 0;
        let mut peak = initial_capital;
        let mut peak_index = 0;

        for (index, point) in equity_curve.iter().enumerate() {
            if point.value > peak {
                peak = point.value;
                peak_index = index;
            }
            if peak <= 0.0 {
                continue;
            }
            let drawdown = (peak - point.value) / peak;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                max_drawdown_duration = index - peak_index;
            }
        }

        DrawdownInfo {
            max_drawdown,
            max_drawdown_duration,
        }
    }
}
