use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineError;

pub const DEFAULT_INITIAL_CAPITAL: f64 = 100_000.0;
pub const DEFAULT_POSITION_SIZE_PCT: f64 = 0.1;
pub const DEFAULT_MAX_POSITIONS: usize = 10;
pub const DEFAULT_COMMISSION_PCT: f64 = 0.001;
pub const DEFAULT_SLIPPAGE_PCT: f64 = 0.001;

/// Parameters of a single backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub position_size_pct: f64,
    pub max_positions: usize,
    pub commission_pct: f64,
    pub slippage_pct: f64,
    /// Restrict the run to these instruments; `None` means every active one.
    pub instrument_ids: Option<Vec<i64>>,
    pub name: Option<String>,
}

impl BacktestConfig {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            position_size_pct: DEFAULT_POSITION_SIZE_PCT,
            max_positions: DEFAULT_MAX_POSITIONS,
            commission_pct: DEFAULT_COMMISSION_PCT,
            slippage_pct: DEFAULT_SLIPPAGE_PCT,
            instrument_ids: None,
            name: None,
        }
    }

    /// Start from the environment-level defaults.
    pub fn from_settings(settings: &AppSettings, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
            initial_capital: settings.initial_capital,
            position_size_pct: settings.position_size_pct,
            max_positions: settings.max_positions,
            commission_pct: settings.commission_rate,
            slippage_pct: settings.slippage_rate,
            instrument_ids: None,
            name: None,
        }
    }

    pub fn frictionless(mut self) -> Self {
        self.commission_pct = 0.0;
        self.slippage_pct = 0.0;
        self
    }

    pub fn fill_costs(&self) -> FillCosts {
        FillCosts {
            commission_rate: self.commission_pct,
            slippage_rate: self.slippage_pct,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.end_date < self.start_date {
            return Err(EngineError::InvalidConfig(format!(
                "end date {} is before start date {}",
                self.end_date, self.start_date
            )));
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "initial capital must be positive (value: {})",
                self.initial_capital
            )));
        }
        if !(self.position_size_pct > 0.0 && self.position_size_pct <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "position size pct must be in (0, 1] (value: {})",
                self.position_size_pct
            )));
        }
        if self.max_positions == 0 {
            return Err(EngineError::InvalidConfig(
                "max positions must be at least 1".to_string(),
            ));
        }
        self.fill_costs().validate()
    }
}

/// Slippage and commission applied to every fill.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FillCosts {
    pub commission_rate: f64,
    pub slippage_rate: f64,
}

impl FillCosts {
    pub fn new(commission_rate: f64, slippage_rate: f64) -> Self {
        Self {
            commission_rate,
            slippage_rate,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for (label, rate) in [
            ("commission rate", self.commission_rate),
            ("slippage rate", self.slippage_rate),
        ] {
            if !(rate.is_finite() && (0.0..1.0).contains(&rate)) {
                return Err(EngineError::InvalidConfig(format!(
                    "{} must be in [0, 1) (value: {})",
                    label, rate
                )));
            }
        }
        Ok(())
    }
}

/// Portfolio limits evaluated by the risk manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_total_exposure: f64,
    pub max_position_concentration: f64,
    pub max_drawdown_pct: f64,
    pub max_losing_streak: usize,
    pub min_cash_reserve: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_total_exposure: 0.95,
            max_position_concentration: 0.20,
            max_drawdown_pct: 0.20,
            max_losing_streak: 5,
            min_cash_reserve: 0.05,
        }
    }
}

impl RiskLimits {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("Invalid risk limits JSON: {}", err))
    }
}

/// Process-level settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub database_url: Option<String>,
    pub commission_rate: f64,
    pub slippage_rate: f64,
    pub initial_capital: f64,
    pub position_size_pct: f64,
    pub max_positions: usize,
    pub risk_limits: RiskLimits,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            commission_rate: DEFAULT_COMMISSION_PCT,
            slippage_rate: DEFAULT_SLIPPAGE_PCT,
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            position_size_pct: DEFAULT_POSITION_SIZE_PCT,
            max_positions: DEFAULT_MAX_POSITIONS,
            risk_limits: RiskLimits::default(),
        }
    }
}

const SETTING_KEYS: &[&str] = &[
    "DATABASE_URL",
    "TRADE_COMMISSION_RATE",
    "TRADE_SLIPPAGE_RATE",
    "BACKTEST_INITIAL_CAPITAL",
    "BACKTEST_POSITION_SIZE_PCT",
    "BACKTEST_MAX_POSITIONS",
    "RISK_MAX_TOTAL_EXPOSURE",
    "RISK_MAX_POSITION_CONCENTRATION",
    "RISK_MAX_DRAWDOWN_PCT",
    "RISK_MAX_LOSING_STREAK",
    "RISK_MIN_CASH_RESERVE",
];

impl AppSettings {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let settings: HashMap<String, String> = SETTING_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let limits = RiskLimits::default();

        let database_url = setting(settings, "DATABASE_URL").map(str::to_string);
        let commission_rate = optional_setting_f64(
            settings,
            "TRADE_COMMISSION_RATE",
            defaults.commission_rate,
            Some(0.0),
            Some(1.0),
        )?;
        let slippage_rate = optional_setting_f64(
            settings,
            "TRADE_SLIPPAGE_RATE",
            defaults.slippage_rate,
            Some(0.0),
            Some(1.0),
        )?;
        let initial_capital = optional_setting_f64(
            settings,
            "BACKTEST_INITIAL_CAPITAL",
            defaults.initial_capital,
            Some(0.0),
            None,
        )?;
        let position_size_pct = optional_setting_f64(
            settings,
            "BACKTEST_POSITION_SIZE_PCT",
            defaults.position_size_pct,
            Some(0.0),
            Some(1.0),
        )?;
        let max_positions =
            optional_setting_usize(settings, "BACKTEST_MAX_POSITIONS", defaults.max_positions, 1)?;

        let risk_limits = RiskLimits {
            max_total_exposure: optional_setting_f64(
                settings,
                "RISK_MAX_TOTAL_EXPOSURE",
                limits.max_total_exposure,
                Some(0.0),
                None,
            )?,
            max_position_concentration: optional_setting_f64(
                settings,
                "RISK_MAX_POSITION_CONCENTRATION",
                limits.max_position_concentration,
                Some(0.0),
                Some(1.0),
            )?,
            max_drawdown_pct: optional_setting_f64(
                settings,
                "RISK_MAX_DRAWDOWN_PCT",
                limits.max_drawdown_pct,
                Some(0.0),
                Some(1.0),
            )?,
            max_losing_streak: optional_setting_usize(
                settings,
                "RISK_MAX_LOSING_STREAK",
                limits.max_losing_streak,
                1,
            )?,
            min_cash_reserve: optional_setting_f64(
                settings,
                "RISK_MIN_CASH_RESERVE",
                limits.min_cash_reserve,
                Some(0.0),
                Some(1.0),
            )?,
        };

        Ok(Self {
            database_url,
            commission_rate,
            slippage_rate,
            initial_capital,
            position_size_pct,
            max_positions,
            risk_limits,
        })
    }
}

fn setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn empty_settings_use_defaults() {
        let settings = AppSettings::from_settings_map(&HashMap::new()).unwrap();
        assert!(settings.database_url.is_none());
        assert!((settings.initial_capital - 100_000.0).abs() < 1e-9);
        assert_eq!(settings.max_positions, 10);
        assert_eq!(settings.risk_limits, RiskLimits::default());
    }

    #[test]
    fn invalid_setting_names_the_key() {
        let mut map = HashMap::new();
        map.insert("TRADE_SLIPPAGE_RATE".to_string(), "abc".to_string());
        let err = AppSettings::from_settings_map(&map).unwrap_err();
        assert!(err.to_string().contains("TRADE_SLIPPAGE_RATE"));

        let mut map = HashMap::new();
        map.insert("BACKTEST_MAX_POSITIONS".to_string(), "2.5".to_string());
        let err = AppSettings::from_settings_map(&map).unwrap_err();
        assert!(err.to_string().contains("must be an integer"));
    }

    #[test]
    fn overrides_are_applied() {
        let mut map = HashMap::new();
        map.insert("RISK_MAX_LOSING_STREAK".to_string(), "3".to_string());
        map.insert("RISK_MIN_CASH_RESERVE".to_string(), " 0.5 ".to_string());
        map.insert("DATABASE_URL".to_string(), "postgres://localhost/db".to_string());
        let settings = AppSettings::from_settings_map(&map).unwrap();
        assert_eq!(settings.risk_limits.max_losing_streak, 3);
        assert!((settings.risk_limits.min_cash_reserve - 0.5).abs() < 1e-9);
        assert_eq!(
            settings.database_url.as_deref(),
            Some("postgres://localhost/db")
        );
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let base = BacktestConfig::new(date(2024, 1, 1), date(2024, 2, 1));
        assert!(base.validate().is_ok());

        let mut reversed = base.clone();
        reversed.end_date = date(2023, 12, 31);
        assert!(matches!(
            reversed.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        let mut oversized = base.clone();
        oversized.position_size_pct = 1.5;
        assert!(oversized.validate().is_err());

        let mut no_slots = base.clone();
        no_slots.max_positions = 0;
        assert!(no_slots.validate().is_err());

        let mut bad_rate = base;
        bad_rate.slippage_pct = 1.0;
        assert!(bad_rate.validate().is_err());
    }

    #[test]
    fn risk_limits_json_round_trip() {
        let limits = RiskLimits {
            max_losing_streak: 2,
            ..RiskLimits::default()
        };
        let parsed = RiskLimits::from_json(&limits.to_json().unwrap()).unwrap();
        assert_eq!(parsed, limits);
        assert!(RiskLimits::from_json("{").is_err());
    }
}
