use chrono::NaiveDate;
use thiserror::Error;

/// Data faults and fatal failures raised by the engines. Expected refusals
/// (insufficient cash, unreached limits, ...) are `Rejection` values instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No trading days found between {start} and {end}")]
    NoTradingDays { start: NaiveDate, end: NaiveDate },

    #[error("Account {0} not found")]
    AccountNotFound(i64),

    #[error("Instrument {0} not found")]
    InstrumentNotFound(String),

    #[error("Order {0} not found")]
    OrderNotFound(i64),

    #[error("Order {0} is no longer pending")]
    OrderNotPending(i64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid {entity} record: {message}")]
    InvalidRecord {
        entity: &'static str,
        message: String,
    },
}

impl EngineError {
    pub fn invalid_record(entity: &'static str, message: impl Into<String>) -> Self {
        EngineError::InvalidRecord {
            entity,
            message: message.into(),
        }
    }
}
