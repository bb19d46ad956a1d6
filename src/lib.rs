pub mod analyzer;
pub mod config;
pub mod context;
pub mod data_context;
pub mod database;
pub mod engine;
pub mod error;
pub mod executor;
pub mod models;
pub mod paper;
pub mod param_utils;
pub mod performance;
pub mod retry;
pub mod risk;
pub mod store;
pub mod strategy;
pub mod trading_rules;

pub mod commands {
    pub mod account;
    pub mod backtest;
    pub mod execute;
    pub mod export_market_data;
    pub mod order;
    pub mod report;
    pub mod risk;
    pub mod snapshot;
}
