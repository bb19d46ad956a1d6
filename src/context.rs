use crate::config::AppSettings;
use crate::data_context::MarketData;
use crate::database::Database;
use crate::retry::retry_store_operation;
use crate::store::{MemoryStore, TradingStore};
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::info;
use std::path::Path;

#[derive(Clone, Copy, Debug, Default)]
pub struct MarketDataFilters {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl MarketDataFilters {
    pub fn is_empty(&self) -> bool {
        self.start_date.is_none() && self.end_date.is_none()
    }
}

/// Settings plus store construction shared by every CLI command.
#[derive(Debug, Clone)]
pub struct AppContext {
    settings: AppSettings,
}

impl AppContext {
    pub fn initialize(settings: AppSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn has_database(&self) -> bool {
        self.settings
            .database_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    /// Connect to Postgres and make sure the schema exists.
    pub fn database(&self) -> Result<Database> {
        let Some(database_url) = self.settings.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed commands."
            ));
        };
        retry_store_operation("database connection", || {
            let db = Database::connect(database_url)?;
            db.ensure_schema()?;
            Ok(db)
        })
    }

    /// In-memory store seeded from a market data snapshot file.
    pub fn memory_store_from_file<P: AsRef<Path>>(
        &self,
        data_file: P,
        filters: MarketDataFilters,
    ) -> Result<MemoryStore> {
        let mut market_data = MarketData::load_from_file(data_file)?;
        if !filters.is_empty() {
            market_data = market_data.restrict_to_date_range(filters.start_date, filters.end_date)?;
        }
        info!(
            "Using {} instruments and {} bars from snapshot",
            market_data.instruments().len(),
            market_data.bar_count()
        );
        Ok(market_data.into_store())
    }

    /// The snapshot file when one is given, the database otherwise.
    pub fn store(
        &self,
        data_file: Option<&Path>,
        filters: MarketDataFilters,
    ) -> Result<Box<dyn TradingStore>> {
        match data_file {
            Some(path) => Ok(Box::new(self.memory_store_from_file(path, filters)?)),
            None => Ok(Box::new(self.database()?)),
        }
    }
}
