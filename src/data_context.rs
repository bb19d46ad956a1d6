use crate::models::{Instrument, PriceBar};
use crate::store::{MemoryStore, TradingStore};
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    instruments: Vec<Instrument>,
    bars: Vec<PriceBar>,
}

/// Daily bars for a set of instruments, loaded once and replayed offline.
#[derive(Debug, Clone)]
pub struct MarketData {
    instruments: Vec<Instrument>,
    bars: BTreeMap<i64, Vec<PriceBar>>,
    unique_dates: Vec<NaiveDate>,
}

/// Union of every date that appears in any series, ascending.
pub fn trading_calendar(bars: &BTreeMap<i64, Vec<PriceBar>>) -> Vec<NaiveDate> {
    bars.values()
        .flat_map(|series| series.iter().map(|bar| bar.date))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl MarketData {
    pub fn from_parts(instruments: Vec<Instrument>, bars: Vec<PriceBar>) -> Self {
        let mut by_instrument: BTreeMap<i64, Vec<PriceBar>> = BTreeMap::new();
        for bar in bars {
            by_instrument.entry(bar.instrument_id).or_default().push(bar);
        }
        for series in by_instrument.values_mut() {
            series.sort_by_key(|bar| bar.date);
            series.dedup_by_key(|bar| bar.date);
        }
        let unique_dates = trading_calendar(&by_instrument);
        Self {
            instruments,
            bars: by_instrument,
            unique_dates,
        }
    }

    /// Pull the active universe and its bars in `[start, end]` from a store.
    pub fn load<S: TradingStore + ?Sized>(
        store: &S,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Self> {
        info!("Loading active instruments...");
        let instruments = store.get_active_instruments()?;
        let ids: Vec<i64> = instruments.iter().map(|instrument| instrument.id).collect();
        info!(
            "Loading price history for {} instruments ({} - {})",
            ids.len(),
            start_date,
            end_date
        );
        let history = store.get_price_history_range(&ids, start_date, end_date)?;
        let bars: Vec<PriceBar> = history.into_values().flatten().collect();
        let market_data = Self::from_parts(instruments, bars);
        info!(
            "Loaded {} bars across {} trading days",
            market_data.bar_count(),
            market_data.unique_dates.len()
        );
        Ok(market_data)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }
        if snapshot.instruments.is_empty() || snapshot.bars.is_empty() {
            return Err(anyhow!(
                "Market data snapshot has no usable instruments or bars"
            ));
        }

        Ok(Self::from_parts(snapshot.instruments, snapshot.bars))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            instruments: self.instruments.clone(),
            bars: self.bars.values().flatten().cloned().collect(),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn restrict_to_date_range(
        self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Self> {
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if start > end {
                return Err(anyhow!(
                    "Invalid market data date range: {} is after {}",
                    start,
                    end
                ));
            }
        }

        let bars: Vec<PriceBar> = self
            .bars
            .into_values()
            .flatten()
            .filter(|bar| start_date.is_none_or(|start| bar.date >= start))
            .filter(|bar| end_date.is_none_or(|end| bar.date <= end))
            .collect();
        if bars.is_empty() {
            return Err(anyhow!("No price data remains after restricting the date range"));
        }
        Ok(Self::from_parts(self.instruments, bars))
    }

    /// Materialize an in-memory store holding these instruments and bars.
    pub fn into_store(self) -> MemoryStore {
        let mut store = MemoryStore::new();
        for instrument in self.instruments {
            store.insert_instrument(instrument);
        }
        store.add_bars(self.bars.into_values().flatten());
        store
    }

    pub fn has_data(&self) -> bool {
        !self.unique_dates.is_empty()
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn bars(&self) -> &BTreeMap<i64, Vec<PriceBar>> {
        &self.bars
    }

    pub fn unique_dates(&self) -> &[NaiveDate] {
        &self.unique_dates
    }

    pub fn bar_count(&self) -> usize {
        self.bars.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(instrument_id: i64, day: u32, close: f64) -> PriceBar {
        PriceBar {
            instrument_id,
            date: NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
            open: Some(close),
            high: Some(close + 0.5),
            low: Some(close - 0.5),
            close,
            volume: 1_000,
            adjusted_close: None,
        }
    }

    fn instrument(id: i64, symbol: &str) -> Instrument {
        Instrument {
            id,
            symbol: symbol.to_string(),
            name: None,
            active: true,
        }
    }

    #[test]
    fn calendar_is_union_of_dates_with_gaps() {
        let data = MarketData::from_parts(
            vec![instrument(1, "AAA"), instrument(2, "BBB")],
            vec![bar(1, 3, 1.0), bar(1, 4, 1.0), bar(2, 4, 2.0), bar(2, 6, 2.0)],
        );
        let days: Vec<u32> = data.unique_dates().iter().map(|d| d.day()).collect();
        assert_eq!(days, vec![3, 4, 6]);
        assert_eq!(data.bar_count(), 4);
    }

    #[test]
    fn snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("market.bin");
        let data = MarketData::from_parts(
            vec![instrument(1, "AAA")],
            vec![bar(1, 3, 10.0), bar(1, 4, 11.0)],
        );
        data.save_to_file(&path).unwrap();

        let loaded = MarketData::load_from_file(&path).unwrap();
        assert_eq!(loaded.instruments(), data.instruments());
        assert_eq!(loaded.bars(), data.bars());
    }

    #[test]
    fn rejects_unknown_snapshot_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.bin");
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION + 1,
            generated_at: Utc::now(),
            instruments: vec![instrument(1, "AAA")],
            bars: vec![bar(1, 3, 1.0)],
        };
        let file = File::create(&path).unwrap();
        bincode::serialize_into(BufWriter::new(file), &snapshot).unwrap();

        let err = MarketData::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn date_restriction_and_store_materialization() {
        let data = MarketData::from_parts(
            vec![instrument(5, "AAA")],
            vec![bar(5, 3, 1.0), bar(5, 4, 2.0), bar(5, 5, 3.0)],
        );
        let restricted = data
            .restrict_to_date_range(Some(NaiveDate::from_ymd_opt(2024, 6, 4).unwrap()), None)
            .unwrap();
        assert_eq!(restricted.unique_dates().len(), 2);

        let store = restricted.into_store();
        assert_eq!(store.get_instrument(5).unwrap().unwrap().symbol, "AAA");
        assert_eq!(store.get_latest_price(5).unwrap().unwrap().close, 3.0);
    }
}
