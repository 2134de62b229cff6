//! Candle Cache (C2): process-wide keyed read-only store with reference-counted eviction.

use crate::domain::lab::errors::{LabError, LabResult};
use crate::domain::lab::types::{Candle, DatasetKey, Timeframe};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

/// An immutable, shareable view onto one dataset's candle slice.
pub type View = Arc<Vec<Candle>>;

/// Read-only collaborator the cache loads through. Implementors own the actual storage
/// (disk, a broker download cache, ...) which is explicitly out of scope for this crate.
pub trait HistoricalDataSource: Send + Sync {
    fn list_available(&self) -> Vec<(String, Timeframe, usize, i64, i64)>;

    /// Ascending `ts`. Timestamps may arrive in seconds or milliseconds; the cache
    /// normalizes them (see `normalize_timestamps`).
    fn load(&self, symbol: &str, timeframe: Timeframe) -> LabResult<Vec<Candle>>;
}

struct InFlight {
    result: Mutex<Option<LabResult<View>>>,
    ready: Condvar,
}

struct CacheState {
    entries: HashMap<DatasetKey, View>,
    in_progress: HashMap<DatasetKey, Arc<InFlight>>,
}

pub struct CandleCache<S: HistoricalDataSource> {
    source: Arc<S>,
    high_water_bars: usize,
    state: Mutex<CacheState>,
}

impl<S: HistoricalDataSource> CandleCache<S> {
    pub fn new(source: Arc<S>, high_water_bars: usize) -> Self {
        Self {
            source,
            high_water_bars,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                in_progress: HashMap::new(),
            }),
        }
    }

    /// Concurrent load misses for the same key coalesce onto a single loader.
    pub fn get_or_load(&self, key: &DatasetKey) -> LabResult<View> {
        let waiter_or_owner = {
            let mut state = self.state.lock().unwrap();
            if let Some(view) = state.entries.get(key) {
                return Ok(view.clone());
            }
            if let Some(in_flight) = state.in_progress.get(key) {
                Some(in_flight.clone())
            } else {
                state.in_progress.insert(
                    key.clone(),
                    Arc::new(InFlight {
                        result: Mutex::new(None),
                        ready: Condvar::new(),
                    }),
                );
                None
            }
        };

        match waiter_or_owner {
            Some(in_flight) => {
                let mut guard = in_flight.result.lock().unwrap();
                while guard.is_none() {
                    guard = in_flight.ready.wait(guard).unwrap();
                }
                guard.clone().unwrap()
            }
            None => {
                let result = self.load_and_normalize(key);
                let mut state = self.state.lock().unwrap();
                if let Ok(ref view) = result {
                    state.entries.insert(key.clone(), view.clone());
                }
                if let Some(in_flight) = state.in_progress.remove(key) {
                    let mut guard = in_flight.result.lock().unwrap();
                    *guard = Some(result.clone());
                    in_flight.ready.notify_all();
                }
                drop(state);
                self.evict_if_over_high_water();
                result
            }
        }
    }

    fn load_and_normalize(&self, key: &DatasetKey) -> LabResult<View> {
        let raw = self.source.load(&key.symbol, key.timeframe)?;
        if raw.is_empty() {
            return Err(LabError::DataNotFound {
                symbol: key.symbol.clone(),
                timeframe: key.timeframe.to_string(),
            });
        }
        let normalized: Vec<Candle> = raw
            .into_iter()
            .map(normalize_timestamp)
            .filter(|c| c.ts >= key.window_start && c.ts <= key.window_end)
            .collect();
        Ok(Arc::new(normalized))
    }

    /// Eviction is eligible only when refcount is zero (no external `Arc` clones held)
    /// AND total cached bars exceed the high-water mark; the largest unreferenced entry
    /// is evicted first.
    fn evict_if_over_high_water(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            let total_bars: usize = state.entries.values().map(|v| v.len()).sum();
            if total_bars <= self.high_water_bars {
                break;
            }
            let victim = state
                .entries
                .iter()
                .filter(|(_, v)| Arc::strong_count(v) == 1)
                .max_by_key(|(_, v)| v.len())
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    state.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn cached_dataset_keys(&self) -> HashSet<DatasetKey> {
        self.state.lock().unwrap().entries.keys().cloned().collect()
    }

    /// External eviction hint (used by the memory manager, C12) — runs the same
    /// unreferenced-entry eviction `get_or_load` triggers after a fresh load.
    pub fn evict_hint(&self) {
        self.evict_if_over_high_water();
    }
}

/// Auto-detects seconds vs. milliseconds by magnitude: `≥ 10^12` implies milliseconds.
fn normalize_timestamp(mut candle: Candle) -> Candle {
    if candle.ts < 1_000_000_000_000 {
        candle.ts *= 1000;
    }
    candle
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixtureSource {
        load_count: AtomicUsize,
    }

    impl HistoricalDataSource for FixtureSource {
        fn list_available(&self) -> Vec<(String, Timeframe, usize, i64, i64)> {
            vec![]
        }

        fn load(&self, symbol: &str, _timeframe: Timeframe) -> LabResult<Vec<Candle>> {
            self.load_count.fetch_add(1, Ordering::SeqCst);
            if symbol == "MISSING" {
                return Ok(vec![]);
            }
            Ok((0..100)
                .map(|i| Candle {
                    ts: 1_700_000_000 + i, // seconds; must be normalized to ms
                    open: dec!(100),
                    high: dec!(101),
                    low: dec!(99),
                    close: dec!(100),
                    volume: dec!(10),
                })
                .collect())
        }
    }

    fn key(symbol: &str) -> DatasetKey {
        DatasetKey {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M5,
            window_start: 0,
            window_end: i64::MAX,
        }
    }

    #[test]
    fn loads_and_normalizes_seconds_to_millis() {
        let source = Arc::new(FixtureSource {
            load_count: AtomicUsize::new(0),
        });
        let cache = CandleCache::new(source, 10_000);
        let view = cache.get_or_load(&key("XAUUSD")).unwrap();
        assert_eq!(view.len(), 100);
        assert!(view[0].ts >= 1_700_000_000_000);
    }

    #[test]
    fn repeated_get_or_load_hits_cache_not_source() {
        let source = Arc::new(FixtureSource {
            load_count: AtomicUsize::new(0),
        });
        let cache = CandleCache::new(source.clone(), 10_000);
        let _ = cache.get_or_load(&key("XAUUSD")).unwrap();
        let _ = cache.get_or_load(&key("XAUUSD")).unwrap();
        assert_eq!(source.load_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_symbol_yields_data_not_found() {
        let source = Arc::new(FixtureSource {
            load_count: AtomicUsize::new(0),
        });
        let cache = CandleCache::new(source, 10_000);
        let err = cache.get_or_load(&key("MISSING")).unwrap_err();
        assert_eq!(err.code(), "LAB_DATA_NOT_FOUND");
    }

    #[test]
    fn referenced_entries_are_not_evicted() {
        let source = Arc::new(FixtureSource {
            load_count: AtomicUsize::new(0),
        });
        let cache = CandleCache::new(source, 1); // tiny high-water mark
        let view = cache.get_or_load(&key("XAUUSD")).unwrap();
        // still holding `view`, so eviction must not have dropped the backing Vec
        assert_eq!(view.len(), 100);
    }
}
