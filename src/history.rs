//! Bounded reading history
//!
//! Readings are kept in arrival order. Once the buffer holds
//! [`HISTORY_CAPACITY`] entries, each append evicts the oldest one. The whole
//! buffer is persisted after every append and reloaded at startup.

use crate::observability::metrics;
use crate::protocol::Reading;
use crate::settings::Settings;
use crate::storage::{KeyValueStore, HISTORY_KEY};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maximum number of readings retained
pub const HISTORY_CAPACITY: usize = 100;

/// Number of most recent readings summarised by [`HistoryStats`]
pub const STATS_WINDOW: usize = 50;

/// Append-only, oldest-evicted store of past readings
pub struct HistoryBuffer {
    entries: VecDeque<Reading>,
    storage: Arc<dyn KeyValueStore>,
}

impl HistoryBuffer {
    /// Empty buffer persisting to `storage`
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY_CAPACITY + 1),
            storage,
        }
    }

    /// Seed the buffer from persisted storage
    ///
    /// Oversized records are truncated to the most recent
    /// [`HISTORY_CAPACITY`] entries. Unreadable or corrupt records yield an
    /// empty buffer.
    pub async fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let mut buffer = Self::new(storage);

        let persisted = match buffer.storage.get(HISTORY_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Reading>>(&raw) {
                Ok(readings) => readings,
                Err(e) => {
                    warn!(error = %e, "Persisted history is corrupt, starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read history, starting empty");
                metrics().persistence_failed();
                Vec::new()
            }
        };

        let skip = persisted.len().saturating_sub(HISTORY_CAPACITY);
        if skip > 0 {
            warn!(
                persisted = persisted.len(),
                kept = HISTORY_CAPACITY,
                "Persisted history exceeds capacity, truncating"
            );
        }
        buffer.entries.extend(persisted.into_iter().skip(skip));
        debug!(len = buffer.entries.len(), "Loaded history");
        buffer
    }

    fn push(&mut self, reading: Reading) {
        self.entries.push_back(reading);
        while self.entries.len() > HISTORY_CAPACITY {
            self.entries.pop_front();
        }
    }

    /// Add a reading at the end, evict beyond capacity, and persist
    ///
    /// A failed write is logged; the in-memory buffer keeps the reading.
    pub async fn append(&mut self, reading: Reading) {
        self.push(reading);
        self.persist().await;
    }

    async fn persist(&self) {
        let json = match serde_json::to_string(&self.entries) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize history");
                return;
            }
        };
        if let Err(e) = self.storage.set(HISTORY_KEY, &json).await {
            warn!(error = %e, "Failed to persist history");
            metrics().persistence_failed();
        }
    }

    /// Full history, oldest first
    pub fn snapshot(&self) -> Vec<Reading> {
        self.entries.iter().cloned().collect()
    }

    /// The most recent `last_n` readings, oldest first
    pub fn slice(&self, last_n: usize) -> Vec<Reading> {
        let skip = self.entries.len().saturating_sub(last_n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Summary of recent readings against the current thresholds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryStats {
    pub average: i32,
    pub maximum: i32,
    pub minimum: i32,
    pub good_percentage: u32,
    pub moderate_percentage: u32,
    pub high_percentage: u32,
    /// Number of channel values the statistics were computed from
    pub total_values: usize,
}

impl HistoryStats {
    /// Compute statistics over the last [`STATS_WINDOW`] readings
    ///
    /// Both channels contribute; zero and negative values are excluded.
    /// Returns `None` when no value remains.
    pub fn compute(readings: &[Reading], settings: &Settings) -> Option<Self> {
        let window = &readings[readings.len().saturating_sub(STATS_WINDOW)..];
        let values: Vec<i32> = window
            .iter()
            .flat_map(|r| [r.co2_1, r.co2_2])
            .filter(|v| *v > 0)
            .collect();

        if values.is_empty() {
            return None;
        }

        let total = values.len();
        let sum: i64 = values.iter().map(|v| i64::from(*v)).sum();
        let good = values
            .iter()
            .filter(|v| **v < settings.low_threshold)
            .count();
        let high = values
            .iter()
            .filter(|v| **v >= settings.high_threshold)
            .count();
        let moderate = total - good - high;

        let percent = |count: usize| ((count as f64 / total as f64) * 100.0).round() as u32;

        Some(Self {
            average: (sum as f64 / total as f64).round() as i32,
            maximum: values.iter().copied().max().unwrap_or_default(),
            minimum: values.iter().copied().min().unwrap_or_default(),
            good_percentage: percent(good),
            moderate_percentage: percent(moderate),
            high_percentage: percent(high),
            total_values: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;

    fn reading(timestamp: i64, co2_1: i32, co2_2: i32) -> Reading {
        Reading {
            timestamp,
            co2_1,
            co2_2,
            wifi_rssi: -55,
            heap_free: 150_000,
            device: "esp32-co2-01".to_string(),
        }
    }

    fn empty_buffer() -> HistoryBuffer {
        HistoryBuffer::new(Arc::new(MemoryStore::new()))
    }

    proptest! {
        #[test]
        fn buffer_keeps_most_recent_readings_in_order(count in 0usize..350) {
            let mut buffer = empty_buffer();
            for i in 0..count {
                buffer.push(reading(i as i64, 400, 400));
            }

            let snapshot = buffer.snapshot();
            prop_assert_eq!(snapshot.len(), count.min(HISTORY_CAPACITY));

            let first_kept = count.saturating_sub(HISTORY_CAPACITY);
            for (offset, r) in snapshot.iter().enumerate() {
                prop_assert_eq!(r.timestamp, (first_kept + offset) as i64);
            }
        }

        #[test]
        fn slice_never_exceeds_buffer(count in 0usize..150, last_n in 0usize..200) {
            let mut buffer = empty_buffer();
            for i in 0..count {
                buffer.push(reading(i as i64, 400, 400));
            }
            let slice = buffer.slice(last_n);
            prop_assert_eq!(slice.len(), last_n.min(buffer.len()));
            if let Some(last) = slice.last() {
                prop_assert_eq!(last.timestamp, count as i64 - 1);
            }
        }
    }

    #[tokio::test]
    async fn test_101_appends_evict_first_reading() {
        let mut buffer = empty_buffer();
        for i in 0..101 {
            buffer.append(reading(i, 500 + i as i32, 500)).await;
        }

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 100);
        assert!(snapshot.iter().all(|r| r.timestamp != 0));
        assert_eq!(snapshot.last().unwrap().timestamp, 100);
        assert_eq!(snapshot.first().unwrap().timestamp, 1);
    }

    #[test]
    fn test_slice_of_small_buffer_returns_everything() {
        let mut buffer = empty_buffer();
        for i in 0..3 {
            buffer.push(reading(i, 400, 400));
        }
        assert_eq!(buffer.slice(10).len(), 3);
        assert_eq!(buffer.slice(2).first().unwrap().timestamp, 1);
        assert!(empty_buffer().slice(5).is_empty());
    }

    #[tokio::test]
    async fn test_append_persists_full_buffer() {
        let storage = Arc::new(MemoryStore::new());
        let mut buffer = HistoryBuffer::new(storage.clone());

        buffer.append(reading(1, 400, 410)).await;
        buffer.append(reading(2, 420, 430)).await;

        assert_eq!(storage.write_count(), 2);
        let raw = storage.raw(HISTORY_KEY).await.unwrap();
        let persisted: Vec<Reading> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted, buffer.snapshot());
    }

    #[tokio::test]
    async fn test_persist_then_reload_round_trip() {
        let storage = Arc::new(MemoryStore::new());
        let mut buffer = HistoryBuffer::new(storage.clone());
        for i in 0..130 {
            buffer.append(reading(i, 600, 610)).await;
        }

        let reloaded = HistoryBuffer::load(storage).await;
        assert_eq!(reloaded.snapshot(), buffer.snapshot());
        assert_eq!(reloaded.len(), HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn test_load_truncates_oversized_record() {
        let oversized: Vec<Reading> = (0..250).map(|i| reading(i, 400, 400)).collect();
        let storage = MemoryStore::new()
            .with_entry(HISTORY_KEY, &serde_json::to_string(&oversized).unwrap())
            .await;

        let buffer = HistoryBuffer::load(Arc::new(storage)).await;
        assert_eq!(buffer.len(), HISTORY_CAPACITY);
        assert_eq!(buffer.snapshot().first().unwrap().timestamp, 150);
        assert_eq!(buffer.snapshot().last().unwrap().timestamp, 249);
    }

    #[tokio::test]
    async fn test_load_corrupt_record_starts_empty() {
        let storage = MemoryStore::new()
            .with_entry(HISTORY_KEY, r#"[{"timestamp":"oops"}]"#)
            .await;
        assert!(HistoryBuffer::load(Arc::new(storage)).await.is_empty());
    }

    #[tokio::test]
    async fn test_append_survives_write_failure() {
        let storage = Arc::new(MemoryStore::new());
        storage.set_fail_writes(true);
        let mut buffer = HistoryBuffer::new(storage);

        buffer.append(reading(1, 400, 400)).await;
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_stats_none_without_valid_values() {
        let settings = Settings::default();
        assert!(HistoryStats::compute(&[], &settings).is_none());
        assert!(HistoryStats::compute(&[reading(1, -1, 0)], &settings).is_none());
    }

    #[test]
    fn test_stats_classification() {
        let settings = Settings::default(); // low 800, high 1200
        let readings = vec![
            reading(1, 600, -1),  // good
            reading(2, 900, 1000), // moderate, moderate
            reading(3, 1200, 1500), // high, high
        ];

        let stats = HistoryStats::compute(&readings, &settings).unwrap();
        assert_eq!(stats.total_values, 5);
        assert_eq!(stats.average, 1040);
        assert_eq!(stats.maximum, 1500);
        assert_eq!(stats.minimum, 600);
        assert_eq!(stats.good_percentage, 20);
        assert_eq!(stats.moderate_percentage, 40);
        assert_eq!(stats.high_percentage, 40);
    }

    #[test]
    fn test_stats_only_use_recent_window() {
        let settings = Settings::default();
        let mut readings: Vec<Reading> = (0..10).map(|i| reading(i, 5000, 5000)).collect();
        readings.extend((10..60).map(|i| reading(i, 500, 500)));

        let stats = HistoryStats::compute(&readings, &settings).unwrap();
        assert_eq!(stats.total_values, 100);
        assert_eq!(stats.maximum, 500);
        assert_eq!(stats.good_percentage, 100);
    }
}
