// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Bounded in-memory history of decoded records
//!
//! Single mutex covers append and the snapshot copy; filtering runs on the
//! snapshot outside the lock. Eviction is oldest-first once the configured
//! limit is exceeded, so `len() <= limit` holds at all times.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};

use crate::decode::DecodedRecord;

/// Hard cap on rows returned by a query.
pub const QUERY_LIMIT_MAX: usize = 500;

/// Default rows returned by a query.
pub const QUERY_LIMIT_DEFAULT: usize = 100;

/// Windowing mode for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Every record currently in history.
    All,
    /// The newest `time_range` records.
    Count,
    /// Records received within the last `time_range` seconds.
    ReceivedTime,
    /// Records whose source timestamp is within the last `time_range` seconds.
    OriginalTime,
}

/// A pull query over history.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub filter_mode: FilterMode,
    /// Seconds for the time-based modes, a row count for `Count`.
    pub time_range: i64,
    pub can_id: Option<u32>,
    pub message_name: Option<String>,
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            filter_mode: FilterMode::ReceivedTime,
            time_range: 60,
            can_id: None,
            message_name: None,
            limit: QUERY_LIMIT_DEFAULT,
        }
    }
}

/// Thread-safe bounded queue of decoded records.
pub struct History {
    records: Mutex<VecDeque<DecodedRecord>>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(limit.min(4096))),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DecodedRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::debug!("history lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Append a record, evicting from the oldest end past the limit.
    pub fn append(&self, record: DecodedRecord) {
        let mut records = self.lock();
        records.push_back(record);
        while records.len() > self.limit {
            records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the full window, oldest first.
    pub fn snapshot(&self) -> Vec<DecodedRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Run a filtered query: window, then exact-match filters, then newest
    /// first, truncated to the (capped) limit. Ties keep insertion order.
    pub fn query(&self, query: &HistoryQuery) -> Vec<DecodedRecord> {
        let snapshot = self.snapshot();
        let now = Local::now();

        let windowed: Vec<DecodedRecord> = match query.filter_mode {
            FilterMode::All => snapshot,
            FilterMode::Count => {
                let take = (query.time_range.max(0) as usize).min(snapshot.len());
                snapshot[snapshot.len() - take..].to_vec()
            }
            FilterMode::ReceivedTime => {
                let cutoff = now - ChronoDuration::seconds(query.time_range);
                snapshot
                    .into_iter()
                    .filter(|r| r.received_timestamp >= cutoff)
                    .collect()
            }
            FilterMode::OriginalTime => {
                let cutoff = now - ChronoDuration::seconds(query.time_range);
                snapshot
                    .into_iter()
                    .filter(|r| r.timestamp >= cutoff)
                    .collect()
            }
        };

        let limit = query.limit.clamp(1, QUERY_LIMIT_MAX);
        windowed
            .into_iter()
            .filter(|r| query.can_id.map_or(true, |id| r.can_id == id))
            .filter(|r| {
                query
                    .message_name
                    .as_deref()
                    .map_or(true, |name| r.message_name == name)
            })
            .rev()
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::FrameDecoder;
    use chrono::DateTime;

    fn record(can_id: u32, offset_secs: i64) -> DecodedRecord {
        let ts = Local::now() - ChronoDuration::seconds(offset_secs);
        record_at(can_id, ts, ts)
    }

    fn record_at(
        can_id: u32,
        timestamp: DateTime<Local>,
        received: DateTime<Local>,
    ) -> DecodedRecord {
        FrameDecoder::new(None).record(can_id, &[0; 8], timestamp, received)
    }

    #[test]
    fn test_append_respects_limit() {
        let history = History::new(5);
        for i in 0..20 {
            history.append(record(i, 0));
            assert!(history.len() <= 5, "history bound must hold at all times");
        }
        let snap = history.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].can_id, 15, "oldest evicted first");
        assert_eq!(snap[4].can_id, 19);
    }

    #[test]
    fn test_query_all() {
        let history = History::new(100);
        for i in 0..3 {
            history.append(record(i, 0));
        }
        let rows = history.query(&HistoryQuery {
            filter_mode: FilterMode::All,
            ..Default::default()
        });
        assert_eq!(rows.len(), 3);
        // newest first
        assert_eq!(rows[0].can_id, 2);
        assert_eq!(rows[2].can_id, 0);
    }

    #[test]
    fn test_query_count_window() {
        // records with can_id 10, 20, 10 added in order (t, t+1, t+2)
        let history = History::new(100);
        history.append(record(10, 2));
        history.append(record(20, 1));
        history.append(record(10, 0));

        let rows = history.query(&HistoryQuery {
            filter_mode: FilterMode::Count,
            time_range: 2,
            ..Default::default()
        });
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].can_id, 10, "newest first");
        assert_eq!(rows[1].can_id, 20);
    }

    #[test]
    fn test_query_received_time_with_id_filter() {
        let history = History::new(100);
        history.append(record(10, 30));
        history.append(record(20, 30));
        history.append(record(10, 0));

        let rows = history.query(&HistoryQuery {
            filter_mode: FilterMode::ReceivedTime,
            time_range: 5,
            can_id: Some(10),
            ..Default::default()
        });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].can_id, 10);
    }

    #[test]
    fn test_query_original_time_uses_source_clock() {
        let history = History::new(100);
        let now = Local::now();
        // Source timestamp old, received just now: out-of-order arrival.
        history.append(record_at(1, now - ChronoDuration::seconds(3600), now));
        history.append(record_at(2, now, now));

        let rows = history.query(&HistoryQuery {
            filter_mode: FilterMode::OriginalTime,
            time_range: 60,
            ..Default::default()
        });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].can_id, 2);
    }

    #[test]
    fn test_query_message_name_filter() {
        let history = History::new(100);
        history.append(record(1, 0));
        let rows = history.query(&HistoryQuery {
            filter_mode: FilterMode::All,
            message_name: Some("Raw".into()),
            ..Default::default()
        });
        assert_eq!(rows.len(), 1);

        let none = history.query(&HistoryQuery {
            filter_mode: FilterMode::All,
            message_name: Some("EngineData".into()),
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_query_limit_capped() {
        let history = History::new(1000);
        for i in 0..700 {
            history.append(record(i, 0));
        }
        let rows = history.query(&HistoryQuery {
            filter_mode: FilterMode::All,
            limit: 10_000,
            ..Default::default()
        });
        assert_eq!(rows.len(), QUERY_LIMIT_MAX);
        assert_eq!(rows[0].can_id, 699, "newest first after truncation");
    }

    #[test]
    fn test_filter_mode_wire_names() {
        assert_eq!(
            serde_json::from_str::<FilterMode>("\"received_time\"").unwrap(),
            FilterMode::ReceivedTime
        );
        assert_eq!(
            serde_json::from_str::<FilterMode>("\"original_time\"").unwrap(),
            FilterMode::OriginalTime
        );
        assert_eq!(
            serde_json::from_str::<FilterMode>("\"all\"").unwrap(),
            FilterMode::All
        );
        assert_eq!(
            serde_json::from_str::<FilterMode>("\"count\"").unwrap(),
            FilterMode::Count
        );
    }
}
