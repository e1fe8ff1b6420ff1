// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Per-frame decoding into history records
//!
//! Decoding is total: every frame produces exactly one record. Failures are
//! carried in the record's `error` field, never dropped. Records carry two
//! clocks: `timestamp` from the source (car) and `received_timestamp` from
//! the local wall clock; source timestamps may arrive out of order, so
//! consumers needing temporal order sort on `timestamp`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::codec::{CanFrame, CAN_DATA_LEN};
use crate::database::{CanDatabase, DatabaseError, SignalValue};

/// A frame augmented with database-derived signals and dual timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub can_id: u32,
    pub message_name: String,
    pub signals: BTreeMap<String, SignalValue>,
    pub raw_data: [u8; CAN_DATA_LEN],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Source-clock time (ISO-8601 with offset).
    pub timestamp: DateTime<Local>,
    /// Local wall clock when the record entered history.
    pub received_timestamp: DateTime<Local>,
}

/// Decodes frames against an optionally loaded bus database.
pub struct FrameDecoder {
    database: Option<Arc<dyn CanDatabase>>,
}

impl FrameDecoder {
    pub fn new(database: Option<Arc<dyn CanDatabase>>) -> Self {
        Self { database }
    }

    pub fn has_database(&self) -> bool {
        self.database.is_some()
    }

    /// Build a record from an arbitrary payload (1..=8 bytes, right-padded).
    pub fn record(
        &self,
        can_id: u32,
        payload: &[u8],
        timestamp: DateTime<Local>,
        received: DateTime<Local>,
    ) -> DecodedRecord {
        let mut raw_data = [0u8; CAN_DATA_LEN];
        let len = payload.len().min(CAN_DATA_LEN);
        raw_data[..len].copy_from_slice(&payload[..len]);

        let (message_name, signals, error) = match &self.database {
            None => ("Raw".to_string(), BTreeMap::new(), None),
            Some(db) => match db.decode(can_id, payload) {
                Ok(msg) => (msg.name, msg.signals, None),
                Err(e @ DatabaseError::UnknownId(_)) => {
                    ("Unknown".to_string(), BTreeMap::new(), Some(e.to_string()))
                }
                Err(e) => {
                    tracing::debug!(can_id, error = %e, "frame decode failed");
                    ("Unknown".to_string(), BTreeMap::new(), Some(e.to_string()))
                }
            },
        };

        DecodedRecord {
            can_id,
            message_name,
            signals,
            raw_data,
            error,
            timestamp,
            received_timestamp: received,
        }
    }

    /// Build a record from a wire frame, guarding its source timestamp.
    pub fn record_from_frame(&self, frame: &CanFrame, received: DateTime<Local>) -> DecodedRecord {
        let timestamp = source_time_from_secs(frame.timestamp, received);
        self.record(frame.can_id, &frame.data, timestamp, received)
    }
}

/// Convert a source-clock `f64` epoch-seconds value to a local timestamp.
///
/// NaN, negative, and out-of-range values fall back to `fallback` (the
/// receiver's wall clock).
pub fn source_time_from_secs(secs: f64, fallback: DateTime<Local>) -> DateTime<Local> {
    if !secs.is_finite() || secs < 0.0 {
        return fallback;
    }
    let millis = secs * 1000.0;
    if millis > i64::MAX as f64 {
        return fallback;
    }
    match Local.timestamp_millis_opt(millis as i64) {
        chrono::LocalResult::Single(ts) => ts,
        _ => fallback,
    }
}

/// Convert an epoch-milliseconds integer (the JSON-side unit) to a local
/// timestamp, falling back on out-of-range values.
pub fn source_time_from_millis(millis: i64, fallback: DateTime<Local>) -> DateTime<Local> {
    match Local.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(ts) => ts,
        _ => fallback,
    }
}

/// Epoch milliseconds for a wire frame timestamp, with the same guard as
/// [`source_time_from_secs`]. This is the only place seconds-as-double
/// becomes milliseconds-as-int.
pub fn frame_epoch_millis(secs: f64, fallback: DateTime<Local>) -> i64 {
    source_time_from_secs(secs, fallback).timestamp_millis()
}

/// Parse a CAN id given in decimal or `0x`-prefixed hex.
pub fn parse_can_id(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}
