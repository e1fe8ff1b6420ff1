// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Bus database interface for per-frame signal decoding
//!
//! The pipeline treats decoding as a pure `(id, bytes) -> message` function
//! behind the [`CanDatabase`] trait; it never parses DBC text itself. The
//! bundled [`MapDatabase`] loads a JSON signal map and covers the common
//! case (Intel byte order, linear scaling, value tables); a full DBC parser
//! can be plugged in through the same trait.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One decoded signal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Text(String),
}

/// Decoded message: name plus signal values.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub name: String,
    pub signals: BTreeMap<String, SignalValue>,
}

/// Decode failures surfaced in the record's `error` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// The frame id has no entry in the database.
    UnknownId(u32),
    /// Payload too short for any signal of the message.
    Truncated { name: String, got: usize },
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownId(_) => write!(f, "id not in database"),
            Self::Truncated { name, got } => {
                write!(f, "data too short for {} ({} bytes)", name, got)
            }
        }
    }
}

impl std::error::Error for DatabaseError {}

/// Pure per-frame decode function provided by an external collaborator.
pub trait CanDatabase: Send + Sync {
    fn decode(&self, can_id: u32, data: &[u8]) -> Result<DecodedMessage, DatabaseError>;
}

/// One signal layout within a message payload.
///
/// Bits are numbered LSB-first from byte 0 (Intel byte order). Truncated
/// payloads decode the signals that still fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    pub start_bit: u16,
    pub bit_length: u16,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub signed: bool,
    /// Value table: raw value -> label, reported as text when present.
    #[serde(default)]
    pub choices: HashMap<u64, String>,
}

fn default_scale() -> f64 {
    1.0
}

/// One message definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSpec {
    pub name: String,
    pub signals: Vec<SignalSpec>,
}

/// In-memory database keyed by frame id, loadable from a JSON signal map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapDatabase {
    messages: HashMap<u32, MessageSpec>,
}

impl MapDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, can_id: u32, spec: MessageSpec) {
        self.messages.insert(can_id, spec);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn from_json(json: &str) -> Result<Self, DatabaseLoadError> {
        serde_json::from_str(json).map_err(|e| DatabaseLoadError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, DatabaseLoadError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| DatabaseLoadError::Io(e.to_string()))?;
        Self::from_json(&content)
    }
}

impl CanDatabase for MapDatabase {
    fn decode(&self, can_id: u32, data: &[u8]) -> Result<DecodedMessage, DatabaseError> {
        let spec = self
            .messages
            .get(&can_id)
            .ok_or(DatabaseError::UnknownId(can_id))?;

        let available_bits = data.len() * 8;
        let mut signals = BTreeMap::new();
        for signal in &spec.signals {
            let end = usize::from(signal.start_bit) + usize::from(signal.bit_length);
            if end > available_bits {
                continue; // truncated payload, skip signals that do not fit
            }
            signals.insert(signal.name.clone(), extract_signal(signal, data));
        }

        if signals.is_empty() && !spec.signals.is_empty() {
            return Err(DatabaseError::Truncated {
                name: spec.name.clone(),
                got: data.len(),
            });
        }

        Ok(DecodedMessage {
            name: spec.name.clone(),
            signals,
        })
    }
}

fn extract_signal(signal: &SignalSpec, data: &[u8]) -> SignalValue {
    let mut raw: u64 = 0;
    for i in 0..u64::from(signal.bit_length) {
        let pos = usize::from(signal.start_bit) + i as usize;
        let bit = (data[pos / 8] >> (pos % 8)) & 1;
        raw |= u64::from(bit) << i;
    }

    if let Some(label) = signal.choices.get(&raw) {
        return SignalValue::Text(label.clone());
    }

    let value = if signal.signed && signal.bit_length > 0 && signal.bit_length < 64 {
        // Sign-extend the raw value from bit_length bits.
        let shift = 64 - u32::from(signal.bit_length);
        (((raw << shift) as i64) >> shift) as f64
    } else {
        raw as f64
    };

    SignalValue::Number(value * signal.scale + signal.offset)
}

/// Database file loading errors.
#[derive(Debug, Clone)]
pub enum DatabaseLoadError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for DatabaseLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Parse(s) => write!(f, "Parse error: {}", s),
        }
    }
}

impl std::error::Error for DatabaseLoadError {}
