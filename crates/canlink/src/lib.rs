// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! # canlink
//!
//! Reliable framed CAN telemetry over a lossy radio link.
//!
//! The car side batches bus frames under monotonic sequence numbers, ships
//! them as UDP datagrams, and keeps a one-minute retention ring for
//! retransmission. The base side tracks sequence gaps, recovers missed
//! batches over a TCP side channel, decodes every frame against an optional
//! bus database, and fans decoded records out to an in-memory history and
//! any number of streaming subscribers with non-blocking backpressure.
//!
//! ```text
//! CAN source -> Sender (batch + seq + ring) -> UDP -> Receiver (gaps)
//!                  ^                                      |
//!                  +-- Recovery server <- TCP <- Recovery client
//!                                                         v
//!                                          Decoder -> History + Broker
//! ```
//!
//! Everything is bounded: batch size, ring age, history depth, the missing
//! set, and per-subscriber queues. A stuck consumer loses its own messages,
//! never anyone else's.

pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod database;
pub mod decode;
pub mod gap;
pub mod history;
pub mod node;
pub mod receiver;
pub mod recovery;
pub mod ring;
pub mod sender;
pub mod source;
pub mod stats;

pub use broker::{Broker, ChannelMessage, Subscription};
pub use codec::{Batch, CanFrame};
pub use config::{NodeConfig, Role};
pub use database::{CanDatabase, MapDatabase};
pub use decode::{DecodedRecord, FrameDecoder};
pub use gap::GapTracker;
pub use history::{FilterMode, History, HistoryQuery};
pub use node::{run_car, spawn_base, BaseNode, NodeError};
pub use ring::RetransmitRing;
pub use stats::{LinkStats, StatsSnapshot};
