// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! External pub/sub side-channel for off-process consumers
//!
//! Dashboards and log sinks outside this process consume the `can_messages`
//! and `system_stats` channels over Redis. When Redis is unreachable at
//! startup the same capability falls through to a named FIFO carrying
//! line-delimited JSON. The binding is decided once; publish sites see a
//! single surface.

use std::ffi::CString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use redis::AsyncCommands;

/// Budget for the startup Redis connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Side-channel publish failures. All are transient: the caller logs at
/// debug level and keeps going.
#[derive(Debug)]
pub enum BusError {
    Redis(String),
    Io(String),
    /// FIFO has no reader attached; the publish is dropped.
    NoReader,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redis(s) => write!(f, "redis error: {}", s),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::NoReader => write!(f, "no FIFO reader attached"),
        }
    }
}

impl std::error::Error for BusError {}

/// Redis pub/sub backend.
pub struct RedisBus {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Redis(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Redis(e.to_string()))?;
        Ok(Self { conn })
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<(), BusError> {
        self.conn
            .publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| BusError::Redis(e.to_string()))
    }
}

/// Named-FIFO fallback backend: one JSON object per line,
/// `{"channel":<name>,"data":<payload>}`.
pub struct FifoBus {
    path: PathBuf,
}

impl FifoBus {
    /// Create the FIFO if it does not exist yet.
    pub fn create(path: &Path) -> Result<Self, BusError> {
        if !path.exists() {
            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|e| BusError::Io(e.to_string()))?;
            // mkfifo: u=rw, g=r, o=r
            let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
            if rc != 0 {
                return Err(BusError::Io(std::io::Error::last_os_error().to_string()));
            }
            tracing::info!(path = %path.display(), "created named pipe");
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn publish(&mut self, channel: &str, payload: &str) -> Result<(), BusError> {
        // Open per publish with O_NONBLOCK: opening a FIFO for writing with
        // no reader fails with ENXIO instead of blocking the pipeline.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| {
                if e.raw_os_error() == Some(libc::ENXIO) {
                    BusError::NoReader
                } else {
                    BusError::Io(e.to_string())
                }
            })?;

        let channel_json =
            serde_json::to_string(channel).map_err(|e| BusError::Io(e.to_string()))?;
        let line = format!("{{\"channel\":{},\"data\":{}}}\n", channel_json, payload);
        file.write_all(line.as_bytes())
            .map_err(|e| BusError::Io(e.to_string()))
    }
}

/// The side-channel binding, decided once at startup.
pub enum BusBackend {
    Redis(RedisBus),
    Fifo(FifoBus),
}

impl BusBackend {
    /// Try Redis first; fall through to the FIFO on any connection failure.
    pub async fn connect(redis_url: &str, pipe_path: &Path) -> Self {
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, RedisBus::connect(redis_url))
            .await
            .unwrap_or_else(|_| Err(BusError::Redis("connection timed out".into())));
        match attempt {
            Ok(bus) => {
                tracing::info!(url = redis_url, "publishing to Redis");
                Self::Redis(bus)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, falling back to named pipe");
                match FifoBus::create(pipe_path) {
                    Ok(bus) => Self::Fifo(bus),
                    Err(create_err) => {
                        tracing::error!(error = %create_err, "could not create named pipe");
                        Self::Fifo(FifoBus {
                            path: pipe_path.to_path_buf(),
                        })
                    }
                }
            }
        }
    }

    pub async fn publish(&mut self, channel: &str, payload: &str) -> Result<(), BusError> {
        match self {
            Self::Redis(bus) => bus.publish(channel, payload).await,
            Self::Fifo(bus) => bus.publish(channel, payload),
        }
    }

    /// Human-readable binding name, surfaced by the health endpoint.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Redis(_) => "Redis Pub/Sub",
            Self::Fifo(_) => "Named Pipe",
        }
    }
}
