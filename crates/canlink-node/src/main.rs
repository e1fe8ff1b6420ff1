// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! CAN telemetry node
//!
//! One binary for both ends of the radio link. The car side sniffs the bus
//! (or simulates it), batches frames, and answers retransmission requests;
//! the base side receives, recovers, decodes, and serves the REST + SSE
//! API for dashboards.
//!
//! # Usage
//!
//! ```bash
//! # Car side, simulated CAN source
//! SIMULATE=true REMOTE_IP=10.0.0.2 canlink-node --role car
//!
//! # Base side with a signal map
//! DBC_FILE=wfr25.json canlink-node --role base
//!
//! # Role from the environment (ROLE=car|base|auto)
//! canlink-node
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use canlink::config::{NodeConfig, Role};
use canlink::database::{CanDatabase, MapDatabase};
use canlink::node::{run_car, shutdown_channel, spawn_base};
use canlink::source::{run_sim_source, SIM_PERIOD};

mod handlers;
mod routes;
mod state;
mod stream;

use state::AppState;

/// CAN telemetry node - reliable radio link between car and base station
#[derive(Parser, Debug)]
#[command(name = "canlink-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run as car, base, or auto (overrides ROLE)
    #[arg(short, long)]
    role: Option<Role>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = NodeConfig::from_env().context("invalid configuration")?;
    if let Some(role) = args.role {
        config.role = role;
    }

    let role = config.resolved_role();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        %role,
        remote = %config.remote_ip,
        "canlink node starting"
    );

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    match role {
        Role::Car => run_car_role(&config, shutdown_rx).await,
        Role::Base | Role::Auto => run_base_role(&config, shutdown_rx).await,
    }
}

async fn run_car_role(
    config: &NodeConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let (frame_tx, frame_rx) = mpsc::channel(1024);

    if config.simulate {
        tokio::spawn(run_sim_source(frame_tx, SIM_PERIOD, shutdown.clone()));
    } else {
        // The CAN adapter feeds the link from outside this binary; park the
        // sender so the ingest channel stays open while the sender idles.
        tracing::warn!("no CAN source configured (set SIMULATE=true to bench); sender will idle");
        let mut sd = shutdown.clone();
        tokio::spawn(async move {
            let _keep_open = frame_tx;
            sd.changed().await.ok();
        });
    }

    run_car(config, frame_rx, shutdown)
        .await
        .context("car pipeline failed")?;
    Ok(())
}

async fn run_base_role(
    config: &NodeConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let database = load_database(config);
    let base = spawn_base(config, database, shutdown.clone())
        .await
        .context("base pipeline failed to start")?;

    let app_state = Arc::new(AppState {
        history: Arc::clone(&base.history),
        broker: Arc::clone(&base.broker),
        decoder: Arc::clone(&base.decoder),
        bus_mode: base.bus_mode,
    });

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind HTTP API on {}", addr))?;
    tracing::info!(%addr, "HTTP API listening");

    let mut http_shutdown = shutdown;
    axum::serve(listener, routes::router(app_state))
        .with_graceful_shutdown(async move {
            http_shutdown.changed().await.ok();
        })
        .await
        .context("HTTP server failed")?;

    base.join().await;
    Ok(())
}

fn load_database(config: &NodeConfig) -> Option<Arc<dyn CanDatabase>> {
    let path = config.dbc_file.as_deref()?;
    match MapDatabase::from_file(path) {
        Ok(db) => {
            tracing::info!(path = %path.display(), messages = db.len(), "bus database loaded");
            Some(Arc::new(db))
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e,
                "bus database unavailable, decoding raw frames only");
            None
        }
    }
}
