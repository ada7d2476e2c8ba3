// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge entry point.
//!
//! Loads configuration, wires the two supervisors into the dispatcher, and
//! pumps runtime events until interrupted. Log level comes from `RUST_LOG`
//! (default `info`).

use hubsink::config::BridgeConfig;
use hubsink::dispatcher::{BridgeState, Dispatcher, RuntimeEvent};
use hubsink::retry::ThreadSleeper;
use hubsink::sink::{InfluxHttpClient, SinkSupervisor};
use hubsink::source::{AmqpConnector, SourceSupervisor};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = BridgeConfig::load()?;
    tracing::info!("using database '{}'", config.influxdb.database);

    let client = InfluxHttpClient::new(config.influxdb.clone())?;
    let sink = SinkSupervisor::new(client, ThreadSleeper);
    let source = SourceSupervisor::new(AmqpConnector::new(config.iothub.clone()), ThreadSleeper);
    let mut dispatcher = Dispatcher::new(sink, source);

    dispatcher.handle(RuntimeEvent::Started);
    while dispatcher.state() != BridgeState::Terminated {
        let event = dispatcher.next_event();
        dispatcher.handle(event);
    }

    let stats = dispatcher.stats();
    tracing::info!(
        "shut down: {} events received, {} points written, {} skipped, {} reconnects",
        stats.events_received,
        stats.points_written,
        stats.events_skipped,
        stats.reconnects
    );
    Ok(())
}
