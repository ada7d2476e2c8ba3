// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IoT Hub to InfluxDB telemetry bridge.
//!
//! Subscribes to the partitioned AMQP 1.0 feed of an IoT telemetry hub,
//! converts each inbound event into a time-series point, and forwards the
//! point to an InfluxDB 1.x instance.
//!
//! ```text
//! IoT Hub (partitions 0..3) --> Dispatcher --> transform --> SinkSupervisor --> InfluxDB
//! ```
//!
//! Both endpoint connections are owned by supervisors that retry forever
//! with a fixed 30 second delay; the bridge never exits on a connectivity
//! failure. Events with bodies that do not decode as JSON objects are
//! skipped. Every reconnect resumes from the latest offset, so events
//! enqueued during an outage are not replayed.

pub mod config;
pub mod dispatcher;
pub mod line;
pub mod retry;
pub mod sink;
pub mod source;
pub mod transform;

pub use config::BridgeConfig;
pub use dispatcher::{BridgeState, Dispatcher, DisruptionKind, RuntimeEvent};
pub use sink::{InfluxHttpClient, SinkSupervisor};
pub use source::{AmqpConnector, SourceSupervisor};
pub use transform::{transform, InboundEvent, Point};
