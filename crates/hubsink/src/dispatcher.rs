// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The bridge state machine.
//!
//! All control flow is driven by [`RuntimeEvent`]s delivered one at a time
//! from the messaging runtime. Processing happens inline: a write or
//! reconnect retry loop blocks further event delivery, which caps the
//! bridge at one in-flight write and one in-flight reconnect with no locks.
//!
//! ```text
//! Uninitialized -> Starting -> Ready <-> Degraded
//!                                 |
//!                                 v
//!                             Terminated
//! ```

use crate::retry::Sleeper;
use crate::sink::{SinkSupervisor, StoreClient};
use crate::source::{BrokerConnector, SourceSupervisor};
use crate::transform::{self, InboundEvent};

/// Lifecycle states of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Starting,
    Ready,
    /// A connection-level disruption is being recovered.
    Degraded,
    Terminated,
}

/// Disruption kinds reported by the messaging runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisruptionKind {
    Closing,
    Closed,
    Error,
    Disconnected,
}

impl DisruptionKind {
    fn as_str(self) -> &'static str {
        match self {
            DisruptionKind::Closing => "closing",
            DisruptionKind::Closed => "closed",
            DisruptionKind::Error => "error",
            DisruptionKind::Disconnected => "disconnected",
        }
    }
}

/// Events driving the state machine.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// Runtime start; brings up both endpoints.
    Started,
    /// An inbound event was delivered.
    Message(InboundEvent),
    /// Connection-level disruption.
    ConnectionDisruption(DisruptionKind),
    /// Session-level disruption.
    SessionDisruption(DisruptionKind),
    /// Process interrupt; terminate the pump.
    Interrupted,
}

/// Lifetime counters. Touched only from the dispatch thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub events_received: u64,
    pub points_written: u64,
    pub events_skipped: u64,
    pub reconnects: u64,
}

/// The orchestrating state machine.
///
/// Owns both supervisors; every transition runs synchronously on the
/// dispatch thread.
pub struct Dispatcher<C, B: BrokerConnector, S> {
    state: BridgeState,
    sink: SinkSupervisor<C, S>,
    source: SourceSupervisor<B, S>,
    stats: BridgeStats,
}

impl<C: StoreClient, B: BrokerConnector, S: Sleeper> Dispatcher<C, B, S> {
    pub fn new(sink: SinkSupervisor<C, S>, source: SourceSupervisor<B, S>) -> Self {
        Self {
            state: BridgeState::Uninitialized,
            sink,
            source,
            stats: BridgeStats::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Snapshot of the lifetime counters.
    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Pull the next event from the live subscription. Blocks.
    pub fn next_event(&mut self) -> RuntimeEvent {
        self.source.next_event()
    }

    /// Advance the state machine by one event.
    pub fn handle(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Started => self.on_started(),
            RuntimeEvent::Message(event) => self.on_message(event),
            RuntimeEvent::ConnectionDisruption(kind) => self.on_connection_disruption(kind),
            RuntimeEvent::SessionDisruption(kind) => self.on_session_disruption(kind),
            RuntimeEvent::Interrupted => {
                tracing::info!("interrupt received; shutting down");
                self.state = BridgeState::Terminated;
            }
        }
    }

    fn on_started(&mut self) {
        self.state = BridgeState::Starting;
        self.sink.ensure_ready();
        self.source.connect_or_reconnect();
        self.state = BridgeState::Ready;
        tracing::info!("setup complete");
    }

    fn on_message(&mut self, event: InboundEvent) {
        if self.state != BridgeState::Ready {
            tracing::warn!(
                "dropping event from '{}' received in state {:?}",
                event.device_id,
                self.state
            );
            return;
        }

        self.stats.events_received += 1;
        tracing::debug!(
            "event received from '{}' ({} bytes)",
            event.device_id,
            event.body.len()
        );

        match transform::transform(&event) {
            Some(point) => {
                tracing::info!("writing point for '{}' at {}", point.measurement, point.time);
                self.sink.write(&[point]);
                self.stats.points_written += 1;
            }
            None => self.stats.events_skipped += 1,
        }
    }

    fn on_connection_disruption(&mut self, kind: DisruptionKind) {
        match kind {
            DisruptionKind::Closing | DisruptionKind::Closed => {
                tracing::error!(
                    "connection {} - trying to reestablish connection",
                    kind.as_str()
                );
                self.state = BridgeState::Degraded;
                self.stats.reconnects += 1;
                self.source.connect_or_reconnect();
                self.state = BridgeState::Ready;
            }
            DisruptionKind::Error | DisruptionKind::Disconnected => {
                tracing::error!("connection {}", kind.as_str());
            }
        }
    }

    fn on_session_disruption(&mut self, kind: DisruptionKind) {
        // Log-only: reconnects are driven by connection-level disruptions.
        tracing::error!("session {}", kind.as_str());
    }
}
