// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event stream source: AMQP connection lifecycle and partition receivers.
//!
//! The [`SourceSupervisor`] owns the broker connection. Each (re)connect
//! builds a wholly fresh AMQP connection plus one receiver per fixed
//! partition, filtered so the subscription resumes from the latest offset
//! only. The AMQP client is async; a current-thread tokio runtime owned by
//! the subscription drives it, entered via `block_on` so the rest of the
//! bridge stays synchronous.

use crate::config::IotHubConfig;
use crate::dispatcher::{DisruptionKind, RuntimeEvent};
use crate::retry::{self, Sleeper};
use crate::transform::{InboundEvent, DEVICE_ID_ANNOTATION, ENQUEUED_TIME_ANNOTATION};
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::delivery::Delivery;
use fe2o3_amqp::link::{LinkStateError, RecvError};
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::{Connection, Receiver, Session};
use fe2o3_amqp_types::messaging::annotations::OwnedKey;
use fe2o3_amqp_types::messaging::{Body, FilterSet, MessageAnnotations, Source};
use fe2o3_amqp_types::primitives::{Symbol, Value};
use futures::future;
use serde_amqp::described::Described;
use serde_amqp::descriptor::Descriptor;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Fixed partition count of the hub's Event Hub compatible endpoint.
pub const PARTITION_COUNT: usize = 4;

/// Consumer group used for all partition receivers.
const CONSUMER_GROUP: &str = "$default";

/// AMQP descriptor of the receiver selector filter.
const SELECTOR_FILTER_NAME: &str = "apache.org:selector-filter:string";

/// Resume selector: only events enqueued after connection time.
/// `-1` would mean "from the beginning"; `@latest` skips history.
pub const RESUME_SELECTOR: &str = "amqp.annotation.x-opt-offset > '@latest'";

/// Container id announced on the AMQP connection.
const CONTAINER_ID: &str = "hubsink";

/// Broker errors. All of them are treated as transient by the supervisor.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to build AMQP runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("AMQP connection open failed: {0}")]
    Open(String),

    #[error("AMQP session begin failed: {0}")]
    Begin(String),

    #[error("AMQP receiver attach failed on {path}: {reason}")]
    Attach { path: String, reason: String },
}

/// Node path for one partition receiver.
pub fn partition_path(partition_name: &str, partition: usize) -> String {
    format!(
        "{}/ConsumerGroups/{}/Partitions/{}",
        partition_name, CONSUMER_GROUP, partition
    )
}

/// Connection establishment seam the supervisor retries over.
pub trait BrokerConnector {
    type Subscription: EventSource;

    /// Open a fresh connection and receiver set.
    fn connect(&mut self) -> Result<Self::Subscription, BrokerError>;
}

/// A live subscription able to produce runtime events. Blocks.
pub trait EventSource {
    fn next_event(&mut self) -> RuntimeEvent;
}

/// Owns the broker connection lifecycle.
pub struct SourceSupervisor<B: BrokerConnector, S> {
    connector: B,
    subscription: Option<B::Subscription>,
    sleeper: S,
}

impl<B: BrokerConnector, S: Sleeper> SourceSupervisor<B, S> {
    pub fn new(connector: B, sleeper: S) -> Self {
        Self {
            connector,
            subscription: None,
            sleeper,
        }
    }

    /// Establish a fresh connection and receiver set, replacing any previous
    /// one. Never returns a failure: retries every 30 seconds until the
    /// broker accepts.
    pub fn connect_or_reconnect(&mut self) {
        let connector = &mut self.connector;
        let subscription = retry::forever("connecting to IoT Hub", &mut self.sleeper, || {
            connector.connect()
        });
        self.subscription = Some(subscription);
        tracing::info!("connected to iothub");
    }

    /// Produce the next runtime event from the live subscription.
    pub fn next_event(&mut self) -> RuntimeEvent {
        match self.subscription.as_mut() {
            Some(subscription) => subscription.next_event(),
            None => {
                tracing::warn!("event requested with no live subscription");
                RuntimeEvent::ConnectionDisruption(DisruptionKind::Closed)
            }
        }
    }
}

/// AMQP connector for the hub's Event Hub compatible endpoint.
///
/// Credentials travel in the connection URL; the client negotiates SASL
/// PLAIN from them.
pub struct AmqpConnector {
    config: IotHubConfig,
}

impl AmqpConnector {
    pub fn new(config: IotHubConfig) -> Self {
        Self { config }
    }
}

impl BrokerConnector for AmqpConnector {
    type Subscription = AmqpSubscription;

    fn connect(&mut self) -> Result<AmqpSubscription, BrokerError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let amqp_url = self.config.amqp_url.clone();
        let partition_name = self.config.partition_name.clone();
        let (connection, session, receivers) = rt.block_on(async move {
            let mut connection = Connection::builder()
                .container_id(CONTAINER_ID)
                .open(amqp_url.as_str())
                .await
                .map_err(|err| BrokerError::Open(err.to_string()))?;

            let mut session = Session::begin(&mut connection)
                .await
                .map_err(|err| BrokerError::Begin(err.to_string()))?;

            let mut receivers = Vec::with_capacity(PARTITION_COUNT);
            for partition in 0..PARTITION_COUNT {
                let path = partition_path(&partition_name, partition);
                let source = Source::builder()
                    .address(path.clone())
                    .filter(resume_filter())
                    .build();
                let receiver = Receiver::builder()
                    .name(format!("{CONTAINER_ID}-partition-{partition}"))
                    .source(source)
                    .attach(&mut session)
                    .await
                    .map_err(|err| BrokerError::Attach {
                        path,
                        reason: err.to_string(),
                    })?;
                receivers.push(receiver);
            }

            Ok::<_, BrokerError>((connection, session, receivers))
        })?;

        Ok(AmqpSubscription {
            rt,
            connection,
            session,
            receivers,
        })
    }
}

/// Filter set restricting a receiver to events after the latest offset.
fn resume_filter() -> FilterSet {
    let mut filter = FilterSet::new();
    filter.insert(
        Symbol::from("selector"),
        Value::Described(Box::new(Described {
            descriptor: Descriptor::Name(Symbol::from(SELECTOR_FILTER_NAME)),
            value: Value::String(RESUME_SELECTOR.to_string()),
        })),
    );
    filter
}

/// A live AMQP subscription: connection, session, partition receivers, and
/// the runtime that drives them. Dropped wholesale on reconnect.
pub struct AmqpSubscription {
    rt: tokio::runtime::Runtime,
    /// Held for the lifetime of the subscription; the receivers die with it.
    #[allow(dead_code)]
    connection: ConnectionHandle<()>,
    #[allow(dead_code)]
    session: SessionHandle<()>,
    receivers: Vec<Receiver>,
}

enum RecvOutcome {
    Interrupted,
    Recv(usize, Result<Delivery<Body<Value>>, RecvError>),
}

impl EventSource for AmqpSubscription {
    fn next_event(&mut self) -> RuntimeEvent {
        loop {
            if self.receivers.is_empty() {
                tracing::warn!("all partition receivers lost; treating connection as closed");
                return RuntimeEvent::ConnectionDisruption(DisruptionKind::Closed);
            }

            let outcome = {
                let receivers = &mut self.receivers;
                self.rt.block_on(async {
                    let pending: Vec<_> = receivers
                        .iter_mut()
                        .map(|receiver| Box::pin(receiver.recv::<Body<Value>>()))
                        .collect();
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => RecvOutcome::Interrupted,
                        (result, index, _) = future::select_all(pending) => {
                            RecvOutcome::Recv(index, result)
                        }
                    }
                })
            };

            match outcome {
                RecvOutcome::Interrupted => return RuntimeEvent::Interrupted,
                RecvOutcome::Recv(index, Ok(delivery)) => {
                    let receiver = &mut self.receivers[index];
                    if let Err(err) = self.rt.block_on(receiver.accept(&delivery)) {
                        tracing::warn!("failed to settle delivery: {}", err);
                    }
                    match decode_delivery(&delivery) {
                        Some(event) => return RuntimeEvent::Message(event),
                        None => continue,
                    }
                }
                RecvOutcome::Recv(index, Err(err)) => {
                    // A receiver that reported an error is dead; drop it so
                    // the select set never spins on a broken link. Once the
                    // set drains, the subscription reports the connection
                    // closed and the supervisor rebuilds everything.
                    self.receivers.remove(index);
                    return match classify_recv_error(&err) {
                        Disruption::Connection(kind) => {
                            tracing::debug!("partition receiver failure: {}", err);
                            RuntimeEvent::ConnectionDisruption(kind)
                        }
                        Disruption::Session(kind) => {
                            tracing::debug!("partition link failure: {}", err);
                            RuntimeEvent::SessionDisruption(kind)
                        }
                    };
                }
            }
        }
    }
}

enum Disruption {
    Connection(DisruptionKind),
    Session(DisruptionKind),
}

/// Map an AMQP receive error onto the runtime's disruption taxonomy.
fn classify_recv_error(err: &RecvError) -> Disruption {
    match err {
        RecvError::LinkStateError(state) => match state {
            // The session (and usually the connection under it) is gone.
            LinkStateError::IllegalSessionState => {
                Disruption::Connection(DisruptionKind::Closed)
            }
            LinkStateError::RemoteClosed | LinkStateError::RemoteClosedWithError(_) => {
                Disruption::Session(DisruptionKind::Closed)
            }
            LinkStateError::RemoteDetached | LinkStateError::RemoteDetachedWithError(_) => {
                Disruption::Session(DisruptionKind::Closing)
            }
            _ => Disruption::Connection(DisruptionKind::Error),
        },
        _ => Disruption::Connection(DisruptionKind::Error),
    }
}

/// Decode one delivery into an inbound event.
///
/// Deliveries missing the device or enqueued-time annotations, or carrying
/// a body that is not data, cannot form an event and are skipped.
fn decode_delivery(delivery: &Delivery<Body<Value>>) -> Option<InboundEvent> {
    let message = delivery.message();
    let Some(annotations) = message.message_annotations.as_ref() else {
        tracing::info!("skipping delivery without message annotations");
        return None;
    };

    let Some(device_id) = annotation(annotations, DEVICE_ID_ANNOTATION).and_then(value_to_string)
    else {
        tracing::info!("skipping delivery without a device identifier annotation");
        return None;
    };
    let Some(enqueued_time_ms) =
        annotation(annotations, ENQUEUED_TIME_ANNOTATION).and_then(value_to_millis)
    else {
        tracing::info!(
            "skipping delivery from '{}' without an enqueued-time annotation",
            device_id
        );
        return None;
    };
    let Some(body) = body_bytes(&message.body) else {
        tracing::info!("skipping delivery from '{}' with an unusable body", device_id);
        return None;
    };

    let annotations = annotations
        .0
        .iter()
        .filter_map(|(key, value)| match key {
            OwnedKey::Symbol(symbol) => {
                amqp_scalar_to_json(value).map(|json| (symbol.0.clone(), json))
            }
            _ => None,
        })
        .collect();

    Some(InboundEvent {
        device_id,
        enqueued_time_ms,
        annotations,
        body,
    })
}

fn annotation<'a>(annotations: &'a MessageAnnotations, name: &str) -> Option<&'a Value> {
    annotations.0.get(&OwnedKey::Symbol(Symbol::from(name)))
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(v) => Some(v.clone()),
        Value::Symbol(v) => Some(v.0.clone()),
        _ => None,
    }
}

/// Interpret an annotation value as epoch milliseconds.
fn value_to_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Timestamp(v) => Some(v.milliseconds()),
        Value::Long(v) => Some(*v),
        Value::Int(v) => Some(i64::from(*v)),
        Value::Uint(v) => Some(i64::from(*v)),
        Value::Ulong(v) => i64::try_from(*v).ok(),
        Value::Double(v) => Some(v.into_inner() as i64),
        Value::String(v) => v.parse().ok(),
        _ => None,
    }
}

/// Extract the raw body bytes from a delivery body.
fn body_bytes(body: &Body<Value>) -> Option<Vec<u8>> {
    match body {
        Body::Data(batch) => batch.first().map(|data| data.0.to_vec()),
        Body::Value(section) => match &section.0 {
            Value::Binary(buf) => Some(buf.to_vec()),
            Value::String(text) => Some(text.clone().into_bytes()),
            _ => None,
        },
        _ => None,
    }
}

/// Project scalar annotation values into JSON for the event's metadata map.
fn amqp_scalar_to_json(value: &Value) -> Option<JsonValue> {
    match value {
        Value::String(v) => Some(JsonValue::String(v.clone())),
        Value::Symbol(v) => Some(JsonValue::String(v.0.clone())),
        Value::Bool(v) => Some(JsonValue::Bool(*v)),
        Value::Timestamp(v) => Some(JsonValue::from(v.milliseconds())),
        Value::Byte(v) => Some(JsonValue::from(*v)),
        Value::Short(v) => Some(JsonValue::from(*v)),
        Value::Int(v) => Some(JsonValue::from(*v)),
        Value::Long(v) => Some(JsonValue::from(*v)),
        Value::Ubyte(v) => Some(JsonValue::from(*v)),
        Value::Ushort(v) => Some(JsonValue::from(*v)),
        Value::Uint(v) => Some(JsonValue::from(*v)),
        Value::Ulong(v) => Some(JsonValue::from(*v)),
        Value::Float(v) => Some(JsonValue::from(f64::from(v.into_inner()))),
        Value::Double(v) => Some(JsonValue::from(v.into_inner())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RecordingSleeper, RETRY_DELAY};

    #[test]
    fn test_partition_path() {
        assert_eq!(
            partition_path("myhub", 2),
            "myhub/ConsumerGroups/$default/Partitions/2"
        );
    }

    #[test]
    fn test_partition_paths_cover_all_partitions() {
        let paths: Vec<String> = (0..PARTITION_COUNT)
            .map(|n| partition_path("myhub", n))
            .collect();
        assert_eq!(paths.len(), 4);
        for (n, path) in paths.iter().enumerate() {
            assert!(path.ends_with(&format!("/Partitions/{}", n)));
        }
    }

    /// Subscription stand-in recording the receivers a connect would attach.
    struct FakeSubscription {
        receivers: Vec<(String, String)>,
    }

    impl EventSource for FakeSubscription {
        fn next_event(&mut self) -> RuntimeEvent {
            RuntimeEvent::Interrupted
        }
    }

    struct FakeConnector {
        failures_left: u32,
        attempts: u32,
    }

    impl BrokerConnector for FakeConnector {
        type Subscription = FakeSubscription;

        fn connect(&mut self) -> Result<FakeSubscription, BrokerError> {
            self.attempts += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(BrokerError::Open("connection refused".to_string()));
            }
            let receivers = (0..PARTITION_COUNT)
                .map(|n| (partition_path("myhub", n), RESUME_SELECTOR.to_string()))
                .collect();
            Ok(FakeSubscription { receivers })
        }
    }

    #[test]
    fn test_connect_retries_then_attaches_all_receivers() {
        let connector = FakeConnector {
            failures_left: 3,
            attempts: 0,
        };
        let mut supervisor = SourceSupervisor::new(connector, RecordingSleeper::default());

        supervisor.connect_or_reconnect();

        // N failures then success: N+1 attempts with a delay after each
        // failure, and the eventual subscription carries one filtered
        // receiver per partition.
        assert_eq!(supervisor.connector.attempts, 4);
        assert_eq!(supervisor.sleeper.slept, vec![RETRY_DELAY; 3]);

        let subscription = supervisor.subscription.as_ref().expect("subscription");
        assert_eq!(subscription.receivers.len(), PARTITION_COUNT);
        for (n, (path, selector)) in subscription.receivers.iter().enumerate() {
            assert_eq!(path, &partition_path("myhub", n));
            assert_eq!(selector, RESUME_SELECTOR);
        }
    }

    #[test]
    fn test_reconnect_replaces_subscription() {
        let connector = FakeConnector {
            failures_left: 0,
            attempts: 0,
        };
        let mut supervisor = SourceSupervisor::new(connector, RecordingSleeper::default());

        supervisor.connect_or_reconnect();
        supervisor.connect_or_reconnect();

        assert_eq!(supervisor.connector.attempts, 2);
        assert!(supervisor.subscription.is_some());
    }

    #[test]
    fn test_next_event_without_subscription_reports_closed() {
        let connector = FakeConnector {
            failures_left: 0,
            attempts: 0,
        };
        let mut supervisor = SourceSupervisor::new(connector, RecordingSleeper::default());

        match supervisor.next_event() {
            RuntimeEvent::ConnectionDisruption(DisruptionKind::Closed) => {}
            other => panic!("expected connection-closed, got {:?}", other),
        }
    }

    #[test]
    fn test_next_event_delegates_to_subscription() {
        let connector = FakeConnector {
            failures_left: 0,
            attempts: 0,
        };
        let mut supervisor = SourceSupervisor::new(connector, RecordingSleeper::default());
        supervisor.connect_or_reconnect();

        assert!(matches!(supervisor.next_event(), RuntimeEvent::Interrupted));
    }
}
