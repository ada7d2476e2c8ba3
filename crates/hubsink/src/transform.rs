// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event-to-point translation.
//!
//! Pure: one inbound hub event in, at most one time-series point out.
//! Events whose bodies do not decode as JSON objects are skipped, never
//! errors; skipping is the expected handling for malformed telemetry.

use chrono::{Local, TimeZone};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Annotation carrying the hub-assigned enqueue time (epoch millis).
pub const ENQUEUED_TIME_ANNOTATION: &str = "iothub-enqueuedtime";

/// Annotation carrying the sending device's identifier.
pub const DEVICE_ID_ANNOTATION: &str = "iothub-connection-device-id";

/// Timestamp layout written into points: local time, microsecond precision.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// One event as delivered by the hub.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Device that produced the event.
    pub device_id: String,

    /// Hub enqueue time in epoch milliseconds.
    pub enqueued_time_ms: i64,

    /// Broker-supplied message annotations.
    pub annotations: BTreeMap<String, Value>,

    /// Raw message body, expected to be JSON.
    pub body: Vec<u8>,
}

/// One time-series point bound for the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Measurement name (the device identifier).
    pub measurement: String,

    /// Local-time timestamp, `%Y-%m-%d %H:%M:%S%.6f`.
    pub time: String,

    /// Field values, copied verbatim from the decoded JSON body.
    pub fields: Map<String, Value>,
}

/// Convert an event into a point.
///
/// Returns `None` (skip) when the body is not a JSON object or when no
/// usable timestamp can be derived. The timestamp comes from the body's
/// `time` field when it is an integer (epoch millis), otherwise from the
/// hub enqueue time.
pub fn transform(event: &InboundEvent) -> Option<Point> {
    let body: Value = match serde_json::from_slice(&event.body) {
        Ok(value) => value,
        Err(err) => {
            tracing::info!(
                "skipping event from '{}': body is not valid JSON: {}",
                event.device_id,
                err
            );
            return None;
        }
    };
    let Value::Object(fields) = body else {
        tracing::info!(
            "skipping event from '{}': JSON body is not an object",
            event.device_id
        );
        return None;
    };

    let millis = fields
        .get("time")
        .and_then(Value::as_i64)
        .unwrap_or(event.enqueued_time_ms);
    let Some(time) = format_timestamp(millis) else {
        tracing::info!(
            "skipping event from '{}': timestamp {} out of range",
            event.device_id,
            millis
        );
        return None;
    };

    Some(Point {
        measurement: event.device_id.clone(),
        time,
        fields,
    })
}

/// Format epoch milliseconds as local time with microsecond precision.
///
/// Returns `None` for instants outside the representable range.
pub fn format_timestamp(epoch_ms: i64) -> Option<String> {
    let instant = Local.timestamp_millis_opt(epoch_ms).single()?;
    Some(instant.format(TIMESTAMP_FORMAT).to_string())
}
