// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-series store client and its supervisor.
//!
//! The [`InfluxHttpClient`] speaks the InfluxDB 1.x HTTP API: `/query` for
//! the database existence check and creation, `/write` for Line Protocol
//! batches. The [`SinkSupervisor`] wraps both operations in the infinite
//! retry discipline; its callers never see a store failure.

use crate::config::InfluxConfig;
use crate::line;
use crate::retry::{self, Sleeper};
use crate::transform::Point;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Connect/read timeout for individual HTTP attempts.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Store errors. All of them are treated as transient by the supervisor.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed store response: {0}")]
    Response(String),
}

/// Store operations the supervisor retries over. Seam for tests.
pub trait StoreClient {
    /// Check that the configured database exists, creating it when absent.
    fn ensure_database(&mut self) -> Result<(), StoreError>;

    /// Submit a batch of points.
    fn write(&mut self, points: &[Point]) -> Result<(), StoreError>;
}

/// InfluxDB 1.x HTTP API client.
pub struct InfluxHttpClient {
    http: reqwest::blocking::Client,
    base_url: String,
    config: InfluxConfig,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    series: Vec<QuerySeries>,
}

#[derive(Debug, Deserialize)]
struct QuerySeries {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl InfluxHttpClient {
    /// Create a client for the configured store.
    pub fn new(config: InfluxConfig) -> Result<Self, StoreError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        let base_url = format!("http://{}:{}", config.host, config.port);
        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        let response = self
            .http
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("u", self.config.user.as_str()),
                ("p", self.config.pass.as_str()),
                ("q", "SHOW DATABASES"),
            ])
            .send()?;
        let body = check_status(response)?.text()?;
        parse_database_names(&body)
    }

    fn create_database(&self) -> Result<(), StoreError> {
        let statement = format!("CREATE DATABASE \"{}\"", self.config.database);
        let response = self
            .http
            .post(format!("{}/query", self.base_url))
            .query(&[
                ("u", self.config.user.as_str()),
                ("p", self.config.pass.as_str()),
                ("q", statement.as_str()),
            ])
            .send()?;
        check_status(response)?;
        Ok(())
    }
}

impl StoreClient for InfluxHttpClient {
    fn ensure_database(&mut self) -> Result<(), StoreError> {
        let databases = self.list_databases()?;
        if !databases.iter().any(|name| name == &self.config.database) {
            tracing::info!("database '{}' not found; creating it", self.config.database);
            self.create_database()?;
        }
        Ok(())
    }

    fn write(&mut self, points: &[Point]) -> Result<(), StoreError> {
        let mut lines = Vec::with_capacity(points.len());
        for point in points {
            match line::encode_point(point) {
                Some(encoded) => lines.push(encoded),
                None => tracing::debug!(
                    "dropping point for '{}': not expressible as line protocol",
                    point.measurement
                ),
            }
        }
        if lines.is_empty() {
            return Ok(());
        }

        let response = self
            .http
            .post(format!("{}/write", self.base_url))
            .query(&[
                ("db", self.config.database.as_str()),
                ("u", self.config.user.as_str()),
                ("p", self.config.pass.as_str()),
                ("precision", "n"),
            ])
            .body(lines.join("\n"))
            .send()?;
        check_status(response)?;
        Ok(())
    }
}

fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().unwrap_or_default();
        Err(StoreError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Extract database names from a `SHOW DATABASES` response body.
fn parse_database_names(body: &str) -> Result<Vec<String>, StoreError> {
    let parsed: QueryResponse =
        serde_json::from_str(body).map_err(|err| StoreError::Response(err.to_string()))?;
    Ok(parsed
        .results
        .iter()
        .flat_map(|result| &result.series)
        .flat_map(|series| &series.values)
        .filter_map(|row| row.first().and_then(|v| v.as_str().map(str::to_owned)))
        .collect())
}

/// Owns the store connection; blocks the caller until operations succeed.
pub struct SinkSupervisor<C, S> {
    client: C,
    sleeper: S,
}

impl<C: StoreClient, S: Sleeper> SinkSupervisor<C, S> {
    pub fn new(client: C, sleeper: S) -> Self {
        Self { client, sleeper }
    }

    /// Verify the database exists, creating it if needed.
    ///
    /// Never returns a failure: retries every 30 seconds until the store
    /// answers.
    pub fn ensure_ready(&mut self) {
        let client = &mut self.client;
        retry::forever("connecting to InfluxDB", &mut self.sleeper, || {
            client.ensure_database()
        });
        tracing::info!("connected to influxdb");
    }

    /// Submit a batch, retrying the identical batch until the store accepts
    /// it. A retry after a partially-applied failure may double-write on
    /// the store side; the bridge is at-least-once.
    pub fn write(&mut self, points: &[Point]) {
        let client = &mut self.client;
        retry::forever("writing to InfluxDB", &mut self.sleeper, || {
            client.write(points)
        });
    }
}
