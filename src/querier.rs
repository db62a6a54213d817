use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::InstanceConfig;
use crate::error::Error;

/// A fully drained, generically typed result set. `rows[i]` holds one value
/// per entry in `columns`, in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// The seam between the query engine and the store. Everything above this
/// trait is unit-tested against a mock; only `HttpQuerier` talks to a live
/// ClickHouse. Dropping the returned future cancels the request.
#[async_trait]
pub trait Querier: Send + Sync {
    async fn query(&self, sql: &str) -> Result<RowSet, Error>;
}

/// ClickHouse HTTP interface client.
///
/// Results are requested as `JSONCompactEachRowWithNames` through the
/// `default_format` URL parameter, so the SQL text itself is never modified
/// and queries with dynamic column sets (aggregations, raw queries, map
/// columns) decode without a compiled-in row type.
pub struct HttpQuerier {
    client: reqwest::Client,
    endpoints: Vec<String>,
    params: String,
    username: String,
    password: String,
    next_endpoint: AtomicUsize,
    query_slots: Semaphore,
}

impl HttpQuerier {
    pub fn new(config: &InstanceConfig) -> Result<Self, Error> {
        let endpoints = parse_endpoints(&config.address);
        if endpoints.is_empty() {
            return Err(Error::Configuration(format!(
                "instance {} has no ClickHouse address",
                config.name
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.dial_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(config.conn_max_lifetime_secs))
            .pool_max_idle_per_host(config.max_idle_conns)
            .build()?;

        // 64-bit integers arrive quoted by default in the JSON output
        // formats; disable that so counts decode as numbers.
        let params = format!(
            "database={}&default_format=JSONCompactEachRowWithNames&output_format_json_quote_64bit_integers=0",
            urlencoding::encode(&config.database)
        );

        Ok(Self {
            client,
            endpoints,
            params,
            username: config.username.clone(),
            password: config.password.clone(),
            next_endpoint: AtomicUsize::new(0),
            query_slots: Semaphore::new(config.max_open_conns),
        })
    }

    async fn execute(&self, endpoint: &str, sql: &str) -> Result<RowSet, Error> {
        let url = format!("{endpoint}/?{}", self.params);
        let mut request = self.client.post(&url).body(sql.to_string());
        if !self.username.is_empty() {
            request = request.header("X-ClickHouse-User", &self.username);
        }
        if !self.password.is_empty() {
            request = request.header("X-ClickHouse-Key", &self.password);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Upstream(body.trim().to_string()));
        }
        parse_row_set(&body)
    }
}

#[async_trait]
impl Querier for HttpQuerier {
    async fn query(&self, sql: &str) -> Result<RowSet, Error> {
        let _permit = self
            .query_slots
            .acquire()
            .await
            .map_err(|_| Error::Connection("query slots closed".to_string()))?;

        // Rotate through the configured endpoints and fail over on transport
        // errors. A server-side error (the query reached ClickHouse) is final.
        let start = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;
        for attempt in 0..self.endpoints.len() {
            let endpoint = &self.endpoints[(start + attempt) % self.endpoints.len()];
            match self.execute(endpoint, sql).await {
                Ok(result) => return Ok(result),
                Err(err @ (Error::Upstream(_) | Error::Decode(_))) => return Err(err),
                Err(err) => {
                    tracing::warn!("query against {endpoint} failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Connection("no endpoints".to_string())))
    }
}

fn parse_endpoints(address: &str) -> Vec<String> {
    address
        .split(',')
        .map(|endpoint| endpoint.trim().trim_end_matches('/').to_string())
        .filter(|endpoint| !endpoint.is_empty())
        .collect()
}

/// Decode a `JSONCompactEachRowWithNames` body: the first line is the column
/// name array, every following line one row of values.
fn parse_row_set(body: &str) -> Result<RowSet, Error> {
    let mut lines = body.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(RowSet::default());
    };
    let columns: Vec<String> = serde_json::from_str(header)
        .map_err(|err| Error::Decode(format!("column header: {err}")))?;

    let mut rows = Vec::new();
    for line in lines {
        let row: Vec<Value> =
            serde_json::from_str(line).map_err(|err| Error::Decode(format!("row: {err}")))?;
        if row.len() != columns.len() {
            return Err(Error::Decode(format!(
                "row has {} values, expected {}",
                row.len(),
                columns.len()
            )));
        }
        rows.push(row);
    }
    Ok(RowSet { columns, rows })
}
