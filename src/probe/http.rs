use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::{Probe, ProbeError, ResultSet};
use crate::catalog::Target;
use crate::config::ProbeConfig;
use crate::metric::{MetricGroup, Value};
use crate::schedule::InstanceId;

/// JSON body served by an instrumented target.
#[derive(Debug, Deserialize)]
struct Payload {
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

/// Probe that GETs `{target.endpoint}{group.query}` and decodes a
/// `{"columns": [..], "rows": [[..], ..]}` body.
pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new(cfg: &ProbeConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(cfg.connect_timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self { http })
    }
}

impl Probe for HttpProbe {
    async fn probe(
        &self,
        instance_id: InstanceId,
        target: &Target,
        group: &MetricGroup,
    ) -> Result<ResultSet, ProbeError> {
        let url = format!("{}{}", target.endpoint, group.query);
        let probed_at = Utc::now();

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeError::Other(format!(
                "unexpected status {status} from {url}: {body}"
            )));
        }

        let payload: Payload = response
            .json()
            .await
            .map_err(|e| ProbeError::Other(format!("decoding response from {url}: {e}")))?;

        debug!(
            instance_id,
            target_id = target.id,
            rows = payload.rows.len(),
            "probe response received"
        );

        decode(payload, group, probed_at)
    }
}

fn classify(err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::ConnectTimeout(err.to_string())
    } else if err.is_connect() {
        ProbeError::ConnectRefused(err.to_string())
    } else {
        ProbeError::Other(err.to_string())
    }
}

/// Converts JSON cells into values of the declared column types. Every row
/// must be as wide as the header. Columns the group does not declare decode
/// as null; the writer's shape check rejects such batches.
fn decode(
    payload: Payload,
    group: &MetricGroup,
    probed_at: chrono::DateTime<Utc>,
) -> Result<ResultSet, ProbeError> {
    let width = payload.columns.len();
    if let Some((index, row)) = payload
        .rows
        .iter()
        .enumerate()
        .find(|(_, row)| row.len() != width)
    {
        return Err(ProbeError::Other(format!(
            "row {index} has {} cells, header has {width}",
            row.len()
        )));
    }

    let types: Vec<_> = payload
        .columns
        .iter()
        .map(|name| {
            group
                .expected_columns()
                .find(|c| &c.name == name)
                .map(|c| c.data_type)
        })
        .collect();

    let rows = payload
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .zip(&types)
                .map(|(cell, data_type)| match data_type {
                    Some(data_type) => Value::from_json(cell, *data_type),
                    None => Ok(Value::Null),
                })
                .collect::<Result<Vec<Value>>>()
        })
        .collect::<Result<Vec<_>>>()
        .map_err(|e| ProbeError::Other(format!("decoding cells: {e:#}")))?;

    Ok(ResultSet::new(probed_at, payload.columns, rows))
}
