//! Probe seam: the act of querying a monitored system.

pub mod http;

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::catalog::Target;
use crate::metric::{MetricGroup, Value};
use crate::schedule::InstanceId;

pub use self::http::HttpProbe;

/// Failure kinds reported by a probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("connection refused: {0}")]
    ConnectRefused(String),

    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    /// Metric label of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ConnectRefused(_) => "connect_refused",
            Self::Other(_) => "other",
        }
    }
}

/// Rows returned by one probe invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub probed_at: DateTime<Utc>,
    /// Column names in the order the probe returned them.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(probed_at: DateTime<Utc>, columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            probed_at,
            columns,
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Checks names and order against the columns `group` declares, and
    /// that every row is as wide as the header.
    pub fn matches_shape(&self, group: &MetricGroup) -> bool {
        let expected = group.expected_columns();
        let names_match = self
            .columns
            .iter()
            .map(String::as_str)
            .eq(expected.map(|c| c.name.as_str()));

        names_match && self.rows.iter().all(|row| row.len() == self.columns.len())
    }
}

/// Queries one metric group on one target.
pub trait Probe: Send + Sync + 'static {
    fn probe(
        &self,
        instance_id: InstanceId,
        target: &Target,
        group: &MetricGroup,
    ) -> impl Future<Output = Result<ResultSet, ProbeError>> + Send;
}
