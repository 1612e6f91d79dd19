//! Read-only HTTP views over the in-memory caches.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::cache::{CacheError, CacheRegistry, CacheTable, CachedEntry};
use crate::catalog::SharedCatalog;
use crate::metric::{MetricGroup, MetricGroupId, TargetId, Value};

/// Shared state behind the `/api` routes.
pub struct ReadApi {
    catalog: Arc<SharedCatalog>,
    caches: Arc<CacheRegistry>,
}

impl ReadApi {
    pub fn new(catalog: Arc<SharedCatalog>, caches: Arc<CacheRegistry>) -> Self {
        Self { catalog, caches }
    }

    /// Data cache and metric group of a configured (target, group) pair.
    fn lookup(
        &self,
        target_id: TargetId,
        group_id: MetricGroupId,
    ) -> Result<(Arc<MetricGroup>, Arc<CacheTable>), ApiError> {
        let catalog = self.catalog.load();
        let target = catalog.target(target_id).ok_or(ApiError::NotFound("target"))?;
        if !target.metric_groups.contains(&group_id) {
            return Err(ApiError::NotFound("metric group"));
        }
        let group = catalog.group(group_id).ok_or(ApiError::NotFound("metric group"))?;
        let table = self
            .caches
            .data(target_id, &group)
            .ok_or(ApiError::NotFound("cache"))?;
        Ok((group, table))
    }

    /// Current values (or deltas) per surrogate id.
    pub fn current(
        &self,
        target_id: TargetId,
        group_id: MetricGroupId,
    ) -> Result<serde_json::Value, ApiError> {
        let (group, table) = self.lookup(target_id, group_id)?;
        let dictionary = self.caches.dictionary(target_id, &group);

        let rows: Vec<serde_json::Value> = table
            .entries()
            .into_iter()
            .filter(|entry| group.multi_row || entry.id == target_id)
            .map(|entry| render_entry(&group, dictionary.as_deref(), &entry))
            .collect();

        Ok(json!({
            "target": target_id,
            "group": group.name,
            "cumulative": group.cumulative,
            "rows": rows,
        }))
    }

    /// Row with the largest value of `column`.
    pub fn top(
        &self,
        target_id: TargetId,
        group_id: MetricGroupId,
        column: &str,
    ) -> Result<serde_json::Value, ApiError> {
        let (group, table) = self.lookup(target_id, group_id)?;
        if !group.multi_row {
            return Err(ApiError::BadRequest("top is only defined for multi-row groups".into()));
        }

        let id = table.get_id_of_max_value(column).map_err(|e| match e {
            CacheError::UnknownColumn(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        })?;

        let row = id.and_then(|id| {
            table
                .entries()
                .into_iter()
                .find(|entry| entry.id == id)
        });
        let dictionary = self.caches.dictionary(target_id, &group);

        Ok(json!({
            "target": target_id,
            "group": group.name,
            "column": column,
            "row": row.map(|entry| render_entry(&group, dictionary.as_deref(), &entry)),
        }))
    }
}

fn render_values(names: &[crate::metric::Column], values: &[Value]) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = names
        .iter()
        .zip(values)
        .map(|(column, value)| (column.name.clone(), value.to_json()))
        .collect();
    serde_json::Value::Object(map)
}

fn render_entry(
    group: &MetricGroup,
    dictionary: Option<&CacheTable>,
    entry: &CachedEntry,
) -> serde_json::Value {
    let dimension = dictionary.and_then(|d| d.get_row(entry.id)).map(|row| {
        json!({
            "keys": render_values(&group.key_columns, &row.keys),
            "attributes": render_values(&group.attribute_columns, &row.values),
        })
    });

    json!({
        "id": entry.id,
        "dimension": dimension,
        "values": entry
            .values
            .as_ref()
            .map(|values| render_values(&group.metric_columns, values)),
        "valid_from": entry.valid_from.map(|t| t.to_rfc3339()),
    })
}

/// Read API failure mapped onto an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    Unavailable,
    NotFound(&'static str),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "read api disabled".to_string()),
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// GET /api/targets/:target/groups/:group/current
pub(crate) async fn current_handler(
    State(state): State<Arc<AppState>>,
    Path((target_id, group_id)): Path<(TargetId, MetricGroupId)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let api = state.api.as_ref().ok_or(ApiError::Unavailable)?;
    api.current(target_id, group_id).map(Json)
}

/// GET /api/targets/:target/groups/:group/top/:column
pub(crate) async fn top_handler(
    State(state): State<Arc<AppState>>,
    Path((target_id, group_id, column)): Path<(TargetId, MetricGroupId, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let api = state.api.as_ref().ok_or(ApiError::Unavailable)?;
    api.top(target_id, group_id, &column).map(Json)
}
