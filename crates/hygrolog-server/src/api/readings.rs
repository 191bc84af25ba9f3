//! Stored reading endpoints.
//!
//! Readings are stored in UTC and rendered in the configured timezone.
//! Values are returned as strings, which is what existing dashboards
//! consume.

use axum::extract::{Query, State};
use axum::Json;
use chrono_tz::Tz;
use hygrolog_core::{run_blocking, HistoryQuery, InvalidSortOrder, Reading, SortOrder};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for the history endpoint.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryParams {
    /// Maximum number of readings to return. Omitted or 0 returns all.
    #[param(example = 10, minimum = 0)]
    pub limit: Option<u32>,

    /// Sort direction by capture time: `asc` or `desc` (default).
    #[param(example = "desc")]
    pub order: Option<String>,
}

/// One reading in the history listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "date": "2025-06-01",
    "time": "14:30",
    "temp": "28.26",
    "humid": "80"
}))]
pub struct HistoryEntry {
    /// Local capture date, `YYYY-MM-DD`.
    #[schema(example = "2025-06-01")]
    pub date: String,

    /// Local capture time, `HH:MM`.
    #[schema(example = "14:30")]
    pub time: String,

    /// Temperature in degrees Celsius.
    #[schema(example = "28.26")]
    pub temp: String,

    /// Relative humidity in percent.
    #[schema(example = "80")]
    pub humid: String,
}

/// The most recent reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "time": "14:30",
    "temp": "28.26",
    "humid": "80"
}))]
pub struct LatestReading {
    /// Local capture time, `HH:MM`.
    #[schema(example = "14:30")]
    pub time: String,

    /// Temperature in degrees Celsius.
    #[schema(example = "28.26")]
    pub temp: String,

    /// Relative humidity in percent.
    #[schema(example = "80")]
    pub humid: String,
}

impl HistoryEntry {
    fn render(reading: &Reading, tz: Tz) -> Self {
        let local = reading.captured_at().with_timezone(&tz);
        Self {
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M").to_string(),
            temp: format_temperature(reading.temperature_celsius()),
            humid: reading.humidity_percent().to_string(),
        }
    }
}

impl LatestReading {
    fn render(reading: &Reading, tz: Tz) -> Self {
        let HistoryEntry {
            time, temp, humid, ..
        } = HistoryEntry::render(reading, tz);
        Self { time, temp, humid }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// List stored readings.
#[utoipa::path(
    get,
    path = "/history",
    tag = "readings",
    operation_id = "getHistory",
    summary = "List stored readings",
    description = "Returns stored readings ordered by capture time, newest first \
        unless `order=asc` is given. Timestamps are rendered in the configured \
        timezone.",
    params(HistoryParams),
    responses(
        (status = 200, description = "Readings retrieved", body = [HistoryEntry]),
        (status = 400, description = "Invalid order parameter", body = ErrorResponse),
        (status = 500, description = "Database error", body = ErrorResponse)
    )
)]
pub async fn get_history(
    State(state): State<SharedState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    let order = match params.order.as_deref() {
        None => SortOrder::default(),
        Some(raw) => raw.parse().map_err(invalid_order)?,
    };
    let limit = params.limit.filter(|&n| n > 0);

    let store = state.store().clone();
    let query = HistoryQuery { limit, order };
    let rows = run_blocking(move || store.history(query)).await?;
    let tz = state.timezone();

    Ok(Json(
        rows.iter()
            .map(|row| HistoryEntry::render(&row.reading, tz))
            .collect(),
    ))
}

/// Get the most recent reading.
#[utoipa::path(
    get,
    path = "/latest",
    tag = "readings",
    operation_id = "getLatest",
    summary = "Get the most recent reading",
    description = "Returns the newest stored reading, or 404 if nothing has been \
        stored yet.",
    responses(
        (status = 200, description = "Latest reading", body = LatestReading),
        (status = 404, description = "No readings stored", body = ErrorResponse),
        (status = 500, description = "Database error", body = ErrorResponse)
    )
)]
pub async fn get_latest(State(state): State<SharedState>) -> ApiResult<Json<LatestReading>> {
    let store = state.store().clone();
    let latest = run_blocking(move || store.latest())
        .await?
        .ok_or_else(|| ApiError::NotFound {
            error_code: "no_data".to_string(),
            message: "No sensor data found.".to_string(),
        })?;

    Ok(Json(LatestReading::render(&latest.reading, state.timezone())))
}

// ============================================================================
// Helpers
// ============================================================================

fn invalid_order(err: InvalidSortOrder) -> ApiError {
    ApiError::BadRequest {
        error_code: "invalid_order".to_string(),
        message: err.to_string(),
    }
}

/// Shortest round-tripping decimal, always with a fractional part.
fn format_temperature(celsius: f64) -> String {
    format!("{celsius:?}")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn reading(temperature: f64, humidity: u8) -> Reading {
        Reading::new(
            temperature,
            humidity,
            Utc.with_ymd_and_hms(2025, 6, 1, 22, 5, 9).unwrap(),
        )
    }

    #[test]
    fn test_history_entry_utc() {
        let entry = HistoryEntry::render(&reading(28.26, 80), chrono_tz::UTC);
        assert_eq!(
            entry,
            HistoryEntry {
                date: "2025-06-01".to_string(),
                time: "22:05".to_string(),
                temp: "28.26".to_string(),
                humid: "80".to_string(),
            }
        );
    }

    #[test]
    fn test_history_entry_rolls_date_in_local_zone() {
        let entry = HistoryEntry::render(&reading(21.5, 40), chrono_tz::Europe::Berlin);
        assert_eq!(entry.date, "2025-06-02");
        assert_eq!(entry.time, "00:05");
    }

    #[test]
    fn test_latest_has_no_date() {
        let latest = LatestReading::render(&reading(-3.5, 91), chrono_tz::UTC);
        let json = serde_json::to_value(&latest).unwrap();
        assert_eq!(json, serde_json::json!({"time": "22:05", "temp": "-3.5", "humid": "91"}));
    }

    #[test]
    fn test_format_temperature() {
        assert_eq!(format_temperature(28.0), "28.0");
        assert_eq!(format_temperature(28.26), "28.26");
        assert_eq!(format_temperature(-0.5), "-0.5");
    }
}
