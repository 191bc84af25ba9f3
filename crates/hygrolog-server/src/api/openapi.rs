//! OpenAPI specification for the hygrolog API.

use axum::Json;
use utoipa::OpenApi;

use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::readings::{HistoryEntry, LatestReading};

/// Serve the OpenAPI specification as JSON.
///
/// Available at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for hygrolog.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "hygrolog API",
        version = "0.1.0",
        description = r#"
# hygrolog API

Read-only access to temperature and humidity readings collected from a
Bluetooth LE sensor.

- **History**: every stored reading, newest first by default
- **Latest**: the most recent reading
- **Health**: service status and the number of stored readings

Readings older than the configured retention window are deleted daily.
Timestamps are rendered in the server's configured timezone.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local hygrolog server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "readings", description = "Stored sensor readings")
    ),
    paths(
        super::health::health_check,
        super::readings::get_history,
        super::readings::get_latest,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            HistoryEntry,
            LatestReading,
        )
    )
)]
pub struct ApiDoc;
