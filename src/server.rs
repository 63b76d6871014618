//! JSON HTTP API.
//!
//! Read endpoints serve search and facet enumeration; admin endpoints
//! trigger and observe indexing runs.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/search` | Paginated faceted search |
//! | `GET`  | `/categories` | Category counts, optionally per registry |
//! | `GET`  | `/languages` | Distinct languages, optionally per registry |
//! | `GET`  | `/metadata` | Per-registry aggregate stats |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/admin/index` | Trigger an indexing run (requires API key) |
//! | `POST` | `/admin/index/stop` | Request cancellation of the active run |
//! | `GET`  | `/admin/index/status` | Latest run status |
//! | `GET`  | `/admin/index/history` | Past runs, most recent first |
//!
//! # Error Contract
//!
//! All error responses use one schema:
//!
//! ```json
//! { "error": { "code": "run_active", "message": "an indexing run is already in progress" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `run_active` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the read surface is
//! consumed directly by browser clients.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::cache::{MemoryCache, SnapshotCache};
use crate::config::Config;
use crate::error::IndexError;
use crate::fetch::HttpRegistryFetcher;
use crate::models::{IndexRun, RegistryMetadata, TriggerSource};
use crate::orchestrate::{begin_run, execute_run, latest_status, list_runs, request_stop};
use crate::search::{
    list_categories, list_languages, list_registry_metadata, search_page, CategoryCount,
    SearchPage, SearchQuery, SortBy,
};

/// Shared application state passed to all route handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
struct AppState {
    pool: sqlx::SqlitePool,
    config: Arc<Config>,
    cache: Arc<MemoryCache>,
}

/// Starts the HTTP server.
///
/// Binds to the address configured in `[server].bind` and runs until the
/// process is terminated. The snapshot cache is process-local and shared
/// across handlers.
pub async fn run_server(config: &Config, pool: sqlx::SqlitePool) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        cache: Arc::new(MemoryCache::new()),
    };

    let app = router(state);

    info!("listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", get(handle_search))
        .route("/categories", get(handle_categories))
        .route("/languages", get(handle_languages))
        .route("/metadata", get(handle_metadata))
        .route("/health", get(handle_health))
        .route("/admin/index", post(handle_trigger_index))
        .route("/admin/index/stop", post(handle_stop_index))
        .route("/admin/index/status", get(handle_index_status))
        .route("/admin/index/history", get(handle_index_history))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "run_active".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

/// Validates the `x-api-key` header against the configured admin key.
/// Returns the truncated key suffix used for run attribution.
fn require_api_key(config: &Config, headers: &HeaderMap) -> Result<String, AppError> {
    let expected = config
        .server
        .api_key
        .as_deref()
        .ok_or_else(|| forbidden("admin indexing is disabled: no API key configured"))?;

    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing x-api-key header"))?;

    if provided != expected {
        return Err(forbidden("invalid API key"));
    }

    let suffix: String = provided
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Ok(format!("...{}", suffix))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /search ============

/// Wire form of the search parameters. `archived=false` excludes archived
/// entries; absent means include everything.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    q: Option<String>,
    registry: Option<String>,
    category: Option<String>,
    language: Option<String>,
    archived: Option<bool>,
    min_stars: Option<i64>,
    sort_by: Option<SortBy>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchPage>, AppError> {
    if let Some(limit) = params.limit {
        if limit == 0 {
            return Err(bad_request("limit must be >= 1"));
        }
    }

    let request = SearchQuery {
        q: params.q,
        registry: params.registry,
        category: params.category,
        language: params.language,
        archived: params.archived,
        min_stars: params.min_stars,
        sort_by: params.sort_by,
        limit: params.limit,
        offset: params.offset,
    };
    let page = search_page(
        &state.pool,
        Some(state.cache.as_ref() as &dyn SnapshotCache),
        &state.config.search,
        &request,
    )
    .await
    .map_err(internal)?;
    Ok(Json(page))
}

// ============ GET /categories, /languages, /metadata ============

#[derive(Debug, Deserialize)]
struct FacetParams {
    registry: Option<String>,
}

// The facet endpoints feed filter dropdowns directly; they return bare
// arrays, not envelopes.

async fn handle_categories(
    State(state): State<AppState>,
    Query(params): Query<FacetParams>,
) -> Result<Json<Vec<CategoryCount>>, AppError> {
    let categories = list_categories(&state.pool, params.registry.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(categories))
}

async fn handle_languages(
    State(state): State<AppState>,
    Query(params): Query<FacetParams>,
) -> Result<Json<Vec<String>>, AppError> {
    let languages = list_languages(&state.pool, params.registry.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(languages))
}

async fn handle_metadata(
    State(state): State<AppState>,
) -> Result<Json<Vec<RegistryMetadata>>, AppError> {
    let registries = list_registry_metadata(&state.pool)
        .await
        .map_err(internal)?;
    Ok(Json(registries))
}

// ============ POST /admin/index ============

#[derive(Serialize)]
struct TriggerResponse {
    status: String,
    #[serde(rename = "runId")]
    run_id: String,
}

/// Triggers a manual indexing run. The run slot is claimed atomically
/// before responding, so the `409` is authoritative even under concurrent
/// triggers; the run itself proceeds in the background and is observed via
/// the status endpoint.
async fn handle_trigger_index(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    let created_by = require_api_key(&state.config, &headers)?;

    // Built before the slot is claimed; a construction failure must not
    // strand a running run row.
    let fetcher = HttpRegistryFetcher::new(&state.config.fetcher, None).map_err(internal)?;

    let run_id = begin_run(&state.pool, TriggerSource::Manual, Some(&created_by))
        .await
        .map_err(|e| match e.downcast_ref::<IndexError>() {
            Some(IndexError::RunActive) => conflict("an indexing run is already in progress"),
            _ => internal(e),
        })?;

    let pool = state.pool.clone();
    let cache = state.cache.clone();
    let background_run_id = run_id.clone();
    tokio::spawn(async move {
        let result = execute_run(
            &pool,
            &background_run_id,
            &fetcher,
            Some(cache.as_ref() as &dyn SnapshotCache),
        )
        .await;
        if let Err(e) = result {
            error!(run_id = %background_run_id, error = %e, "background indexing run failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            status: "started".to_string(),
            run_id,
        }),
    ))
}

// ============ POST /admin/index/stop ============

#[derive(Serialize)]
struct StopResponse {
    stopped: bool,
}

async fn handle_stop_index(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StopResponse>, AppError> {
    require_api_key(&state.config, &headers)?;
    let stopped = request_stop(&state.pool).await.map_err(internal)?;
    Ok(Json(StopResponse { stopped }))
}

// ============ GET /admin/index/status, /admin/index/history ============

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    run: Option<IndexRun>,
}

async fn handle_index_status(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, AppError> {
    let (status, run) = latest_status(&state.pool).await.map_err(internal)?;
    Ok(Json(StatusResponse { status, run }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    runs: Vec<IndexRun>,
}

async fn handle_index_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);
    let runs = list_runs(&state.pool, limit, offset)
        .await
        .map_err(internal)?;
    Ok(Json(HistoryResponse { runs }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_registry;
    use crate::normalize::tests::{document, item, repo, section, test_pool};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state(api_key: Option<&str>) -> AppState {
        let pool = test_pool().await;
        let key_line = match api_key {
            Some(key) => format!("api_key = \"{}\"\n", key),
            None => String::new(),
        };
        let config: Config = toml::from_str(&format!(
            r#"[db]
path = "/tmp/unused.sqlite"

[server]
bind = "127.0.0.1:0"
{}"#,
            key_line
        ))
        .unwrap();
        AppState {
            pool,
            config: Arc::new(config),
            cache: Arc::new(MemoryCache::new()),
        }
    }

    async fn seed_go_registry(state: &AppState) {
        let doc = document(
            "Awesome Go",
            vec![section(
                "Web Frameworks",
                vec![item("Gin", Some(repo("gin-gonic", "gin", 50000, "Go", false)))],
            )],
        );
        normalize_registry(&state.pool, "go", &doc).await.unwrap();
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post(
        state: AppState,
        uri: &str,
        api_key: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method("POST").uri(uri);
        if let Some(key) = api_key {
            request = request.header("x-api-key", key);
        }
        let response = router(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_categories_returns_bare_array() {
        let state = test_state(None).await;
        seed_go_registry(&state).await;

        let (status, body) = get_json(state, "/categories").await;
        assert_eq!(status, StatusCode::OK);
        let entries = body.as_array().expect("bare JSON array");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["category"], "Web Frameworks");
        assert_eq!(entries[0]["key"], "go:web-frameworks");
        assert_eq!(entries[0]["count"], 1);
    }

    #[tokio::test]
    async fn test_languages_returns_bare_array() {
        let state = test_state(None).await;
        seed_go_registry(&state).await;

        let (status, body) = get_json(state, "/languages").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!(["Go"]));
    }

    #[tokio::test]
    async fn test_metadata_returns_bare_array() {
        let state = test_state(None).await;
        seed_go_registry(&state).await;

        let (status, body) = get_json(state, "/metadata").await;
        assert_eq!(status, StatusCode::OK);
        let entries = body.as_array().expect("bare JSON array");
        assert_eq!(entries[0]["name"], "go");
        assert_eq!(entries[0]["total_repos"], 1);
    }

    #[tokio::test]
    async fn test_trigger_requires_api_key() {
        let state = test_state(Some("secret-key")).await;
        let (status, body) = post(state, "/admin/index", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");

        let state = test_state(Some("secret-key")).await;
        let (status, body) = post(state, "/admin/index", Some("wrong")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "forbidden");

        // With no key configured, manual indexing over HTTP is disabled.
        let state = test_state(None).await;
        let (status, _) = post(state, "/admin/index", Some("anything")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_trigger_conflicts_while_run_active() {
        let state = test_state(Some("secret-key")).await;
        sqlx::query(
            "INSERT INTO index_runs (id, trigger_source, status, started_at) VALUES ('busy', 'manual', 'running', 0)",
        )
        .execute(&state.pool)
        .await
        .unwrap();

        let pool = state.pool.clone();
        let (status, body) = post(state, "/admin/index", Some("secret-key")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "run_active");

        // The rejected trigger must not have created a second run row.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_runs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_status_endpoint_idle() {
        let state = test_state(None).await;
        let (status, body) = get_json(state, "/admin/index/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "idle");
        assert!(body["run"].is_null());
    }
}
