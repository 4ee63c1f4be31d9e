use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use fitlog_core::models::{Identity, MealCompletion, WorkoutCompletion};
use fitlog_core::remote::{
    AffectedPayload, Collection, FiltersPayload, HostedStore, Query, RemoteStore, RowsPayload,
    UpdatePayload, UpsertPayload,
};
use fitlog_core::validation::{RequiredFields, is_valid_upload_today};

const BODY_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

#[derive(Clone)]
pub(crate) struct AppState {
    store: Arc<HostedStore>,
    api_key: Option<String>,
}

impl AppState {
    pub(crate) fn new(store: HostedStore, api_key: Option<String>) -> Self {
        Self {
            store: Arc::new(store),
            api_key,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

// --- Error handling ---

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                error!(error = format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Row validation ---

fn parse_collection(name: &str) -> Result<Collection, ApiError> {
    name.parse()
        .map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))
}

/// Reject rows the store must never hold: rows owned by the device
/// placeholder and completions that fail the upload checks.
fn validate_rows(collection: Collection, rows: &[Value]) -> Result<(), ApiError> {
    for (idx, row) in rows.iter().enumerate() {
        if !row.is_object() {
            return Err(ApiError::BadRequest(format!("Row {idx} is not an object")));
        }
        match collection {
            Collection::WorkoutCompletions => check_completion::<WorkoutCompletion>(idx, row)?,
            Collection::MealCompletions => check_completion::<MealCompletion>(idx, row)?,
            Collection::UserProfiles => check_owner(idx, row)?,
        }
    }
    Ok(())
}

fn check_owner(idx: usize, row: &Value) -> Result<(), ApiError> {
    let owner = row
        .get("user_id")
        .and_then(Value::as_str)
        .map(|s| Identity::from(s.to_string()))
        .unwrap_or_default();
    if owner.is_authenticated() {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "Row {idx} must be owned by a signed-in account"
        )))
    }
}

fn check_completion<C>(idx: usize, row: &Value) -> Result<(), ApiError>
where
    C: fitlog_core::models::Completion + RequiredFields + DeserializeOwned,
{
    check_owner(idx, row)?;
    let record: C = serde_json::from_value(row.clone())
        .map_err(|e| ApiError::BadRequest(format!("Row {idx} is malformed: {e}")))?;
    let check = is_valid_upload_today(&record);
    if check.valid {
        Ok(())
    } else {
        warn!(row = idx, reasons = ?check.reasons, "rejected completion row");
        Err(ApiError::BadRequest(format!(
            "Row {idx} rejected: {}",
            check.reasons.join("; ")
        )))
    }
}

// --- Handlers ---

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn select_rows(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(query): Json<Query>,
) -> Result<Json<RowsPayload>, ApiError> {
    let collection = parse_collection(&name)?;
    let rows = state.store.select(collection, &query).await?;
    Ok(Json(RowsPayload { rows }))
}

async fn insert_rows(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<RowsPayload>,
) -> Result<Json<AffectedPayload>, ApiError> {
    let collection = parse_collection(&name)?;
    validate_rows(collection, &payload.rows)?;
    state.store.insert(collection, &payload.rows).await?;
    Ok(Json(AffectedPayload {
        affected: payload.rows.len() as u64,
    }))
}

async fn update_rows(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<UpdatePayload>,
) -> Result<Json<AffectedPayload>, ApiError> {
    let collection = parse_collection(&name)?;
    if !payload.patch.is_object() {
        return Err(ApiError::BadRequest(
            "Update patch must be a JSON object".to_string(),
        ));
    }
    if payload.patch.get("user_id").is_some() {
        check_owner(0, &payload.patch)?;
    }
    let affected = state
        .store
        .update(collection, &payload.filters, &payload.patch)
        .await?;
    Ok(Json(AffectedPayload { affected }))
}

async fn upsert_rows(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<UpsertPayload>,
) -> Result<Json<AffectedPayload>, ApiError> {
    let collection = parse_collection(&name)?;
    validate_rows(collection, &payload.rows)?;

    let keys: Vec<&str> = if payload.conflict_keys.is_empty() {
        collection.conflict_keys().to_vec()
    } else {
        payload.conflict_keys.iter().map(String::as_str).collect()
    };
    state.store.upsert(collection, &payload.rows, &keys).await?;
    Ok(Json(AffectedPayload {
        affected: payload.rows.len() as u64,
    }))
}

async fn delete_rows(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<FiltersPayload>,
) -> Result<Json<AffectedPayload>, ApiError> {
    let collection = parse_collection(&name)?;
    if payload.filters.is_empty() {
        return Err(ApiError::BadRequest(
            "Refusing to delete without filters".to_string(),
        ));
    }
    let affected = state.store.delete(collection, &payload.filters).await?;
    Ok(Json(AffectedPayload { affected }))
}

// --- Router ---

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/collections/{name}/select", post(select_rows))
        .route("/api/collections/{name}/insert", post(insert_rows))
        .route("/api/collections/{name}/update", post(update_rows))
        .route("/api/collections/{name}/upsert", post(upsert_rows))
        .route("/api/collections/{name}/delete", post(delete_rows))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    store: HostedStore,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    new_api_key: bool,
) -> anyhow::Result<()> {
    let app = build_router(AppState::new(store, api_key.clone()));

    match api_key {
        Some(ref key) if new_api_key => {
            eprintln!("Generated new API key: {key}");
            eprintln!("Include in requests: Authorization: Bearer {key}");
        }
        Some(ref key) if key.len() >= 8 => {
            eprintln!(
                "API key: {}...{} (see api_key file in data directory)",
                &key[..4],
                &key[key.len() - 4..],
            );
        }
        Some(_) => eprintln!("API key: see api_key file in data directory"),
        None => {
            eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
            if bind != "127.0.0.1" && bind != "localhost" {
                eprintln!(
                    "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
                );
            }
        }
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!(bind, port, "remote store listening");
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_app(api_key: Option<String>) -> Router {
        build_router(AppState::new(
            HostedStore::open_in_memory().unwrap(),
            api_key,
        ))
    }

    fn post_json(uri: &str, body: &Value) -> axum::http::Request<Body> {
        axum::http::Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn today() -> String {
        chrono::Local::now().date_naive().to_string()
    }

    fn meal_row(user: &str, date: &str, meal_type: &str, completed_at: &str) -> Value {
        json!({
            "user_id": user,
            "meal_date": date,
            "meal_type": meal_type,
            "completed_at": completed_at,
        })
    }

    #[tokio::test]
    async fn auth_missing_key_returns_401() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(post_json(
                "/api/collections/meal_completions/select",
                &json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Invalid or missing API key");
    }

    #[tokio::test]
    async fn auth_wrong_key_returns_401() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/health")
                    .header("Authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_correct_key_succeeds() {
        let app = test_app(Some("test-key-abc123".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/health")
                    .header("Authorization", "Bearer test-key-abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn no_auth_mode_allows_requests() {
        let app = test_app(None);

        let response = app
            .oneshot(post_json(
                "/api/collections/workout_completions/select",
                &json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["rows"], json!([]));
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = test_app(None);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn security_headers_on_auth_failure() {
        let app = test_app(Some("secret".to_string()));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let app = test_app(None);

        let big_body = vec![0u8; BODY_LIMIT + 1];
        let response = app
            .oneshot(
                axum::http::Request::post("/api/collections/meal_completions/insert")
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!("secret database path /home/user/remote.db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert!(!json["error"].as_str().unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn unknown_collection_returns_400() {
        let app = test_app(None);

        let response = app
            .oneshot(post_json("/api/collections/recipes/select", &json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Unknown collection 'recipes'");
    }

    #[tokio::test]
    async fn upsert_then_select_roundtrip() {
        let app = test_app(None);
        let today = today();

        let first = meal_row("U1", &today, "lunch", "2024-06-15T12:00:00+00:00");
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/collections/meal_completions/upsert",
                &json!({ "rows": [first] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Same slot: replaces rather than duplicates.
        let second = meal_row("U1", &today, "lunch", "2024-06-15T13:00:00+00:00");
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/collections/meal_completions/upsert",
                &json!({ "rows": [second] }),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["affected"], 1);

        let response = app
            .oneshot(post_json(
                "/api/collections/meal_completions/select",
                &json!({ "filters": [{ "op": "eq", "field": "user_id", "value": "U1" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let rows = json["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["completed_at"], "2024-06-15T13:00:00+00:00");
        assert!(rows[0]["id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn future_dated_completion_returns_400() {
        let app = test_app(None);
        let ahead = (chrono::Local::now().date_naive() + chrono::Duration::days(2)).to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/collections/meal_completions/insert",
                &json!({ "rows": [meal_row("U1", &ahead, "dinner", "2024-06-15T12:00:00Z")] }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("future"));

        let response = app
            .oneshot(post_json(
                "/api/collections/meal_completions/select",
                &json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["rows"], json!([]));
    }

    #[tokio::test]
    async fn client_one_day_ahead_is_accepted() {
        let app = test_app(None);
        let today = today();
        let tomorrow = (chrono::Local::now().date_naive() + chrono::Duration::days(1)).to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/collections/meal_completions/upsert",
                &json!({
                    "rows": [
                        meal_row("U1", &today, "lunch", "2024-06-15T12:00:00Z"),
                        meal_row("U1", &tomorrow, "breakfast", "2024-06-15T07:00:00Z"),
                    ],
                    "conflict_keys": ["user_id", "meal_date", "meal_type"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                "/api/collections/meal_completions/select",
                &json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["rows"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn placeholder_owner_returns_400() {
        let app = test_app(None);

        let response = app
            .oneshot(post_json(
                "/api/collections/workout_completions/upsert",
                &json!({ "rows": [{
                    "user_id": "local_user",
                    "workout_date": today(),
                    "day_number": 1,
                    "workout_day_name": "Monday",
                    "completed_at": "2024-06-15T08:00:00Z",
                    "estimated_calories_burned": 300.0,
                }] }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("signed-in account"));
    }

    #[tokio::test]
    async fn update_and_delete_report_affected_rows() {
        let app = test_app(None);
        let today = today();

        let rows = json!({ "rows": [
            meal_row("U1", &today, "breakfast", "2024-06-15T08:00:00Z"),
            meal_row("U1", &today, "snack", "2024-06-15T15:00:00Z"),
            meal_row("U2", &today, "snack", "2024-06-15T15:00:00Z"),
        ] });
        let response = app
            .clone()
            .oneshot(post_json("/api/collections/meal_completions/insert", &rows))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["affected"], 3);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/collections/meal_completions/update",
                &json!({
                    "filters": [{ "op": "eq", "field": "meal_type", "value": "snack" }],
                    "patch": { "meal_plan_id": "plan-7" },
                }),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["affected"], 2);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/collections/meal_completions/delete",
                &json!({ "filters": [{ "op": "eq", "field": "user_id", "value": "U1" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["affected"], 2);

        let response = app
            .oneshot(post_json(
                "/api/collections/meal_completions/select",
                &json!({}),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["rows"].as_array().unwrap().len(), 1);
        assert_eq!(json["rows"][0]["meal_plan_id"], "plan-7");
    }

    #[tokio::test]
    async fn delete_without_filters_returns_400() {
        let app = test_app(None);

        let response = app
            .oneshot(post_json(
                "/api/collections/user_profiles/delete",
                &json!({ "filters": [] }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
