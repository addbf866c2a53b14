use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use domainlink_core::CanonicalPreference;

use crate::problem::ProblemResponse;
use crate::service::{DomainService, OperationResponse, ProvisionRequest};
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    service: DomainService,
    admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, service: DomainService, admin_token: Option<String>) -> Self {
        Self {
            metrics,
            service,
            admin_token: admin_token
                .filter(|token| !token.is_empty())
                .map(Arc::from),
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn service(&self) -> &DomainService {
        &self.service
    }
}

/// Health and metrics are always served. Domain management is mounted only
/// when an admin token is configured.
pub fn app_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics));

    if state.admin_token.is_some() {
        let domains = Router::new()
            .route("/domains", post(provision))
            .route("/domains/:id", get(show).delete(remove))
            .route("/domains/:id/dns", get(dns_status))
            .route("/domains/:id/setup", post(setup))
            .route("/domains/:id/restart", post(restart))
            .route("/domains/:id/disable", post(disable))
            .route("/domains/:id/enable", post(enable))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        router = router.merge(domains);
    }

    router.with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return ProblemResponse::unauthorized().into_response();
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();

    if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        next.run(request).await
    } else {
        ProblemResponse::unauthorized().into_response()
    }
}

async fn provision(
    State(state): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> Result<Response, ProblemResponse> {
    let record = state.service().provision(request).await?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ProblemResponse> {
    let view = state.service().get(&id).await?;
    Ok(Json(view).into_response())
}

async fn dns_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ProblemResponse> {
    let status = state.service().dns_status(&id).await?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Deserialize)]
struct SetupRequest {
    hostname: String,
    #[serde(default)]
    canonical_preference: CanonicalPreference,
}

async fn setup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SetupRequest>,
) -> Result<Response, ProblemResponse> {
    let response = state
        .service()
        .setup(&id, &request.hostname, request.canonical_preference)
        .await?;
    Ok(operation(response))
}

async fn restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ProblemResponse> {
    Ok(operation(state.service().restart(&id).await?))
}

async fn disable(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ProblemResponse> {
    Ok(operation(state.service().disable(&id).await?))
}

async fn enable(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ProblemResponse> {
    Ok(operation(state.service().enable(&id).await?))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ProblemResponse> {
    Ok(operation(state.service().remove(&id).await?))
}

fn operation(response: OperationResponse) -> Response {
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use domainlink_storage::Database;
    use domainlink_util::MonitoringConfig;

    use crate::service::Collaborators;
    use crate::test_support::{
        fixed_clock, healthy, probe_for, FakeProvider, RecordingNotifier, RecordingScheduler,
        StaticHealth,
    };

    const TOKEN: &str = "admin-secret";

    async fn setup_state(admin_token: Option<&str>) -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");

        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let service = DomainService::new(
            database.tenant_domains(),
            Collaborators {
                provider: Arc::new(FakeProvider::with_verified(true)),
                health: Arc::new(StaticHealth(healthy())),
                notifier: Arc::new(RecordingNotifier::default()),
                scheduler: Arc::new(RecordingScheduler::default()),
                dns: probe_for("example.com", true),
            },
            MonitoringConfig {
                companion_verify_delay: std::time::Duration::ZERO,
                ..MonitoringConfig::default()
            },
            fixed_clock(),
        );
        AppState::new(metrics, service, admin_token.map(str::to_string))
    }

    fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> Value {
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        serde_json::from_slice(&collected.to_bytes()).expect("json body")
    }

    async fn provision(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/domains",
                Some(json!({
                    "tenant_id": "tenant-1",
                    "subdomain": "tenant-1.platform.test",
                    "owner_email": "owner@tenant-1.test",
                    "custom_domains_enabled": true
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(setup_state(None).await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(setup_state(None).await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn domain_routes_absent_without_token() {
        let app = app_router(setup_state(None).await);

        let response = app
            .oneshot(authed("GET", "/domains/rec-1", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_wrong_bearer_token() {
        let app = app_router(setup_state(Some(TOKEN)).await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/domains/rec-1")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn setup_then_show_reports_monitoring() {
        let app = app_router(setup_state(Some(TOKEN)).await);
        let id = provision(&app).await;

        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/domains/{id}/setup"),
                Some(json!({ "hostname": "Example.com", "canonical_preference": "apex" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["hostname"], "example.com");

        let response = app
            .clone()
            .oneshot(authed("GET", &format!("/domains/{id}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "cname_monitoring");
        assert_eq!(body["canonical_domain"], "example.com");
        assert_eq!(body["estimated_seconds_remaining"], 3600);
    }

    #[tokio::test]
    async fn invalid_hostname_is_a_problem() {
        let app = app_router(setup_state(Some(TOKEN)).await);
        let id = provision(&app).await;

        let response = app
            .oneshot(authed(
                "POST",
                &format!("/domains/{id}/setup"),
                Some(json!({ "hostname": "not a host" })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["type"], crate::problem::INVALID_HOSTNAME);
    }

    #[tokio::test]
    async fn unknown_record_is_not_found() {
        let app = app_router(setup_state(Some(TOKEN)).await);

        let response = app
            .oneshot(authed("POST", "/domains/missing/restart", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disable_on_subdomain_conflicts_and_delete_reverts() {
        let app = app_router(setup_state(Some(TOKEN)).await);
        let id = provision(&app).await;

        let response = app
            .clone()
            .oneshot(authed("POST", &format!("/domains/{id}/disable"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        app.clone()
            .oneshot(authed(
                "POST",
                &format!("/domains/{id}/setup"),
                Some(json!({ "hostname": "example.com" })),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(authed("DELETE", &format!("/domains/{id}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["hostname"], "tenant-1.platform.test");
    }
}
