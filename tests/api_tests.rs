use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use dora_metrics::api::{build_router, AppState, RateLimiter};
use dora_metrics::config::RateLimitSettings;
use dora_metrics::metrics::sql::kind;
use dora_metrics::metrics::MetricsService;
use dora_metrics::warehouse::fake::FakeWarehouse;
use dora_metrics::warehouse::{ConnectionManager, Statement, WarehouseRow};
use dora_metrics::DoraResult;

fn rows(values: Value) -> DoraResult<Vec<WarehouseRow>> {
    Ok(values
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(WarehouseRow::from_json)
        .collect())
}

/// `acme` has data, `quiet-org` exists with nothing in range, `ghost-org` has nothing at all
fn respond(stmt: &Statement) -> DoraResult<Vec<WarehouseRow>> {
    let org = stmt.organization.as_deref().unwrap_or_default();
    match (org, stmt.kind) {
        ("ghost-org", kind::ORGANIZATION_OVERVIEW) => rows(json!([
            { "total_deployments": 0, "total_incidents": 0, "project_count": 0 }
        ])),
        ("ghost-org", _) => Ok(Vec::new()),
        (_, kind::ORGANIZATION_PROBE) => rows(json!([{ "present": 1 }])),
        ("acme", kind::ORGANIZATION_OVERVIEW) => rows(json!([{
            "total_deployments": "42", "total_incidents": "3", "project_count": "2",
            "first_deployment_at": "2024-01-02T08:00:00.000Z",
            "last_deployment_at": "2024-06-01T17:30:00.000Z",
        }])),
        ("acme", kind::DEPLOYMENT_FREQUENCY) => rows(json!([
            { "metric_date": "2024-06-03", "deployment_count": "4",
              "projects": "[\"web\"]", "applications": "[\"checkout\"]", "environments": "[\"Production\"]" },
            { "metric_date": "2024-06-01", "deployment_count": "2",
              "projects": "[\"api\",\"web\"]", "applications": "[\"billing\",\"checkout\"]",
              "environments": "[\"Non-Production\",\"Production\"]" },
        ])),
        ("acme", kind::CHANGE_FAILURE_RATE) => rows(json!([
            { "metric_date": "2024-06-01", "total_deployments": 10, "failed_deployments": 1 },
            { "metric_date": "2024-06-02", "total_deployments": 100, "failed_deployments": 50 },
        ])),
        ("acme", kind::DISTINCT_PROJECTS) => rows(json!([{ "value": "api" }, { "value": "web" }])),
        ("acme", kind::DISTINCT_APPLICATIONS) => {
            if stmt.string_params("project_name_").contains(&"web") {
                rows(json!([{ "value": "checkout" }]))
            } else {
                rows(json!([{ "value": "billing" }, { "value": "checkout" }]))
            }
        }
        ("acme", kind::DISTINCT_ENVIRONMENTS) => {
            rows(json!([{ "value": "Non-Production" }, { "value": "Production" }]))
        }
        _ => Ok(Vec::new()),
    }
}

fn limits(max_requests: u32, trust_forwarded_for: bool) -> RateLimitSettings {
    RateLimitSettings {
        window: Duration::from_secs(60),
        max_requests,
        trust_forwarded_for,
    }
}

fn app_with(fake: &FakeWarehouse, settings: RateLimitSettings) -> Router {
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(fake.clone()),
        Duration::from_secs(5),
    ));
    let limiter = RateLimiter::new(&settings);
    let state = AppState::new(MetricsService::new(manager), limiter);
    build_router(state, "http://localhost:3000").expect("router should build")
}

fn app() -> (Router, FakeWarehouse) {
    let fake = FakeWarehouse::new(respond);
    (app_with(&fake, limits(1_000, false)), fake)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_default_request_covers_last_thirty_days() {
    let (app, _fake) = app();
    let (status, body) = get(&app, "/api/v1/dora/acme/deployment-frequency").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metric"], "deployment_frequency");
    assert_eq!(body["organization_name"], "acme");

    let dates: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["date"].as_str().unwrap())
        .collect();
    assert_eq!(dates, vec!["2024-06-01", "2024-06-03"]);

    let range = &body["summary"]["date_range"];
    assert_eq!(range["days"], 30);
    assert_eq!(range["time_range"], "30d");
    let end = DateTime::parse_from_rfc3339(range["end_date"].as_str().unwrap()).unwrap();
    let start = DateTime::parse_from_rfc3339(range["start_date"].as_str().unwrap()).unwrap();
    assert_eq!((end - start).num_days(), 30);
    assert!((Utc::now() - end.with_timezone(&Utc)).num_seconds().abs() < 60);

    assert_eq!(body["summary"]["total_deployments"], 6);
    assert_eq!(body["summary"]["average_per_day"], 0.2);
}

#[tokio::test]
async fn test_row_counts_match_lists() {
    let (app, _fake) = app();
    let (_, body) = get(&app, "/api/v1/dora/acme/deployment-frequency").await;

    for row in body["data"].as_array().unwrap() {
        for (count, list) in [
            ("project_count", "projects"),
            ("application_count", "applications"),
            ("environment_count", "environments"),
        ] {
            assert_eq!(
                row[count].as_u64().unwrap() as usize,
                row[list].as_array().unwrap().len()
            );
        }
    }
}

#[tokio::test]
async fn test_failure_rate_weighted() {
    let (app, _fake) = app();
    let (status, body) = get(&app, "/api/v1/dora/acme/change-failure-rate").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metric"], "change_failure_rate");
    let rate = body["summary"]["overall_failure_rate"].as_f64().unwrap();
    assert!((rate - 51.0 / 110.0 * 100.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_invalid_environment_rejected_before_warehouse() {
    let (app, fake) = app();
    let (status, body) = get(
        &app,
        "/api/v1/dora/acme/deployment-frequency?environmentType=Prod",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], true);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(fake.executed().is_empty());
}

#[tokio::test]
async fn test_reversed_dates_never_reach_warehouse() {
    let (app, fake) = app();
    let (status, body) = get(
        &app,
        "/api/v1/dora/acme/lead-time-for-changes?startDate=2024-02-01&endDate=2024-01-01",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["details"]["field"], "endDate");
    assert!(fake.executed().is_empty());
}

#[tokio::test]
async fn test_range_longer_than_two_years_rejected() {
    let (app, _fake) = app();
    let (status, _) = get(
        &app,
        "/api/v1/dora/acme/summary?startDate=2021-01-01&endDate=2024-01-01",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_explicit_dates_win_over_time_range() {
    let (app, _fake) = app();
    let (status, body) = get(
        &app,
        "/api/v1/dora/acme/deployment-frequency?startDate=2024-05-01&endDate=2024-05-31&timeRange=7d",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let range = &body["summary"]["date_range"];
    assert_eq!(range["start_date"], "2024-05-01T00:00:00Z");
    assert_eq!(range["end_date"], "2024-05-31T00:00:00Z");
    assert_eq!(range["time_range"], Value::Null);
}

#[tokio::test]
async fn test_repeated_and_bracketed_keys_normalize_identically() {
    let (app, _fake) = app();
    let (_, repeated) = get(
        &app,
        "/api/v1/dora/acme/deployment-frequency?projectName=b&projectName=a",
    )
    .await;
    let (_, bracketed) = get(
        &app,
        "/api/v1/dora/acme/deployment-frequency?projectName%5B%5D=a&projectName%5B%5D=b",
    )
    .await;

    assert_eq!(repeated["filters_applied"]["project_names"], json!(["a", "b"]));
    assert_eq!(
        repeated["filters_applied"],
        bracketed["filters_applied"]
    );
}

#[tokio::test]
async fn test_empty_result_is_success() {
    let (app, _fake) = app();
    let (status, body) = get(&app, "/api/v1/dora/quiet-org/mean-time-to-restore").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metric"], "mean_time_to_restore");
    assert_eq!(body["data"], json!([]));
    assert_eq!(body["summary"]["total_incidents"], 0);
    assert_eq!(body["summary"]["overall_median_hours"], 0.0);
    assert_eq!(body["summary"]["aggregation_context"]["project_count"], 0);
}

#[tokio::test]
async fn test_unknown_organization() {
    let (app, _fake) = app();

    let (status, body) = get(&app, "/api/v1/dora/ghost-org/health").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["has_data"], false);
    assert_eq!(body["status"], "no_data");

    let (status, body) = get(&app, "/api/v1/dora/ghost-org/deployment-frequency").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "ORGANIZATION_ACCESS_DENIED");
}

#[tokio::test]
async fn test_organization_health_with_data() {
    let (app, _fake) = app();
    let (status, body) = get(&app, "/api/v1/dora/acme/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_data"], true);
    assert_eq!(body["status"], "active");
    assert_eq!(body["data_summary"]["total_deployments"], 42);
    assert_eq!(body["data_summary"]["project_count"], 2);
}

#[tokio::test]
async fn test_malformed_organization_is_unauthorized() {
    let (app, fake) = app();
    let (status, body) = get(&app, "/api/v1/dora/ab/summary").await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert!(fake.executed().is_empty());
}

#[tokio::test]
async fn test_organization_header_must_match_path() {
    let (app, _fake) = app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/dora/acme/summary")
                .header("X-Organization-Name", "other-org")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let (status, _) = get(
        &app,
        "/api/v1/dora/acme/summary?organizationName=other-org",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_cascading_filters() {
    let (app, _fake) = app();
    let (status, all) = get(&app, "/api/v1/dora/acme/filters").await;
    assert_eq!(status, StatusCode::OK);
    let (_, scoped) = get(&app, "/api/v1/dora/acme/filters?projectName=web").await;

    let all_apps = all["available_filters"]["applications"].as_array().unwrap();
    let scoped_apps = scoped["available_filters"]["applications"].as_array().unwrap();
    assert_eq!(scoped_apps, &vec![json!("checkout")]);
    assert!(scoped_apps.iter().all(|a| all_apps.contains(a)));
    assert_eq!(scoped["selected_projects"], json!(["web"]));
    assert_eq!(
        all["available_filters"]["environments"],
        json!(["Non-Production", "Production"])
    );
}

#[tokio::test]
async fn test_summary_combines_all_metrics() {
    let (app, _fake) = app();
    let (status, body) = get(&app, "/api/v1/dora/acme/summary?timeRange=90d").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["date_range"]["days"], 90);
    assert_eq!(body["deployment_frequency"]["total_deployments"], 6);
    assert_eq!(body["change_failure_rate"]["total_failed_deployments"], 51);
    assert_eq!(body["change_failure_rate"]["performance_level"], "low");
    assert_eq!(body["lead_time_for_changes"]["performance_level"], Value::Null);
    assert_eq!(body["aggregation_context"]["projects"], json!(["api", "web"]));
}

#[tokio::test]
async fn test_rate_limit_applies_to_api_only() {
    let fake = FakeWarehouse::new(respond);
    let app = app_with(&fake, limits(2, false));

    for _ in 0..2 {
        let (status, _) = get(&app, "/api/v1/dora/acme/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/dora/acme/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    let (status, _) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
}

async fn get_forwarded(app: &Router, client: &str) -> StatusCode {
    app.clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/dora/acme/health")
                .header("X-Forwarded-For", client)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_forwarded_clients_limited_separately_behind_trusted_proxy() {
    let fake = FakeWarehouse::new(respond);
    let app = app_with(&fake, limits(1, true));

    assert_eq!(get_forwarded(&app, "10.0.0.1").await, StatusCode::OK);
    assert_eq!(get_forwarded(&app, "10.0.0.2").await, StatusCode::OK);
    assert_eq!(
        get_forwarded(&app, "10.0.0.1").await,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_rotating_forwarded_header_does_not_reset_quota() {
    let fake = FakeWarehouse::new(respond);
    let app = app_with(&fake, limits(1, false));

    assert_eq!(get_forwarded(&app, "10.0.0.1").await, StatusCode::OK);
    assert_eq!(
        get_forwarded(&app, "10.0.0.2").await,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_warehouse_unavailable() {
    let (app, fake) = app();
    fake.fail_next_connects(1);

    let (status, body) = get(&app, "/api/v1/dora/acme/deployment-frequency").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "DATABASE_UNAVAILABLE");
    assert!(!body["message"].as_str().unwrap().contains("fake"));

    let (status, _) = get(&app, "/api/v1/dora/acme/deployment-frequency").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_service_health() {
    let (app, fake) = app();

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "dora-metrics");
    assert_eq!(body["warehouse"]["status"], "healthy");

    fake.fail_next_connects(1);
    let fresh = app_with(&fake, limits(10, false));
    let (status, body) = get(&fresh, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["warehouse"]["status"], "unhealthy");
}
