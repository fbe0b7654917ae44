use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::ApiError;
use super::extractors::{OrganizationName, SelectedProjects, ValidatedMetricQuery};
use super::AppState;
use crate::metrics::models::{DoraSummary, FiltersResponse, OrganizationHealth};
use crate::metrics::{MetricKind, MetricResponse};
use crate::warehouse::HealthReport;

pub const SERVICE_NAME: &str = "dora-metrics";

async fn metric(
    state: &AppState,
    kind: MetricKind,
    ValidatedMetricQuery(params): ValidatedMetricQuery,
) -> Result<Json<MetricResponse>, ApiError> {
    state
        .service
        .ensure_organization_access(&params.organization_name)
        .await?;
    let response = state.service.metric(kind, &params).await?;
    tracing::debug!(
        organization = %params.organization_name,
        metric = %kind,
        rows = response.len(),
        "metric served"
    );
    Ok(Json(response))
}

pub async fn deployment_frequency(
    State(state): State<AppState>,
    query: ValidatedMetricQuery,
) -> Result<Json<MetricResponse>, ApiError> {
    metric(&state, MetricKind::DeploymentFrequency, query).await
}

pub async fn change_failure_rate(
    State(state): State<AppState>,
    query: ValidatedMetricQuery,
) -> Result<Json<MetricResponse>, ApiError> {
    metric(&state, MetricKind::ChangeFailureRate, query).await
}

pub async fn lead_time_for_changes(
    State(state): State<AppState>,
    query: ValidatedMetricQuery,
) -> Result<Json<MetricResponse>, ApiError> {
    metric(&state, MetricKind::LeadTimeForChanges, query).await
}

pub async fn mean_time_to_restore(
    State(state): State<AppState>,
    query: ValidatedMetricQuery,
) -> Result<Json<MetricResponse>, ApiError> {
    metric(&state, MetricKind::MeanTimeToRestore, query).await
}

pub async fn summary(
    State(state): State<AppState>,
    ValidatedMetricQuery(params): ValidatedMetricQuery,
) -> Result<Json<DoraSummary>, ApiError> {
    state
        .service
        .ensure_organization_access(&params.organization_name)
        .await?;
    Ok(Json(state.service.summary(&params).await?))
}

pub async fn filters(
    State(state): State<AppState>,
    OrganizationName(organization): OrganizationName,
    SelectedProjects(projects): SelectedProjects,
) -> Result<Json<FiltersResponse>, ApiError> {
    state.service.ensure_organization_access(&organization).await?;
    Ok(Json(
        state.service.available_filters(&organization, projects).await?,
    ))
}

/// 200 when the organization has data, 404 otherwise
pub async fn organization_health(
    State(state): State<AppState>,
    OrganizationName(organization): OrganizationName,
) -> Result<(StatusCode, Json<OrganizationHealth>), ApiError> {
    let health = state.service.organization_health(&organization).await?;
    let status = if health.has_data {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(health)))
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub hostname: String,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
    pub warehouse: HealthReport,
}

/// Process and warehouse health; 503 when the warehouse probe fails
pub async fn service_health(State(state): State<AppState>) -> (StatusCode, Json<ServiceHealth>) {
    let warehouse = state.service.warehouse().health_check().await;
    let (status, label) = if warehouse.is_healthy() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    (
        status,
        Json(ServiceHealth {
            status: label,
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            hostname,
            uptime_secs: state.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
            warehouse,
        }),
    )
}
