use axum::extract::{FromRequestParts, RawPathParams};
use axum::http::request::Parts;
use chrono::Utc;

use super::error::ApiError;
use crate::error::DoraError;
use crate::metrics::params::is_valid_organization_name;
use crate::metrics::{MetricQueryParams, RawMetricQuery};

/// Optional header that must repeat the organization named in the path
pub const ORGANIZATION_HEADER: &str = "x-organization-name";

/// The organization a request acts for, taken from the `{org}` path segment.
///
/// Missing or malformed names are rejected with 401. A present `X-Organization-Name` header
/// naming a different organization is rejected with 403.
#[derive(Debug, Clone)]
pub struct OrganizationName(pub String);

impl<S: Send + Sync> FromRequestParts<S> for OrganizationName {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let unauthorized =
            || ApiError(DoraError::Unauthorized("Missing or malformed organization name".into()));

        let params = RawPathParams::from_request_parts(parts, state)
            .await
            .map_err(|_| unauthorized())?;
        let organization = params
            .iter()
            .find(|(key, _)| *key == "org")
            .map(|(_, value)| value.trim().to_string())
            .filter(|org| is_valid_organization_name(org))
            .ok_or_else(unauthorized)?;

        if let Some(header) = parts.headers.get(ORGANIZATION_HEADER) {
            let claimed = header.to_str().map_err(|_| unauthorized())?.trim();
            if claimed != organization {
                return Err(ApiError(DoraError::OrganizationAccess(format!(
                    "Not authorized for organization `{organization}`"
                ))));
            }
        }

        Ok(Self(organization))
    }
}

/// Metric query parameters, normalized and validated against the path organization
#[derive(Debug, Clone)]
pub struct ValidatedMetricQuery(pub MetricQueryParams);

impl<S: Send + Sync> FromRequestParts<S> for ValidatedMetricQuery {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let OrganizationName(organization) =
            OrganizationName::from_request_parts(parts, state).await?;

        let mut raw = RawMetricQuery::from_query_string(parts.uri.query().unwrap_or_default());
        if raw
            .organization_name
            .as_deref()
            .is_some_and(|named| named != organization)
        {
            return Err(ApiError(DoraError::OrganizationAccess(format!(
                "Query organization does not match `{organization}`"
            ))));
        }
        raw.merge_path_organization(&organization);

        Ok(Self(raw.normalize(Utc::now())?))
    }
}

/// Selected projects of a `/filters` request
#[derive(Debug, Clone, Default)]
pub struct SelectedProjects(pub Vec<String>);

impl<S: Send + Sync> FromRequestParts<S> for SelectedProjects {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = RawMetricQuery::from_query_string(parts.uri.query().unwrap_or_default());
        Ok(Self(raw.project_names))
    }
}
