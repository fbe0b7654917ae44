//! Metric queries and their cross-date reductions.

use chrono::NaiveDate;
use std::sync::Arc;

use super::models::{
    AggregationContext, AvailableFilters, ChangeFailureRateRow, ChangeFailureRateSummary,
    DeploymentFrequencyRow, DeploymentFrequencySummary, DoraSummary, FiltersResponse,
    LeadTimeRow, LeadTimeSummary, MetricEnvelope, MetricKind, MetricResponse,
    OrganizationDataSummary, OrganizationHealth, OrganizationStatus, TimeToRestoreRow,
    TimeToRestoreSummary,
};
use super::params::{is_valid_organization_name, name_set, MetricQueryParams};
use super::sql::{self, FilterDimension};
use super::stats;
use crate::error::{DoraError, DoraResult};
use crate::warehouse::{ConnectionManager, Statement, WarehouseRow};

pub type DeploymentFrequencyResponse =
    MetricEnvelope<DeploymentFrequencyRow, DeploymentFrequencySummary>;
pub type ChangeFailureRateResponse = MetricEnvelope<ChangeFailureRateRow, ChangeFailureRateSummary>;
pub type LeadTimeResponse = MetricEnvelope<LeadTimeRow, LeadTimeSummary>;
pub type TimeToRestoreResponse = MetricEnvelope<TimeToRestoreRow, TimeToRestoreSummary>;

/// Runs metric queries through a shared [`ConnectionManager`]
#[derive(Clone)]
pub struct MetricsService {
    warehouse: Arc<ConnectionManager>,
}

impl MetricsService {
    pub fn new(warehouse: Arc<ConnectionManager>) -> Self {
        Self { warehouse }
    }

    pub fn warehouse(&self) -> &Arc<ConnectionManager> {
        &self.warehouse
    }

    /// Whether the organization has any deployment data at all
    pub async fn validate_organization_access(&self, organization: &str) -> DoraResult<bool> {
        let rows = self
            .warehouse
            .execute(&sql::organization_probe(organization))
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn ensure_organization_access(&self, organization: &str) -> DoraResult<()> {
        if self.validate_organization_access(organization).await? {
            Ok(())
        } else {
            tracing::warn!(organization, "access denied to organization without data");
            Err(DoraError::OrganizationAccess(format!(
                "Organization `{organization}` has no accessible DORA data"
            )))
        }
    }

    pub async fn metric(
        &self,
        kind: MetricKind,
        params: &MetricQueryParams,
    ) -> DoraResult<MetricResponse> {
        Ok(match kind {
            MetricKind::DeploymentFrequency => {
                MetricResponse::DeploymentFrequency(self.deployment_frequency(params).await?)
            }
            MetricKind::ChangeFailureRate => {
                MetricResponse::ChangeFailureRate(self.change_failure_rate(params).await?)
            }
            MetricKind::LeadTimeForChanges => {
                MetricResponse::LeadTimeForChanges(self.lead_time_for_changes(params).await?)
            }
            MetricKind::MeanTimeToRestore => {
                MetricResponse::MeanTimeToRestore(self.mean_time_to_restore(params).await?)
            }
        })
    }

    pub async fn deployment_frequency(
        &self,
        params: &MetricQueryParams,
    ) -> DoraResult<DeploymentFrequencyResponse> {
        let data = self
            .daily_rows(
                &sql::deployment_frequency(params),
                DeploymentFrequencyRow::from_row,
                |r| r.date,
            )
            .await?;

        let total_deployments: u64 = data.iter().map(|r| r.deployment_count).sum();
        let summary = DeploymentFrequencySummary {
            total_deployments,
            average_per_day: stats::per_day(total_deployments, params.date_range.days),
            date_range: params.date_range.clone(),
            aggregation_context: AggregationContext::union(data.iter().map(|r| &r.context)),
        };
        Ok(envelope(params, data, summary))
    }

    pub async fn change_failure_rate(
        &self,
        params: &MetricQueryParams,
    ) -> DoraResult<ChangeFailureRateResponse> {
        let data = self
            .daily_rows(
                &sql::change_failure_rate(params),
                ChangeFailureRateRow::from_row,
                |r| r.date,
            )
            .await?;

        let total_deployments: u64 = data.iter().map(|r| r.total_deployments).sum();
        let total_failed_deployments: u64 = data.iter().map(|r| r.failed_deployments).sum();
        let summary = ChangeFailureRateSummary {
            total_deployments,
            total_failed_deployments,
            overall_failure_rate: stats::percent(total_failed_deployments, total_deployments),
            date_range: params.date_range.clone(),
            aggregation_context: AggregationContext::union(data.iter().map(|r| &r.context)),
        };
        Ok(envelope(params, data, summary))
    }

    pub async fn lead_time_for_changes(
        &self,
        params: &MetricQueryParams,
    ) -> DoraResult<LeadTimeResponse> {
        let daily = sql::lead_time_daily(params);
        let overall = sql::lead_time_overall(params);
        let (data, overall_median_hours) = tokio::try_join!(
            self.daily_rows(&daily, LeadTimeRow::from_row, |r| r.date),
            self.overall_median(&overall),
        )?;

        let summary = LeadTimeSummary {
            total_changes: data.iter().map(|r| r.change_count).sum(),
            overall_median_hours,
            overall_median_days: overall_median_hours / 24.0,
            date_range: params.date_range.clone(),
            aggregation_context: AggregationContext::union(data.iter().map(|r| &r.context)),
        };
        Ok(envelope(params, data, summary))
    }

    pub async fn mean_time_to_restore(
        &self,
        params: &MetricQueryParams,
    ) -> DoraResult<TimeToRestoreResponse> {
        let daily = sql::time_to_restore_daily(params);
        let overall = sql::time_to_restore_overall(params);
        let (data, overall_median_hours) = tokio::try_join!(
            self.daily_rows(&daily, TimeToRestoreRow::from_row, |r| r.date),
            self.overall_median(&overall),
        )?;

        let summary = TimeToRestoreSummary {
            total_incidents: data.iter().map(|r| r.incident_count).sum(),
            overall_median_hours,
            date_range: params.date_range.clone(),
            aggregation_context: AggregationContext::union(data.iter().map(|r| &r.context)),
        };
        Ok(envelope(params, data, summary))
    }

    /// All four metrics fetched concurrently; any failure fails the whole summary.
    pub async fn summary(&self, params: &MetricQueryParams) -> DoraResult<DoraSummary> {
        let (deployments, failures, lead_time, restore) = tokio::try_join!(
            self.deployment_frequency(params),
            self.change_failure_rate(params),
            self.lead_time_for_changes(params),
            self.mean_time_to_restore(params),
        )?;

        let aggregation_context = AggregationContext::union([
            &deployments.summary.aggregation_context,
            &failures.summary.aggregation_context,
            &lead_time.summary.aggregation_context,
            &restore.summary.aggregation_context,
        ]);

        Ok(DoraSummary {
            organization_name: params.organization_name.clone(),
            date_range: params.date_range.clone(),
            filters_applied: params.filters.clone(),
            deployment_frequency: (&deployments.summary).into(),
            change_failure_rate: (&failures.summary).into(),
            lead_time_for_changes: (&lead_time.summary).into(),
            mean_time_to_restore: (&restore.summary).into(),
            aggregation_context,
        })
    }

    /// Distinct filter values; applications and environments narrow to `selected_projects`.
    pub async fn available_filters(
        &self,
        organization: &str,
        selected_projects: Vec<String>,
    ) -> DoraResult<FiltersResponse> {
        check_organization_name(organization)?;
        let selected_projects = name_set("projectName", selected_projects)?;

        let (projects, applications, environments) = tokio::try_join!(
            self.distinct(organization, FilterDimension::Project, &selected_projects),
            self.distinct(organization, FilterDimension::Application, &selected_projects),
            self.distinct(organization, FilterDimension::Environment, &selected_projects),
        )?;

        Ok(FiltersResponse {
            organization_name: organization.to_string(),
            selected_projects,
            available_filters: AvailableFilters {
                projects,
                applications,
                environments,
            },
        })
    }

    pub async fn organization_health(&self, organization: &str) -> DoraResult<OrganizationHealth> {
        check_organization_name(organization)?;
        let rows = self
            .warehouse
            .execute(&sql::organization_overview(organization))
            .await?;
        let data_summary = rows
            .first()
            .map(OrganizationDataSummary::from_row)
            .unwrap_or_else(|| OrganizationDataSummary::from_row(&WarehouseRow::default()));

        let has_data = data_summary.total_deployments > 0;
        Ok(OrganizationHealth {
            organization_name: organization.to_string(),
            status: if has_data {
                OrganizationStatus::Active
            } else {
                OrganizationStatus::NoData
            },
            has_data,
            data_summary,
        })
    }

    /// Execute a grouped statement and return its rows in ascending date order
    async fn daily_rows<T>(
        &self,
        statement: &Statement,
        parse: fn(&WarehouseRow) -> Option<T>,
        date_of: fn(&T) -> NaiveDate,
    ) -> DoraResult<Vec<T>> {
        let rows = self.warehouse.execute(statement).await?;
        let total = rows.len();
        let mut parsed: Vec<T> = rows.iter().filter_map(parse).collect();
        if parsed.len() < total {
            tracing::debug!(
                kind = statement.kind,
                skipped = total - parsed.len(),
                "skipped rows without a date"
            );
        }
        parsed.sort_by_key(date_of);
        Ok(parsed)
    }

    /// Median of an overall statement; zero when nothing was in scope
    async fn overall_median(&self, statement: &Statement) -> DoraResult<f64> {
        let rows = self.warehouse.execute(statement).await?;
        Ok(rows
            .first()
            .and_then(|r| r.get_f64("median_hours"))
            .filter(|v| v.is_finite())
            .unwrap_or(0.0))
    }

    async fn distinct(
        &self,
        organization: &str,
        dimension: FilterDimension,
        selected_projects: &[String],
    ) -> DoraResult<Vec<String>> {
        let statement = sql::distinct_values(organization, dimension, selected_projects);
        let rows = self.warehouse.execute(&statement).await?;
        let mut values: Vec<String> = rows
            .iter()
            .filter_map(|r| r.get_string("value"))
            .filter(|v| !v.is_empty())
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }
}

fn envelope<R, S>(params: &MetricQueryParams, data: Vec<R>, summary: S) -> MetricEnvelope<R, S> {
    MetricEnvelope {
        organization_name: params.organization_name.clone(),
        data,
        summary,
        filters_applied: params.filters.clone(),
    }
}

fn check_organization_name(organization: &str) -> DoraResult<()> {
    if is_valid_organization_name(organization) {
        Ok(())
    } else {
        Err(DoraError::validation(
            "organizationName",
            "organizationName must be 3-50 letters, digits, hyphens or underscores",
        ))
    }
}
