use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::str::FromStr;

use super::params::{DateRange, MetricFilters};
use super::stats::PerformanceLevel;
use crate::warehouse::WarehouseRow;

/// The four DORA metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    DeploymentFrequency,
    ChangeFailureRate,
    LeadTimeForChanges,
    MeanTimeToRestore,
}

impl MetricKind {
    pub const ALL: [Self; 4] = [
        Self::DeploymentFrequency,
        Self::ChangeFailureRate,
        Self::LeadTimeForChanges,
        Self::MeanTimeToRestore,
    ];

    /// Name used as the `metric` tag in responses
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeploymentFrequency => "deployment_frequency",
            Self::ChangeFailureRate => "change_failure_rate",
            Self::LeadTimeForChanges => "lead_time_for_changes",
            Self::MeanTimeToRestore => "mean_time_to_restore",
        }
    }

    /// URL path segment of the metric endpoint
    pub fn path(self) -> &'static str {
        match self {
            Self::DeploymentFrequency => "deployment-frequency",
            Self::ChangeFailureRate => "change-failure-rate",
            Self::LeadTimeForChanges => "lead-time-for-changes",
            Self::MeanTimeToRestore => "mean-time-to-restore",
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    /// Accepts either the response tag or the path segment
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.path() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Self::ALL.iter().map(|k| k.path()).collect();
                format!("unknown metric `{s}`, expected one of {}", names.join(", "))
            })
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was rolled up into a row: contributing projects, applications and environments.
///
/// Counts always equal the lengths of their lists; build through [`Self::from_lists`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationContext {
    pub project_count: usize,
    pub application_count: usize,
    pub environment_count: usize,
    pub projects: Vec<String>,
    pub applications: Vec<String>,
    pub environments: Vec<String>,
}

impl AggregationContext {
    pub fn from_lists(
        projects: Vec<String>,
        applications: Vec<String>,
        environments: Vec<String>,
    ) -> Self {
        Self {
            project_count: projects.len(),
            application_count: applications.len(),
            environment_count: environments.len(),
            projects,
            applications,
            environments,
        }
    }

    /// Context columns of a grouped row; absent columns become empty lists
    pub fn from_row(row: &WarehouseRow) -> Self {
        Self::from_lists(
            row.get_string_list("projects"),
            row.get_string_list("applications"),
            row.get_string_list("environments"),
        )
    }

    /// Sorted union of several contexts
    pub fn union<'a, I>(contexts: I) -> Self
    where
        I: IntoIterator<Item = &'a AggregationContext>,
    {
        let mut projects = BTreeSet::new();
        let mut applications = BTreeSet::new();
        let mut environments = BTreeSet::new();
        for ctx in contexts {
            projects.extend(ctx.projects.iter().cloned());
            applications.extend(ctx.applications.iter().cloned());
            environments.extend(ctx.environments.iter().cloned());
        }
        Self::from_lists(
            projects.into_iter().collect(),
            applications.into_iter().collect(),
            environments.into_iter().collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentFrequencyRow {
    pub date: NaiveDate,
    pub deployment_count: u64,
    #[serde(flatten)]
    pub context: AggregationContext,
}

impl DeploymentFrequencyRow {
    pub fn from_row(row: &WarehouseRow) -> Option<Self> {
        Some(Self {
            date: row.get_date("metric_date")?,
            deployment_count: row.get_count("deployment_count"),
            context: AggregationContext::from_row(row),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeFailureRateRow {
    pub date: NaiveDate,
    pub total_deployments: u64,
    pub failed_deployments: u64,
    /// Failed share of that day's deployments, in percent
    pub failure_rate: f64,
    #[serde(flatten)]
    pub context: AggregationContext,
}

impl ChangeFailureRateRow {
    pub fn from_row(row: &WarehouseRow) -> Option<Self> {
        let total_deployments = row.get_count("total_deployments");
        let failed_deployments = row.get_count("failed_deployments");
        Some(Self {
            date: row.get_date("metric_date")?,
            total_deployments,
            failed_deployments,
            failure_rate: super::stats::percent(failed_deployments, total_deployments),
            context: AggregationContext::from_row(row),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadTimeRow {
    pub date: NaiveDate,
    pub median_lead_time_hours: f64,
    pub change_count: u64,
    #[serde(flatten)]
    pub context: AggregationContext,
}

impl LeadTimeRow {
    pub fn from_row(row: &WarehouseRow) -> Option<Self> {
        Some(Self {
            date: row.get_date("metric_date")?,
            median_lead_time_hours: row.get_f64("median_lead_time_hours").unwrap_or(0.0),
            change_count: row.get_count("change_count"),
            context: AggregationContext::from_row(row),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeToRestoreRow {
    pub date: NaiveDate,
    pub median_hours_to_restore: f64,
    pub incident_count: u64,
    #[serde(flatten)]
    pub context: AggregationContext,
}

impl TimeToRestoreRow {
    pub fn from_row(row: &WarehouseRow) -> Option<Self> {
        Some(Self {
            date: row.get_date("metric_date")?,
            median_hours_to_restore: row.get_f64("median_hours_to_restore").unwrap_or(0.0),
            incident_count: row.get_count("incident_count"),
            context: AggregationContext::from_row(row),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentFrequencySummary {
    pub total_deployments: u64,
    pub average_per_day: f64,
    pub date_range: DateRange,
    pub aggregation_context: AggregationContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeFailureRateSummary {
    pub total_deployments: u64,
    pub total_failed_deployments: u64,
    /// `sum(failed) / sum(total)` in percent, weighted by volume
    pub overall_failure_rate: f64,
    pub date_range: DateRange,
    pub aggregation_context: AggregationContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadTimeSummary {
    pub total_changes: u64,
    /// Median over every individual change, not over the daily medians
    pub overall_median_hours: f64,
    pub overall_median_days: f64,
    pub date_range: DateRange,
    pub aggregation_context: AggregationContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeToRestoreSummary {
    pub total_incidents: u64,
    pub overall_median_hours: f64,
    pub date_range: DateRange,
    pub aggregation_context: AggregationContext,
}

/// Response body shared by the four metric endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEnvelope<R, S> {
    pub organization_name: String,
    pub data: Vec<R>,
    pub summary: S,
    pub filters_applied: MetricFilters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum MetricResponse {
    DeploymentFrequency(MetricEnvelope<DeploymentFrequencyRow, DeploymentFrequencySummary>),
    ChangeFailureRate(MetricEnvelope<ChangeFailureRateRow, ChangeFailureRateSummary>),
    LeadTimeForChanges(MetricEnvelope<LeadTimeRow, LeadTimeSummary>),
    MeanTimeToRestore(MetricEnvelope<TimeToRestoreRow, TimeToRestoreSummary>),
}

impl MetricResponse {
    /// Number of per-date rows
    pub fn len(&self) -> usize {
        match self {
            Self::DeploymentFrequency(e) => e.data.len(),
            Self::ChangeFailureRate(e) => e.data.len(),
            Self::LeadTimeForChanges(e) => e.data.len(),
            Self::MeanTimeToRestore(e) => e.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentFrequencyHeadline {
    pub total_deployments: u64,
    pub average_per_day: f64,
    pub performance_level: Option<PerformanceLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeFailureRateHeadline {
    pub total_deployments: u64,
    pub total_failed_deployments: u64,
    pub overall_failure_rate: f64,
    pub performance_level: Option<PerformanceLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadTimeHeadline {
    pub total_changes: u64,
    pub overall_median_hours: f64,
    pub overall_median_days: f64,
    pub performance_level: Option<PerformanceLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeToRestoreHeadline {
    pub total_incidents: u64,
    pub overall_median_hours: f64,
    pub performance_level: Option<PerformanceLevel>,
}

impl From<&DeploymentFrequencySummary> for DeploymentFrequencyHeadline {
    fn from(s: &DeploymentFrequencySummary) -> Self {
        Self {
            total_deployments: s.total_deployments,
            average_per_day: s.average_per_day,
            performance_level: PerformanceLevel::for_deployment_frequency(
                s.average_per_day,
                s.total_deployments,
            ),
        }
    }
}

impl From<&ChangeFailureRateSummary> for ChangeFailureRateHeadline {
    fn from(s: &ChangeFailureRateSummary) -> Self {
        Self {
            total_deployments: s.total_deployments,
            total_failed_deployments: s.total_failed_deployments,
            overall_failure_rate: s.overall_failure_rate,
            performance_level: PerformanceLevel::for_change_failure_rate(
                s.overall_failure_rate,
                s.total_deployments,
            ),
        }
    }
}

impl From<&LeadTimeSummary> for LeadTimeHeadline {
    fn from(s: &LeadTimeSummary) -> Self {
        Self {
            total_changes: s.total_changes,
            overall_median_hours: s.overall_median_hours,
            overall_median_days: s.overall_median_days,
            performance_level: PerformanceLevel::for_lead_time(
                s.overall_median_hours,
                s.total_changes,
            ),
        }
    }
}

impl From<&TimeToRestoreSummary> for TimeToRestoreHeadline {
    fn from(s: &TimeToRestoreSummary) -> Self {
        Self {
            total_incidents: s.total_incidents,
            overall_median_hours: s.overall_median_hours,
            performance_level: PerformanceLevel::for_time_to_restore(
                s.overall_median_hours,
                s.total_incidents,
            ),
        }
    }
}

/// Key figures of all four metrics over one range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoraSummary {
    pub organization_name: String,
    pub date_range: DateRange,
    pub filters_applied: MetricFilters,
    pub deployment_frequency: DeploymentFrequencyHeadline,
    pub change_failure_rate: ChangeFailureRateHeadline,
    pub lead_time_for_changes: LeadTimeHeadline,
    pub mean_time_to_restore: TimeToRestoreHeadline,
    pub aggregation_context: AggregationContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AvailableFilters {
    pub projects: Vec<String>,
    pub applications: Vec<String>,
    pub environments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FiltersResponse {
    pub organization_name: String,
    pub selected_projects: Vec<String>,
    pub available_filters: AvailableFilters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationStatus {
    Active,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationDataSummary {
    pub total_deployments: u64,
    pub total_incidents: u64,
    pub project_count: u64,
    pub first_deployment_at: Option<DateTime<Utc>>,
    pub last_deployment_at: Option<DateTime<Utc>>,
}

impl OrganizationDataSummary {
    pub fn from_row(row: &WarehouseRow) -> Self {
        Self {
            total_deployments: row.get_count("total_deployments"),
            total_incidents: row.get_count("total_incidents"),
            project_count: row.get_count("project_count"),
            first_deployment_at: row.get_timestamp("first_deployment_at"),
            last_deployment_at: row.get_timestamp("last_deployment_at"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationHealth {
    pub organization_name: String,
    pub status: OrganizationStatus,
    pub has_data: bool,
    pub data_summary: OrganizationDataSummary,
}
