//! Statements issued against the DORA gold tables.
//!
//! Tables live in the catalog/schema the connection is scoped to:
//! - `gold_dora_deployments`: one row per deployment (`deployed_at`, `is_failed`)
//! - `gold_dora_lead_times`: one row per change reaching production (`lead_time_hours`)
//! - `gold_dora_incidents`: one row per restored incident (`detected_at`, `hours_to_restore`)
//!
//! All carry `organization_name`, `project_name`, `application_name`, `environment_type`.

use super::params::{MetricFilters, MetricQueryParams};
use crate::warehouse::{QueryParam, Statement};

pub const DEPLOYMENTS_TABLE: &str = "gold_dora_deployments";
pub const LEAD_TIMES_TABLE: &str = "gold_dora_lead_times";
pub const INCIDENTS_TABLE: &str = "gold_dora_incidents";

const CONTEXT_COLUMNS: &str = "array_sort(collect_set(project_name)) AS projects, \
     array_sort(collect_set(application_name)) AS applications, \
     array_sort(collect_set(environment_type)) AS environments";

/// Statement kinds, used as log labels and by test doubles to route answers
pub mod kind {
    pub const DEPLOYMENT_FREQUENCY: &str = "deployment_frequency";
    pub const CHANGE_FAILURE_RATE: &str = "change_failure_rate";
    pub const LEAD_TIME_DAILY: &str = "lead_time_daily";
    pub const LEAD_TIME_OVERALL: &str = "lead_time_overall";
    pub const TIME_TO_RESTORE_DAILY: &str = "time_to_restore_daily";
    pub const TIME_TO_RESTORE_OVERALL: &str = "time_to_restore_overall";
    pub const ORGANIZATION_PROBE: &str = "organization_probe";
    pub const ORGANIZATION_OVERVIEW: &str = "organization_overview";
    pub const DISTINCT_PROJECTS: &str = "distinct_projects";
    pub const DISTINCT_APPLICATIONS: &str = "distinct_applications";
    pub const DISTINCT_ENVIRONMENTS: &str = "distinct_environments";
}

/// Appends SQL text and binds values to generated `:name` markers
#[derive(Debug, Default)]
pub struct SqlBuilder {
    sql: String,
    params: Vec<(String, QueryParam)>,
}

impl SqlBuilder {
    pub fn new(initial: &str) -> Self {
        Self {
            sql: initial.to_string(),
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append a `:name` marker bound to `value`
    pub fn push_bind(&mut self, name: &str, value: impl Into<QueryParam>) -> &mut Self {
        self.sql.push(':');
        self.sql.push_str(name);
        self.params.push((name.to_string(), value.into()));
        self
    }

    /// Append `column IN (:prefix_0, :prefix_1, ...)`; values OR together
    pub fn push_in<V>(&mut self, column: &str, prefix: &str, values: &[V]) -> &mut Self
    where
        V: Clone + Into<QueryParam>,
    {
        self.sql.push_str(column);
        self.sql.push_str(" IN (");
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_bind(&format!("{prefix}_{i}"), value.clone());
        }
        self.sql.push(')');
        self
    }

    pub fn build(self, kind: &'static str, organization: &str) -> Statement {
        Statement {
            kind,
            sql: self.sql,
            params: self.params,
            organization: Some(organization.to_string()),
        }
    }
}

/// Organization and time-window predicates shared by every metric statement
fn push_scope(builder: &mut SqlBuilder, time_column: &str, params: &MetricQueryParams) {
    builder
        .push(" WHERE organization_name = ")
        .push_bind("organization_name", params.organization_name.as_str())
        .push(&format!(" AND {time_column} >= "))
        .push_bind("start_date", params.date_range.start_date)
        .push(&format!(" AND {time_column} <= "))
        .push_bind("end_date", params.date_range.end_date);
    push_filters(builder, &params.filters);
}

/// One `AND ... IN (...)` per non-empty dimension
fn push_filters(builder: &mut SqlBuilder, filters: &MetricFilters) {
    if !filters.project_names.is_empty() {
        builder
            .push(" AND ")
            .push_in("project_name", "project_name", &filters.project_names);
    }
    if !filters.application_names.is_empty() {
        builder
            .push(" AND ")
            .push_in("application_name", "application_name", &filters.application_names);
    }
    if !filters.environment_types.is_empty() {
        let environments: Vec<&str> = filters
            .environment_types
            .iter()
            .map(|e| e.as_str())
            .collect();
        builder
            .push(" AND ")
            .push_in("environment_type", "environment_type", &environments);
    }
}

fn daily(
    kind: &'static str,
    measures: &str,
    table: &str,
    time_column: &str,
    extra_predicate: Option<&str>,
    params: &MetricQueryParams,
) -> Statement {
    let mut builder = SqlBuilder::new(&format!(
        "SELECT to_date({time_column}) AS metric_date, {measures}, {CONTEXT_COLUMNS} FROM {table}"
    ));
    push_scope(&mut builder, time_column, params);
    if let Some(predicate) = extra_predicate {
        builder.push(" AND ").push(predicate);
    }
    builder.push(&format!(
        " GROUP BY to_date({time_column}) ORDER BY metric_date ASC"
    ));
    builder.build(kind, &params.organization_name)
}

/// Single-row median over every record in scope, not over the per-date medians
fn overall_median(
    kind: &'static str,
    value_column: &str,
    table: &str,
    time_column: &str,
    params: &MetricQueryParams,
) -> Statement {
    let mut builder = SqlBuilder::new(&format!(
        "SELECT median({value_column}) AS median_hours, count(*) AS sample_count FROM {table}"
    ));
    push_scope(&mut builder, time_column, params);
    builder.push(&format!(" AND {value_column} IS NOT NULL"));
    builder.build(kind, &params.organization_name)
}

pub fn deployment_frequency(params: &MetricQueryParams) -> Statement {
    daily(
        kind::DEPLOYMENT_FREQUENCY,
        "count(*) AS deployment_count",
        DEPLOYMENTS_TABLE,
        "deployed_at",
        None,
        params,
    )
}

pub fn change_failure_rate(params: &MetricQueryParams) -> Statement {
    daily(
        kind::CHANGE_FAILURE_RATE,
        "count(*) AS total_deployments, count_if(is_failed) AS failed_deployments",
        DEPLOYMENTS_TABLE,
        "deployed_at",
        None,
        params,
    )
}

/// Per-date median lead time, computed by the warehouse
pub fn lead_time_daily(params: &MetricQueryParams) -> Statement {
    daily(
        kind::LEAD_TIME_DAILY,
        "median(lead_time_hours) AS median_lead_time_hours, count(*) AS change_count",
        LEAD_TIMES_TABLE,
        "deployed_at",
        Some("lead_time_hours IS NOT NULL"),
        params,
    )
}

pub fn lead_time_overall(params: &MetricQueryParams) -> Statement {
    overall_median(
        kind::LEAD_TIME_OVERALL,
        "lead_time_hours",
        LEAD_TIMES_TABLE,
        "deployed_at",
        params,
    )
}

pub fn time_to_restore_daily(params: &MetricQueryParams) -> Statement {
    daily(
        kind::TIME_TO_RESTORE_DAILY,
        "median(hours_to_restore) AS median_hours_to_restore, count(*) AS incident_count",
        INCIDENTS_TABLE,
        "detected_at",
        Some("hours_to_restore IS NOT NULL"),
        params,
    )
}

pub fn time_to_restore_overall(params: &MetricQueryParams) -> Statement {
    overall_median(
        kind::TIME_TO_RESTORE_OVERALL,
        "hours_to_restore",
        INCIDENTS_TABLE,
        "detected_at",
        params,
    )
}

/// Cheap existence check for an organization's data
pub fn organization_probe(organization: &str) -> Statement {
    let mut builder = SqlBuilder::new(&format!(
        "SELECT 1 AS present FROM {DEPLOYMENTS_TABLE} WHERE organization_name = "
    ));
    builder.push_bind("organization_name", organization).push(" LIMIT 1");
    builder.build(kind::ORGANIZATION_PROBE, organization)
}

pub fn organization_overview(organization: &str) -> Statement {
    let mut builder = SqlBuilder::new(&format!(
        "SELECT count(*) AS total_deployments, \
         count(DISTINCT project_name) AS project_count, \
         min(deployed_at) AS first_deployment_at, \
         max(deployed_at) AS last_deployment_at, \
         (SELECT count(*) FROM {INCIDENTS_TABLE} WHERE organization_name = :organization_name) AS total_incidents \
         FROM {DEPLOYMENTS_TABLE} WHERE organization_name = "
    ));
    builder.push_bind("organization_name", organization);
    builder.build(kind::ORGANIZATION_OVERVIEW, organization)
}

/// A filter dimension offered to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDimension {
    Project,
    Application,
    Environment,
}

impl FilterDimension {
    fn column(self) -> &'static str {
        match self {
            Self::Project => "project_name",
            Self::Application => "application_name",
            Self::Environment => "environment_type",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Project => kind::DISTINCT_PROJECTS,
            Self::Application => kind::DISTINCT_APPLICATIONS,
            Self::Environment => kind::DISTINCT_ENVIRONMENTS,
        }
    }
}

/// Distinct values of one dimension, narrowed to `selected_projects` when any are given
pub fn distinct_values(
    organization: &str,
    dimension: FilterDimension,
    selected_projects: &[String],
) -> Statement {
    let column = dimension.column();
    let mut builder = SqlBuilder::new(&format!(
        "SELECT DISTINCT {column} AS value FROM {DEPLOYMENTS_TABLE} WHERE organization_name = "
    ));
    builder
        .push_bind("organization_name", organization)
        .push(&format!(" AND {column} IS NOT NULL"));
    if dimension != FilterDimension::Project && !selected_projects.is_empty() {
        builder
            .push(" AND ")
            .push_in("project_name", "project_name", selected_projects);
    }
    builder.push(" ORDER BY value ASC");
    builder.build(dimension.kind(), organization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::params::{DateRange, EnvironmentType};
    use chrono::{Duration, TimeZone, Utc};

    fn params(filters: MetricFilters) -> MetricQueryParams {
        let end = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        MetricQueryParams {
            organization_name: "acme".to_string(),
            date_range: DateRange::new(end - Duration::days(30), end, None),
            filters,
        }
    }

    #[test]
    fn test_unfiltered_statement_has_no_in_predicates() {
        let stmt = deployment_frequency(&params(MetricFilters::default()));
        assert!(stmt.sql.contains("FROM gold_dora_deployments"));
        assert!(stmt.sql.contains("organization_name = :organization_name"));
        assert!(stmt.sql.contains("deployed_at >= :start_date"));
        assert!(stmt.sql.contains("deployed_at <= :end_date"));
        assert!(stmt.sql.ends_with("ORDER BY metric_date ASC"));
        assert!(!stmt.sql.contains(" IN ("));
        assert_eq!(stmt.params.len(), 3);
        assert_eq!(stmt.organization.as_deref(), Some("acme"));
    }

    #[test]
    fn test_filters_or_within_and_across_dimensions() {
        let stmt = change_failure_rate(&params(MetricFilters {
            project_names: vec!["api".into(), "web".into()],
            application_names: vec![],
            environment_types: vec![EnvironmentType::Production],
        }));

        assert!(stmt
            .sql
            .contains("AND project_name IN (:project_name_0, :project_name_1)"));
        assert!(stmt
            .sql
            .contains("AND environment_type IN (:environment_type_0)"));
        assert!(!stmt.sql.contains("application_name IN"));
        assert_eq!(stmt.string_params("project_name_"), vec!["api", "web"]);
        assert_eq!(stmt.string_params("environment_type_"), vec!["Production"]);
    }

    #[test]
    fn test_user_values_never_inlined() {
        let stmt = lead_time_overall(&params(MetricFilters {
            project_names: vec!["x') OR 1=1 --".into()],
            ..Default::default()
        }));
        assert!(!stmt.sql.contains("OR 1=1"));
        assert!(stmt.sql.contains("lead_time_hours IS NOT NULL"));
    }

    #[test]
    fn test_cascading_distinct_applications() {
        let unscoped = distinct_values("acme", FilterDimension::Application, &[]);
        assert!(!unscoped.sql.contains("project_name IN"));

        let scoped = distinct_values("acme", FilterDimension::Application, &["web".to_string()]);
        assert!(scoped.sql.contains("AND project_name IN (:project_name_0)"));
        assert_eq!(scoped.kind, kind::DISTINCT_APPLICATIONS);

        let projects = distinct_values("acme", FilterDimension::Project, &["web".to_string()]);
        assert!(!projects.sql.contains("project_name IN"));
    }

    #[test]
    fn test_incident_statements_use_detection_time() {
        let stmt = time_to_restore_daily(&params(MetricFilters::default()));
        assert!(stmt.sql.contains("FROM gold_dora_incidents"));
        assert!(stmt.sql.contains("GROUP BY to_date(detected_at)"));
        assert!(stmt.sql.contains("median(hours_to_restore)"));
    }

    #[test]
    fn test_overall_median_is_one_aggregate_row() {
        let stmt = time_to_restore_overall(&params(MetricFilters {
            application_names: vec!["checkout".into()],
            ..Default::default()
        }));
        assert!(stmt
            .sql
            .starts_with("SELECT median(hours_to_restore) AS median_hours"));
        assert!(stmt.sql.contains("detected_at >= :start_date"));
        assert!(stmt.sql.contains("AND application_name IN (:application_name_0)"));
        assert!(stmt.sql.contains("hours_to_restore IS NOT NULL"));
        assert!(!stmt.sql.contains("GROUP BY"));
        assert_eq!(stmt.kind, kind::TIME_TO_RESTORE_OVERALL);
    }
}
