//! Normalization of metric query-string input into [`MetricQueryParams`].

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DoraError, DoraResult};

/// Longest span a single query may cover
pub const MAX_RANGE_DAYS: i64 = 730;

const MAX_FILTER_VALUE_LEN: usize = 255;

/// Compact relative ranges accepted in `timeRange`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "7d")]
    Week,
    #[default]
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "90d")]
    Quarter,
    #[serde(rename = "1y")]
    Year,
}

impl TimeRange {
    pub const ALL: [Self; 4] = [Self::Week, Self::Month, Self::Quarter, Self::Year];

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Week => "7d",
            Self::Month => "30d",
            Self::Quarter => "90d",
            Self::Year => "1y",
        }
    }

    pub fn days(self) -> i64 {
        match self {
            Self::Week => 7,
            Self::Month => 30,
            Self::Quarter => 90,
            Self::Year => 365,
        }
    }
}

/// The two environment classes the gold tables distinguish
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EnvironmentType {
    #[serde(rename = "Production")]
    Production,
    #[serde(rename = "Non-Production")]
    NonProduction,
}

impl EnvironmentType {
    pub const ALL: [Self; 2] = [Self::Production, Self::NonProduction];

    /// Exact, case-sensitive match
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Production => "Production",
            Self::NonProduction => "Non-Production",
        }
    }
}

/// `3..=50` characters of ASCII letters, digits, `-` or `_`
pub fn is_valid_organization_name(name: &str) -> bool {
    (3..=50).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Resolved time window of a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateRange {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Whole days covered, rounded up, at least one
    pub days: i64,
    /// The shorthand that produced this range, when one did
    pub time_range: Option<TimeRange>,
}

impl DateRange {
    pub fn new(start_date: DateTime<Utc>, end_date: DateTime<Utc>, time_range: Option<TimeRange>) -> Self {
        let seconds = (end_date - start_date).num_seconds().max(0);
        let days = ((seconds + 86_399) / 86_400).max(1);
        Self {
            start_date,
            end_date,
            days,
            time_range,
        }
    }

    pub fn from_shorthand(range: TimeRange, now: DateTime<Utc>) -> Self {
        Self::new(now - Duration::days(range.days()), now, Some(range))
    }
}

/// Filter sets: values OR together within a dimension, dimensions AND together.
/// An empty set means no restriction on that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricFilters {
    pub project_names: Vec<String>,
    pub application_names: Vec<String>,
    pub environment_types: Vec<EnvironmentType>,
}

impl MetricFilters {
    pub fn is_empty(&self) -> bool {
        self.project_names.is_empty()
            && self.application_names.is_empty()
            && self.environment_types.is_empty()
    }
}

/// Validated input to every metric query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricQueryParams {
    pub organization_name: String,
    pub date_range: DateRange,
    pub filters: MetricFilters,
}

/// Query-string input as received, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMetricQuery {
    pub organization_name: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub time_range: Option<String>,
    pub project_names: Vec<String>,
    pub application_names: Vec<String>,
    pub environment_types: Vec<String>,
}

impl RawMetricQuery {
    /// Collect parameters from a raw query string.
    ///
    /// Multi-valued keys may repeat (`projectName=a&projectName=b`) or use the bracketed
    /// array form (`projectName[]=a`); both land in the same list.
    pub fn from_query_string(query: &str) -> Self {
        Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut raw = Self::default();
        for (key, value) in pairs {
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            let value = value.to_string();
            match key.as_ref().trim_end_matches("[]") {
                "organizationName" => raw.organization_name = Some(value),
                "startDate" => raw.start_date = Some(value),
                "endDate" => raw.end_date = Some(value),
                "timeRange" => raw.time_range = Some(value),
                "projectName" => raw.project_names.push(value),
                "applicationName" => raw.application_names.push(value),
                "environmentType" => raw.environment_types.push(value),
                _ => {}
            }
        }
        raw
    }

    /// Fill the organization from the URL path unless the query already named one
    pub fn merge_path_organization(&mut self, organization: &str) {
        if self.organization_name.is_none() {
            self.organization_name = Some(organization.to_string());
        }
    }

    /// Validate and resolve into canonical parameters.
    ///
    /// Without any of `startDate`, `endDate` or `timeRange` the range is the last 30 days.
    /// Explicit dates always win over `timeRange`.
    pub fn normalize(self, now: DateTime<Utc>) -> DoraResult<MetricQueryParams> {
        let organization_name = self
            .organization_name
            .ok_or_else(|| DoraError::validation("organizationName", "organizationName is required"))?;
        if !is_valid_organization_name(&organization_name) {
            return Err(DoraError::validation(
                "organizationName",
                "organizationName must be 3-50 letters, digits, hyphens or underscores",
            ));
        }

        let time_range = self
            .time_range
            .as_deref()
            .map(|v| {
                TimeRange::parse(v).ok_or_else(|| {
                    DoraError::validation(
                        "timeRange",
                        format!("timeRange must be one of 7d, 30d, 90d, 1y; got `{v}`"),
                    )
                })
            })
            .transpose()?;
        let start = self
            .start_date
            .as_deref()
            .map(|v| parse_instant("startDate", v))
            .transpose()?;
        let end = self
            .end_date
            .as_deref()
            .map(|v| parse_instant("endDate", v))
            .transpose()?;

        let date_range = match (start, end) {
            (None, None) => DateRange::from_shorthand(time_range.unwrap_or_default(), now),
            (start, end) => {
                let end = end.unwrap_or(now);
                let start =
                    start.unwrap_or_else(|| end - Duration::days(TimeRange::default().days()));
                DateRange::new(start, end, None)
            }
        };

        if date_range.end_date <= date_range.start_date {
            return Err(DoraError::validation(
                "endDate",
                "endDate must be after startDate",
            ));
        }
        if date_range.end_date - date_range.start_date > Duration::days(MAX_RANGE_DAYS) {
            return Err(DoraError::validation(
                "endDate",
                format!("date range cannot exceed {MAX_RANGE_DAYS} days"),
            ));
        }

        Ok(MetricQueryParams {
            organization_name,
            date_range,
            filters: MetricFilters {
                project_names: name_set("projectName", self.project_names)?,
                application_names: name_set("applicationName", self.application_names)?,
                environment_types: environment_set(&self.environment_types)?,
            },
        })
    }
}

/// Validate a list of names into a sorted, duplicate-free set
pub fn name_set(field: &str, values: Vec<String>) -> DoraResult<Vec<String>> {
    if let Some(long) = values.iter().find(|v| v.len() > MAX_FILTER_VALUE_LEN) {
        return Err(DoraError::validation(
            field,
            format!(
                "{field} values must be at most {MAX_FILTER_VALUE_LEN} characters, got {}",
                long.len()
            ),
        ));
    }
    let mut set = values;
    set.sort();
    set.dedup();
    Ok(set)
}

fn environment_set(values: &[String]) -> DoraResult<Vec<EnvironmentType>> {
    let mut set = values
        .iter()
        .map(|v| {
            EnvironmentType::parse(v).ok_or_else(|| {
                DoraError::validation(
                    "environmentType",
                    format!("environmentType must be one of Production, Non-Production; got `{v}`"),
                )
            })
        })
        .collect::<DoraResult<Vec<_>>>()?;
    set.sort();
    set.dedup();
    Ok(set)
}

/// Accept an RFC 3339 instant or a bare `YYYY-MM-DD` date (midnight UTC)
fn parse_instant(field: &str, value: &str) -> DoraResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            DoraError::validation(field, format!("{field} must be an ISO-8601 date, got `{value}`"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-30T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn normalize(query: &str) -> DoraResult<MetricQueryParams> {
        let mut raw = RawMetricQuery::from_query_string(query);
        raw.merge_path_organization("acme");
        raw.normalize(now())
    }

    fn field_of(err: DoraError) -> String {
        match err {
            DoraError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_range_is_thirty_days() {
        let params = normalize("").unwrap();
        assert_eq!(params.date_range.end_date, now());
        assert_eq!(params.date_range.start_date, now() - Duration::days(30));
        assert_eq!(params.date_range.days, 30);
        assert_eq!(params.date_range.time_range, Some(TimeRange::Month));
        assert!(params.filters.is_empty());
    }

    #[test]
    fn test_shorthand_expansion() {
        for (code, days) in [("7d", 7), ("30d", 30), ("90d", 90), ("1y", 365)] {
            let params = normalize(&format!("timeRange={code}")).unwrap();
            assert_eq!(params.date_range.start_date, now() - Duration::days(days));
            assert_eq!(params.date_range.end_date, now());
            assert_eq!(params.date_range.days, days);
        }
    }

    #[test]
    fn test_explicit_dates_win_over_shorthand() {
        let params =
            normalize("startDate=2024-01-01T00:00:00Z&endDate=2024-01-15T00:00:00Z&timeRange=1y")
                .unwrap();
        assert_eq!(
            params.date_range.start_date.to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
        assert_eq!(
            params.date_range.end_date.to_rfc3339(),
            "2024-01-15T00:00:00+00:00"
        );
        assert_eq!(params.date_range.days, 14);
        assert_eq!(params.date_range.time_range, None);
    }

    #[test]
    fn test_single_explicit_date_skips_shorthand() {
        let params = normalize("startDate=2024-06-01&timeRange=7d").unwrap();
        assert_eq!(params.date_range.end_date, now());
        assert_eq!(params.date_range.start_date.date_naive().to_string(), "2024-06-01");

        let params = normalize("endDate=2024-06-10").unwrap();
        assert_eq!(
            params.date_range.start_date,
            params.date_range.end_date - Duration::days(30)
        );
    }

    #[test]
    fn test_date_ordering_rejected() {
        let err = normalize("startDate=2024-03-01&endDate=2024-03-01").unwrap_err();
        assert_eq!(field_of(err), "endDate");
        let err = normalize("startDate=2024-03-02&endDate=2024-03-01").unwrap_err();
        assert_eq!(field_of(err), "endDate");
    }

    #[test]
    fn test_range_ceiling() {
        assert!(normalize("startDate=2022-01-01&endDate=2023-12-31").is_ok());
        let err = normalize("startDate=2022-01-01&endDate=2024-01-02").unwrap_err();
        assert!(err.to_string().contains("730"));
    }

    #[test]
    fn test_repeated_and_array_keys_normalize_identically() {
        let repeated = normalize("projectName=b&projectName=a").unwrap();
        let bracketed = normalize("projectName[]=a&projectName[]=b&projectName[]=a").unwrap();
        let encoded = normalize("projectName%5B%5D=a&projectName%5B%5D=b").unwrap();

        assert_eq!(repeated.filters.project_names, vec!["a", "b"]);
        assert_eq!(repeated.filters, bracketed.filters);
        assert_eq!(repeated.filters, encoded.filters);
    }

    #[test]
    fn test_single_value_becomes_list() {
        let params = normalize("applicationName=checkout&environmentType=Production").unwrap();
        assert_eq!(params.filters.application_names, vec!["checkout"]);
        assert_eq!(
            params.filters.environment_types,
            vec![EnvironmentType::Production]
        );
    }

    #[test]
    fn test_environment_allow_list() {
        assert!(normalize("environmentType=Non-Production").is_ok());
        for bad in ["Prod", "production", "PRODUCTION", "Staging", "Non-production"] {
            let err = normalize(&format!("environmentType={bad}")).unwrap_err();
            assert_eq!(field_of(err), "environmentType", "{bad} should be rejected");
        }
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(field_of(normalize("timeRange=2w").unwrap_err()), "timeRange");
        assert_eq!(field_of(normalize("startDate=yesterday").unwrap_err()), "startDate");
    }

    #[test]
    fn test_path_merge_does_not_overwrite_query() {
        let mut raw = RawMetricQuery::from_query_string("organizationName=globex");
        raw.merge_path_organization("acme");
        assert_eq!(raw.organization_name.as_deref(), Some("globex"));

        let mut raw = RawMetricQuery::default();
        raw.merge_path_organization("acme");
        assert_eq!(raw.organization_name.as_deref(), Some("acme"));
    }

    #[test]
    fn test_organization_name_format() {
        assert!(is_valid_organization_name("acme"));
        assert!(is_valid_organization_name("ghost-org_2"));
        assert!(!is_valid_organization_name("ab"));
        assert!(!is_valid_organization_name("acme corp"));
        assert!(!is_valid_organization_name(&"x".repeat(51)));
    }
}
