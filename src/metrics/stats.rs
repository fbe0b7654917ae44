use serde::Serialize;

/// `part / whole` as a percentage (0.0 - 100.0); zero when `whole` is zero
#[allow(clippy::cast_precision_loss)]
pub fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

/// `total / days`; zero for an empty span
#[allow(clippy::cast_precision_loss)]
pub fn per_day(total: u64, days: i64) -> f64 {
    if days <= 0 {
        0.0
    } else {
        total as f64 / days as f64
    }
}

/// DORA performance band of a single metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceLevel {
    Elite,
    High,
    Medium,
    Low,
}

impl PerformanceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Elite => "elite",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Deployments per day: daily or better is elite, weekly high, monthly medium
    pub fn for_deployment_frequency(per_day: f64, total_deployments: u64) -> Option<Self> {
        if total_deployments == 0 {
            return None;
        }
        Some(if per_day >= 1.0 {
            Self::Elite
        } else if per_day >= 1.0 / 7.0 {
            Self::High
        } else if per_day >= 1.0 / 30.0 {
            Self::Medium
        } else {
            Self::Low
        })
    }

    /// Failure rate in percent
    pub fn for_change_failure_rate(rate: f64, total_deployments: u64) -> Option<Self> {
        if total_deployments == 0 {
            return None;
        }
        Some(if rate <= 5.0 {
            Self::Elite
        } else if rate <= 10.0 {
            Self::High
        } else if rate <= 15.0 {
            Self::Medium
        } else {
            Self::Low
        })
    }

    pub fn for_lead_time(median_hours: f64, total_changes: u64) -> Option<Self> {
        Self::by_hours(median_hours, total_changes, [24.0, 168.0, 720.0])
    }

    pub fn for_time_to_restore(median_hours: f64, total_incidents: u64) -> Option<Self> {
        Self::by_hours(median_hours, total_incidents, [1.0, 24.0, 168.0])
    }

    /// Bands are upper bounds (exclusive) for elite, high and medium
    fn by_hours(hours: f64, samples: u64, [elite, high, medium]: [f64; 3]) -> Option<Self> {
        if samples == 0 || !hours.is_finite() {
            return None;
        }
        Some(if hours < elite {
            Self::Elite
        } else if hours < high {
            Self::High
        } else if hours < medium {
            Self::Medium
        } else {
            Self::Low
        })
    }
}

impl std::fmt::Display for PerformanceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
