//! DORA metric computation: parameter normalization, SQL, reductions and response shapes.

pub mod models;
pub mod params;
pub mod service;
pub mod sql;
pub mod stats;

pub use models::{MetricKind, MetricResponse};
pub use params::{MetricQueryParams, RawMetricQuery};
pub use service::MetricsService;
