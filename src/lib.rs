//! DORA delivery metrics served over HTTP from a Databricks SQL warehouse.

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod warehouse;

pub use error::{DoraError, DoraResult, ErrorCode};
