//! Databricks SQL Statement Execution API client.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{Statement, WarehouseConnection, WarehouseConnector, WarehouseRow};
use crate::config::WarehouseSettings;
use crate::error::{DoraError, DoraResult};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Submit without blocking so the statement id, and its cancel guard, exist before any
/// caller-side timeout can drop the request
const SUBMIT_WAIT: &str = "0s";
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const USER_AGENT: &str = concat!("dora-metrics/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
struct WarehouseInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    warehouse_id: &'a str,
    statement: &'a str,
    catalog: &'a str,
    schema: &'a str,
    parameters: Vec<WireParameter<'a>>,
    format: &'static str,
    disposition: &'static str,
    wait_timeout: &'static str,
}

#[derive(Debug, Serialize)]
struct WireParameter<'a> {
    name: &'a str,
    value: String,
    #[serde(rename = "type")]
    type_name: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum StatementState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Closed,
}

impl StatementState {
    fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StatementStatus {
    state: StatementState,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ColumnInfo {
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResultSchema {
    #[serde(default)]
    columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResultManifest {
    #[serde(default)]
    schema: ResultSchema,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResultChunk {
    #[serde(default)]
    data_array: Vec<Vec<Value>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<ResultManifest>,
    #[serde(default)]
    result: Option<ResultChunk>,
}

/// Opens authenticated connections to one Databricks SQL warehouse
#[derive(Debug, Clone)]
pub struct DatabricksConnector {
    settings: WarehouseSettings,
}

impl DatabricksConnector {
    pub fn new(settings: WarehouseSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl WarehouseConnector for DatabricksConnector {
    async fn connect(&self) -> DoraResult<Arc<dyn WarehouseConnection>> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DoraError::Connection(format!("failed to build HTTP client: {e}")))?;

        let conn = DatabricksConnection {
            client,
            base_url: self.settings.base_url(),
            token: self.settings.token.clone(),
            warehouse_id: self.settings.warehouse_id().to_string(),
            catalog: self.settings.catalog.clone(),
            schema: self.settings.schema.clone(),
        };
        let info = conn.get_warehouse().await?;
        tracing::info!(
            warehouse = info.name.as_deref().unwrap_or(&conn.warehouse_id),
            state = info.state.as_deref().unwrap_or("UNKNOWN"),
            "connected to Databricks SQL warehouse"
        );

        Ok(Arc::new(conn))
    }
}

pub struct DatabricksConnection {
    client: Client,
    base_url: String,
    token: String,
    warehouse_id: String,
    catalog: String,
    schema: String,
}

impl DatabricksConnection {
    async fn get_warehouse(&self) -> DoraResult<WarehouseInfo> {
        let resp = self
            .client
            .get(format!(
                "{}/api/2.0/sql/warehouses/{}",
                self.base_url, self.warehouse_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| DoraError::Connection(format!("failed to reach warehouse: {e}")))?;

        match resp.status() {
            s if s.is_success() => resp
                .json()
                .await
                .map_err(|e| DoraError::Connection(format!("unexpected warehouse response: {e}"))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DoraError::Connection(
                "warehouse rejected the access token".to_string(),
            )),
            StatusCode::NOT_FOUND => Err(DoraError::Connection(format!(
                "warehouse `{}` does not exist",
                self.warehouse_id
            ))),
            s => Err(DoraError::Connection(format!(
                "warehouse lookup failed: {s} {}",
                resp.text().await.unwrap_or_default()
            ))),
        }
    }

    fn statements_url(&self) -> String {
        format!("{}/api/2.0/sql/statements", self.base_url)
    }

    async fn get_statement(&self, statement_id: &str) -> DoraResult<StatementResponse> {
        let resp = self
            .client
            .get(format!("{}/{statement_id}", self.statements_url()))
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(resp).await
    }

    async fn get_chunk(&self, link: &str) -> DoraResult<ResultChunk> {
        let resp = self
            .client
            .get(format!("{}{link}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(resp).await
    }
}

#[async_trait]
impl WarehouseConnection for DatabricksConnection {
    async fn execute(&self, statement: &Statement) -> DoraResult<Vec<WarehouseRow>> {
        let body = ExecuteRequest {
            warehouse_id: &self.warehouse_id,
            statement: &statement.sql,
            catalog: &self.catalog,
            schema: &self.schema,
            parameters: statement
                .params
                .iter()
                .map(|(name, value)| WireParameter {
                    name,
                    value: value.to_wire(),
                    type_name: value.type_name(),
                })
                .collect(),
            format: "JSON_ARRAY",
            disposition: "INLINE",
            wait_timeout: SUBMIT_WAIT,
        };

        let resp = self
            .client
            .post(self.statements_url())
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let mut response: StatementResponse = decode(resp).await?;

        let mut guard = StatementGuard {
            client: self.client.clone(),
            cancel_url: format!("{}/{}/cancel", self.statements_url(), response.statement_id),
            token: self.token.clone(),
            finished: false,
        };

        while !response.status.state.is_terminal() {
            tokio::time::sleep(POLL_INTERVAL).await;
            response = self.get_statement(&response.statement_id).await?;
        }
        guard.finished = true;

        match response.status.state {
            StatementState::Succeeded => {}
            StatementState::Failed => return Err(classify_failure(response.status.error)),
            _ => {
                return Err(DoraError::Database(format!(
                    "statement {} was canceled",
                    response.statement_id
                )))
            }
        }

        let columns: Vec<String> = response
            .manifest
            .unwrap_or_default()
            .schema
            .columns
            .into_iter()
            .map(|c| c.name)
            .collect();

        let mut rows = Vec::new();
        let mut chunk = response.result.unwrap_or_default();
        loop {
            rows.extend(
                chunk
                    .data_array
                    .into_iter()
                    .map(|values| WarehouseRow::from_columns(&columns, values)),
            );
            match chunk.next_chunk_internal_link {
                Some(link) => chunk = self.get_chunk(&link).await?,
                None => break,
            }
        }

        Ok(rows)
    }
}

/// Cancels a statement that is dropped before reaching a terminal state
struct StatementGuard {
    client: Client,
    cancel_url: String,
    token: String,
    finished: bool,
}

impl Drop for StatementGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let url = std::mem::take(&mut self.cancel_url);
        let token = std::mem::take(&mut self.token);
        runtime.spawn(async move {
            match client.post(&url).bearer_auth(token).send().await {
                Ok(_) => tracing::debug!(%url, "canceled unfinished statement"),
                Err(e) => tracing::warn!(%url, error = %e, "failed to cancel statement"),
            }
        });
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> DoraResult<T> {
    let status = resp.status();
    if status.is_success() {
        let text = resp.text().await?;
        return Ok(serde_json::from_str(&text)?);
    }

    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DoraError::Connection(format!(
            "warehouse rejected credentials: {status}"
        ))),
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
            Err(DoraError::Timeout(format!("warehouse request timed out: {status}")))
        }
        _ => Err(DoraError::Database(format!(
            "warehouse returned {status}: {body}"
        ))),
    }
}

fn classify_failure(error: Option<ServiceError>) -> DoraError {
    let error = error.unwrap_or(ServiceError {
        error_code: None,
        message: None,
    });
    let message = error
        .message
        .unwrap_or_else(|| "statement failed without a message".to_string());
    let code = error.error_code.unwrap_or_default();

    let lowered = message.to_ascii_lowercase();
    if lowered.contains("timeout") || lowered.contains("timed out") {
        DoraError::Timeout(message)
    } else if code.is_empty() {
        DoraError::Database(message)
    } else {
        DoraError::Database(format!("{code}: {message}"))
    }
}
