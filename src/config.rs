use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DoraError, DoraResult};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 15 * 60 * 1000;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 100;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Optional on-disk settings. Every field may also come from the environment, which wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub server_hostname: Option<String>,
    pub http_path: Option<String>,
    pub token: Option<String>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cors_origin: Option<String>,
    pub rate_limit_window_ms: Option<u64>,
    pub rate_limit_max_requests: Option<u32>,
    pub rate_limit_trust_forwarded_for: Option<bool>,
    pub query_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
    pub environment: Option<String>,
}

impl FileConfig {
    pub fn config_file() -> PathBuf {
        Config::config_dir().join("config.toml")
    }

    /// Load the config file, returning default if it doesn't exist.
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load() -> DoraResult<Self> {
        let path = Self::config_file();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            DoraError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| DoraError::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

/// Deployment mode. Production hides internal error details from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnvironment {
    #[default]
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "test" => Some(Self::Test),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

/// Connection settings for the Databricks SQL warehouse
#[derive(Clone)]
pub struct WarehouseSettings {
    pub server_hostname: String,
    pub http_path: String,
    pub token: String,
    pub catalog: String,
    pub schema: String,
}

impl std::fmt::Debug for WarehouseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseSettings")
            .field("server_hostname", &self.server_hostname)
            .field("http_path", &self.http_path)
            .field("token", &"<redacted>")
            .field("catalog", &self.catalog)
            .field("schema", &self.schema)
            .finish()
    }
}

impl WarehouseSettings {
    /// Warehouse id taken from the last segment of `/sql/1.0/warehouses/<id>`
    pub fn warehouse_id(&self) -> &str {
        self.http_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }

    pub fn base_url(&self) -> String {
        format!("https://{}", self.server_hostname)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: u32,
    /// Key clients by `X-Forwarded-For`; only safe behind a proxy that overwrites it
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub warehouse: WarehouseSettings,
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    pub rate_limit: RateLimitSettings,
    pub query_timeout: Duration,
    pub log_level: String,
    pub environment: AppEnvironment,
}

impl Config {
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("DORA_METRICS_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("~/.config"))
                .join("dora-metrics")
        }
    }

    /// Load configuration from the environment, falling back to the config file.
    pub fn load() -> DoraResult<Self> {
        let file = FileConfig::load()?;
        Self::from_sources(|key| std::env::var(key).ok(), &file)
    }

    /// Resolve and validate every setting, reporting all problems at once.
    pub fn from_sources<F>(lookup: F, file: &FileConfig) -> DoraResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut problems = Vec::new();
        let text = |key: &str, fallback: &Option<String>| -> Option<String> {
            lookup(key)
                .or_else(|| fallback.clone())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let server_hostname = text("DATABRICKS_SERVER_HOSTNAME", &file.server_hostname);
        let http_path = text("DATABRICKS_HTTP_PATH", &file.http_path);
        let token = text("DATABRICKS_TOKEN", &file.token);
        let catalog = text("DATABRICKS_CATALOG", &file.catalog);
        let schema = text("DATABRICKS_SCHEMA", &file.schema);

        match &server_hostname {
            None => problems.push("DATABRICKS_SERVER_HOSTNAME is required".to_string()),
            Some(h) if h.contains("://") || h.contains('/') => problems.push(format!(
                "DATABRICKS_SERVER_HOSTNAME must be a bare hostname, got `{h}`"
            )),
            Some(_) => {}
        }
        match &http_path {
            None => problems.push("DATABRICKS_HTTP_PATH is required".to_string()),
            Some(p) if !valid_http_path(p) => problems.push(format!(
                "DATABRICKS_HTTP_PATH must look like /sql/1.0/warehouses/<id>, got `{p}`"
            )),
            Some(_) => {}
        }
        if token.is_none() {
            problems.push("DATABRICKS_TOKEN is required".to_string());
        }
        for (key, value) in [("DATABRICKS_CATALOG", &catalog), ("DATABRICKS_SCHEMA", &schema)] {
            match value {
                None => problems.push(format!("{key} is required")),
                Some(v) if !is_identifier(v) => {
                    problems.push(format!("{key} must be a plain identifier, got `{v}`"));
                }
                Some(_) => {}
            }
        }

        let host = text("HOST", &file.host).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = number("PORT", lookup("PORT"), file.port, DEFAULT_PORT, &mut problems);
        let cors_origin =
            text("CORS_ORIGIN", &file.cors_origin).unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string());
        if axum::http::HeaderValue::from_str(&cors_origin).is_err() {
            problems.push(format!("CORS_ORIGIN is not a valid origin: `{cors_origin}`"));
        }

        let window_ms = number(
            "RATE_LIMIT_WINDOW_MS",
            lookup("RATE_LIMIT_WINDOW_MS"),
            file.rate_limit_window_ms,
            DEFAULT_RATE_LIMIT_WINDOW_MS,
            &mut problems,
        );
        let max_requests = number(
            "RATE_LIMIT_MAX_REQUESTS",
            lookup("RATE_LIMIT_MAX_REQUESTS"),
            file.rate_limit_max_requests,
            DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            &mut problems,
        );
        let trust_forwarded_for = flag(
            "RATE_LIMIT_TRUST_FORWARDED_FOR",
            lookup("RATE_LIMIT_TRUST_FORWARDED_FOR"),
            file.rate_limit_trust_forwarded_for,
            &mut problems,
        );
        let timeout_secs = number(
            "QUERY_TIMEOUT_SECS",
            lookup("QUERY_TIMEOUT_SECS"),
            file.query_timeout_secs,
            DEFAULT_QUERY_TIMEOUT_SECS,
            &mut problems,
        );
        for (key, value) in [
            ("RATE_LIMIT_WINDOW_MS", window_ms),
            ("RATE_LIMIT_MAX_REQUESTS", u64::from(max_requests)),
            ("QUERY_TIMEOUT_SECS", timeout_secs),
        ] {
            if value == 0 {
                problems.push(format!("{key} must be greater than zero"));
            }
        }

        let log_level = text("LOG_LEVEL", &file.log_level)
            .unwrap_or_else(|| "info".to_string())
            .to_ascii_lowercase();
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            problems.push(format!(
                "LOG_LEVEL must be one of {}, got `{log_level}`",
                LOG_LEVELS.join("/")
            ));
        }

        let environment = match text("APP_ENV", &file.environment) {
            None => AppEnvironment::default(),
            Some(v) => AppEnvironment::parse(&v).unwrap_or_else(|| {
                problems.push(format!("APP_ENV must be development/test/production, got `{v}`"));
                AppEnvironment::default()
            }),
        };

        if !problems.is_empty() {
            return Err(DoraError::Config(problems.join("; ")));
        }

        Ok(Self {
            warehouse: WarehouseSettings {
                server_hostname: server_hostname.unwrap_or_default(),
                http_path: http_path.unwrap_or_default(),
                token: token.unwrap_or_default(),
                catalog: catalog.unwrap_or_default(),
                schema: schema.unwrap_or_default(),
            },
            host,
            port,
            cors_origin,
            rate_limit: RateLimitSettings {
                window: Duration::from_millis(window_ms),
                max_requests,
                trust_forwarded_for,
            },
            query_timeout: Duration::from_secs(timeout_secs),
            log_level,
            environment,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn number<T>(key: &str, raw: Option<String>, file: Option<T>, default: T, problems: &mut Vec<String>) -> T
where
    T: std::str::FromStr + Copy,
{
    match raw {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            problems.push(format!("{key} must be a non-negative integer, got `{v}`"));
            default
        }),
        None => file.unwrap_or(default),
    }
}

fn flag(key: &str, raw: Option<String>, file: Option<bool>, problems: &mut Vec<String>) -> bool {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) => match v.as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" | "" => false,
            _ => {
                problems.push(format!("{key} must be true or false, got `{v}`"));
                false
            }
        },
        None => file.unwrap_or(false),
    }
}

fn valid_http_path(path: &str) -> bool {
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    path.starts_with("/sql/")
        && segments.len() >= 4
        && segments[segments.len() - 2] == "warehouses"
        && segments.last().is_some_and(|id| is_identifier(id))
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABRICKS_SERVER_HOSTNAME", "adb-123.azuredatabricks.net"),
            ("DATABRICKS_HTTP_PATH", "/sql/1.0/warehouses/abc123"),
            ("DATABRICKS_TOKEN", "dapi-secret"),
            ("DATABRICKS_CATALOG", "main"),
            ("DATABRICKS_SCHEMA", "dora_gold"),
        ])
    }

    fn resolve(vars: &HashMap<&str, &str>) -> DoraResult<Config> {
        Config::from_sources(|k| vars.get(k).map(|v| (*v).to_string()), &FileConfig::default())
    }

    #[test]
    fn test_defaults_applied() {
        let config = resolve(&required()).unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(900));
        assert!(!config.rate_limit.trust_forwarded_for);
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.warehouse.warehouse_id(), "abc123");
        assert_eq!(config.bind_addr(), "0.0.0.0:3001");
    }

    #[test]
    fn test_missing_required_reports_every_key() {
        let err = resolve(&HashMap::new()).unwrap_err();
        let msg = err.to_string();
        for key in [
            "DATABRICKS_SERVER_HOSTNAME",
            "DATABRICKS_HTTP_PATH",
            "DATABRICKS_TOKEN",
            "DATABRICKS_CATALOG",
            "DATABRICKS_SCHEMA",
        ] {
            assert!(msg.contains(key), "missing {key} in: {msg}");
        }
    }

    #[test]
    fn test_malformed_values_rejected() {
        let mut vars = required();
        vars.insert("DATABRICKS_SERVER_HOSTNAME", "https://adb-123.net");
        vars.insert("DATABRICKS_HTTP_PATH", "/warehouses/abc");
        vars.insert("DATABRICKS_SCHEMA", "gold; drop table x");
        vars.insert("PORT", "eighty");
        vars.insert("LOG_LEVEL", "loud");
        vars.insert("RATE_LIMIT_MAX_REQUESTS", "0");

        let msg = resolve(&vars).unwrap_err().to_string();
        assert!(msg.contains("bare hostname"));
        assert!(msg.contains("DATABRICKS_HTTP_PATH"));
        assert!(msg.contains("DATABRICKS_SCHEMA"));
        assert!(msg.contains("PORT"));
        assert!(msg.contains("LOG_LEVEL"));
        assert!(msg.contains("RATE_LIMIT_MAX_REQUESTS must be greater than zero"));
    }

    #[test]
    fn test_file_values_used_when_env_absent() {
        let file = FileConfig {
            server_hostname: Some("file-host.cloud.databricks.com".to_string()),
            http_path: Some("/sql/1.0/warehouses/fromfile".to_string()),
            token: Some("file-token".to_string()),
            catalog: Some("main".to_string()),
            schema: Some("gold".to_string()),
            port: Some(8080),
            ..Default::default()
        };
        let env = HashMap::from([("DATABRICKS_SCHEMA", "env_gold")]);
        let config =
            Config::from_sources(|k| env.get(k).map(|v| (*v).to_string()), &file).unwrap();

        assert_eq!(config.warehouse.server_hostname, "file-host.cloud.databricks.com");
        assert_eq!(config.warehouse.schema, "env_gold");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_trust_forwarded_for_flag() {
        let mut vars = required();
        vars.insert("RATE_LIMIT_TRUST_FORWARDED_FOR", "true");
        assert!(resolve(&vars).unwrap().rate_limit.trust_forwarded_for);

        vars.insert("RATE_LIMIT_TRUST_FORWARDED_FOR", "sometimes");
        let msg = resolve(&vars).unwrap_err().to_string();
        assert!(msg.contains("RATE_LIMIT_TRUST_FORWARDED_FOR"));
    }

    #[test]
    fn test_production_environment() {
        let mut vars = required();
        vars.insert("APP_ENV", "production");
        assert!(resolve(&vars).unwrap().environment.is_production());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = resolve(&required()).unwrap();
        let rendered = format!("{:?}", config.warehouse);
        assert!(!rendered.contains("dapi-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
