use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use dora_metrics::api::{self, AppState, RateLimiter};
use dora_metrics::config::{Config, FileConfig};
use dora_metrics::error::set_expose_details;
use dora_metrics::logging::{self, LogFormat};
use dora_metrics::metrics::{MetricKind, MetricsService, RawMetricQuery};
use dora_metrics::warehouse::databricks::DatabricksConnector;
use dora_metrics::warehouse::ConnectionManager;

#[derive(Parser)]
#[command(
    name = "dora-metrics",
    version,
    about = "Serve DORA delivery metrics from a Databricks SQL warehouse"
)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, global = true, env = "LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (default)
    Serve,

    /// Validate configuration and exit
    CheckConfig,

    /// Probe the warehouse connection; exits non-zero when unhealthy
    Health,

    /// Run one metric query and print the JSON response
    Query {
        /// Organization name
        organization: String,
        /// deployment-frequency, change-failure-rate, lead-time-for-changes or mean-time-to-restore
        metric: MetricKind,
        /// Relative range: 7d, 30d, 90d or 1y
        #[arg(long)]
        time_range: Option<String>,
        /// ISO-8601 date or instant
        #[arg(long)]
        start_date: Option<String>,
        /// ISO-8601 date or instant
        #[arg(long)]
        end_date: Option<String>,
        #[arg(long = "project")]
        projects: Vec<String>,
        #[arg(long = "application")]
        applications: Vec<String>,
        /// Production or Non-Production
        #[arg(long = "environment")]
        environments: Vec<String>,
    },

    /// List the filter values available to an organization
    Filters {
        organization: String,
        /// Narrow applications and environments to these projects
        #[arg(long = "project")]
        projects: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(cli.log_format).await,
        Commands::CheckConfig => cmd_check_config(),
        Commands::Health => cmd_health(cli.log_format).await,
        Commands::Query {
            organization,
            metric,
            time_range,
            start_date,
            end_date,
            projects,
            applications,
            environments,
        } => {
            let raw = RawMetricQuery {
                organization_name: Some(organization),
                start_date,
                end_date,
                time_range,
                project_names: projects,
                application_names: applications,
                environment_types: environments,
            };
            cmd_query(cli.log_format, metric, raw).await
        }
        Commands::Filters {
            organization,
            projects,
        } => cmd_filters(cli.log_format, &organization, projects).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// Load configuration and install logging
fn bootstrap(format: LogFormat) -> Result<Config> {
    let config = Config::load().context("Invalid configuration")?;
    logging::init(&config.log_level, format);
    set_expose_details(!config.environment.is_production());
    Ok(config)
}

fn connection_manager(config: &Config) -> Arc<ConnectionManager> {
    let connector = DatabricksConnector::new(config.warehouse.clone());
    Arc::new(ConnectionManager::new(
        Arc::new(connector),
        config.query_timeout,
    ))
}

async fn cmd_serve(format: LogFormat) -> Result<()> {
    let config = bootstrap(format)?;
    let manager = connection_manager(&config);
    let state = AppState::new(
        MetricsService::new(Arc::clone(&manager)),
        RateLimiter::new(&config.rate_limit),
    );
    let app = api::build_router(state, &config.cors_origin)?;

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        environment = ?config.environment,
        warehouse = %config.warehouse.server_hostname,
        "dora-metrics listening"
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    manager.close().await;
    tracing::info!("shutdown complete");
    served.context("Server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

fn cmd_check_config() -> Result<()> {
    let config = Config::load().context("Invalid configuration")?;
    println!("Configuration OK");
    println!("  config file:   {}", FileConfig::config_file().display());
    println!("  warehouse:     {}", config.warehouse.server_hostname);
    println!("  warehouse id:  {}", config.warehouse.warehouse_id());
    println!(
        "  catalog:       {}.{}",
        config.warehouse.catalog, config.warehouse.schema
    );
    println!("  listen:        {}", config.bind_addr());
    println!("  environment:   {:?}", config.environment);
    Ok(())
}

async fn cmd_health(format: LogFormat) -> Result<()> {
    let config = bootstrap(format)?;
    let manager = connection_manager(&config);
    let report = manager.health_check().await;
    manager.close().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_healthy() {
        anyhow::bail!("warehouse is unhealthy");
    }
    Ok(())
}

async fn cmd_query(format: LogFormat, metric: MetricKind, raw: RawMetricQuery) -> Result<()> {
    let config = bootstrap(format)?;
    let params = raw.normalize(chrono::Utc::now())?;

    let manager = connection_manager(&config);
    let service = MetricsService::new(Arc::clone(&manager));
    let result = async {
        service
            .ensure_organization_access(&params.organization_name)
            .await?;
        service.metric(metric, &params).await
    }
    .await;
    manager.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn cmd_filters(format: LogFormat, organization: &str, projects: Vec<String>) -> Result<()> {
    let config = bootstrap(format)?;
    let manager = connection_manager(&config);
    let service = MetricsService::new(Arc::clone(&manager));
    let result = service.available_filters(organization, projects).await;
    manager.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
