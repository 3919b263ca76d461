use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use flowgate::audit::AuditSink;
use flowgate::quota::QuotaStore;
use flowgate::{FlowgateConfig, FlowgateHttpState, MemoryAuditLog, MemoryQuotaStore};

#[derive(Debug, Parser)]
#[command(name = "flowgate")]
#[command(about = "Quota-gated HTTP front end for a remote workflow service")]
#[command(version)]
struct Cli {
    /// Config file (.json, .toml, or .yaml/.yml with `config-yaml`).
    config: PathBuf,

    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Persist quota counters and usage log in this SQLite database.
    /// Without it both live in memory and are lost on exit.
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Mounts `/admin/usage` behind this token.
    #[arg(long, conflicts_with = "admin_token_env")]
    admin_token: Option<String>,

    /// Reads the admin token from this environment variable.
    #[arg(long)]
    admin_token_env: Option<String>,

    #[arg(long)]
    json_logs: bool,

    #[arg(long)]
    otel: bool,

    /// OTLP/HTTP endpoint; implies `--otel`.
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _otel_guard = init_tracing(&cli)?;

    let config = FlowgateConfig::load(&cli.config)?;
    let (quota_store, audit) = open_stores(&cli, &config).await?;
    let orchestrator = config.build_orchestrator(quota_store, audit)?;

    let mut state = FlowgateHttpState::new(orchestrator);
    if let Some(token) = resolve_admin_token(&cli)? {
        state = state.with_admin_token(token);
    }

    let app = flowgate::router(state);
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    tracing::info!(listen = %cli.listen, users = config.users.len(), "flowgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("flowgate stopped");
    Ok(())
}

type Stores = (Arc<dyn QuotaStore>, Arc<dyn AuditSink>);

#[cfg(feature = "store-sqlite")]
async fn open_stores(
    cli: &Cli,
    config: &FlowgateConfig,
) -> Result<Stores, Box<dyn std::error::Error>> {
    let Some(path) = cli.sqlite.as_ref() else {
        return Ok(memory_stores(config));
    };
    let store = flowgate::SqliteStore::new(path)
        .with_reservation_ttl(config.quota.reservation_ttl());
    store.init().await?;
    tracing::info!(path = %path.display(), "using sqlite store");
    let store = Arc::new(store);
    Ok((store.clone(), store))
}

#[cfg(not(feature = "store-sqlite"))]
async fn open_stores(
    cli: &Cli,
    config: &FlowgateConfig,
) -> Result<Stores, Box<dyn std::error::Error>> {
    if cli.sqlite.is_some() {
        return Err("--sqlite requires `--features store-sqlite`".into());
    }
    Ok(memory_stores(config))
}

fn memory_stores(config: &FlowgateConfig) -> Stores {
    tracing::warn!("no --sqlite path; quota and usage data are kept in memory");
    let store =
        MemoryQuotaStore::new().with_reservation_ttl(config.quota.reservation_ttl());
    (Arc::new(store), Arc::new(MemoryAuditLog::new()))
}

fn resolve_admin_token(cli: &Cli) -> Result<Option<String>, Box<dyn std::error::Error>> {
    if let Some(token) = cli.admin_token.clone() {
        return Ok(Some(token));
    }
    let Some(env) = cli.admin_token_env.as_deref() else {
        return Ok(None);
    };
    match std::env::var(env) {
        Ok(token) if !token.trim().is_empty() => Ok(Some(token)),
        _ => Err(format!("--admin-token-env: {env} is not set").into()),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(feature = "otel")]
fn init_tracing(cli: &Cli) -> Result<Option<flowgate::otel::OtelGuard>, Box<dyn std::error::Error>> {
    if !cli.otel && cli.otel_endpoint.is_none() {
        init_fmt(cli.json_logs)?;
        return Ok(None);
    }
    let settings = flowgate::otel::OtelSettings {
        service_name: None,
        endpoint: cli.otel_endpoint.clone(),
        json_logs: cli.json_logs,
    };
    Ok(Some(flowgate::otel::init_tracing(&settings)?))
}

#[cfg(not(feature = "otel"))]
fn init_tracing(cli: &Cli) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if cli.otel || cli.otel_endpoint.is_some() {
        return Err("otel requires `--features otel`".into());
    }
    init_fmt(cli.json_logs)?;
    Ok(None)
}

fn init_fmt(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    if json_logs {
        builder.json().try_init().map_err(|e| e as Box<dyn std::error::Error>)?;
    } else {
        builder.try_init().map_err(|e| e as Box<dyn std::error::Error>)?;
    }
    Ok(())
}
