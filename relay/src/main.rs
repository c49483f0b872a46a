//! planrelay - two-stage streaming plan relay
//!
//! CLI entry point: serve the relay, run one query in-process, or check a
//! running server.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use planrelay::check;
use planrelay::cli::{Cli, Command};
use planrelay::config::{Config, Environment};
use planrelay::directions::DirectionsClient;
use planrelay::pipeline::{Pipeline, Session};
use planrelay::server::{self, AppState};
use planrelay::sink::EventSink;
use planrelay::stage::HttpStageRunner;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder().build().context("Failed to build HTTP client")
}

fn build_pipeline(config: &Config, http: reqwest::Client) -> Arc<Pipeline> {
    let (planner, executor) = config.resolve_stages();
    debug!(?planner, ?executor, "build_pipeline: stages resolved");
    let runner = HttpStageRunner::with_client(http);
    Arc::new(Pipeline::new(Arc::new(runner), planner, executor))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    if let Command::Serve { production: true, .. } = cli.command {
        config.environment = Environment::Production;
    }
    config.load_env_file()?;

    match cli.command {
        Command::Serve { host, port, .. } => {
            debug!(?host, ?port, "main: matched Serve command");
            cmd_serve(&config, host, port).await
        }
        Command::Plan { query } => {
            debug!(query_len = query.len(), "main: matched Plan command");
            cmd_plan(&config, query).await
        }
        Command::Check { url, query } => {
            debug!(%url, "main: matched Check command");
            cmd_check(&url, &query).await
        }
    }
}

/// Run the HTTP server until Ctrl+C
async fn cmd_serve(config: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    info!(environment = ?config.environment, "Starting planrelay");

    let http = build_http_client()?;
    let directions = config.resolve_directions();
    debug!(?directions, "cmd_serve: directions resolved");
    let state = AppState::new(build_pipeline(config, http.clone()))
        .with_directions(DirectionsClient::new(http, directions))
        .with_channel_capacity(config.server.channel_capacity);
    server::serve(&host, port, state).await
}

/// Run one query through the pipeline and print every frame to stdout
async fn cmd_plan(config: &Config, query: String) -> Result<()> {
    if query.is_empty() {
        return Err(eyre!("query is required"));
    }
    let pipeline = build_pipeline(config, build_http_client()?);
    let (sink, mut rx) = EventSink::channel(config.server.channel_capacity);
    let session = tokio::spawn(server::run_session(pipeline, Session::new(query, sink)));

    let mut stdout = std::io::stdout();
    while let Some(Ok(frame)) = rx.recv().await {
        stdout.write_all(&frame)?;
        stdout.flush()?;
    }

    if let Err(e) = session.await {
        warn!("Session task failed: {}", e);
    }
    Ok(())
}

/// Post a query to a running server and print what it streams back
async fn cmd_check(url: &str, query: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let mut stdout = std::io::stdout();
    let summary = check::run(&client, url, query, &mut stdout).await?;

    println!("{} frames received", summary.frames);
    if !summary.completed() {
        return Err(eyre!(
            "Stream did not complete (last event: {})",
            summary.last_node.as_deref().unwrap_or("none")
        ));
    }
    Ok(())
}
