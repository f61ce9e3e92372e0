//! # SIEM Agent Main Binary
//!
//! Entry point: loads configuration, builds the `AgentService`, and runs it
//! until a shutdown signal arrives.

use std::path::PathBuf;
use std::process;

use clap::{Arg, Command};
use dotenvy::dotenv;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use siem_agent::config::AgentConfig;
use siem_agent::error::{AgentError, Result};
use siem_agent::service::AgentService;
use siem_agent::{SERVICE_NAME, VERSION};

#[tokio::main]
async fn main() {
    init_logging();
    setup_panic_hook();

    if let Err(e) = dotenv() {
        warn!("failed to load .env file: {}", e);
    }

    let matches = create_cli().get_matches();

    let working_dir = matches
        .get_one::<String>("working-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);

    if matches.get_flag("validate-config") {
        match load_configuration(config_path.as_deref()) {
            Ok(config) => match config.validate_full() {
                Ok(warnings) => {
                    for warning in warnings {
                        warn!("{warning}");
                    }
                    info!("configuration is valid");
                    process::exit(0);
                }
                Err(errors) => {
                    for err in &errors {
                        error!("{err}");
                    }
                    process::exit(1);
                }
            },
            Err(e) => {
                error!("failed to load configuration: {}", e);
                process::exit(1);
            }
        }
    }

    info!("starting {} version {}", SERVICE_NAME, VERSION);

    let mut config = match load_configuration(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Some(level) = matches.get_one::<String>("log-level") {
        if let Ok(parsed) = level.parse() {
            config.log_level = parsed;
        }
    }

    if let Err(errors) = config.validate_full() {
        for err in &errors {
            error!("{err}");
        }
        process::exit(1);
    }

    match run_service(config, working_dir).await {
        Ok(()) => {
            info!("service stopped gracefully");
        }
        Err(e) => {
            error!("service failed: {}", e);
            process::exit(1);
        }
    }
}

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let subscriber = tracing_subscriber::registry();

    match log_format.as_str() {
        "json" => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_span_list(true),
                )
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
                )
                .init();
        }
        _ => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_thread_names(true),
                )
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
                )
                .init();
        }
    }

    info!("logging initialized with level: {}", log_level);
}

fn create_cli() -> Command {
    Command::new(SERVICE_NAME)
        .version(VERSION)
        .about("Host security-event collection and forwarding agent")
        .long_about(
            "Collects security-relevant events from file logs, OS event logs and syslog, \
             buffers them durably across connectivity gaps, and forwards them to a remote \
             SIEM collector.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Durable configuration file path")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("working-dir")
                .long("working-dir")
                .value_name("DIR")
                .help("Directory for the durable queue, config backups and disk usage sampling")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("validate-config")
                .long("validate-config")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Override log level (trace, debug, information, warning, error, critical)")
                .action(clap::ArgAction::Set),
        )
}

/// Loads the durable on-disk config if `config_path` is given (or the
/// default working-directory location exists), otherwise falls back to the
/// environment-variable bootstrap path (spec §4.8/§10.4).
fn load_configuration(config_path: Option<&std::path::Path>) -> Result<AgentConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return AgentConfig::from_file(path).map_err(|e| AgentError::configuration(e.to_string()));
        }
    }
    AgentConfig::from_env().map_err(|e| AgentError::configuration(e.to_string()))
}

async fn run_service(config: AgentConfig, working_dir: PathBuf) -> Result<()> {
    let admin_bind_addr = config
        .admin_bind_addr
        .parse()
        .map_err(|e| AgentError::configuration(format!("invalid adminBindAddr: {e}")))?;

    info!("initializing agent service");
    let service = AgentService::new(config, working_dir, admin_bind_addr).await?;
    info!("agent service created");

    let service = std::sync::Arc::new(service);
    let run_handle = {
        let service = std::sync::Arc::clone(&service);
        tokio::spawn(async move { service.run().await })
    };

    tokio::pin!(run_handle);

    tokio::select! {
        result = &mut run_handle => {
            return report_run_result(result);
        }
        _ = wait_for_shutdown_signal() => {
            info!("received shutdown signal");
            service.stop();
        }
    }

    // Each worker already bounds its own join to a 10s budget inside
    // `AgentService::run` (spec:165). This is just an outer safety net in
    // case `run` itself never returns.
    match tokio::time::timeout(std::time::Duration::from_secs(120), run_handle).await {
        Ok(result) => report_run_result(result),
        Err(_) => {
            error!("graceful shutdown exceeded its outer safety-net budget");
            Err(AgentError::internal("graceful shutdown timed out"))
        }
    }
}

fn report_run_result(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            info!("service completed successfully");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("service failed: {}", e);
            Err(e)
        }
        Err(e) => {
            error!("service task panicked: {}", e);
            Err(AgentError::internal("service task panicked"))
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
        info!("received ctrl-c signal");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
        info!("received sigterm signal");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn setup_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic message".to_string()
        };
        error!("agent panicked at {}: {}\nbacktrace:\n{}", location, message, backtrace);
        process::exit(1);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_name_matches_service_name() {
        let cli = create_cli();
        assert_eq!(cli.get_name(), SERVICE_NAME);
    }

    #[test]
    fn load_configuration_falls_back_to_defaults_without_a_file() {
        let config = load_configuration(None).unwrap();
        assert_eq!(config.agent_version, VERSION);
    }
}
