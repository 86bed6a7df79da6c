//! ha-bootstrap - forms an HA Kubernetes cluster from a node inventory.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Loads and validates the configuration
//! - Starts the optional health/metrics server
//! - Runs the bootstrap and prints the report

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ha_bootstrap::health::{HealthState, run_health_server};
use ha_bootstrap::inventory::BootstrapConfig;
use ha_bootstrap::{preflight, production_context, run_bootstrap};

/// Exit status when the configuration is rejected before any node is touched.
const EXIT_CONFIG: u8 = 2;

/// Bootstrap a highly-available Kubernetes cluster
#[derive(Parser, Debug)]
#[command(name = "ha-bootstrap")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bootstrap configuration file
    #[arg(short, long, env = "HA_BOOTSTRAP_CONFIG", default_value = "bootstrap.yaml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Form the cluster and install add-ons
    Run {
        /// Where to write the admin kubeconfig used for add-on installs
        #[arg(long)]
        kubeconfig_out: Option<PathBuf>,

        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Pre-flight checks only; no node is contacted
    Validate,
    /// Print the resolved plan as JSON
    Plan,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env().add_directive("ha_bootstrap=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_target(false).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_format) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = match BootstrapConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let plan = match preflight(&config) {
        Ok(plan) => plan,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "Configuration rejected");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Command::Validate => {
            println!(
                "Configuration valid: {} control planes, {} workers, add-ons: {}",
                plan.topology.control_plane_count(),
                plan.topology.worker_count(),
                plan.addons.order().join(" -> ")
            );
            ExitCode::SUCCESS
        }
        Command::Plan => match serde_json::to_string_pretty(&plan.summary()) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Failed to serialize plan");
                ExitCode::FAILURE
            }
        },
        Command::Run {
            kubeconfig_out,
            json,
        } => run(config, plan, kubeconfig_out, json).await,
    }
}

async fn run(
    config: BootstrapConfig,
    plan: ha_bootstrap::Plan,
    kubeconfig_out: Option<PathBuf>,
    json: bool,
) -> ExitCode {
    let health_state = config.metrics_addr.map(|addr| {
        let state = Arc::new(HealthState::new());
        let server_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(addr, server_state).await {
                error!("Health server error: {}", e);
            }
        });
        state
    });

    let kubeconfig_out = kubeconfig_out
        .unwrap_or_else(|| PathBuf::from(format!("{}-admin.conf", config.cluster.name)));
    let ctx = Arc::new(production_context(
        &config,
        &plan,
        kubeconfig_out,
        health_state,
    ));
    info!(run_id = %ctx.run_id, cluster = %config.cluster.name, "Starting bootstrap");

    let report = tokio::select! {
        report = run_bootstrap(plan, ctx) => report,
        _ = shutdown_signal() => {
            warn!("Interrupted; completed phases are kept and a re-run resumes from them");
            return ExitCode::from(130);
        }
    };

    if json {
        match report.to_json() {
            Ok(out) => println!("{out}"),
            Err(e) => error!(error = %e, "Failed to serialize report"),
        }
    } else {
        println!("{report}");
        for (target, hint) in report.hints() {
            println!("--- {target} ---");
            println!("{hint}");
        }
    }

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// If a handler cannot be installed, that signal is never delivered and the
/// run continues.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
