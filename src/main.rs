//! vpnerd: the vpner control-plane daemon
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! vpnerd
//!
//! # Run with a custom configuration
//! vpnerd -c /opt/etc/vpner/vpner.yaml
//!
//! # Override the log level
//! RUST_LOG=debug vpnerd
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use vpner::config::{load_config, Config};
use vpner::runtime::Runtime;

const DEFAULT_CONFIG_PATH: &str = "/opt/etc/vpner/vpner.yaml";

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("vpnerd v{}", vpner::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"vpnerd v{}

Router-resident control plane for selective VPN/proxy tunneling.

USAGE:
    vpnerd [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file path [default: {DEFAULT_CONFIG_PATH}]
    --check                Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (trace, debug, info, warn, error)

REQUIREMENTS:
    - ipset >= 6.0 and iptables on PATH
    - root (the daemon programs kernel sets and firewall chains)
"#,
        vpner::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence over the config file's `log.level`.
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        // Reduce noise from dependencies
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap())
        .add_directive("tokio=warn".parse().unwrap());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {e}", args.config_path);
            return ExitCode::FAILURE;
        }
    };

    if args.check_config {
        println!("Configuration is valid");
        return ExitCode::SUCCESS;
    }

    init_logging(&config);
    info!("vpnerd v{}", vpner::VERSION);
    info!("configuration loaded from {:?}", args.config_path);

    match run(config).await {
        Ok(()) => {
            info!("orderly shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let runtime = Runtime::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Signal handling: first signal triggers graceful shutdown
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("received SIGINT"),
            () = wait_for_sigterm() => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(());
    });

    runtime
        .run(shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}

/// Wait for SIGTERM
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
