#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use storinfo_server::config::{build_feed, AppConfig, LogConfig, LogFormat, Overrides};
use storinfo_server::{NetworkModule, UtilizationCache};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Serves cached storage node utilization over HTTP.
#[derive(Debug, Parser)]
#[command(name = "storinfo-server", version)]
struct Args {
    /// Configuration file to use.
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    file: Option<PathBuf>,

    /// Listen for requests on port.
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Verbose output. Use multiple times for more verbose.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// `PostgreSQL` connection string for the storage bucket.
    #[arg(long, env = "STORINFO_DATABASE_URL", value_name = "URL")]
    database_url: Option<String>,

    /// Serve a fixed JSON array of records instead of querying the store.
    #[arg(long, value_name = "FILE")]
    test_data: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            database_url: self.database_url.clone(),
            test_data: self.test_data.clone(),
            verbosity: self.verbose,
            log_format: self.log_format,
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    match log.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

/// Resolves on Ctrl-C, SIGTERM or SIGHUP.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigterm), Ok(mut sighup)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) else {
            error!("failed to register signal handlers; falling back to Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sighup.recv() => info!("received SIGHUP"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = config
        .store
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no record source configured"))?;
    let feed = build_feed(store).await?;

    let cache = Arc::new(UtilizationCache::start(config.cache, feed));

    let mut network = NetworkModule::new(config.network, Arc::clone(&cache));
    let port = match network.start().await {
        Ok(port) => port,
        Err(e) => {
            cache.close().await;
            return Err(e);
        }
    };
    info!(port, "storinfo listening");

    network.serve(wait_for_shutdown_signal()).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load(args.file.as_deref(), &args.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("storinfo-server: {e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&config.log);

    match run(config).await {
        Ok(()) => {
            info!("storinfo stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_map_to_overrides() {
        let args = Args::try_parse_from([
            "storinfo-server",
            "-f",
            "/etc/storinfo.json",
            "-p",
            "9000",
            "-vv",
            "--log-format",
            "json",
            "--test-data",
            "nodes.json",
        ])
        .unwrap();

        assert_eq!(args.file, Some(PathBuf::from("/etc/storinfo.json")));
        let overrides = args.overrides();
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.verbosity, 2);
        assert_eq!(overrides.log_format, LogFormat::Json);
        assert_eq!(overrides.test_data, Some(PathBuf::from("nodes.json")));
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(Args::try_parse_from(["storinfo-server", "-p", "eighty"]).is_err());
    }
}
