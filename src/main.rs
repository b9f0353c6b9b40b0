use anyhow::Result;
use clap::Parser;
use hostgate::{Config, Proxy};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Hostname-routing reverse proxy for Minecraft Java Edition")]
struct Args {
    /// Path to the configuration file (YAML or JSON)
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    /// Abort in-flight connections on shutdown instead of draining them
    #[arg(long)]
    no_drain: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hostgate=debug".into()),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config, "starting hostgate");

    let config = Config::load_from_file(&args.config)?;
    if let Some(bind) = &config.metrics_bind {
        hostgate::metrics::init_metrics(bind.parse()?)?;
    }

    let proxy = Proxy::new(config)?;
    proxy.start().await?;

    wait_for_shutdown(&proxy, &args.config).await;

    info!(drain = !args.no_drain, "shutting down");
    proxy.shutdown(!args.no_drain).await;
    Ok(())
}

/// Block until an interrupt arrives, reloading the configuration on SIGHUP.
async fn wait_for_shutdown(proxy: &Proxy, config_path: &str) {
    #[cfg(unix)]
    {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "SIGHUP handler unavailable, reload disabled");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => break,
                _ = hangup.recv() => {
                    info!(config = %config_path, "SIGHUP received, reloading configuration");
                    match Config::load_from_file(config_path) {
                        Ok(config) => {
                            if let Err(e) = proxy.reload(config) {
                                error!(error = %e, "reload failed, keeping previous configuration");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "could not read configuration, keeping previous");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
