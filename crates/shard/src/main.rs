//! Shard server entry point.
//!
//! Loads the TOML configuration, applies command line overrides, sets up
//! logging and runs the network core until SIGINT/SIGTERM.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Result};
use cli::CliArgs;
use config::AppConfig;
use game_server::{GameServer, NetworkCore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Grace period for the server to flush and close every connection.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The running shard: configuration plus the server built from it.
pub struct Application {
    config: AppConfig,
    server: Arc<GameServer>,
}

impl Application {
    /// Loads and validates the configuration, then builds the server.
    pub async fn new(args: CliArgs) -> Result<Self> {
        // Configuration comes first so logging can honour it
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        apply_overrides(&mut config, &args);

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;

        let server = GameServer::new(config.to_server_config()?)?;

        info!(
            "🚀 Shard server v{} | Config: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display()
        );

        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    /// Runs the server until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Listen: {}", self.config.server.listen.join(", "));
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        if self.config.server.max_connections_per_ip > 0 {
            info!(
                "  🧍 Max connections per IP: {}",
                self.config.server.max_connections_per_ip
            );
        }
        info!(
            "  ⏱️ Inactivity timeout: {}s",
            self.config.network.inactivity_timeout_secs
        );
        info!("  📦 Pending cap: {} bytes", self.config.network.pending_cap);

        let listener = self.server.bind()?;
        let server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move {
                match server.run(listener).await {
                    Ok(()) => info!("✅ Server completed successfully"),
                    Err(e) => error!("❌ Server error: {:?}", e),
                }
            })
        };

        let monitoring_handle = self.start_monitoring();

        info!("✅ Shard is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        signals::wait_for_shutdown().await?;

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        if let Some(handle) = monitoring_handle {
            handle.abort();
        }

        self.server.shutdown();
        info!("⏳ Waiting for connections to close...");
        match timeout(SHUTDOWN_GRACE, server_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("❌ Server task failed: {}", e),
            Err(_) => warn!(
                "⚠️ Server did not stop within {}s",
                SHUTDOWN_GRACE.as_secs()
            ),
        }

        log_stats(&self.server.core());
        info!("👋 Shard shutdown complete");
        Ok(())
    }

    fn start_monitoring(&self) -> Option<JoinHandle<()>> {
        let period = self.config.monitoring.stats_interval_secs;
        if period == 0 {
            return None;
        }

        let core = self.server.core();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                log_stats(&core);
            }
        }))
    }
}

/// Applies command line overrides on top of the file configuration.
fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if !args.listen.is_empty() {
        config.server.listen = args.listen.clone();
    }
    if let Some(max_connections) = args.max_connections {
        config.server.max_connections = max_connections;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

fn log_stats(core: &NetworkCore) {
    let stats = core.stats();
    info!(
        "📊 Network - {} online | paused: {} | {} awaiting pump | {} awaiting disposal",
        stats.online, stats.paused, stats.received_pending, stats.disposed_pending
    );
    for pool in &stats.pools {
        info!(
            "  🧱 {}: {}/{} free | {} misses",
            pool.name, pool.free_count, pool.current_capacity, pool.misses
        );
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Application error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
