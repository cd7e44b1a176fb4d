//! CO2 telemetry client - Main Entry Point

use co2_telemetry::alert::AirQuality;
use co2_telemetry::config::ClientConfig;
use co2_telemetry::context::TelemetryContext;
use co2_telemetry::history::{HistoryBuffer, HistoryStats};
use co2_telemetry::notify::NotificationSink;
use co2_telemetry::observability::{init_default_logging, init_logging, metrics, LogFormat};
use co2_telemetry::protocol::Reading;
use co2_telemetry::settings::{SettingsPatch, SettingsStore};
use co2_telemetry::storage::{FileStore, KeyValueStore};
use co2_telemetry::transport::mqtt::{MqttTransportFactory, MqttTransportOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, Level};

/// Real-time CO2 telemetry client
#[derive(Parser)]
#[command(name = "co2-telemetry")]
#[command(about = "Subscribe to a CO2 sensor feed, keep history and raise threshold alerts")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CO2_TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (overrides LOG_LEVEL)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and process readings until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Print persisted reading history
    History {
        /// Only the most recent N readings
        #[arg(long, value_name = "N")]
        last: Option<usize>,
        /// Print summary statistics instead of readings
        #[arg(long)]
        stats: bool,
    },
    /// Show or update persisted settings
    Settings {
        /// Show current settings
        #[arg(long)]
        show: bool,
        /// Low threshold (ppm)
        #[arg(long, value_name = "PPM")]
        low: Option<i32>,
        /// High threshold (ppm)
        #[arg(long, value_name = "PPM")]
        high: Option<i32>,
        #[arg(long, value_name = "BOOL")]
        notifications: Option<bool>,
        #[arg(long, value_name = "BOOL")]
        auto_refresh: Option<bool>,
        /// Refresh interval in milliseconds
        #[arg(long, value_name = "MS")]
        refresh_interval: Option<u64>,
        /// Restore every setting to its default
        #[arg(long, conflicts_with_all = ["low", "high", "notifications", "auto_refresh", "refresh_interval"])]
        reset: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize observability system
    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    // Load configuration
    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::History { last, stats } => handle_history_command(&config, last, stats).await,
        Commands::Settings {
            show,
            low,
            high,
            notifications,
            auto_refresh,
            refresh_interval,
            reset,
        } => {
            let patch = if reset {
                SettingsPatch::reset()
            } else {
                SettingsPatch {
                    low_threshold: low,
                    high_threshold: high,
                    notifications_enabled: notifications,
                    auto_refresh,
                    refresh_interval,
                }
            };
            handle_settings_command(&config, patch, show).await
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ClientConfig::load_from_file(path)?)
        }
        None => {
            // Try default locations
            let default_paths = ["co2-telemetry.toml", "config/co2-telemetry.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ClientConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create co2-telemetry.toml".into())
        }
    }
}

fn storage_for(config: &ClientConfig) -> Arc<dyn KeyValueStore> {
    Arc::new(FileStore::new(&config.storage.data_dir))
}

#[cfg(feature = "desktop-notifications")]
fn notification_sink() -> Arc<dyn NotificationSink> {
    Arc::new(co2_telemetry::notify::DesktopNotificationSink)
}

#[cfg(not(feature = "desktop-notifications"))]
fn notification_sink() -> Arc<dyn NotificationSink> {
    Arc::new(co2_telemetry::notify::LogNotificationSink)
}

async fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting CO2 telemetry client v{}",
        env!("CARGO_PKG_VERSION")
    );

    let factory = MqttTransportFactory::new(MqttTransportOptions::from(&config));
    let context =
        TelemetryContext::start(&config, factory, storage_for(&config), notification_sink())
            .await?;

    // Log every reading as it arrives
    let mut readings = context.watch_reading();
    let mut settings = context.watch_settings();
    let reporter = tokio::spawn(async move {
        while readings.changed().await.is_ok() {
            let Some(reading) = readings.borrow_and_update().clone() else {
                continue;
            };
            let quality = AirQuality::classify(&reading, &settings.borrow_and_update());
            info!(
                device = %reading.device,
                co2_1 = reading.co2_1,
                co2_2 = reading.co2_2,
                wifi_rssi = reading.wifi_rssi,
                quality = %quality,
                "Reading received"
            );
        }
    });

    info!("Client is running, waiting for readings...");
    wait_for_shutdown_signal().await?;

    info!("Application shutdown initiated");
    context.shutdown().await;
    reporter.abort();

    println!("{}", serde_json::to_string_pretty(&metrics().snapshot())?);
    info!("Application shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down gracefully...");
    Ok(())
}

fn handle_config_command(
    config: &ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!(broker = %config.endpoint()?, "Configuration validation complete");
    Ok(())
}

async fn handle_history_command(
    config: &ClientConfig,
    last: Option<usize>,
    stats: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = storage_for(config);
    let history = HistoryBuffer::load(storage.clone()).await;

    if stats {
        let settings = SettingsStore::load(storage).await;
        match HistoryStats::compute(&history.snapshot(), settings.current()) {
            Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
            None => println!("No valid readings in history"),
        }
        return Ok(());
    }

    let readings = match last {
        Some(n) => history.slice(n),
        None => history.snapshot(),
    };
    for reading in readings {
        println!("{}", history_line(&reading)?);
    }
    Ok(())
}

/// One history row: the device time in RFC 3339, then the raw record
fn history_line(reading: &Reading) -> Result<String, serde_json::Error> {
    let recorded_at = reading
        .recorded_at()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| format!("@{}", reading.timestamp));
    Ok(format!("{recorded_at}  {}", serde_json::to_string(reading)?))
}

async fn handle_settings_command(
    config: &ClientConfig,
    patch: SettingsPatch,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = SettingsStore::load(storage_for(config)).await;

    if !patch.is_empty() {
        store.current().merge(&patch).validate()?;
        store.update(&patch).await;
    } else if !show {
        info!("No settings changes requested");
    }

    println!("{}", serde_json::to_string_pretty(store.current())?);
    Ok(())
}
