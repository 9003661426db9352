use clap::{Parser, Subcommand};
use sentra::config::AppConfig;
use sentra::coordinator::Coordinator;
use sentra::error::Result;
use sentra::SentraError;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sentra", about = "Broker connectivity resilience daemon", version)]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Dry run: no real orders are submitted
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            let mut config = load_config(&cli.config_dir)?;
            init_logging(&config.logging);
            if dry_run {
                config.dry_run.enabled = true;
            }
            if config.dry_run.enabled {
                info!("DRY RUN mode: orders will not reach the broker");
            }

            let coordinator = Arc::new(Coordinator::new(config)?);
            if let Err(e) = coordinator.run().await {
                error!(error = %e, "Daemon exited with error");
                return Err(e);
            }
        }
        Commands::CheckConfig => {
            init_logging_simple();
            let config = load_config(&cli.config_dir)?;
            match config.validate() {
                Ok(()) => println!("Configuration OK"),
                Err(errors) => {
                    for e in &errors {
                        eprintln!("config error: {}", e);
                    }
                    return Err(SentraError::Validation(format!(
                        "{} configuration error(s)",
                        errors.len()
                    )));
                }
            }
        }
    }

    Ok(())
}

fn load_config(config_dir: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(config_dir)?;
    if let Err(errors) = config.validate() {
        return Err(SentraError::Validation(errors.join("; ")));
    }
    Ok(config)
}

fn init_logging(logging: &sentra::config::LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sentra=debug", logging.level)));

    // Check if we should write to file (prefer SENTRA_LOG_DIR, fallback to LOG_DIR or /var/log/sentra).
    let log_dir = std::env::var("SENTRA_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/sentra".to_string());

    // `tracing_appender::rolling::daily` panics if it can't create the
    // initial log file, so preflight writability first.
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".sentra_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "sentra.log");
                let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the life of the process.
                Box::leak(Box::new(_guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Log directory {} not writable ({}), console only", log_dir, e);
                None
            }
        }
    } else {
        eprintln!("Could not create log directory {}, console only", log_dir);
        None
    };

    let (plain_console, json_console) = if logging.json {
        (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(plain_console)
        .with(json_console)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        eprintln!("Logging to: {}/sentra.log", log_dir);
    }
}

fn init_logging_simple() {
    // Minimal logging for CLI commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
