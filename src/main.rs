use accord::agreement::AgreementWorker;
use accord::config::{AppConfig, LoggingConfig};
use accord::error::{AccordError, Result};
use accord::events::{Event, EventBus};
use accord::ledger::HttpLedger;
use accord::persistence::{AgreementStore, MemoryStore, PostgresStore};
use accord::policy::PolicyManager;
use accord::protocol::{BasicProtocol, LedgerProtocol, ProtocolRegistry};
use accord::registry::HttpRegistry;
use accord::signing::WalletSigner;
use accord::transport::HttpSender;
use accord::worker::{self, StatusBoard};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "accord", about = "Edge-node agreement negotiation agent")]
struct Cli {
    /// Directory holding default.toml and the ACCORD_ENV overlay
    #[arg(long, default_value = "config")]
    config_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    init_logging(&config.logging);

    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!("configuration: {problem}");
        }
        return Err(AccordError::Internal(format!(
            "invalid configuration ({} problems)",
            problems.len()
        )));
    }

    let signer = Arc::new(WalletSigner::from_env()?);
    let store: Arc<dyn AgreementStore> = match &config.database {
        Some(db) => {
            let store = PostgresStore::connect(&db.url, db.max_connections).await?;
            store.ensure_schema().await?;
            info!("using postgres agreement store");
            Arc::new(store)
        }
        None => {
            warn!("no database configured, agreement records will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let sender = Arc::new(HttpSender::new(
        config.transport.retry_count,
        Duration::from_millis(config.transport.retry_interval_ms),
    ));
    let registry = Arc::new(HttpRegistry::new(
        &config.registry.base_url,
        config.registry.retry_count,
        Duration::from_millis(config.registry.retry_interval_ms),
    ));

    let manager = Arc::new(PolicyManager::new());
    let mut protocols = ProtocolRegistry::new();
    protocols.register(Arc::new(BasicProtocol::new(
        manager.clone(),
        signer.clone(),
        sender.clone(),
    )));
    if let Some(ledger) = &config.ledger {
        protocols.register(Arc::new(LedgerProtocol::new(
            manager.clone(),
            signer.clone(),
            sender.clone(),
            Arc::new(HttpLedger::new(&ledger.base_url)),
        )));
    }

    let bus = EventBus::default();
    let board = Arc::new(StatusBoard::new());
    let mut events = bus.subscribe();

    worker::spawn(AgreementWorker::new(
        bus.clone(),
        board.clone(),
        config.agent.clone(),
        manager,
        store,
        Arc::new(protocols),
        registry,
    ));
    let mut running = 1u32;

    bus.publish(Event::DeviceRegistered {
        device_id: config.agent.id.clone(),
    });
    info!(node = %config.agent.id, "agent running");

    let mut shutting_down = false;
    loop {
        tokio::select! {
            _ = signal::ctrl_c(), if !shutting_down => {
                info!("shutdown requested");
                shutting_down = true;
                bus.publish(Event::ShutdownRequested);
            }
            event = events.recv() => {
                match event {
                    Ok(Event::WorkerStopped { worker }) => {
                        info!(worker, "worker stopped");
                        running = running.saturating_sub(1);
                        if running == 0 {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("event stream ended: {e}");
                        break;
                    }
                }
            }
        }
    }

    bus.publish(Event::ShutdownComplete);
    for status in board.all() {
        info!(worker = %status.name, status = %status.status, "final status");
    }
    info!("shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    // RUST_LOG still wins; logging.level sets the baseline otherwise.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&logging.level)));

    let log_dir = std::env::var("ACCORD_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/accord".to_string());

    // `tracing_appender::rolling::daily` panics if it cannot create the
    // initial log file, so writability is checked up front.
    let file_writer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".accord_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "accord.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the lifetime of the process.
                Box::leak(Box::new(guard));

                Some(non_blocking)
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir
        );
        None
    };

    let file_logging_enabled = file_writer.is_some();
    if logging.json {
        let file_layer = file_writer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
        });
        let console_layer = tracing_subscriber::fmt::layer().json().with_target(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        let file_layer = file_writer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
        });
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    }

    if file_logging_enabled {
        eprintln!("Logging to: {}/accord.log", log_dir);
    }
}

fn default_directives(level: &str) -> String {
    format!("{level},accord={level},sqlx=warn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_drives_the_default_filter() {
        assert_eq!(default_directives("debug"), "debug,accord=debug,sqlx=warn");
        assert_eq!(
            default_directives(&LoggingConfig::default().level),
            "info,accord=info,sqlx=warn"
        );
    }
}
