//! gasline - headless catalog synchronizer.
//!
//! Wires the sync core to the storefront REST API and push channel, reads
//! lifecycle commands from stdin and logs every cache change. Stands in for
//! the mobile UI when exercising the synchronizer against a real backend.

mod commands;

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gasline_core::sync::{self, ConfigScopeStore, SyncDeps, SyncHandle, SyncNotice, SyncSettings, Trigger};
use gasline_core::transport::WsConnector;
use gasline_core::{ApiClient, Config, EntityKind};

use commands::{describe, CliCommand, HELP};

/// Directory for daily rolling log files. Unset means stderr only.
const LOG_DIR_ENV: &str = "GASLINE_LOG_DIR";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=gasline_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "gasline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();
    info!("gasline starting");

    let config = Config::load().context("Failed to load configuration")?;

    let mut api = ApiClient::new(&config.api_base_url, config.request_timeout())
        .context("Failed to build API client")?;
    if let Some(token) = config.auth_token.as_deref() {
        api.set_token(token);
    }
    let connector = WsConnector::new(&config.push_url, config.auth_token.as_deref())
        .with_context(|| format!("Invalid push URL: {}", config.push_url))?;
    let scope_store = ConfigScopeStore::from_default_path().context("Failed to locate config directory")?;

    let handle = sync::spawn(SyncDeps {
        source: Arc::new(api),
        connector: Arc::new(connector),
        scope_store: Arc::new(scope_store),
        settings: SyncSettings::from_config(&config),
    });
    spawn_change_logger(&handle);

    eprintln!("{}", HELP);
    let result = run_commands(&handle).await;

    if handle.shutdown().is_err() {
        warn!("Synchronizer already stopped");
    }
    info!("gasline shutting down");
    result
}

/// Log cache changes and notices as they happen.
fn spawn_change_logger(handle: &SyncHandle) {
    for kind in [EntityKind::Agency, EntityKind::Product] {
        let mut subscription = handle.on_cache_changed(kind);
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(change) = subscription.changed().await {
                let view = handle.view();
                let count = match kind {
                    EntityKind::Agency => view.agencies.len(),
                    EntityKind::Product => view.products.len(),
                };
                info!(%kind, reason = ?change.reason, count, "Catalog changed");
            }
        });
    }

    let mut notices = handle.notices();
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                SyncNotice::SessionExpired => {
                    warn!("Session expired - set a fresh GASLINE_TOKEN and run 'logout'");
                }
                SyncNotice::SelectionCleared { agency_id } => {
                    warn!(agency = %agency_id, "Selected agency is no longer available");
                }
            }
        }
    });
}

/// Read commands from stdin until `quit`, EOF or Ctrl-C.
async fn run_commands(handle: &SyncHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<CliCommand>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        let sent = match command {
            CliCommand::Focus => handle.lifecycle(Trigger::Focus),
            CliCommand::Foreground => handle.lifecycle(Trigger::Foreground),
            CliCommand::Refresh(scope) => handle.refresh(scope.as_deref()),
            CliCommand::Select(id) => handle.select_scope(id),
            CliCommand::Logout => handle.logout(),
            CliCommand::Status => {
                print!("{}", describe(&handle.view()));
                Ok(())
            }
            CliCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            CliCommand::Quit => return Ok(()),
        };
        sent.context("Synchronizer stopped unexpectedly")?;
    }
}
