use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tier1_dashboard::redirect::RedirectReceiver;
use tier1_dashboard::{
    load_config, Config, Dashboard, DashboardEvent, DashboardView, DownloadOutcome, InitOutcome,
};

#[derive(Debug, PartialEq)]
enum Action {
    /// Keep the session alive and log collections as they change
    Run,
    Download { task_id: String },
}

fn cli() -> Command {
    Command::new("tier1-dashboard")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tier-1 task dashboard session client")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .env("TIER1_CONFIG_PATH")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to the JSON configuration file"),
        )
        .subcommand(Command::new("run").about("Keep the session alive and log tasks and events (default)"))
        .subcommand(
            Command::new("download")
                .about("Download the artifact of one task")
                .arg(
                    Arg::new("task-id")
                        .required(true)
                        .help("Id of the task whose artifact to fetch"),
                ),
        )
}

fn action_of(matches: &ArgMatches) -> Result<(Action, Option<PathBuf>)> {
    let mut config_path = matches.get_one::<PathBuf>("config").cloned();
    let action = match matches.subcommand() {
        Some(("download", args)) => {
            // Global args land on the subcommand's matches
            if let Some(path) = args.get_one::<PathBuf>("config") {
                config_path = Some(path.clone());
            }
            let task_id = args
                .get_one::<String>("task-id")
                .cloned()
                .context("download needs a task id")?;
            Action::Download { task_id }
        }
        Some(("run", args)) => {
            if let Some(path) = args.get_one::<PathBuf>("config") {
                config_path = Some(path.clone());
            }
            Action::Run
        }
        _ => Action::Run,
    };
    Ok((action, config_path))
}

fn log_view(dashboard: &Dashboard) {
    match dashboard.view() {
        DashboardView::Initializing => info!("Initializing..."),
        DashboardView::RedirectingToLogin { login_url } => {
            info!(login_url = ?login_url, "Redirecting to login...")
        }
        DashboardView::InitializationFailed { error } => error!(%error, "Initialization failed"),
        DashboardView::Ready { tasks, events } => {
            if tasks.is_empty() {
                info!("No tasks.");
            }
            for task in tasks.items() {
                info!(
                    id = %task.id,
                    name = %task.name,
                    filename = %task.filename,
                    size = task.size,
                    timestamp = %task.timestamp,
                    "Task"
                );
            }
            if events.is_empty() {
                info!("No events.");
            }
            for event in events.items() {
                info!("[{}] Task {}: {}", event.timestamp, event.task_id, event.event);
            }
        }
    }
}

async fn run(dashboard: &Dashboard) -> Result<()> {
    let mut events = dashboard.subscribe();
    // The first fetch may have finished before we subscribed
    if dashboard.tasks().updated_at().is_some() {
        log_view(dashboard);
    }
    info!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            received = events.recv() => match received {
                Ok(stream_event) => match stream_event.event() {
                    DashboardEvent::CollectionUpdated { .. } => log_view(dashboard),
                    DashboardEvent::SessionExpired { reason } => {
                        warn!(%reason, "Session expired");
                        break;
                    }
                    other => debug!(kind = other.kind(), "Session event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

async fn download(dashboard: &Dashboard, task_id: &str) -> Result<()> {
    match dashboard.download(task_id).await? {
        DownloadOutcome::Delivered { path, bytes, .. } => {
            info!(path = %path.display(), bytes, "Saved artifact");
        }
        DownloadOutcome::Skipped => warn!("Not authenticated, nothing downloaded"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    // Initialize the tracing subscriber for structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "tier1_dashboard=debug,tower_http=debug,warn".into()
            } else {
                "tier1_dashboard=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let (action, config_path) = action_of(&cli().get_matches())?;
    let config: Config = load_config(config_path.as_deref()).await?;

    let receiver = RedirectReceiver::new(&config.identity.redirect_uri)?;
    let dashboard = Dashboard::from_config(config, Some(Arc::new(receiver)))?;

    if !dashboard.backend_healthy().await {
        warn!("Backend health probe failed, continuing anyway");
    }

    let outcome = match dashboard.start().await {
        Ok(outcome) => outcome,
        Err(e) => {
            log_view(&dashboard);
            return Err(e.into());
        }
    };
    if let InitOutcome::Redirecting { .. } = outcome {
        log_view(&dashboard);
        return Ok(());
    }

    let result = match action {
        Action::Run => run(&dashboard).await,
        Action::Download { task_id } => download(&dashboard, &task_id).await,
    };

    if let Some(logout_url) = dashboard.logout().await? {
        info!("End the provider session at {}", logout_url);
    }
    dashboard.shutdown().await;
    info!("Shutdown complete");
    result
}
