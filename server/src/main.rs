use std::time::Duration;

use color_eyre::eyre::WrapErr;
use skypost::{
    cron,
    setup::{setup_sentry, setup_tracing},
    AppState,
};
use tracing::info;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Initialize Sentry for error tracking
    let _sentry_guard = setup_sentry();

    // Create and run the tokio runtime
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

async fn run_application() -> color_eyre::Result<()> {
    setup_tracing("skypost")?;

    let app_state = AppState::from_env().await?;
    info!(
        "Using Bluesky authorization server at {}",
        app_state.config.base_url
    );

    let futures = spawn_application_tasks(app_state)?;
    if futures.is_empty() {
        info!("No tasks enabled, exiting");
        return Ok(());
    }

    tokio::select! {
        result = futures::future::try_join_all(futures) => {
            for task in result.wrap_err("Application task panicked")? {
                task?;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    Ok(())
}

/// Spawn all application background tasks
fn spawn_application_tasks(
    app_state: AppState,
) -> color_eyre::Result<Vec<tokio::task::JoinHandle<color_eyre::Result<()>>>> {
    let mut futures = vec![];

    if is_feature_enabled("CRON") {
        let interval = match std::env::var("REFRESH_INTERVAL_SECS") {
            Ok(secs) => Duration::from_secs(
                secs.trim()
                    .parse()
                    .wrap_err("Failed to parse REFRESH_INTERVAL_SECS")?,
            ),
            Err(_) => cron::DEFAULT_REFRESH_INTERVAL,
        };
        info!("Cron Enabled, refreshing every {:?}", interval);

        let auth = app_state.auth.clone();
        futures.push(tokio::spawn(async move {
            cron::run_cron(auth, interval).await?;
            Ok::<_, color_eyre::Report>(())
        }));
    } else {
        info!("Cron Disabled");
    }

    Ok(futures)
}

/// Check if a feature is enabled based on environment variables
fn is_feature_enabled(feature: &str) -> bool {
    std::env::var(format!("{}_DISABLED", feature)).unwrap_or_else(|_| "false".to_string()) != "true"
}
