use std::time::Duration;

use tracing::{error, info};

use crate::{auth::AuthService, errors::Result};

/// How often the worker looks for expiring grants
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of one refresh sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub found: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Refresh every active grant whose token is within the refresh buffer
///
/// Failures are logged and counted; one bad grant never stops the sweep.
pub async fn refresh_expiring_authorizations(auth: &AuthService) -> Result<RefreshSummary> {
    let records = auth
        .credentials()
        .find_expiring(auth.config().refresh_buffer)
        .await?;

    let mut summary = RefreshSummary {
        found: records.len(),
        ..RefreshSummary::default()
    };
    info!("Found {} authorizations due for refresh", summary.found);

    let results =
        futures::future::join_all(records.iter().map(|record| auth.refresh_token(record))).await;

    for (record, result) in records.iter().zip(results) {
        match result {
            Ok(_) => summary.refreshed += 1,
            Err(err) => {
                summary.failed += 1;
                error!(
                    "Failed to refresh authorization for user {}: {}",
                    record.user_id, err
                );
            }
        }
    }

    info!(
        "Refreshed {} authorizations, {} failed",
        summary.refreshed, summary.failed
    );
    Ok(summary)
}

/// Run the refresh sweep every `interval` until the task is dropped
pub async fn run_cron(auth: std::sync::Arc<AuthService>, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(err) = refresh_expiring_authorizations(&auth).await {
            tracing::error!("Failed to run refresh_expiring_authorizations: {:?}", err);
        }
    }
}
