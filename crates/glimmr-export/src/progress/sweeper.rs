//! Periodic removal of expired export records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::service::ExportService;

/// Background task that sweeps expired exports on a fixed interval.
///
/// Started with the service and stopped with it; dropping the sweeper
/// without calling [`ProgressSweeper::shutdown`] also cancels the task.
pub struct ProgressSweeper {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressSweeper {
    pub fn start(service: Arc<ExportService>, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let child = token.child_token();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so startup does not sweep.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match service.sweep(Utc::now()).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "Expired exports swept");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Export sweep failed");
                    }
                }
            }
            tracing::debug!("Export sweeper stopped");
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Cancel the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Export sweeper task ended abnormally");
        }
    }
}

impl Drop for ProgressSweeper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
