//! # Background Garbage Collection
//!
//! Periodic sweep of the checkout tree: any `<repo>@<commit>` directory
//! whose mtime is older than a day is removed. The per-reconcile sibling
//! GC already keeps live configurations at one checkout; this sweep cleans
//! up after deleted resources and crashed reconciles.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::context::ControllerContext;
use crate::observability::metrics;
use crate::workdir::sweep_stale;

/// How often the sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Checkouts older than this are fair game.
const MAX_CHECKOUT_AGE: Duration = Duration::from_secs(24 * 3600);

/// Run the sweep forever. Spawned as a background task at startup; ends
/// with the process.
pub async fn run(ctx: Arc<ControllerContext>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let base = ctx.config.base_config_path.clone();
        debug!(base = %base.display(), "running workdir garbage collection");

        // The sweep is synchronous filesystem work; keep it off the
        // reconcile executor threads.
        let removed =
            tokio::task::spawn_blocking(move || sweep_stale(&base, MAX_CHECKOUT_AGE))
                .await
                .unwrap_or(0);

        if removed > 0 {
            metrics::increment_workdirs_collected(removed as u64);
            info!(removed, "garbage collected stale checkouts");
        }
    }
}
