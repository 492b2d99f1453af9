//! Periodic human-readable state snapshot.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::debug;

use canopy_mesh::engine::Engine;

/// Dump the supervisor state to `path` once per second.
pub async fn run(engine: Arc<Mutex<Engine>>, path: PathBuf) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        let state = engine.lock().await.debug_state(Instant::now());
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let content = format!(
            "{}\nUpdate time: {unix_time}\n{state}",
            "*".repeat(49)
        );

        if let Err(e) = tokio::fs::write(&path, content).await {
            debug!(error = %e, path = %path.display(), "cannot write state file");
        }
    }
}
