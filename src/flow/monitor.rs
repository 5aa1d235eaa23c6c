//! Background disk usage monitor
//!
//! Polls the used percentage of the filesystem holding the data file and
//! logs each change while a flow runs.

use crate::cancel::{CancellationToken, POLL_QUANTUM};
use crate::io::disk::DiskIO;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Handle to a running monitor task
pub struct DiskUsageMonitor {
    stop: CancellationToken,
    handle: JoinHandle<Vec<f64>>,
}

impl DiskUsageMonitor {
    /// Stop polling and return every distinct percentage observed, in order
    pub async fn stop(self) -> Vec<f64> {
        self.stop.cancel();
        match self.handle.await {
            Ok(samples) => samples,
            Err(e) => {
                warn!("disk usage monitor task failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Used share of the filesystem holding `path`, in percent with one decimal
pub fn disk_usage_percent(disk: &dyn DiskIO, path: &Path) -> io::Result<f64> {
    let total = disk.total_space(path)?;
    if total == 0 {
        return Ok(0.0);
    }
    let free = disk.free_space(path)?.min(total);
    let used = (total - free) as f64 / total as f64 * 100.0;
    Ok((used * 10.0).round() / 10.0)
}

/// Start polling every `poll` until `cancel` is set or the monitor is stopped
pub fn spawn_disk_usage_monitor(
    disk: Arc<dyn DiskIO>,
    path: PathBuf,
    poll: Duration,
    cancel: CancellationToken,
) -> DiskUsageMonitor {
    let stop = CancellationToken::new();
    let own_stop = stop.clone();
    let handle = tokio::spawn(async move {
        let mut samples = Vec::new();
        let mut last: Option<f64> = None;
        let mut warned = false;

        while !cancel.is_cancelled() && !own_stop.is_cancelled() {
            let (probe_disk, probe_path) = (Arc::clone(&disk), path.clone());
            let usage = task::spawn_blocking(move || disk_usage_percent(&*probe_disk, &probe_path))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
                .and_then(|r| r);

            match usage {
                Ok(percent) if last != Some(percent) => {
                    info!("disk usage: {:.1}%", percent);
                    samples.push(percent);
                    last = Some(percent);
                }
                Ok(_) => {}
                Err(e) if !warned => {
                    warn!("cannot read disk usage for {}: {}", path.display(), e);
                    warned = true;
                }
                Err(e) => debug!("disk usage poll failed: {}", e),
            }

            let mut waited = Duration::ZERO;
            while waited < poll && !cancel.is_cancelled() && !own_stop.is_cancelled() {
                let step = POLL_QUANTUM.min(poll - waited);
                tokio::time::sleep(step).await;
                waited += step;
            }
        }

        debug!("disk usage monitor stopped");
        samples
    });

    DiskUsageMonitor { stop, handle }
}
