mod ingestor;


pub use ingestor::IngestReport;

use crate::broadcast::Broadcaster;
use crate::classify::Thresholds;
use crate::devices::DeviceTracker;
use crate::latest::LatestCache;
use crate::pipeline::PipelineHandle;
use chrono::Duration as ChronoDuration;

/// Runs every accepted reading through classify, cache and publish, then hands
/// it to persistence without waiting on the store. Cheap to clone.
#[derive(Clone)]
pub struct TelemetryIngestor {
    pipeline: PipelineHandle,
    thresholds: Thresholds,
    latest: LatestCache,
    broadcaster: Broadcaster,
    devices: DeviceTracker,
    heartbeat_timeout: ChronoDuration,
}
