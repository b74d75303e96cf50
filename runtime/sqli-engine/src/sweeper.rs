use std::sync::{Arc, Weak};

use tracing::debug;

use crate::engine::EngineShared;
use crate::host::{Event, Host};
use crate::result_handle::ResultHandle;

/// Queues the next sweep one interval from now.
pub(crate) fn schedule_next(shared: &EngineShared, host: &dyn Host) {
    let at = host
        .now_ms()
        .saturating_add(shared.config().sweep_interval_ms);
    host.schedule_event(shared.id(), Event::ExpirySweep, at);
}

/// Handles this engine created that are still in the host registry.
pub(crate) fn live_handles(shared: &EngineShared, host: &dyn Host) -> Vec<Arc<ResultHandle>> {
    let alive: Vec<Arc<ResultHandle>> = {
        let mut tracked = shared.tracked_handles().lock();
        tracked.retain(|handle| handle.strong_count() > 0);
        tracked.iter().filter_map(Weak::upgrade).collect()
    };
    alive
        .into_iter()
        .filter(|handle| host.find_object(handle.id()).is_some())
        .collect()
}

/// Runs one expiry pass and returns how many handles were flagged.
pub(crate) fn sweep(shared: &EngineShared, host: &dyn Host) -> usize {
    let now = host.now_ms();
    let threshold = shared.config().expiry_timeout_ms;
    let handles = live_handles(shared, host);
    let flagged = handles
        .iter()
        .filter(|handle| handle.check_expiry(now, threshold))
        .count();
    if shared.is_debug() {
        debug!(
            engine = %shared.id(),
            checked = handles.len(),
            flagged,
            "expiry sweep"
        );
    }
    flagged
}
