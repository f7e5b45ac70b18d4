//! Background flush timers

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Which timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTick {
    /// Flush only if the buffer has reached the lower limit
    IfFull,
    /// Flush whatever is buffered
    All,
}

/// Spawn the periodic flush loop of one owner
///
/// `on_tick` runs for every timer tick and returns `false` once its owner
/// is gone, which ends the loop. Without a running tokio runtime nothing
/// is spawned and `None` is returned; the owner then relies on explicit
/// flushes and the hard limit.
pub fn spawn_flush_task<F>(
    name: &'static str,
    full_check: Option<Duration>,
    flush_all: Duration,
    stop: CancellationToken,
    mut on_tick: F,
) -> Option<JoinHandle<()>>
where
    F: FnMut(FlushTick) -> bool + Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current().ok()?;

    Some(handle.spawn(async move {
        info!(
            task = name,
            full_check_ms = full_check.map(|d| d.as_millis() as u64),
            flush_all_ms = flush_all.as_millis() as u64,
            "Flush task started"
        );

        // a disabled full check still needs a timer to select on
        let full_period = full_check.unwrap_or(Duration::from_secs(3600));
        let mut full_timer = interval_at(Instant::now() + full_period, full_period);
        full_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut all_timer = interval_at(Instant::now() + flush_all, flush_all);
        all_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let tick = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(task = name, "Flush task shutting down");
                    break;
                }
                _ = all_timer.tick() => FlushTick::All,
                _ = full_timer.tick(), if full_check.is_some() => FlushTick::IfFull,
            };

            if !on_tick(tick) {
                debug!(task = name, "Owner dropped, flush task exiting");
                break;
            }
        }
    }))
}
