//! Benchmark workers: one per connection, one request per tick.

use crate::requester::Requester;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Run totals shared across workers. Workers keep local counters on the hot
/// path and merge here exactly once at exit, so the fast path never touches
/// shared cache lines.
#[derive(Debug, Default)]
pub struct WorkerTotals {
    pub success: AtomicU64,
    pub error: AtomicU64,
    pub timely_sends: AtomicU64,
    pub late_sends: AtomicU64,
}

/// First-failure slot for requester setup. The worker that fails records
/// its message and stops the run; later failures are dropped.
#[derive(Debug, Default)]
pub struct SetupFailure(Mutex<Option<String>>);

impl SetupFailure {
    pub fn record(&self, message: String) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub fn take(&self) -> Option<String> {
        self.0.lock().unwrap().take()
    }
}

/// Consume ticks until the tick channel closes, issuing one synchronous
/// request per tick and emitting a latency or an error key for each.
#[allow(clippy::too_many_arguments)]
pub fn run(
    id: u64,
    mut requester: Box<dyn Requester>,
    expected_interval: Duration,
    ticks: Receiver<Instant>,
    results: Sender<i64>,
    errors: Sender<String>,
    totals: &WorkerTotals,
    running: &AtomicBool,
    setup_failure: &SetupFailure,
) {
    if let Err(e) = requester.setup() {
        tracing::error!(worker = id, error = %e, "requester setup failed, aborting run");
        setup_failure.record(e.to_string());
        running.store(false, Ordering::Relaxed);
        return;
    }

    let mut timely_sends = 0u64;
    let mut late_sends = 0u64;
    let mut success_total = 0u64;
    let mut error_total = 0u64;

    for tick in ticks.iter() {
        let before = Instant::now();
        if before.duration_since(tick) >= expected_interval {
            late_sends += 1;
        } else {
            timely_sends += 1;
        }

        let outcome = requester.request();
        let latency = before.elapsed().as_nanos() as i64;

        match outcome {
            Ok(()) => {
                // Non-monotonic clock steps have been observed to produce
                // negative intervals on some hosts; report those as 0.
                let latency = latency.max(0);
                if results.send(latency).is_err() {
                    break;
                }
                success_total += 1;
            }
            Err(e) => {
                if errors.send(e.to_string()).is_err() {
                    break;
                }
                error_total += 1;
            }
        }
    }

    totals.timely_sends.fetch_add(timely_sends, Ordering::Relaxed);
    totals.late_sends.fetch_add(late_sends, Ordering::Relaxed);
    totals.success.fetch_add(success_total, Ordering::Relaxed);
    totals.error.fetch_add(error_total, Ordering::Relaxed);

    if let Err(e) = requester.teardown() {
        tracing::error!(worker = id, error = %e, "requester teardown failed");
    }
}
