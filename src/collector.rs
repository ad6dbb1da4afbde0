//! Sample aggregation into the latency histogram.

use crossbeam_channel::{Receiver, select};
use hdrhistogram::{Histogram, RecordError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Histogram range: 1 ms to 100 s in nanoseconds, five significant figures.
pub const MIN_RECORDABLE_NS: u64 = 1_000_000;
pub const MAX_RECORDABLE_NS: u64 = 100_000_000_000;
pub const SIGNIFICANT_FIGURES: u8 = 5;

pub fn new_latency_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(MIN_RECORDABLE_NS, MAX_RECORDABLE_NS, SIGNIFICANT_FIGURES)
        .expect("latency histogram bounds are valid")
}

/// Everything the collector accumulated over a run.
#[derive(Debug)]
pub struct Collected {
    pub success_total: u64,
    pub avg_request_time_ms: f64,
    pub histogram: Histogram<u64>,
    /// Error key -> count, in first-seen order.
    pub errors: Vec<(String, u64)>,
}

/// Single consumer of worker samples. Owns the histogram and the error map
/// exclusively for the duration of the run.
pub struct Collector {
    base_latency_ns: i64,
}

impl Collector {
    pub fn new(base_latency_ns: i64) -> Self {
        Self { base_latency_ns }
    }

    /// Consume samples until `stop` fires, then drain whatever is still
    /// buffered so no sample is lost.
    ///
    /// A histogram recording failure means the latency bound is
    /// misconfigured; it clears `running` so the ticker winds the run down,
    /// keeps consuming so workers are not left blocked on a full channel,
    /// and is returned once the drain completes.
    pub fn run(
        self,
        results: Receiver<i64>,
        errors: Receiver<String>,
        stop: Receiver<()>,
        running: &AtomicBool,
    ) -> Result<Collected, RecordError> {
        let mut state = CollectorState::new(self.base_latency_ns);
        let mut fatal: Option<RecordError> = None;

        loop {
            select! {
                recv(results) -> sample => {
                    if let Ok(sample) = sample
                        && fatal.is_none()
                        && let Err(e) = state.record(sample)
                    {
                        tracing::error!(error = %e, sample, "failed to record latency");
                        running.store(false, Ordering::Relaxed);
                        fatal = Some(e);
                    }
                }
                recv(errors) -> key => {
                    if let Ok(key) = key {
                        state.count_error(key);
                    }
                }
                recv(stop) -> _ => break,
            }
        }

        while let Ok(sample) = results.try_recv() {
            if fatal.is_none()
                && let Err(e) = state.record(sample)
            {
                tracing::error!(error = %e, sample, "failed to record latency");
                running.store(false, Ordering::Relaxed);
                fatal = Some(e);
            }
        }
        while let Ok(key) = errors.try_recv() {
            state.count_error(key);
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(state.finish()),
        }
    }
}

struct CollectorState {
    base_latency_ns: i64,
    histogram: Histogram<u64>,
    success_total: u64,
    avg_request_time_ms: f64,
    error_counts: HashMap<String, u64>,
    error_order: Vec<String>,
}

impl CollectorState {
    fn new(base_latency_ns: i64) -> Self {
        Self {
            base_latency_ns,
            histogram: new_latency_histogram(),
            success_total: 0,
            avg_request_time_ms: 0.0,
            error_counts: HashMap::new(),
            error_order: Vec::new(),
        }
    }

    fn record(&mut self, sample: i64) -> Result<(), RecordError> {
        self.success_total += 1;
        let corrected = (sample - self.base_latency_ns).max(0) as u64;
        self.histogram.record(corrected)?;
        let n = self.success_total as f64;
        self.avg_request_time_ms =
            (self.avg_request_time_ms * (n - 1.0) + (sample / 1_000_000) as f64) / n;
        Ok(())
    }

    fn count_error(&mut self, key: String) {
        match self.error_counts.get_mut(&key) {
            Some(count) => *count += 1,
            None => {
                self.error_counts.insert(key.clone(), 1);
                self.error_order.push(key);
            }
        }
    }

    fn finish(mut self) -> Collected {
        let errors = self
            .error_order
            .into_iter()
            .map(|key| {
                let count = self.error_counts.remove(&key).unwrap_or(0);
                (key, count)
            })
            .collect();

        Collected {
            success_total: self.success_total,
            avg_request_time_ms: self.avg_request_time_ms,
            histogram: self.histogram,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::Arc;
    use std::thread;

    struct Channels {
        result_tx: crossbeam_channel::Sender<i64>,
        error_tx: crossbeam_channel::Sender<String>,
        stop_tx: crossbeam_channel::Sender<()>,
        running: Arc<AtomicBool>,
        handle: thread::JoinHandle<Result<Collected, RecordError>>,
    }

    fn spawn_collector(base_latency_ns: i64) -> Channels {
        let (result_tx, result_rx) = bounded::<i64>(100);
        let (error_tx, error_rx) = bounded::<String>(100);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = Arc::clone(&running);
            thread::spawn(move || {
                Collector::new(base_latency_ns).run(result_rx, error_rx, stop_rx, &running)
            })
        };

        Channels {
            result_tx,
            error_tx,
            stop_tx,
            running,
            handle,
        }
    }

    #[test]
    fn test_base_latency_subtracted() {
        let c = spawn_collector(2_000_000);
        c.result_tx.send(5_000_000).unwrap();
        c.stop_tx.send(()).unwrap();
        let collected = c.handle.join().unwrap().unwrap();

        assert_eq!(collected.success_total, 1);
        assert_eq!(collected.histogram.len(), 1);
        assert_eq!(collected.histogram.max(), 3_000_000);
    }

    #[test]
    fn test_zero_latency_clamped_not_negative() {
        // A 0 ns measurement with a positive base latency records 0.
        let c = spawn_collector(10_000_000);
        c.result_tx.send(0).unwrap();
        c.stop_tx.send(()).unwrap();
        let collected = c.handle.join().unwrap().unwrap();

        assert_eq!(collected.success_total, 1);
        assert_eq!(collected.histogram.len(), 1);
        assert_eq!(collected.histogram.min(), 0);
    }

    #[test]
    fn test_buffered_samples_drained_on_stop() {
        let c = spawn_collector(0);
        // Samples racing with the stop signal: whether they are consumed in
        // the select loop or in the post-stop drain, none may be lost.
        for i in 0..10 {
            c.result_tx.send(i * 1_000_000).unwrap();
        }
        c.error_tx.send("connection refused".to_string()).unwrap();
        c.stop_tx.send(()).unwrap();
        drop(c.result_tx);
        drop(c.error_tx);
        let collected = c.handle.join().unwrap().unwrap();

        assert_eq!(collected.success_total, 10);
        assert_eq!(collected.histogram.len(), 10);
        assert_eq!(collected.errors, vec![("connection refused".to_string(), 1)]);
    }

    #[test]
    fn test_error_keys_counted_in_first_seen_order() {
        let c = spawn_collector(0);
        for key in ["b", "a", "b", "b", "a", "c"] {
            c.error_tx.send(key.to_string()).unwrap();
        }
        c.stop_tx.send(()).unwrap();
        let collected = c.handle.join().unwrap().unwrap();

        assert_eq!(
            collected.errors,
            vec![
                ("b".to_string(), 3),
                ("a".to_string(), 2),
                ("c".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_out_of_range_sample_is_fatal() {
        let c = spawn_collector(0);
        // Two hundred seconds, double the histogram ceiling.
        c.result_tx.send(200_000_000_000).unwrap();
        c.stop_tx.send(()).unwrap();
        let result = c.handle.join().unwrap();

        assert!(result.is_err());
        assert!(!c.running.load(Ordering::Relaxed));
    }

    #[test]
    fn test_running_mean_in_ms() {
        let c = spawn_collector(0);
        c.result_tx.send(2_000_000).unwrap();
        c.result_tx.send(4_000_000).unwrap();
        c.stop_tx.send(()).unwrap();
        let collected = c.handle.join().unwrap().unwrap();

        assert!((collected.avg_request_time_ms - 3.0).abs() < f64::EPSILON);
    }
}
