//! Benchmark driver: wires the ticker, workers, and collector together.

use crate::collector::Collector;
use crate::requester::RequesterFactory;
use crate::summary::{Summary, normalize_errors, percentage};
use crate::ticker::Ticker;
use crate::worker::{self, SetupFailure, WorkerTotals};
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Capacity of the results and errors channels. A stalled collector exerts
/// backpressure on workers at this depth, never on the ticker.
const SAMPLE_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("invalid benchmark configuration: {0}")]
    Config(String),
    #[error("requester factory failed for connection {number}: {message}")]
    Factory { number: u64, message: String },
    #[error("requester setup failed: {0}")]
    Setup(String),
    #[error("failed to record latency: {0}")]
    Record(#[from] hdrhistogram::RecordError),
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("{0} thread panicked")]
    ThreadPanic(&'static str),
}

/// Immutable run parameters, shared by reference with every component.
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub request_rate: f64,
    pub connections: u64,
    pub duration: Duration,
    pub base_latency: Duration,
    /// 1 s / `request_rate`.
    pub expected_interval: Duration,
    pub force_tight_ticker: bool,
}

impl BenchmarkConfig {
    pub fn new(
        request_rate: f64,
        connections: u64,
        duration: Duration,
        base_latency: Duration,
        force_tight_ticker: bool,
    ) -> Result<Self, BenchError> {
        if !(request_rate > 0.0) {
            return Err(BenchError::Config(
                "request rate must be positive".to_string(),
            ));
        }
        if duration.is_zero() {
            return Err(BenchError::Config("duration must be positive".to_string()));
        }
        let connections = connections.max(1);

        Ok(Self {
            request_rate,
            connections,
            duration,
            base_latency,
            expected_interval: Duration::from_secs_f64(1.0 / request_rate),
            force_tight_ticker,
        })
    }
}

/// Drives a system benchmark: synthesizes ticks at the target rate, fans
/// them out across one worker per connection, and aggregates per-request
/// latencies into a summary.
pub struct Benchmark {
    config: BenchmarkConfig,
    factory: Box<dyn RequesterFactory>,
}

impl Benchmark {
    pub fn new(config: BenchmarkConfig, factory: Box<dyn RequesterFactory>) -> Self {
        Self { config, factory }
    }

    /// Run the benchmark to completion and summarize the results. Clearing
    /// `running` (e.g. from a signal handler) ends the run early but still
    /// produces a valid summary.
    pub fn run(&self, output_json: bool, running: Arc<AtomicBool>) -> Result<Summary, BenchError> {
        let (tick_tx, tick_rx) = bounded::<Instant>(0);
        let (result_tx, result_rx) = bounded::<i64>(SAMPLE_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = bounded::<String>(SAMPLE_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let totals = Arc::new(WorkerTotals::default());
        let setup_failure = Arc::new(SetupFailure::default());

        // Requesters are constructed up front so a factory error surfaces
        // before any thread starts.
        let mut requesters = Vec::with_capacity(self.config.connections as usize);
        for number in 0..self.config.connections {
            let requester =
                self.factory
                    .get_requester(number)
                    .map_err(|e| BenchError::Factory {
                        number,
                        message: e.to_string(),
                    })?;
            requesters.push(requester);
        }

        let mut worker_handles = Vec::with_capacity(requesters.len());
        for (number, requester) in requesters.into_iter().enumerate() {
            let ticks = tick_rx.clone();
            let results = result_tx.clone();
            let errors = error_tx.clone();
            let totals = Arc::clone(&totals);
            let running = Arc::clone(&running);
            let setup_failure = Arc::clone(&setup_failure);
            let expected_interval = self.config.expected_interval;

            let handle = thread::Builder::new()
                .name(format!("worker-{number}"))
                .spawn(move || {
                    worker::run(
                        number as u64,
                        requester,
                        expected_interval,
                        ticks,
                        results,
                        errors,
                        &totals,
                        &running,
                        &setup_failure,
                    )
                })
                .map_err(|e| BenchError::Spawn("worker", e))?;
            worker_handles.push(handle);
        }
        // Only workers hold tick receivers and sample senders now; dropping
        // ours lets channel closure propagate naturally at end of run.
        drop(tick_rx);
        drop(result_tx);
        drop(error_tx);

        let ticker = Ticker::new(
            self.config.expected_interval,
            self.config.duration,
            self.config.force_tight_ticker,
        );
        let ticker_handle = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("ticker".to_string())
                .spawn(move || ticker.run(tick_tx, &running))
                .map_err(|e| BenchError::Spawn("ticker", e))?
        };

        let collector = Collector::new(self.config.base_latency.as_nanos() as i64);
        let collector_handle = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("collector".to_string())
                .spawn(move || collector.run(result_rx, error_rx, stop_rx, &running))
                .map_err(|e| BenchError::Spawn("collector", e))?
        };

        // Workers exit once the ticker closes the tick channel and the
        // remaining ticks are drained.
        let mut worker_panicked = false;
        for handle in worker_handles {
            if handle.join().is_err() {
                worker_panicked = true;
                running.store(false, Ordering::Relaxed);
            }
        }

        let tick_stats = ticker_handle
            .join()
            .map_err(|_| BenchError::ThreadPanic("ticker"))?;

        let _ = stop_tx.send(());
        let collected = collector_handle
            .join()
            .map_err(|_| BenchError::ThreadPanic("collector"))??;

        if let Some(message) = setup_failure.take() {
            return Err(BenchError::Setup(message));
        }
        if worker_panicked {
            return Err(BenchError::ThreadPanic("worker"));
        }

        let success_total = totals.success.load(Ordering::Relaxed);
        let error_total = totals.error.load(Ordering::Relaxed);
        let timely_sends = totals.timely_sends.load(Ordering::Relaxed);
        let late_sends = totals.late_sends.load(Ordering::Relaxed);

        tracing::info!(
            ticks = tick_stats.timely_ticks + tick_stats.missed_ticks,
            timely_ticks = tick_stats.timely_ticks,
            missed_ticks = tick_stats.missed_ticks,
            sends = timely_sends + late_sends,
            timely_sends,
            late_sends,
            "run complete"
        );

        let request_total = success_total + error_total;
        let elapsed_secs = tick_stats.elapsed.as_secs_f64();
        let throughput = if elapsed_secs > 0.0 {
            request_total as f64 / elapsed_secs
        } else {
            0.0
        };

        Ok(Summary {
            connections: self.config.connections,
            request_rate: self.config.request_rate,
            success_total,
            error_total,
            elapsed: tick_stats.elapsed,
            throughput,
            avg_request_time_ms: collected.avg_request_time_ms,
            errors: normalize_errors(collected.errors),
            timely_ticks: tick_stats.timely_ticks,
            timely_ticks_ratio: percentage(
                tick_stats.timely_ticks,
                tick_stats.timely_ticks + tick_stats.missed_ticks,
            ),
            timely_sends,
            timely_sends_ratio: percentage(timely_sends, timely_sends + late_sends),
            histogram: collected.histogram,
            output_json,
        })
    }
}
