//! Tick synthesis at the target request rate.
//!
//! The ticker is the closed-loop generator's clock: it emits one tick per
//! `expected_interval` onto a rendezvous channel and never blocks on a
//! saturated worker pool. A tick nobody is ready to receive is dropped and
//! counted as missed, which keeps the clock honest and makes saturation
//! observable instead of silently slowing the rate.

use crate::timer;
use crossbeam_channel::{Sender, TrySendError, after, select, tick};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Multiple of the OS timer resolution below which the sleeping strategy
/// can no longer be trusted to wake on time.
const SLEEP_RESOLUTION_MARGIN: u32 = 7;

/// Multiple of the OS timer resolution above which even the tight strategy
/// cannot reliably hit the interval.
const UNRELIABLE_RESOLUTION_MARGIN: u32 = 3;

/// Startup grace so workers reach their channel receive before the first
/// tick is offered.
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// Pacing strategy, selected once at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// OS-timer driven; used when the interval comfortably exceeds the
    /// host timer resolution.
    Sleeping,
    /// Spin-polls the monotonic clock; trades a core for accuracy.
    Tight,
}

impl Strategy {
    pub fn select(
        expected_interval: Duration,
        timer_resolution: Duration,
        force_tight: bool,
    ) -> Self {
        if !force_tight && expected_interval >= SLEEP_RESOLUTION_MARGIN * timer_resolution {
            Strategy::Sleeping
        } else {
            Strategy::Tight
        }
    }
}

/// Tick accounting, written exactly once when the ticker finishes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    pub timely_ticks: u64,
    pub missed_ticks: u64,
    /// Wall-clock time from the first tick to shutdown.
    pub elapsed: Duration,
}

pub struct Ticker {
    expected_interval: Duration,
    duration: Duration,
    force_tight: bool,
}

impl Ticker {
    pub fn new(expected_interval: Duration, duration: Duration, force_tight: bool) -> Self {
        Self {
            expected_interval,
            duration,
            force_tight,
        }
    }

    /// Run to completion, offering ticks on `out`. The channel is closed by
    /// dropping `out` when the duration elapses or `running` clears.
    pub fn run(self, out: Sender<Instant>, running: &AtomicBool) -> TickStats {
        let resolution = timer::detect_timer_resolution();
        let strategy = Strategy::select(self.expected_interval, resolution, self.force_tight);
        tracing::info!(
            expected_interval = ?self.expected_interval,
            timer_resolution = ?resolution,
            ?strategy,
            "ticker calibrated"
        );
        if UNRELIABLE_RESOLUTION_MARGIN * resolution > self.expected_interval {
            tracing::warn!(
                timer_resolution = ?resolution,
                expected_interval = ?self.expected_interval,
                "OS timer resolution may not be sufficient for the requested rate"
            );
        }

        std::thread::sleep(STARTUP_GRACE);

        match strategy {
            Strategy::Sleeping => self.sleeping(out, running),
            Strategy::Tight => self.tight(out, running),
        }
    }

    fn sleeping(self, out: Sender<Instant>, running: &AtomicBool) -> TickStats {
        let start = Instant::now();
        let deadline = after(self.duration);
        let interval = tick(self.expected_interval);

        let mut stats = TickStats::default();

        // Initial tick fires immediately. Workers are already parked on the
        // rendezvous channel after the startup grace, so a blocking send is
        // safe here and guarantees the run starts with a timely tick.
        if out.send(start).is_ok() {
            stats.timely_ticks += 1;
        }

        loop {
            select! {
                recv(interval) -> t => {
                    if let Ok(t) = t {
                        match out.try_send(t) {
                            Ok(()) => stats.timely_ticks += 1,
                            Err(TrySendError::Full(_)) => stats.missed_ticks += 1,
                            Err(TrySendError::Disconnected(_)) => break,
                        }
                    }
                }
                recv(deadline) -> _ => break,
            }
            if !running.load(Ordering::Relaxed) {
                break;
            }
        }

        stats.elapsed = start.elapsed();
        stats
    }

    fn tight(self, out: Sender<Instant>, running: &AtomicBool) -> TickStats {
        let start = Instant::now();
        let mut last_tick = start;

        let mut stats = TickStats::default();

        loop {
            let this_tick = loop {
                let now = Instant::now();
                if now.duration_since(last_tick) >= self.expected_interval {
                    // Advance by the nominal interval, never by the measured
                    // elapsed, so jitter cannot accumulate into rate drift.
                    last_tick += self.expected_interval;
                    break now;
                }
            };

            match out.try_send(this_tick) {
                Ok(()) => stats.timely_ticks += 1,
                Err(TrySendError::Full(_)) => stats.missed_ticks += 1,
                Err(TrySendError::Disconnected(_)) => break,
            }

            if this_tick.duration_since(start) > self.duration || !running.load(Ordering::Relaxed)
            {
                break;
            }
        }

        stats.elapsed = start.elapsed();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_strategy_selection() {
        let res = Duration::from_millis(1);
        assert_eq!(
            Strategy::select(Duration::from_millis(10), res, false),
            Strategy::Sleeping
        );
        assert_eq!(
            Strategy::select(Duration::from_millis(5), res, false),
            Strategy::Tight
        );
        // Exactly at the margin still sleeps.
        assert_eq!(
            Strategy::select(Duration::from_millis(7), res, false),
            Strategy::Sleeping
        );
        // The override always wins.
        assert_eq!(
            Strategy::select(Duration::from_secs(1), res, true),
            Strategy::Tight
        );
    }

    fn run_ticker(
        interval: Duration,
        duration: Duration,
        force_tight: bool,
        consume: impl FnOnce(crossbeam_channel::Receiver<Instant>) + Send + 'static,
    ) -> TickStats {
        let (tx, rx) = bounded::<Instant>(0);
        let running = Arc::new(AtomicBool::new(true));

        let consumer = thread::spawn(move || consume(rx));

        let ticker = Ticker::new(interval, duration, force_tight);
        let stats = ticker.run(tx, &running);
        consumer.join().unwrap();
        stats
    }

    #[test]
    fn test_tight_ticker_rate_accounting() {
        // 1 ms interval for 200 ms with a fast consumer: the total tick
        // count tracks elapsed/interval regardless of how many rendezvous.
        let stats = run_ticker(
            Duration::from_millis(1),
            Duration::from_millis(200),
            true,
            |rx| {
                for _ in rx.iter() {}
            },
        );

        let total = stats.timely_ticks + stats.missed_ticks;
        assert!(total >= 190, "expected ~200 ticks, got {total}");
        assert!(total <= 260, "expected ~200 ticks, got {total}");
        assert!(stats.elapsed >= Duration::from_millis(200));
    }

    #[test]
    fn test_sleeping_ticker_emits_initial_tick() {
        let stats = run_ticker(
            Duration::from_millis(50),
            Duration::from_millis(240),
            false,
            |rx| {
                for _ in rx.iter() {}
            },
        );

        // Initial tick plus ~4 interval ticks.
        assert!(stats.timely_ticks + stats.missed_ticks >= 4);
        assert!(stats.timely_ticks >= 1);
        assert!(stats.elapsed >= Duration::from_millis(240));
    }

    #[test]
    fn test_busy_receiver_misses_ticks() {
        // A consumer that takes one tick and then stalls: subsequent ticks
        // are dropped as missed, never queued.
        let stats = run_ticker(
            Duration::from_millis(1),
            Duration::from_millis(150),
            true,
            |rx| {
                let _ = rx.recv();
                thread::sleep(Duration::from_millis(400));
                for _ in rx.iter() {}
            },
        );

        assert!(stats.missed_ticks > 0);
        assert!(stats.timely_ticks >= 1);
    }

    #[test]
    fn test_interrupt_closes_early() {
        let (tx, rx) = bounded::<Instant>(0);
        let running = Arc::new(AtomicBool::new(true));

        let stop = Arc::clone(&running);
        let consumer = thread::spawn(move || {
            let mut n = 0u64;
            for _ in rx.iter() {
                n += 1;
                if n == 3 {
                    stop.store(false, Ordering::Relaxed);
                }
            }
            n
        });

        let ticker = Ticker::new(Duration::from_millis(10), Duration::from_secs(30), true);
        let stats = ticker.run(tx, &running);
        let received = consumer.join().unwrap();

        assert!(received >= 3);
        // Closed well before the nominal 30s duration.
        assert!(stats.elapsed < Duration::from_secs(5));
    }
}
