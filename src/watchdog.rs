//! Sufficiency and stall watchdog
//!
//! Polls the telemetry iteration once per tick. An experiment ends either
//! when the iteration exceeds the minimum number of observations or when
//! it has not advanced for longer than the stall timeout. Both paths raise
//! the reset signal, pulse the reset line and clear the telemetry state.

use crate::config::PortSettings;
use crate::link::{self, LinkError, ResetLine};
use crate::telemetry::IterationState;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest single sleep, so `stop()` is noticed quickly even with long ticks
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Why a reset was performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Iteration exceeded the minimum number of observations
    Threshold,
    /// No progress within the stall timeout
    Timeout,
    /// Operator asked for the next experiment
    Manual,
}

/// Single pending "advance to the next experiment" flag.
///
/// Raising an already raised signal is a no-op; the consumer takes it.
#[derive(Debug, Default)]
pub struct ResetSignal {
    pending: AtomicBool,
}

impl ResetSignal {
    /// Returns true if the signal was not already pending
    pub fn raise(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    /// Consume the signal, returning whether one was pending
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// The tick-by-tick decision, without threads or I/O
#[derive(Debug, Clone)]
pub struct StallDetector {
    min_observations: u32,
    stall_timeout: Duration,
    baseline: u32,
    idle: Duration,
}

impl StallDetector {
    pub fn new(min_observations: u32, stall_timeout: Duration) -> Self {
        Self {
            min_observations,
            stall_timeout,
            baseline: 0,
            idle: Duration::ZERO,
        }
    }

    /// Evaluate one tick. `elapsed` is the wall time since the previous tick.
    pub fn tick(&mut self, iteration: u32, elapsed: Duration) -> Option<Trigger> {
        if iteration > self.baseline {
            self.baseline = iteration;
            self.idle = Duration::ZERO;
            if iteration > self.min_observations {
                self.rearm();
                return Some(Trigger::Threshold);
            }
            return None;
        }

        // A drop means the reader lost sync or the target restarted
        self.baseline = iteration;
        self.idle += elapsed;
        if self.idle > self.stall_timeout {
            self.rearm();
            return Some(Trigger::Timeout);
        }
        None
    }

    /// Forget the baseline and the idle time
    pub fn rearm(&mut self) {
        self.baseline = 0;
        self.idle = Duration::ZERO;
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }
}

/// How many resets each path has performed
#[derive(Debug, Default)]
pub struct TriggerCounts {
    threshold: AtomicU32,
    timeout: AtomicU32,
    manual: AtomicU32,
}

impl TriggerCounts {
    fn record(&self, trigger: Trigger) {
        let counter = match trigger {
            Trigger::Threshold => &self.threshold,
            Trigger::Timeout => &self.timeout,
            Trigger::Manual => &self.manual,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn threshold(&self) -> u32 {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn timeout(&self) -> u32 {
        self.timeout.load(Ordering::Relaxed)
    }

    pub fn manual(&self) -> u32 {
        self.manual.load(Ordering::Relaxed)
    }
}

struct Shared {
    state: Arc<IterationState>,
    /// While set, ticks neither count idle time nor trigger
    paused: AtomicBool,
    signal: ResetSignal,
    counts: TriggerCounts,
    detector: Mutex<StallDetector>,
    reset_line: Mutex<Option<Box<dyn ResetLine>>>,
}

impl Shared {
    fn detector(&self) -> MutexGuard<'_, StallDetector> {
        self.detector.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn tick(&self, elapsed: Duration) -> Option<Trigger> {
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        let iteration = self.state.get_iteration();
        let trigger = self.detector().tick(iteration, elapsed)?;

        match trigger {
            Trigger::Threshold => log::info!("Enough observations read ({})", iteration),
            Trigger::Timeout => log::warn!("No telemetry progress, stall timeout reached"),
            Trigger::Manual => {}
        }
        self.reset(trigger);
        Some(trigger)
    }

    fn reset(&self, trigger: Trigger) {
        if !self.signal.raise() {
            log::debug!("Reset signal already pending");
        }
        self.pulse();
        self.counts.record(trigger);
    }

    /// Send the reset byte and clear the telemetry state
    fn pulse(&self) {
        let mut line = self.reset_line.lock().unwrap_or_else(|p| p.into_inner());
        match line.as_mut() {
            Some(line) => match line.send_reset() {
                Ok(()) => log::info!("Reset sent to target"),
                Err(e) => log::warn!("Failed to send reset: {}", e),
            },
            None => log::warn!("Reset line not connected, target not reset"),
        }
        drop(line);

        self.state.clear();
    }
}

/// Background watchdog over a telemetry reader's state
pub struct Watchdog {
    shared: Arc<Shared>,
    tick: Duration,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(
        state: Arc<IterationState>,
        min_observations: u32,
        stall_timeout: Duration,
        tick: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state,
                paused: AtomicBool::new(false),
                signal: ResetSignal::default(),
                counts: TriggerCounts::default(),
                detector: Mutex::new(StallDetector::new(min_observations, stall_timeout)),
                reset_line: Mutex::new(None),
            }),
            tick,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Open the reset port. On failure the watchdog keeps running without
    /// it and experiments can only end through the signal path.
    pub fn connect(&self, settings: &PortSettings) -> Result<(), LinkError> {
        match link::open_reset(settings) {
            Ok(line) => {
                log::info!("Reset line connected on {} at {} baud", settings.port, settings.baud);
                self.connect_with(line);
                Ok(())
            }
            Err(e) => {
                log::warn!("Reset connection failed: {}", e);
                *self.shared.reset_line.lock().unwrap_or_else(|p| p.into_inner()) = None;
                Err(e)
            }
        }
    }

    pub fn connect_with(&self, line: Box<dyn ResetLine>) {
        *self.shared.reset_line.lock().unwrap_or_else(|p| p.into_inner()) = Some(line);
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .reset_line
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Start observing on a background thread
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.shared.detector().rearm();
        self.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let tick = self.tick;

        self.handle = Some(thread::spawn(move || {
            let mut last = Instant::now();
            while running.load(Ordering::SeqCst) {
                if !sleep_while_running(&running, tick) {
                    break;
                }
                let now = Instant::now();
                shared.tick(now - last);
                last = now;
            }
            log::debug!("Watchdog thread exiting");
        }));
    }

    /// Run a single tick on the calling thread
    #[cfg(test)]
    pub fn tick(&self, elapsed: Duration) -> Option<Trigger> {
        self.shared.tick(elapsed)
    }

    /// Stop judging progress, e.g. while the firmware is being rebuilt
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Resume observing from a clean baseline
    pub fn resume(&self) {
        self.shared.detector().rearm();
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Reset now and signal the driver to move on
    pub fn manual_reset(&self) {
        log::info!("Manual reset requested");
        self.shared.detector().rearm();
        self.shared.reset(Trigger::Manual);
    }

    /// Reset the target without leaving the current experiment
    pub fn restart_target(&self) {
        log::info!("Restarting target for the current experiment");
        self.shared.detector().rearm();
        self.shared.pulse();
    }

    pub fn signal(&self) -> &ResetSignal {
        &self.shared.signal
    }

    pub fn counts(&self) -> &TriggerCounts {
        &self.shared.counts
    }

    pub fn idle(&self) -> Duration {
        self.shared.detector().idle()
    }

    /// Stop the thread and drop the reset connection
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Watchdog thread panicked");
            }
        }
        *self.shared.reset_line.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep for `total` in short slices. Returns false if stopped meanwhile.
pub(crate) fn sleep_while_running(running: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::fake::{BrokenReset, CountingReset, ScriptedSource};
    use crate::telemetry::TelemetryReader;

    const TICK: Duration = Duration::from_secs(1);

    fn watchdog(min: u32, timeout_secs: u64) -> (Arc<IterationState>, Watchdog, CountingReset) {
        let state = Arc::new(IterationState::new(50));
        let wd = Watchdog::new(
            Arc::clone(&state),
            min,
            Duration::from_secs(timeout_secs),
            TICK,
        );
        let resets = CountingReset::default();
        wd.connect_with(Box::new(resets.clone()));
        (state, wd, resets)
    }

    fn feed(state: &IterationState, n: u32) {
        state.observe(format!("iteration: {}", n).as_bytes());
    }

    #[test]
    fn test_signal_is_idempotent() {
        let signal = ResetSignal::default();
        assert!(signal.raise());
        assert!(!signal.raise());
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn test_manual_reset_twice_leaves_one_pending_signal() {
        let (_, wd, resets) = watchdog(100, 60);
        wd.manual_reset();
        wd.manual_reset();

        assert!(wd.signal().take());
        assert!(!wd.signal().take());
        assert_eq!(resets.count(), 2);
        assert_eq!(wd.counts().manual(), 2);
    }

    #[test]
    fn test_detector_progress_resets_idle() {
        let mut d = StallDetector::new(10, Duration::from_secs(5));
        assert_eq!(d.tick(0, TICK), None);
        assert_eq!(d.idle(), TICK);
        assert_eq!(d.tick(3, TICK), None);
        assert_eq!(d.idle(), Duration::ZERO);
        assert_eq!(d.tick(3, TICK), None);
        assert_eq!(d.idle(), TICK);
    }

    #[test]
    fn test_threshold_fires_once() {
        let (state, wd, resets) = watchdog(10, 60);
        let mut triggers = Vec::new();
        for n in 1..=11 {
            feed(&state, n);
            triggers.extend(wd.tick(TICK));
        }
        // The target keeps running until the reset lands
        for n in 1..=3 {
            feed(&state, n);
            triggers.extend(wd.tick(TICK));
        }

        assert_eq!(triggers, vec![Trigger::Threshold]);
        assert_eq!(resets.count(), 1);
        assert_eq!(wd.counts().threshold(), 1);
        assert_eq!(wd.counts().timeout(), 0);
        assert!(wd.signal().is_pending());
    }

    #[test]
    fn test_stall_fires_once_via_timeout() {
        let (state, wd, resets) = watchdog(100, 10);
        for n in 1..=5 {
            feed(&state, n);
        }

        let triggers: Vec<_> = (0..20).filter_map(|_| wd.tick(TICK)).collect();

        // one tick of progress, then ten idle ticks reach the limit and the
        // eleventh exceeds it; the remaining eight stay under it again
        assert_eq!(triggers, vec![Trigger::Timeout]);
        assert_eq!(resets.count(), 1);
        assert_eq!(wd.counts().timeout(), 1);
        assert_eq!(wd.counts().threshold(), 0);
        assert_eq!(state.get_iteration(), 0);
        assert!(wd.signal().take());
    }

    #[test]
    fn test_reset_without_line_still_signals() {
        let state = Arc::new(IterationState::new(50));
        let wd = Watchdog::new(Arc::clone(&state), 100, Duration::from_secs(2), TICK);
        assert!(!wd.is_connected());

        feed(&state, 1);
        let triggers: Vec<_> = (0..4).filter_map(|_| wd.tick(TICK)).collect();
        assert_eq!(triggers, vec![Trigger::Timeout]);
        assert!(wd.signal().take());
    }

    #[test]
    fn test_failed_reset_write_is_not_fatal() {
        let (state, wd, _) = watchdog(2, 60);
        wd.connect_with(Box::new(BrokenReset));
        for n in 1..=3 {
            feed(&state, n);
            wd.tick(TICK);
        }
        assert!(wd.signal().take());
        assert_eq!(state.get_iteration(), 0);
    }

    #[test]
    fn test_paused_watchdog_does_not_fire() {
        let (state, wd, resets) = watchdog(3, 2);
        wd.pause();
        for n in 1..=5 {
            feed(&state, n);
        }
        let triggers: Vec<_> = (0..10).filter_map(|_| wd.tick(TICK)).collect();
        assert!(triggers.is_empty());
        assert_eq!(resets.count(), 0);

        wd.resume();
        assert_eq!(wd.tick(TICK), Some(Trigger::Threshold));
    }

    #[test]
    fn test_restart_target_does_not_signal() {
        let (state, wd, resets) = watchdog(100, 60);
        feed(&state, 1);
        wd.restart_target();
        assert_eq!(resets.count(), 1);
        assert!(!wd.signal().is_pending());
        assert_eq!(state.get_iteration(), 0);
    }

    #[test]
    fn test_end_to_end_scenario() {
        let (state, wd, resets) = watchdog(250, 120);
        let mut fired_at = Vec::new();

        for n in 1..=251 {
            feed(&state, n);
            if n <= 250 {
                assert!(state.get_valid());
                assert_eq!(state.get_iteration(), n);
            }
            if wd.tick(TICK).is_some() {
                fired_at.push(n);
            }
        }

        assert_eq!(fired_at, vec![251]);
        assert_eq!(resets.count(), 1);
        assert_eq!(state.get_iteration(), 0);
        assert!(wd.signal().is_pending());
    }

    #[test]
    fn test_watchdog_thread_with_reader() {
        let mut reader = TelemetryReader::new(50, Duration::from_millis(5));
        let mut wd = Watchdog::new(
            reader.state(),
            25,
            Duration::from_secs(60),
            Duration::from_millis(10),
        );
        let resets = CountingReset::default();
        wd.connect_with(Box::new(resets.clone()));
        wd.start();

        reader.start_with(Box::new(ScriptedSource::new(
            (1..=30).map(|n| format!("iteration: {}", n)),
        )));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !wd.signal().is_pending() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        // let a few more ticks pass with no further progress
        thread::sleep(Duration::from_millis(100));

        wd.stop();
        reader.stop();
        assert!(wd.signal().take());
        assert_eq!(resets.count(), 1);
        assert_eq!(wd.counts().threshold(), 1);
        assert!(!wd.is_connected());
    }
}
