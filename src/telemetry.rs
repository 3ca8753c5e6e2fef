//! Telemetry reader
//!
//! Reads lines from the target's console, extracts `iteration: <n>` and
//! keeps track of whether the target is producing an in-sequence run.
//!
//! The iteration counter, the valid flag and the no-match counter are
//! packed into one `AtomicU64` so that a `clear()` issued by the driver or
//! the watchdog can never be overwritten by a stale update from the reader
//! thread: every update is a compare-and-swap against the value it was
//! computed from.

use crate::config::PortSettings;
use crate::link::{self, LineSource, LinkError};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Text that precedes the iteration number on a telemetry line
const ITERATION_MARKER: &str = "iteration: ";

/// Pause after a failed read before trying again
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Decoded view of the packed iteration state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub iteration: u32,
    pub valid: bool,
    /// Consecutive lines that were not accepted
    pub no_match: u32,
}

impl Snapshot {
    // bit 0: valid, bits 1..32: no_match, bits 32..64: iteration
    fn pack(self) -> u64 {
        (u64::from(self.iteration) << 32)
            | (u64::from(self.no_match & 0x7fff_ffff) << 1)
            | u64::from(self.valid)
    }

    fn unpack(word: u64) -> Self {
        Self {
            iteration: (word >> 32) as u32,
            valid: word & 1 == 1,
            no_match: ((word >> 1) & 0x7fff_ffff) as u32,
        }
    }

    /// A reading is in sequence if it repeats the current iteration, is the
    /// next one, or is the first iteration of a fresh run.
    pub fn accepts(&self, value: u32) -> bool {
        value == self.iteration || Some(value) == self.iteration.checked_add(1) || value == 1
    }
}

/// What happened to a single telemetry line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// In-sequence reading, now the current iteration
    Accepted(u32),
    /// Reading that does not follow the current iteration
    OutOfSequence(u32),
    /// Line without an iteration reading
    NoMatch,
    /// Bytes that are not valid text
    Undecodable,
    /// The line pushed the no-match counter over the threshold and the
    /// state was cleared
    LostSync,
}

/// Shared iteration state.
///
/// Written by the reader thread through [`observe`](Self::observe); read by
/// everyone else. [`clear`](Self::clear) may be called from any thread.
#[derive(Debug)]
pub struct IterationState {
    word: AtomicU64,
    no_match_threshold: u32,
}

impl IterationState {
    pub fn new(no_match_threshold: u32) -> Self {
        Self {
            word: AtomicU64::new(Snapshot::default().pack()),
            no_match_threshold: no_match_threshold.min(0x7fff_fffe),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::unpack(self.word.load(Ordering::Acquire))
    }

    pub fn get_iteration(&self) -> u32 {
        self.snapshot().iteration
    }

    pub fn get_valid(&self) -> bool {
        self.snapshot().valid
    }

    /// Back to `{iteration: 0, valid: false}`
    pub fn clear(&self) {
        self.word.store(Snapshot::default().pack(), Ordering::Release);
    }

    /// Apply one raw telemetry line to the state
    pub fn observe(&self, line: &[u8]) -> Observation {
        let reading = match std::str::from_utf8(line) {
            Ok(text) => match parse_iteration(text) {
                Some(value) => Reading::Value(value),
                None => Reading::NoMatch,
            },
            Err(_) => Reading::Undecodable,
        };

        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let (next, observation) = self.step(Snapshot::unpack(current), reading);
            match self.word.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return observation,
                Err(actual) => current = actual,
            }
        }
    }

    fn step(&self, state: Snapshot, reading: Reading) -> (Snapshot, Observation) {
        let rejected = match reading {
            Reading::Value(value) if state.accepts(value) => {
                let next = Snapshot {
                    iteration: value,
                    valid: true,
                    no_match: 0,
                };
                return (next, Observation::Accepted(value));
            }
            Reading::Value(value) => Observation::OutOfSequence(value),
            Reading::NoMatch => Observation::NoMatch,
            Reading::Undecodable => Observation::Undecodable,
        };

        let no_match = state.no_match + 1;
        if no_match > self.no_match_threshold {
            (Snapshot::default(), Observation::LostSync)
        } else {
            (Snapshot { no_match, ..state }, rejected)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Reading {
    Value(u32),
    NoMatch,
    Undecodable,
}

/// Extract `n` from the first `iteration: n` in a line. A marker with no
/// digits after it is skipped.
pub fn parse_iteration(line: &str) -> Option<u32> {
    for (at, _) in line.match_indices(ITERATION_MARKER) {
        let rest = &line[at + ITERATION_MARKER.len()..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if end > 0 {
            return rest[..end].parse().ok();
        }
    }
    None
}

/// Destination file for accepted telemetry lines
#[derive(Default)]
struct Sink {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

/// Background reader for the telemetry link
pub struct TelemetryReader {
    state: Arc<IterationState>,
    sink: Arc<Mutex<Sink>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    read_timeout: Duration,
}

impl TelemetryReader {
    pub fn new(no_match_threshold: u32, read_timeout: Duration) -> Self {
        Self {
            state: Arc::new(IterationState::new(no_match_threshold)),
            sink: Arc::new(Mutex::new(Sink::default())),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            read_timeout,
        }
    }

    /// Handle to the shared state, for the watchdog
    pub fn state(&self) -> Arc<IterationState> {
        Arc::clone(&self.state)
    }

    /// Open the telemetry port and start reading.
    ///
    /// On failure the reader stays disconnected; call again with another
    /// port to retry.
    pub fn start(&mut self, settings: &PortSettings) -> Result<(), LinkError> {
        self.stop_thread();

        let source = link::open_telemetry(settings, self.read_timeout).map_err(|e| {
            log::warn!("Telemetry connection failed: {}", e);
            e
        })?;
        log::info!(
            "Telemetry connected on {} at {} baud",
            settings.port,
            settings.baud
        );
        self.start_with(source);
        Ok(())
    }

    /// Start reading from an already opened source
    pub fn start_with(&mut self, mut source: Box<dyn LineSource>) {
        self.stop_thread();
        self.running.store(true, Ordering::SeqCst);

        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.running);

        self.handle = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match source.read_line() {
                    Ok(Some(line)) => process_line(&state, &sink, &line),
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("Telemetry read error: {}", e);
                        thread::sleep(READ_ERROR_BACKOFF);
                    }
                }
            }
            log::debug!("Telemetry reader thread exiting");
        }));
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn get_iteration(&self) -> u32 {
        self.state.get_iteration()
    }

    pub fn get_valid(&self) -> bool {
        self.state.get_valid()
    }

    pub fn clear(&self) {
        self.state.clear();
    }

    /// Append accepted lines to `path` from now on. The file is truncated.
    pub fn set_output(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;

        let mut sink = lock_sink(&self.sink);
        if let Some(mut old) = sink.writer.take() {
            let _ = old.flush();
        }
        sink.writer = Some(BufWriter::new(file));
        sink.path = Some(path.to_path_buf());
        log::info!("Telemetry output: {}", path.display());
        Ok(())
    }

    #[cfg(test)]
    pub fn output_path(&self) -> Option<PathBuf> {
        lock_sink(&self.sink).path.clone()
    }

    /// Stop the reader thread, close the connection and the output file
    pub fn stop(&mut self) {
        self.stop_thread();

        let mut sink = lock_sink(&self.sink);
        if let Some(mut writer) = sink.writer.take() {
            if let Err(e) = writer.flush() {
                log::warn!("Failed to flush telemetry output: {}", e);
            }
        }
        sink.path = None;
    }

    fn stop_thread(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Telemetry reader thread panicked");
            }
        }
    }
}

impl Drop for TelemetryReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_sink(sink: &Mutex<Sink>) -> std::sync::MutexGuard<'_, Sink> {
    // A panic while holding the sink leaves only a half-written line behind
    sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn process_line(state: &IterationState, sink: &Mutex<Sink>, line: &[u8]) {
    match state.observe(line) {
        Observation::Accepted(iteration) => {
            log::debug!("Found iteration {}", iteration);
            let mut guard = lock_sink(sink);
            let Sink { path, writer } = &mut *guard;
            if let Some(writer) = writer.as_mut() {
                let written = writer
                    .write_all(line)
                    .and_then(|_| writer.write_all(b"\n"))
                    .and_then(|_| writer.flush());
                if let Err(e) = written {
                    let target = path.as_deref().unwrap_or_else(|| Path::new("telemetry output"));
                    log::warn!("Failed to write {}: {}", target.display(), e);
                }
            }
        }
        Observation::OutOfSequence(value) => {
            log::debug!("Discarding out-of-sequence iteration {}", value);
        }
        Observation::NoMatch => {
            log::trace!("No iteration in line: {}", String::from_utf8_lossy(line));
        }
        Observation::Undecodable => {
            log::debug!("Undecodable telemetry line ({} bytes)", line.len());
        }
        Observation::LostSync => {
            log::warn!("Unmatched telemetry lines exceeded threshold, state cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::fake::ScriptedSource;
    use proptest::prelude::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn line(n: u32) -> Vec<u8> {
        format!("core0 iteration: {} cycles: 12345", n).into_bytes()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_parse_iteration() {
        assert_eq!(parse_iteration("iteration: 42"), Some(42));
        assert_eq!(parse_iteration("[core 2] iteration: 7 cycles=99"), Some(7));
        assert_eq!(parse_iteration("iteration: "), None);
        assert_eq!(parse_iteration("iteration:5"), None);
        assert_eq!(parse_iteration("ITERATION: 5"), None);
        assert_eq!(parse_iteration("iteration: 99999999999"), None);
        assert_eq!(
            parse_iteration("iteration: start, core1 iteration: 12 done"),
            Some(12)
        );
        assert_eq!(parse_iteration("iteration: 3 iteration: 4"), Some(3));
    }

    #[test]
    fn test_pack_unpack() {
        let s = Snapshot {
            iteration: u32::MAX,
            valid: true,
            no_match: 17,
        };
        assert_eq!(Snapshot::unpack(s.pack()), s);
        assert_eq!(Snapshot::unpack(0), Snapshot::default());
    }

    #[test]
    fn test_progress_duplicate_and_restart() {
        let state = IterationState::new(50);
        assert_eq!(state.observe(&line(1)), Observation::Accepted(1));
        assert_eq!(state.observe(&line(2)), Observation::Accepted(2));
        assert_eq!(state.observe(&line(2)), Observation::Accepted(2));
        assert_eq!(state.observe(&line(1)), Observation::Accepted(1));
        assert_eq!(state.get_iteration(), 1);
        assert!(state.get_valid());
    }

    #[test]
    fn test_out_of_sequence_leaves_iteration() {
        let state = IterationState::new(50);
        for n in 1..=5 {
            state.observe(&line(n));
        }
        assert_eq!(state.observe(&line(9)), Observation::OutOfSequence(9));
        assert_eq!(state.get_iteration(), 5);
        assert!(state.get_valid());
        assert_eq!(state.snapshot().no_match, 1);

        // An accepted reading resets the counter
        state.observe(&line(6));
        assert_eq!(state.snapshot().no_match, 0);
    }

    #[test]
    fn test_threshold_clears_exactly_once() {
        let state = IterationState::new(3);
        for n in 1..=10 {
            state.observe(&line(n));
        }

        let outcomes: Vec<_> = (0..7).map(|_| state.observe(b"booting...")).collect();
        let lost = outcomes
            .iter()
            .filter(|o| **o == Observation::LostSync)
            .count();

        // Lines 1-3 are tolerated, line 4 exceeds the threshold, and the
        // counter restarts so lines 5-7 do not clear again.
        assert_eq!(lost, 1);
        assert_eq!(outcomes[3], Observation::LostSync);
        assert_eq!(state.get_iteration(), 0);
        assert!(!state.get_valid());
    }

    #[test]
    fn test_out_of_sequence_counts_toward_threshold() {
        let state = IterationState::new(2);
        state.observe(&line(1));
        assert_eq!(state.observe(&line(40)), Observation::OutOfSequence(40));
        assert_eq!(state.observe(b"noise"), Observation::NoMatch);
        assert_eq!(state.observe(&line(41)), Observation::LostSync);
        assert_eq!(state.snapshot(), Snapshot::default());
    }

    #[test]
    fn test_undecodable_is_counted() {
        let state = IterationState::new(1);
        state.observe(&line(1));
        assert_eq!(state.observe(&[0xff, 0xfe, b'\n']), Observation::Undecodable);
        assert_eq!(state.get_iteration(), 1);
        assert_eq!(state.observe(&[0xc3]), Observation::LostSync);
        assert_eq!(state.get_iteration(), 0);
    }

    #[test]
    fn test_clear() {
        let state = IterationState::new(50);
        state.observe(&line(1));
        state.observe(b"garbage");
        state.clear();
        assert_eq!(state.snapshot(), Snapshot::default());
    }

    proptest! {
        #[test]
        fn prop_sequence_validity(i in 1u32..100_000, v in 0u32..200_000) {
            let state = IterationState::new(u32::MAX);
            state.word.store(
                Snapshot { iteration: i, valid: false, no_match: 0 }.pack(),
                Ordering::SeqCst,
            );

            let observation = state.observe(format!("iteration: {}", v).as_bytes());
            let in_sequence = v == i || v == i + 1 || v == 1;

            prop_assert_eq!(state.get_valid(), in_sequence);
            if in_sequence {
                prop_assert_eq!(observation, Observation::Accepted(v));
                prop_assert_eq!(state.get_iteration(), v);
            } else {
                prop_assert_eq!(observation, Observation::OutOfSequence(v));
                prop_assert_eq!(state.get_iteration(), i);
                prop_assert_eq!(state.snapshot().no_match, 1);
            }
        }
    }

    #[test]
    fn test_reader_thread_writes_accepted_lines() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("run").join("exp.log");

        let mut reader = TelemetryReader::new(50, Duration::from_millis(10));
        reader.set_output(&out).unwrap();
        reader.start_with(Box::new(ScriptedSource::new(vec![
            b"boot banner".to_vec(),
            b"iteration: 1".to_vec(),
            b"iteration: 2".to_vec(),
            b"iteration: 7".to_vec(),
            b"iteration: 3".to_vec(),
        ])));

        assert!(reader.is_connected());
        assert!(wait_for(|| reader.get_iteration() == 3));
        assert!(reader.get_valid());
        reader.stop();
        assert!(!reader.is_connected());
        assert_eq!(reader.output_path(), None);

        let written = fs::read_to_string(&out).unwrap();
        assert_eq!(written, "iteration: 1\niteration: 2\niteration: 3\n");
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn test_start_failure_leaves_reader_disconnected() {
        let mut reader = TelemetryReader::new(50, Duration::from_millis(10));
        let result = reader.start(&PortSettings::new("/dev/null-port", 115200));
        assert!(matches!(result, Err(LinkError::Unsupported)));
        assert!(!reader.is_connected());
    }
}
