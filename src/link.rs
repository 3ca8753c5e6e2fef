//! Abstractions over the two serial links a campaign drives
//!
//! The telemetry reader only needs lines and the watchdog only needs to
//! send a reset byte, so both are traits. The serial implementations live
//! behind the `serial` feature; tests use scripted fakes.

use crate::config::PortSettings;
use std::time::Duration;
use thiserror::Error;

/// Byte the reset controller interprets as "reset the target"
#[cfg(feature = "serial")]
pub const RESET_BYTE: u8 = b'r';

/// Longest line kept; a longer run without a newline is handed on in pieces
#[cfg(any(feature = "serial", test))]
pub const MAX_LINE: usize = 4096;

#[derive(Debug, Error)]
pub enum LinkError {
    #[cfg_attr(not(feature = "serial"), allow(dead_code))]
    #[error("cannot open {port} at {baud} baud: {reason}")]
    Open {
        port: String,
        baud: u32,
        reason: String,
    },

    #[cfg_attr(not(feature = "serial"), allow(dead_code))]
    #[error("serial I/O failed: {0}")]
    Io(String),

    #[error("built without serial support (enable the `serial` feature)")]
    Unsupported,
}

/// A source of raw telemetry lines.
///
/// `read_line` must return within a bounded time: `Ok(None)` means no
/// complete line arrived before the timeout.
pub trait LineSource: Send {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, LinkError>;
}

/// The output side of the reset controller
pub trait ResetLine: Send {
    fn send_reset(&mut self) -> Result<(), LinkError>;
}

/// Splits a byte stream into lines.
///
/// Bytes without a newline are held until the line completes, up to
/// [`MAX_LINE`]; past that the held bytes come out as a line of their own so
/// noise at a wrong baud rate still reaches the no-match counter.
#[cfg(any(feature = "serial", test))]
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

#[cfg(any(feature = "serial", test))]
impl LineBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Next complete line without its `\n` or `\r\n` terminator
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let newline = self
            .pending
            .iter()
            .take(MAX_LINE + 1)
            .position(|&b| b == b'\n');

        match newline {
            Some(end) => {
                let mut line: Vec<u8> = self.pending.drain(..=end).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some(line)
            }
            None if self.pending.len() >= MAX_LINE => {
                Some(self.pending.drain(..MAX_LINE).collect())
            }
            None => None,
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Open the telemetry connection
#[cfg(feature = "serial")]
pub fn open_telemetry(
    settings: &PortSettings,
    read_timeout: Duration,
) -> Result<Box<dyn LineSource>, LinkError> {
    use crate::serial::{PortConfig, SerialConnection};

    let config = PortConfig::new(&settings.port)
        .with_baud_rate(settings.baud)
        .with_timeout(read_timeout);
    let mut conn = SerialConnection::open(config).map_err(|e| open_error(settings, e))?;
    // drop whatever the target printed before we were listening
    if let Err(e) = conn.clear_buffers() {
        log::debug!("Could not clear telemetry buffers: {:#}", e);
    }
    Ok(Box::new(conn))
}

/// Open the reset connection
#[cfg(feature = "serial")]
pub fn open_reset(settings: &PortSettings) -> Result<Box<dyn ResetLine>, LinkError> {
    use crate::serial::{PortConfig, SerialConnection};

    let config = PortConfig::new(&settings.port)
        .with_baud_rate(settings.baud)
        .with_timeout(Duration::from_millis(100));
    let conn = SerialConnection::open(config).map_err(|e| open_error(settings, e))?;
    Ok(Box::new(conn))
}

#[cfg(not(feature = "serial"))]
pub fn open_telemetry(
    _settings: &PortSettings,
    _read_timeout: Duration,
) -> Result<Box<dyn LineSource>, LinkError> {
    Err(LinkError::Unsupported)
}

#[cfg(not(feature = "serial"))]
pub fn open_reset(_settings: &PortSettings) -> Result<Box<dyn ResetLine>, LinkError> {
    Err(LinkError::Unsupported)
}

#[cfg(feature = "serial")]
fn open_error(settings: &PortSettings, err: anyhow::Error) -> LinkError {
    LinkError::Open {
        port: settings.port.clone(),
        baud: settings.baud,
        reason: format!("{:#}", err),
    }
}

#[cfg(feature = "serial")]
impl LineSource for crate::serial::SerialConnection {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        crate::serial::SerialConnection::read_line(self).map_err(|e| LinkError::Io(format!("{:#}", e)))
    }
}

#[cfg(feature = "serial")]
impl ResetLine for crate::serial::SerialConnection {
    fn send_reset(&mut self) -> Result<(), LinkError> {
        self.write(&[RESET_BYTE])
            .and_then(|_| self.flush())
            .map(|_| ())
            .map_err(|e| LinkError::Io(format!("{:#}", e)))
    }
}

#[cfg(test)]
pub mod fake {
    //! Scripted links for tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Replays a fixed list of lines, then reports timeouts forever
    pub struct ScriptedSource {
        lines: VecDeque<Vec<u8>>,
        idle: Duration,
    }

    impl ScriptedSource {
        pub fn new<I, L>(lines: I) -> Self
        where
            I: IntoIterator<Item = L>,
            L: Into<Vec<u8>>,
        {
            Self {
                lines: lines.into_iter().map(Into::into).collect(),
                idle: Duration::from_millis(5),
            }
        }
    }

    impl LineSource for ScriptedSource {
        fn read_line(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
            match self.lines.pop_front() {
                Some(line) => Ok(Some(line)),
                None => {
                    std::thread::sleep(self.idle);
                    Ok(None)
                }
            }
        }
    }

    /// Lines pushed from another thread, e.g. by a fake build step
    pub struct ChannelSource {
        rx: std::sync::mpsc::Receiver<Vec<u8>>,
        timeout: Duration,
    }

    impl ChannelSource {
        pub fn new() -> (std::sync::mpsc::Sender<Vec<u8>>, Self) {
            let (tx, rx) = std::sync::mpsc::channel();
            let source = Self {
                rx,
                timeout: Duration::from_millis(5),
            };
            (tx, source)
        }
    }

    impl LineSource for ChannelSource {
        fn read_line(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
            // a dropped sender looks like a silent target
            match self.rx.recv_timeout(self.timeout) {
                Ok(line) => Ok(Some(line)),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(self.timeout);
                    Ok(None)
                }
            }
        }
    }

    /// Counts reset bytes; clones share the counter
    #[derive(Clone, Default)]
    pub struct CountingReset {
        pub sent: Arc<AtomicUsize>,
    }

    impl CountingReset {
        pub fn count(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    impl ResetLine for CountingReset {
        fn send_reset(&mut self) -> Result<(), LinkError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// A reset line whose writes always fail
    pub struct BrokenReset;

    impl ResetLine for BrokenReset {
        fn send_reset(&mut self) -> Result<(), LinkError> {
            Err(LinkError::Io("device unplugged".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_and_keeps_partial_lines() {
        let mut buf = LineBuffer::default();
        buf.push(b"iteration: 1\r\niter");
        assert_eq!(buf.next_line(), Some(b"iteration: 1".to_vec()));
        assert_eq!(buf.next_line(), None);

        buf.push(b"ation: 2\n\n");
        assert_eq!(buf.next_line(), Some(b"iteration: 2".to_vec()));
        assert_eq!(buf.next_line(), Some(Vec::new()));
        assert_eq!(buf.next_line(), None);
    }

    #[test]
    fn test_line_buffer_cuts_endless_noise() {
        let mut buf = LineBuffer::default();
        buf.push(&vec![0xAA; MAX_LINE * 2 + 10]);

        assert_eq!(buf.next_line().map(|l| l.len()), Some(MAX_LINE));
        assert_eq!(buf.next_line().map(|l| l.len()), Some(MAX_LINE));
        assert_eq!(buf.next_line(), None);

        // a newline beyond the cap does not make a longer line
        buf.clear();
        let mut long = vec![b'x'; MAX_LINE + 5];
        long.push(b'\n');
        buf.push(&long);
        assert_eq!(buf.next_line().map(|l| l.len()), Some(MAX_LINE));
        assert_eq!(buf.next_line(), Some(b"xxxxx".to_vec()));
    }
}
