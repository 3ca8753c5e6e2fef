//! Shared terminal output
//!
//! The status line, the scrolling event log and the menu prompts all go to
//! one terminal. Exactly two handles exist, one per [`Party`], and every
//! write happens inside that party's critical section.

use crate::exclusion::{Party, PetersonLock};
use chrono::Local;
use colored::Colorize;
use std::cell::UnsafeCell;
use std::io::{self, Write};
use std::sync::Arc;

/// Clear the current terminal line and return the cursor to column 0
const CLEAR_LINE: &str = "\r\x1b[2K";

/// Severity tag printed in front of an event line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Info,
    Ok,
    Warn,
    Error,
    Menu,
}

impl Tag {
    fn label(self) -> colored::ColoredString {
        match self {
            Tag::Info => "[*]".cyan().bold(),
            Tag::Ok => "[OK]".green().bold(),
            Tag::Warn => "[WARN]".yellow().bold(),
            Tag::Error => "[ERROR]".red().bold(),
            Tag::Menu => "[MENU]".magenta().bold(),
        }
    }
}

/// What is on the terminal, only touched inside the critical section
struct Screen<W> {
    out: W,
    /// Open prompt, redrawn after event lines and kept over the status line
    prompt: Option<String>,
}

struct Terminal<W> {
    lock: PetersonLock,
    screen: UnsafeCell<Screen<W>>,
}

// SAFETY: `screen` is only reached through `ConsoleHandle::write_locked`, which
// holds the Peterson lock for the handle's party. There is one handle per
// party and writing needs `&mut ConsoleHandle`, so at most one thread is
// inside the critical section at a time.
unsafe impl<W: Send> Sync for Terminal<W> {}

/// Constructor for the pair of console handles
pub struct Console;

impl Console {
    /// Wrap `out` and return the `(Control, Input)` handles
    pub fn split<W: Write + Send>(out: W) -> (ConsoleHandle<W>, ConsoleHandle<W>) {
        let terminal = Arc::new(Terminal {
            lock: PetersonLock::new(),
            screen: UnsafeCell::new(Screen { out, prompt: None }),
        });
        (
            ConsoleHandle {
                terminal: Arc::clone(&terminal),
                party: Party::Control,
            },
            ConsoleHandle {
                terminal,
                party: Party::Input,
            },
        )
    }

    pub fn stdout() -> (ConsoleHandle<io::Stdout>, ConsoleHandle<io::Stdout>) {
        Self::split(io::stdout())
    }
}

impl<W: Write> Screen<W> {
    fn redraw_prompt(&mut self) -> io::Result<()> {
        match &self.prompt {
            Some(prompt) => write!(self.out, "{}{}", CLEAR_LINE, prompt),
            None => Ok(()),
        }
    }
}

/// One party's access to the terminal
pub struct ConsoleHandle<W> {
    terminal: Arc<Terminal<W>>,
    party: Party,
}

impl<W: Write + Send> ConsoleHandle<W> {
    fn write_locked(&mut self, f: impl FnOnce(&mut Screen<W>) -> io::Result<()>) {
        let _guard = self.terminal.lock.lock(self.party);
        // SAFETY: see the `Sync` impl on `Terminal`
        let screen = unsafe { &mut *self.terminal.screen.get() };
        if let Err(e) = f(screen).and_then(|_| screen.out.flush()) {
            log::debug!("Terminal write failed: {}", e);
        }
    }

    /// Append a timestamped event line to the scrolling log
    pub fn line(&mut self, tag: Tag, message: &str) {
        let timestamp = Local::now().format("%H:%M:%S").to_string();
        self.write_locked(|screen| {
            write!(
                screen.out,
                "{}{} {} {}\r\n",
                CLEAR_LINE,
                timestamp.dimmed(),
                tag.label(),
                message
            )?;
            screen.redraw_prompt()
        });
    }

    /// Overwrite the status line in place. Skipped while a prompt is open.
    pub fn status(&mut self, text: &str) {
        self.write_locked(|screen| {
            if screen.prompt.is_some() {
                return Ok(());
            }
            write!(screen.out, "{}{}", CLEAR_LINE, text)
        });
    }

    /// Show a prompt with the text typed so far
    pub fn prompt(&mut self, label: &str, input: &str) {
        let rendered = format!("{} {}", label.cyan().bold(), input);
        self.write_locked(|screen| {
            screen.prompt = Some(rendered);
            screen.redraw_prompt()
        });
    }

    /// Take the prompt off the terminal
    pub fn close_prompt(&mut self) {
        self.write_locked(|screen| {
            screen.prompt = None;
            write!(screen.out, "{}", CLEAR_LINE)
        });
    }

    /// Write text as-is, for multi-line blocks such as the menu help
    pub fn raw(&mut self, text: &str) {
        self.write_locked(|screen| {
            for l in text.lines() {
                write!(screen.out, "{}{}\r\n", CLEAR_LINE, l)?;
            }
            screen.redraw_prompt()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    /// Captures everything written, one chunk per `write` call
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            // widen the window for a torn line if exclusion were broken
            thread::yield_now();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    #[test]
    fn test_handles_have_fixed_parties() {
        let (control, input) = Console::split(Vec::new());
        assert_eq!(control.party, Party::Control);
        assert_eq!(input.party, Party::Input);
    }

    #[test]
    fn test_lines_from_both_parties_stay_intact() {
        colored::control::set_override(false);
        let capture = Capture::default();
        let (mut control, mut input) = Console::split(capture.clone());

        let a = thread::spawn(move || {
            for i in 0..300 {
                control.line(Tag::Info, &format!("control message {}", i));
            }
        });
        let b = thread::spawn(move || {
            for i in 0..300 {
                input.line(Tag::Menu, &format!("input message {}", i));
            }
        });
        a.join().unwrap();
        b.join().unwrap();

        let text = capture.text();
        let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 600);
        for line in lines {
            assert!(line.starts_with(CLEAR_LINE), "torn line: {:?}", line);
            let body = &line[CLEAR_LINE.len()..];
            let ok = (body.contains("[*] control message") && !body.contains("input"))
                || (body.contains("[MENU] input message") && !body.contains("control"));
            assert!(ok, "interleaved line: {:?}", line);
        }
    }

    #[test]
    fn test_status_and_prompt_do_not_advance_line() {
        colored::control::set_override(false);
        let capture = Capture::default();
        let (mut control, mut input) = Console::split(capture.clone());
        control.status("exp 1/3 | iteration 42");
        input.prompt("Telemetry port:", "/dev/tty");

        let text = capture.text();
        assert!(!text.contains('\n'));
        assert!(text.contains("exp 1/3 | iteration 42"));
        assert!(text.ends_with("Telemetry port: /dev/tty"));
    }

    #[test]
    fn test_open_prompt_survives_status_and_events() {
        colored::control::set_override(false);
        let capture = Capture::default();
        let (mut control, mut input) = Console::split(capture.clone());

        input.prompt("Reset port:", "/dev/ttyU");
        control.status("exp 1/3 | iteration 7");
        assert!(!capture.text().contains("iteration 7"));

        control.line(Tag::Ok, "Target reset");
        let text = capture.text();
        assert!(text.contains("Target reset\r\n"));
        assert!(text.ends_with("Reset port: /dev/ttyU"));

        input.close_prompt();
        control.status("exp 1/3 | iteration 8");
        assert!(capture.text().ends_with("exp 1/3 | iteration 8"));
    }
}
