//! Operator menu
//!
//! Turns keypresses into [`MenuCommand`]s on a dedicated thread. Commands
//! land in a single-slot mailbox: a newer command replaces one the driver
//! has not taken yet.

use crate::console::{ConsoleHandle, Tag};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const MENU_HELP: &str = "\
Keys:  n next experiment   m reset target now   c connect
       t telemetry port    r reset port         o output file
       h help              q quit";

const KEY_ESC: u8 = 0x1b;
const KEY_BACKSPACE: u8 = 0x7f;
const KEY_CTRL_H: u8 = 0x08;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuCommand {
    Quit,
    SetOutputFile(PathBuf),
    SetTelemetryPort(String),
    SetResetPort(String),
    Connect,
    ManualReset,
    NextExperiment,
}

impl MenuCommand {
    fn describe(&self) -> String {
        match self {
            MenuCommand::Quit => "quit".into(),
            MenuCommand::SetOutputFile(p) => format!("output file -> {}", p.display()),
            MenuCommand::SetTelemetryPort(p) => format!("telemetry port -> {}", p),
            MenuCommand::SetResetPort(p) => format!("reset port -> {}", p),
            MenuCommand::Connect => "connect".into(),
            MenuCommand::ManualReset => "reset target".into(),
            MenuCommand::NextExperiment => "next experiment".into(),
        }
    }
}

/// Text a command needs before it can be issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    OutputFile,
    TelemetryPort,
    ResetPort,
}

impl PromptKind {
    fn label(self) -> &'static str {
        match self {
            PromptKind::OutputFile => "Output file:",
            PromptKind::TelemetryPort => "Telemetry port:",
            PromptKind::ResetPort => "Reset port:",
        }
    }

    fn command(self, text: String) -> MenuCommand {
        match self {
            PromptKind::OutputFile => MenuCommand::SetOutputFile(PathBuf::from(text)),
            PromptKind::TelemetryPort => MenuCommand::SetTelemetryPort(text),
            PromptKind::ResetPort => MenuCommand::SetResetPort(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    Command(MenuCommand),
    Prompt(PromptKind),
    Help,
    Ignore,
}

impl KeyAction {
    pub fn from_key(key: u8) -> Self {
        match key.to_ascii_lowercase() {
            b'q' => KeyAction::Command(MenuCommand::Quit),
            b'c' => KeyAction::Command(MenuCommand::Connect),
            b'm' => KeyAction::Command(MenuCommand::ManualReset),
            b'n' => KeyAction::Command(MenuCommand::NextExperiment),
            b'o' => KeyAction::Prompt(PromptKind::OutputFile),
            b't' => KeyAction::Prompt(PromptKind::TelemetryPort),
            b'r' => KeyAction::Prompt(PromptKind::ResetPort),
            b'h' | b'?' => KeyAction::Help,
            _ => KeyAction::Ignore,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Edit {
    Continue,
    Done(String),
    Cancel,
}

/// Minimal line editor for prompts
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
}

impl LineEditor {
    pub fn feed(&mut self, key: u8) -> Edit {
        match key {
            b'\r' | b'\n' => {
                let text = self.buffer.trim().to_string();
                self.buffer.clear();
                if text.is_empty() {
                    Edit::Cancel
                } else {
                    Edit::Done(text)
                }
            }
            KEY_ESC => {
                self.buffer.clear();
                Edit::Cancel
            }
            KEY_BACKSPACE | KEY_CTRL_H => {
                self.buffer.pop();
                Edit::Continue
            }
            k if k.is_ascii_graphic() || k == b' ' => {
                self.buffer.push(char::from(k));
                Edit::Continue
            }
            _ => Edit::Continue,
        }
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }
}

/// Single-slot command mailbox
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<MenuCommand>>,
}

impl Mailbox {
    /// Store a command, replacing any not yet taken
    pub fn post(&self, command: MenuCommand) {
        let replaced = self
            .slot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(command);
        if let Some(old) = replaced {
            log::debug!("Menu command {:?} dropped before it was taken", old);
        }
    }

    pub fn take(&self) -> Option<MenuCommand> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// A keyboard, or anything else producing key bytes
pub trait KeySource: Send {
    /// Wait up to `timeout` for one key. `UnexpectedEof` means no key
    /// will ever arrive.
    fn poll_key(&mut self, timeout: Duration) -> io::Result<Option<u8>>;
}

/// Menu input thread
pub struct MenuInput {
    mailbox: Arc<Mailbox>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MenuInput {
    pub fn start<K, W>(keys: K, console: ConsoleHandle<W>, poll: Duration) -> Self
    where
        K: KeySource + 'static,
        W: Write + Send + 'static,
    {
        let mailbox = Arc::new(Mailbox::default());
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let mailbox = Arc::clone(&mailbox);
            let running = Arc::clone(&running);
            thread::spawn(move || input_loop(keys, console, &mailbox, &running, poll))
        };

        Self {
            mailbox,
            running,
            handle: Some(handle),
        }
    }

    pub fn take(&self) -> Option<MenuCommand> {
        self.mailbox.take()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Menu input thread panicked");
            }
        }
    }
}

impl Drop for MenuInput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn input_loop<K: KeySource, W: Write + Send>(
    mut keys: K,
    mut console: ConsoleHandle<W>,
    mailbox: &Mailbox,
    running: &AtomicBool,
    poll: Duration,
) {
    console.raw(MENU_HELP);
    let mut editing: Option<(PromptKind, LineEditor)> = None;

    while running.load(Ordering::SeqCst) {
        let key = match keys.poll_key(poll) {
            Ok(Some(key)) => key,
            Ok(None) => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::warn!("Keyboard closed, menu input stopped");
                while running.load(Ordering::SeqCst) {
                    thread::sleep(poll);
                }
                break;
            }
            Err(e) => {
                log::warn!("Keyboard read failed: {}", e);
                thread::sleep(poll);
                continue;
            }
        };

        if let Some((kind, mut editor)) = editing.take() {
            match editor.feed(key) {
                Edit::Continue => {
                    console.prompt(kind.label(), editor.text());
                    editing = Some((kind, editor));
                }
                Edit::Done(text) => {
                    console.close_prompt();
                    issue(&mut console, mailbox, kind.command(text));
                }
                Edit::Cancel => {
                    console.close_prompt();
                    console.line(Tag::Menu, "cancelled");
                }
            }
            continue;
        }

        match KeyAction::from_key(key) {
            KeyAction::Command(command) => issue(&mut console, mailbox, command),
            KeyAction::Prompt(kind) => {
                console.prompt(kind.label(), "");
                editing = Some((kind, LineEditor::default()));
            }
            KeyAction::Help => console.raw(MENU_HELP),
            KeyAction::Ignore => {}
        }
    }
    log::debug!("Menu input thread exiting");
}

fn issue<W: Write + Send>(console: &mut ConsoleHandle<W>, mailbox: &Mailbox, command: MenuCommand) {
    console.line(Tag::Menu, &command.describe());
    mailbox.post(command);
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;

    /// Plays back a key sequence, then reports no input
    pub struct ScriptedKeys {
        keys: VecDeque<u8>,
    }

    impl ScriptedKeys {
        pub fn new(keys: &[u8]) -> Self {
            Self {
                keys: keys.iter().copied().collect(),
            }
        }
    }

    impl KeySource for ScriptedKeys {
        fn poll_key(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
            match self.keys.pop_front() {
                Some(k) => Ok(Some(k)),
                None => {
                    thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedKeys;
    use super::*;
    use crate::console::Console;
    use std::time::Instant;

    fn run_keys(keys: &[u8]) -> Vec<MenuCommand> {
        let (_control, input) = Console::split(io::sink());
        let mut menu = MenuInput::start(ScriptedKeys::new(keys), input, Duration::from_millis(2));

        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            if let Some(cmd) = menu.take() {
                seen.push(cmd);
            }
            thread::sleep(Duration::from_millis(1));
        }
        menu.stop();
        seen
    }

    #[test]
    fn test_key_mapping() {
        assert_eq!(KeyAction::from_key(b'q'), KeyAction::Command(MenuCommand::Quit));
        assert_eq!(KeyAction::from_key(b'N'), KeyAction::Command(MenuCommand::NextExperiment));
        assert_eq!(KeyAction::from_key(b'm'), KeyAction::Command(MenuCommand::ManualReset));
        assert_eq!(KeyAction::from_key(b'c'), KeyAction::Command(MenuCommand::Connect));
        assert_eq!(KeyAction::from_key(b'r'), KeyAction::Prompt(PromptKind::ResetPort));
        assert_eq!(KeyAction::from_key(b'?'), KeyAction::Help);
        assert_eq!(KeyAction::from_key(b'x'), KeyAction::Ignore);
    }

    #[test]
    fn test_line_editor() {
        let mut editor = LineEditor::default();
        for &k in b"/dev/ttyUSBX" {
            assert_eq!(editor.feed(k), Edit::Continue);
        }
        editor.feed(KEY_BACKSPACE);
        editor.feed(b'2');
        assert_eq!(editor.feed(b'\r'), Edit::Done("/dev/ttyUSB2".into()));

        assert_eq!(editor.feed(b'\n'), Edit::Cancel);
        editor.feed(b'a');
        assert_eq!(editor.feed(KEY_ESC), Edit::Cancel);
        assert_eq!(editor.text(), "");
    }

    #[test]
    fn test_mailbox_keeps_latest() {
        let mailbox = Mailbox::default();
        mailbox.post(MenuCommand::Connect);
        mailbox.post(MenuCommand::NextExperiment);
        assert_eq!(mailbox.take(), Some(MenuCommand::NextExperiment));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_menu_thread_issues_commands() {
        assert_eq!(run_keys(b"n"), vec![MenuCommand::NextExperiment]);
        assert_eq!(
            run_keys(b"t/dev/ttyACM0\r"),
            vec![MenuCommand::SetTelemetryPort("/dev/ttyACM0".into())]
        );
        assert_eq!(
            run_keys(b"oresults/manual.log\n"),
            vec![MenuCommand::SetOutputFile(PathBuf::from("results/manual.log"))]
        );
    }

    /// Hangs up on the first poll and counts every poll after it
    struct HungUpKeys(Arc<std::sync::atomic::AtomicUsize>);

    impl KeySource for HungUpKeys {
        fn poll_key(&mut self, _timeout: Duration) -> io::Result<Option<u8>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "terminal closed"))
        }
    }

    #[test]
    fn test_closed_keyboard_is_not_polled_again() {
        let polls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (_control, input) = Console::split(io::sink());
        let mut menu = MenuInput::start(
            HungUpKeys(Arc::clone(&polls)),
            input,
            Duration::from_millis(2),
        );

        thread::sleep(Duration::from_millis(100));
        menu.stop();
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert_eq!(menu.take(), None);
    }

    #[test]
    fn test_prompt_swallows_command_keys() {
        // 'q' typed inside a prompt is text, Esc then cancels the prompt
        assert_eq!(run_keys(b"rq\x1b"), Vec::<MenuCommand>::new());
    }
}
