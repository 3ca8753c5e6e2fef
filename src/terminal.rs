//! Raw keyboard input and Ctrl+C handling (Unix)

use crate::menu::KeySource;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether SIGINT has been received since the handler was installed
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn handle_sigint(_: libc::c_int) {
    // only async-signal-safe work here
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT to [`interrupted`] instead of killing the process
#[cfg(unix)]
pub fn install_interrupt_handler() -> io::Result<()> {
    let handler = handle_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_interrupt_handler() -> io::Result<()> {
    Ok(())
}

/// Stdin in non-canonical, no-echo mode. The original settings are
/// restored on drop.
#[cfg(unix)]
pub struct TerminalKeys {
    fd: libc::c_int,
    original: libc::termios,
}

#[cfg(unix)]
impl TerminalKeys {
    pub fn stdin() -> io::Result<Self> {
        let fd = libc::STDIN_FILENO;

        // SAFETY: isatty/tcgetattr/tcsetattr only read or write the termios
        // struct we pass in
        unsafe {
            if libc::isatty(fd) != 1 {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "stdin is not a terminal",
                ));
            }

            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut original) != 0 {
                return Err(io::Error::last_os_error());
            }

            let mut raw = original;
            // keep ISIG so Ctrl+C still raises SIGINT
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;
            if libc::tcsetattr(fd, libc::TCSANOW, &raw) != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(Self { fd, original })
        }
    }
}

#[cfg(unix)]
impl KeySource for TerminalKeys {
    fn poll_key(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: one valid pollfd, and a one-byte buffer for read
        unsafe {
            match libc::poll(&mut pfd, 1, millis) {
                0 => Ok(None),
                n if n < 0 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        Ok(None)
                    } else {
                        Err(err)
                    }
                }
                _ => {
                    let mut byte = 0u8;
                    let read = libc::read(self.fd, (&mut byte as *mut u8).cast(), 1);
                    match read {
                        1 => Ok(Some(byte)),
                        // hangup: poll keeps reporting it, so stop here
                        0 => Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "terminal closed",
                        )),
                        _ => Err(io::Error::last_os_error()),
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
impl Drop for TerminalKeys {
    fn drop(&mut self) {
        // SAFETY: restores the settings captured in `stdin()`
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.original);
        }
    }
}

#[cfg(not(unix))]
pub struct TerminalKeys;

#[cfg(not(unix))]
impl TerminalKeys {
    pub fn stdin() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "raw keyboard input is only supported on Unix",
        ))
    }
}

#[cfg(not(unix))]
impl KeySource for TerminalKeys {
    fn poll_key(&mut self, _timeout: Duration) -> io::Result<Option<u8>> {
        Ok(None)
    }
}
