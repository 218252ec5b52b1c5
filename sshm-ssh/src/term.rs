//! Local terminal control for interactive sessions.
//!
//! Raw mode is entered through [`RawModeGuard`], which restores the saved
//! termios state on drop.  Because SIGINT/SIGTERM would bypass drops,
//! [`install_restore_handler`] registers a signal handler that restores the
//! terminal from static state before re-raising the signal with its default
//! disposition.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

// Shared with the signal handler.  `ACTIVE_FD` is -1 while no guard is
// live; the guard writes the saved state into the static slot before
// publishing the fd.  The slot is static storage and is never freed, so a
// handler racing a guard drop can at worst restore stale-but-valid state.
static ACTIVE_FD: AtomicI32 = AtomicI32::new(-1);
static mut SAVED_TERMIOS: MaybeUninit<libc::termios> = MaybeUninit::uninit();

/// Terminal size as rows/columns, queried with `TIOCGWINSZ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
}

impl WindowSize {
    /// Fallback when the size cannot be queried (fd is not a tty).
    pub const DEFAULT: WindowSize = WindowSize { cols: 80, rows: 24 };
}

/// Query the window size of `fd`, falling back to 80x24.
pub fn window_size(fd: RawFd) -> WindowSize {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        WindowSize {
            cols: u32::from(ws.ws_col),
            rows: u32::from(ws.ws_row),
        }
    } else {
        WindowSize::DEFAULT
    }
}

pub fn is_tty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

/// Puts `fd` into raw mode; dropping the guard restores the prior state.
///
/// At most one guard should be live at a time — the signal-handler state
/// is a single slot.
pub struct RawModeGuard {
    fd: RawFd,
    orig: libc::termios,
}

impl RawModeGuard {
    pub fn new(fd: RawFd) -> io::Result<Self> {
        let mut orig = MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(fd, orig.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let orig = unsafe { orig.assume_init() };

        let mut raw = orig;
        unsafe { libc::cfmakeraw(&mut raw) };
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // Publish for the signal handler: slot contents first, then the fd
        // that gates reading them.
        unsafe {
            (*std::ptr::addr_of_mut!(SAVED_TERMIOS)).write(orig);
        }
        ACTIVE_FD.store(fd, Ordering::Release);
        Ok(Self { fd, orig })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // Detach from the signal handler, then restore from our own copy.
        // The static slot keeps its now-stale contents; a handler that won
        // the race re-restores the same state, which is harmless.
        ACTIVE_FD.store(-1, Ordering::SeqCst);
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
        }
    }
}

extern "C" fn restore_and_reraise(sig: libc::c_int) {
    // Async-signal-safe: atomics, tcsetattr, sigaction, raise only.  The
    // termios slot is static storage, so the read is valid even when the
    // guard is dropped concurrently on another thread.
    let fd = ACTIVE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, std::ptr::addr_of!(SAVED_TERMIOS).cast());
        }
    }
    unsafe {
        let mut dfl: libc::sigaction = std::mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &dfl, std::ptr::null_mut());
        libc::raise(sig);
    }
}

/// Install the terminal-restoring SIGINT/SIGTERM handler.  Call once,
/// before the first interactive session.
pub fn install_restore_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = restore_and_reraise as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Guard state is process-wide; serialise the tests that touch it.
    static STATE_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn window_size_falls_back_for_non_tty_fd() {
        // /dev/null is never a tty, so the ioctl fails.
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&file);
        assert_eq!(window_size(fd), WindowSize::DEFAULT);
        assert!(!is_tty(fd));
    }

    #[test]
    fn raw_mode_on_non_tty_fd_is_an_error() {
        let _lock = STATE_LOCK.lock().unwrap();
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&file);
        assert!(RawModeGuard::new(fd).is_err());
        // Failure must leave the handler state detached.
        assert_eq!(ACTIVE_FD.load(Ordering::SeqCst), -1);
    }

    #[test]
    fn dropping_the_guard_detaches_the_signal_state() {
        let _lock = STATE_LOCK.lock().unwrap();
        // A pty master supports termios ops without needing a real terminal.
        let master = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
        if master < 0 {
            return; // no pty device in this environment
        }
        unsafe {
            libc::grantpt(master);
            libc::unlockpt(master);
        }

        let guard = RawModeGuard::new(master).unwrap();
        assert_eq!(ACTIVE_FD.load(Ordering::SeqCst), master);
        drop(guard);
        // After drop the handler must be gated off; the saved slot is
        // static storage, so no dangling state remains either way.
        assert_eq!(ACTIVE_FD.load(Ordering::SeqCst), -1);
        unsafe {
            libc::close(master);
        }
    }
}
