//! Interactive terminal prompting.
//!
//! [`read_hidden`] collects a secret from the terminal with echo disabled.
//! The saved `termios` state is restored through an RAII guard, so the
//! terminal comes back in its original state even when the read is
//! interrupted or the calling code bails out early with `?`.

use std::io::{self, BufRead, Write};

use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::io::RawFd;

// ---------------------------------------------------------------------------
// TermiosGuard — RAII terminal-state restoration
// ---------------------------------------------------------------------------

/// Restores the original `termios` settings on the given fd when dropped.
#[cfg(unix)]
struct TermiosGuard {
    fd: RawFd,
    orig: libc::termios,
}

#[cfg(unix)]
impl Drop for TermiosGuard {
    fn drop(&mut self) {
        // Best-effort restore; a dead fd no longer has terminal state worth
        // caring about.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
        }
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Read one line from stdin with terminal echo disabled, after printing
/// `prompt` to stderr.
///
/// End-of-input before a newline is an error, never an empty secret.  When
/// stdin is not a terminal (tests, pipes) the line is read as-is.  The
/// returned string has trailing CR/LF stripped and is `Zeroizing` so it is
/// scrubbed on drop.
pub fn read_hidden(prompt: &str) -> io::Result<Zeroizing<String>> {
    eprint!("{prompt}");
    io::stderr().flush()?;

    #[cfg(unix)]
    let guard = hide_input(libc::STDIN_FILENO);
    let result = read_trimmed_line();
    #[cfg(unix)]
    if guard.is_some() {
        // The user's Enter was not echoed; move to the next line ourselves.
        eprintln!();
    }
    #[cfg(unix)]
    drop(guard);

    result
}

/// Disable echo on `fd`, returning a guard that restores the previous state.
///
/// Returns `None` when `fd` is not a terminal.
#[cfg(unix)]
fn hide_input(fd: RawFd) -> Option<TermiosGuard> {
    // SAFETY: fd is a process-owned descriptor and term is initialised by
    // tcgetattr before use.
    let guard = unsafe {
        let mut term = std::mem::MaybeUninit::<libc::termios>::uninit();
        if libc::tcgetattr(fd, term.as_mut_ptr()) != 0 {
            return None;
        }
        TermiosGuard {
            fd,
            orig: term.assume_init(),
        }
    };

    let mut noecho = guard.orig;
    noecho.c_lflag &= !(libc::ECHO as libc::tcflag_t);
    noecho.c_lflag &= !(libc::ECHONL as libc::tcflag_t);

    // TCSAFLUSH also discards stale unread keypresses between prompts.
    unsafe {
        if libc::tcsetattr(fd, libc::TCSAFLUSH, &noecho) != 0 {
            return None;
        }
    }
    Some(guard)
}

fn read_trimmed_line() -> io::Result<Zeroizing<String>> {
    let mut buf = Zeroizing::new(Vec::<u8>::new());
    let n = io::stdin().lock().read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "end of input while reading from the terminal",
        ));
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let s = std::str::from_utf8(&buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .to_string();
    Ok(Zeroizing::new(s))
}

/// Read one visible line from stdin after printing `prompt` to stderr.
pub fn read_line(prompt: &str) -> io::Result<String> {
    eprint!("{prompt}");
    io::stderr().flush()?;
    let line = read_trimmed_line()?;
    Ok(line.to_string())
}

/// Ask a y/N question; only an explicit `y`/`yes` answers true.
pub fn confirm(question: &str) -> io::Result<bool> {
    let answer = read_line(&format!("{question} [y/N]: "))?;
    Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}
