//! Interactive session driver.
//!
//! `run_shell` walks the fixed sequence dial, handshake, authenticate,
//! channel, raw terminal, PTY, shell, pump; each step has its own error
//! variant so failures name the stage that broke.  Terminal state is held
//! by a [`RawModeGuard`] so it restores on every exit path, including `?`.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::mpsc;
use std::time::Duration;

use ssh2::Session;
use zeroize::Zeroizing;

use sshm_core::config::Connection;

use crate::auth::AuthMethod;
use crate::term::{self, RawModeGuard, WindowSize};

const TERM_TYPE: &str = "xterm-256color";
const PUMP_IDLE: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("cannot reach {host}:{port}: {source}")]
    Dial {
        host: String,
        port: u16,
        source: io::Error,
    },
    #[error("SSH handshake with {host} failed: {source}")]
    Handshake { host: String, source: ssh2::Error },
    #[error("authentication as {user} failed after {attempted} method(s)")]
    AuthFailed { user: String, attempted: usize },
    #[error("cannot open session channel: {0}")]
    Channel(#[source] ssh2::Error),
    #[error("cannot enter raw terminal mode: {0}")]
    RawMode(#[source] io::Error),
    #[error("PTY request failed: {0}")]
    Pty(#[source] ssh2::Error),
    #[error("cannot start remote shell: {0}")]
    Shell(#[source] ssh2::Error),
    #[error("cannot run remote command: {0}")]
    Exec(#[source] ssh2::Error),
    #[error("session i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Dial, handshake and authenticate, returning a live session.
///
/// An empty method set still dials and handshakes; the failure then
/// surfaces from the authentication step, where the remote host gets to
/// decide whether it wanted credentials at all.
fn connect(conn: &Connection, methods: Vec<AuthMethod>) -> Result<Session, SessionError> {
    // The remote host key is accepted without verification, matching the
    // behaviour users get from `ssh -o StrictHostKeyChecking=no`.
    tracing::warn!(
        host = %conn.host,
        "host key is NOT verified; the connection is open to interception"
    );

    let tcp = TcpStream::connect((conn.host.as_str(), conn.port)).map_err(|source| {
        SessionError::Dial {
            host: conn.host.clone(),
            port: conn.port,
            source,
        }
    })?;

    let mut session = Session::new().map_err(|source| SessionError::Handshake {
        host: conn.host.clone(),
        source,
    })?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|source| SessionError::Handshake {
        host: conn.host.clone(),
        source,
    })?;

    let attempted = methods.len();
    for method in methods {
        let outcome = match method {
            AuthMethod::PublicKey { pem } => {
                session.userauth_pubkey_memory(&conn.user, None, &pem, None)
            }
            AuthMethod::Password(password) => session.userauth_password(&conn.user, &password),
        };
        match outcome {
            Ok(()) if session.authenticated() => return Ok(session),
            Ok(()) => {}
            Err(err) => {
                tracing::debug!(user = %conn.user, error = %err, "authentication method rejected");
            }
        }
    }

    Err(SessionError::AuthFailed {
        user: conn.user.clone(),
        attempted,
    })
}

/// Run an interactive login shell on `conn`, bridging the local terminal.
/// Returns the remote exit status.
pub fn run_shell(conn: &Connection, methods: Vec<AuthMethod>) -> Result<i32, SessionError> {
    let session = connect(conn, methods)?;
    let mut channel = session.channel_session().map_err(SessionError::Channel)?;

    let stdin_fd = io::stdin().as_raw_fd();
    let size = if term::is_tty(stdin_fd) {
        term::window_size(stdin_fd)
    } else {
        WindowSize::DEFAULT
    };

    // Raw mode before the PTY request, so no cooked-mode input leaks into
    // the session.  The guard restores the terminal on every exit path.
    let _raw = if term::is_tty(stdin_fd) {
        Some(RawModeGuard::new(stdin_fd).map_err(SessionError::RawMode)?)
    } else {
        None
    };

    channel
        .request_pty(TERM_TYPE, None, Some((size.cols, size.rows, 0, 0)))
        .map_err(SessionError::Pty)?;
    channel.shell().map_err(SessionError::Shell)?;

    pump(&session, &mut channel, stdin_fd)?;

    session.set_blocking(true);
    channel.close().ok();
    channel.wait_close().ok();
    Ok(channel.exit_status().unwrap_or(0))
}

/// Run a single remote command, copying its output through, without a PTY
/// or terminal changes.  Returns the remote exit status.
pub fn run_command(
    conn: &Connection,
    methods: Vec<AuthMethod>,
    command: &str,
) -> Result<i32, SessionError> {
    let session = connect(conn, methods)?;
    let mut channel = session.channel_session().map_err(SessionError::Channel)?;
    channel.exec(command).map_err(SessionError::Exec)?;

    // stdout and stderr share the channel's flow-control window, so both
    // must be drained as data arrives; reading them one after the other
    // would stall a command that floods one while the other stays open.
    session.set_blocking(false);
    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    let mut buf = [0u8; 8192];
    loop {
        let mut active = drain_stream(&mut channel, &mut stdout, &mut buf)?;
        active |= drain_stream(&mut channel.stderr(), &mut stderr, &mut buf)?;
        if channel.eof() {
            break;
        }
        if active {
            stdout.flush()?;
        } else {
            std::thread::sleep(PUMP_IDLE);
        }
    }
    stdout.flush()?;
    stderr.flush()?;

    session.set_blocking(true);
    channel.wait_close().ok();
    Ok(channel.exit_status().unwrap_or(0))
}

/// Bridge local stdin/stdout with the channel until the remote side
/// closes.  Stdin is read on a detached thread because the blocking read
/// cannot be multiplexed with the non-blocking channel polls.
fn pump(
    session: &Session,
    channel: &mut ssh2::Channel,
    stdin_fd: i32,
) -> Result<(), SessionError> {
    let (tx, rx) = mpsc::channel::<Zeroizing<Vec<u8>>>();
    std::thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Zeroizing::new(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    });

    session.set_blocking(false);
    let mut stdout = io::stdout().lock();
    let mut buf = [0u8; 8192];
    let mut last_size = term::window_size(stdin_fd);

    loop {
        let mut active = false;

        while let Ok(input) = rx.try_recv() {
            write_all_nonblocking(channel, &input)?;
            active = true;
        }

        if drain_stream(&mut *channel, &mut stdout, &mut buf)? {
            stdout.flush()?;
            active = true;
        }
        active |= drain_stream(&mut channel.stderr(), &mut io::stderr(), &mut buf)?;

        if channel.eof() {
            return Ok(());
        }

        // Propagate local resizes by polling; cheap enough at idle cadence.
        if term::is_tty(stdin_fd) {
            let size = term::window_size(stdin_fd);
            if size != last_size {
                last_size = size;
                channel
                    .request_pty_size(size.cols, size.rows, None, None)
                    .ok();
            }
        }

        if !active {
            std::thread::sleep(PUMP_IDLE);
        }
    }
}

/// Forward whatever `src` has ready into `dst`.  Returns whether any bytes
/// moved; `WouldBlock` counts as nothing ready, not an error.
fn drain_stream(
    src: &mut impl Read,
    dst: &mut impl Write,
    buf: &mut [u8],
) -> io::Result<bool> {
    match src.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            dst.write_all(&buf[..n])?;
            Ok(true)
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

/// `write_all` against a non-blocking channel, retrying short writes.
fn write_all_nonblocking(channel: &mut ssh2::Channel, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match channel.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(PUMP_IDLE);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshm_core::config::Connection;

    fn conn(host: &str, port: u16) -> Connection {
        Connection {
            name: "test".to_string(),
            host: host.to_string(),
            port,
            user: "alice".to_string(),
            ..Connection::default()
        }
    }

    #[test]
    fn empty_method_set_flows_into_the_dial_step() {
        // No methods is not a local precondition failure; the attempt
        // proceeds and fails wherever the connection does — here at Dial,
        // since nothing listens on this port.
        let err = connect(&conn("127.0.0.1", 1), Vec::new()).err().unwrap();
        assert!(matches!(err, SessionError::Dial { .. }));
    }

    #[test]
    fn streams_drain_independently_of_each_other() {
        use std::collections::VecDeque;

        struct Feed(VecDeque<Vec<u8>>);
        impl Read for Feed {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                match self.0.pop_front() {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(&chunk);
                        Ok(chunk.len())
                    }
                    None => Err(io::ErrorKind::WouldBlock.into()),
                }
            }
        }

        let mut out_src = Feed(VecDeque::new());
        let mut err_src = Feed(VecDeque::from([vec![b'e'; 8192], vec![b'e'; 8192]]));
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut buf = [0u8; 8192];

        // Stdout has nothing ready; stderr must still make progress
        // instead of waiting for stdout to finish.
        for _ in 0..2 {
            assert!(!drain_stream(&mut out_src, &mut out, &mut buf).unwrap());
            assert!(drain_stream(&mut err_src, &mut err, &mut buf).unwrap());
        }
        assert!(out.is_empty());
        assert_eq!(err.len(), 16384);
    }

    #[test]
    fn unreachable_host_is_a_dial_error() {
        // Port 1 on localhost is near-certainly closed.
        let methods = vec![AuthMethod::Password(Zeroizing::new("pw".to_string()))];
        let err = connect(&conn("127.0.0.1", 1), methods).err().unwrap();
        match err {
            SessionError::Dial { host, port, .. } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 1);
            }
            other => panic!("expected Dial, got {other:?}"),
        }
    }
}
