//! Direct serial AT command interface.
//!
//! The engine-queued `quectel cmd` path echoes responses through the channel
//! driver and is unreliable for `?` queries, so VoLTE state is read straight
//! from the modem's data port. Each call opens the device, configures raw
//! termios (115200 8N1, no flow control, VMIN=0/VTIME=1 so reads return after
//! 100ms of silence), writes the command with CRLF framing, and reads until a
//! final result code or the deadline. Failures are encoded as
//! `Error: <reason>` — the caller pattern-matches, it never unwinds.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tracing::debug;

/// Read buffer size (AT responses are small).
const READ_BUF_SIZE: usize = 1024;

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Send one AT command to the serial device at `port` and collect the
/// response for up to `timeout_secs` seconds.
///
/// The blocking open/write/read runs on the blocking pool so an unresponsive
/// device never stalls the runtime.
pub async fn send_at_direct(port: &str, command: &str, timeout_secs: u64) -> String {
    let port = port.to_string();
    let command = command.to_string();
    tokio::task::spawn_blocking(move || {
        at_transaction(&port, &command, Duration::from_secs(timeout_secs))
            .unwrap_or_else(|e| format!("Error: {e}"))
    })
    .await
    .unwrap_or_else(|e| format!("Error: serial task failed: {e}"))
}

fn at_transaction(port: &str, command: &str, timeout: Duration) -> Result<String, String> {
    let fd = fcntl::open(port, OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK, Mode::empty())
        .map_err(|e| format!("open {port}: {e}"))?;

    let result = execute(fd, command, timeout);
    let _ = unistd::close(fd);
    match &result {
        Ok(resp) => debug!("AT {command} on {port}: {:?}", resp.trim()),
        Err(e) => debug!("AT {command} on {port} failed: {e}"),
    }
    result
}

fn execute(fd: RawFd, command: &str, timeout: Duration) -> Result<String, String> {
    // Clear O_NONBLOCK now that the port is open — reads should block with
    // the VTIME timeout instead.
    let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL).map_err(|e| format!("F_GETFL: {e}"))?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.remove(OFlag::O_NONBLOCK);
    fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags)).map_err(|e| format!("F_SETFL: {e}"))?;

    configure_termios(fd)?;

    // SAFETY: fd is valid — caller just opened it and closes it after
    let bfd = unsafe { borrow_fd(fd) };

    // Flush stale data, then write the command with CRLF framing
    termios::tcflush(bfd, termios::FlushArg::TCIOFLUSH).map_err(|e| format!("tcflush: {e}"))?;
    let framed = format!("{command}\r\n");
    unistd::write(bfd, framed.as_bytes()).map_err(|e| format!("write: {e}"))?;

    read_response(fd, timeout)
}

/// Configure termios: raw mode, 115200 baud, 8N1, no flow control.
fn configure_termios(fd: RawFd) -> Result<(), String> {
    // SAFETY: fd is valid — caller just opened it
    let bfd = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(bfd).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| format!("cfsetospeed: {e}"))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    // VMIN=0, VTIME=1 → read returns after 100ms idle or when data available
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(bfd, SetArg::TCSANOW, &tio).map_err(|e| format!("tcsetattr: {e}"))?;

    Ok(())
}

/// Read until a final result code or the deadline. A partial response at the
/// deadline is returned as-is; an empty one is an error.
fn read_response(fd: RawFd, timeout: Duration) -> Result<String, String> {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut response = String::with_capacity(256);
    let deadline = Instant::now() + timeout;

    loop {
        if Instant::now() >= deadline {
            let cleaned = clean_response(&response);
            if cleaned.is_empty() {
                return Err(format!("no response within {:.0}s", timeout.as_secs_f64()));
            }
            return Ok(cleaned);
        }

        match unistd::read(fd, &mut buf) {
            Ok(0) | Err(nix::errno::Errno::EAGAIN) => {
                if response_is_complete(&response) {
                    break;
                }
            }
            Ok(n) => {
                response.push_str(&String::from_utf8_lossy(&buf[..n]));
                if response_is_complete(&response) {
                    break;
                }
            }
            Err(e) => return Err(format!("read: {e}")),
        }
    }

    Ok(clean_response(&response))
}

/// Check if the AT response contains a final result code.
fn response_is_complete(response: &str) -> bool {
    response.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == "OK"
            || trimmed == "ERROR"
            || trimmed.starts_with("+CME ERROR:")
            || trimmed.starts_with("+CMS ERROR:")
    })
}

/// Drop garbage control bytes and echo lines from a raw modem response.
///
/// Stale buffer data can contain NUL bytes or replacement characters that
/// break line-based parsing, and echo may not be fully disabled on a port
/// the engine also talks to.
fn clean_response(response: &str) -> String {
    let sanitized: String = response
        .chars()
        .filter(|&c| c == '\r' || c == '\n' || (!c.is_control() && c != '\u{FFFD}'))
        .collect();

    sanitized
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return false;
            }
            // Skip leading non-alpha garbage before testing for an "AT" echo
            match trimmed.find(|c: char| c.is_ascii_alphabetic()) {
                Some(pos) => !trimmed[pos..].starts_with("AT"),
                None => true,
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_is_complete_ok() {
        assert!(response_is_complete("+QAUDMOD: 3\r\nOK\r\n"));
    }

    #[test]
    fn test_response_is_complete_cme_error() {
        assert!(response_is_complete("+CME ERROR: 516\r\n"));
    }

    #[test]
    fn test_response_is_complete_partial() {
        assert!(!response_is_complete("+QAUDMOD: 3\r\n"));
    }

    #[test]
    fn test_clean_response_strips_echo() {
        let cleaned = clean_response("AT+QPCMV?\r\n+QPCMV: 1,2\r\nOK\r\n");
        assert!(cleaned.contains("+QPCMV: 1,2"));
        assert!(cleaned.contains("OK"));
        assert!(!cleaned.contains("AT+QPCMV?"));
    }

    #[test]
    fn test_clean_response_drops_nul_and_garbage() {
        let cleaned = clean_response("\x00AT+QCFG=\"ims\"\r\n+QCFG: \"ims\",1,1\r\nOK\r\n");
        assert!(cleaned.contains("+QCFG: \"ims\",1,1"));
        assert!(!cleaned.contains('\x00'));
        assert!(!cleaned.contains("AT+QCFG"));
    }

    #[test]
    fn test_clean_response_keeps_plain_lines() {
        let cleaned = clean_response("\r\n115200\r\nOK\r\n");
        assert!(cleaned.contains("115200"));
    }
}
