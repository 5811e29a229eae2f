use std::io::{self, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use super::poll::wait_writable;

/// Write all of `buf` to a non-blocking socket.
///
/// When the socket buffer is full, waits for writability for at most
/// `timeout` in total before giving up with [`io::ErrorKind::TimedOut`].
pub fn send_all(stream: &TcpStream, mut buf: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut writer = stream;
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() || !wait_writable(stream.as_raw_fd(), left)? {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
