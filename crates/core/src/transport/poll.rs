//! Level-triggered readiness over `poll(2)`.
//!
//! Each worker rebuilds its interest set every iteration, so a flat
//! `pollfd` array is all that is needed.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Readiness event for a registered descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: usize,
    pub readable: bool,
    pub hangup: bool,
}

/// Reusable `pollfd` set.
#[derive(Default)]
pub struct Readiness {
    fds: Vec<libc::pollfd>,
    tokens: Vec<usize>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
        self.tokens.clear();
    }

    /// Watch `fd` for input under `token`.
    pub fn register(&mut self, fd: RawFd, token: usize) {
        self.push(fd, libc::POLLIN, token);
    }

    /// Watch `fd` for hangup and errors only. Unread input does not wake
    /// the wait.
    pub fn register_hangup(&mut self, fd: RawFd, token: usize) {
        self.push(fd, 0, token);
    }

    fn push(&mut self, fd: RawFd, events: libc::c_short, token: usize) {
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        self.tokens.push(token);
    }

    /// Block until a registered descriptor is readable or `timeout` expires.
    ///
    /// An interrupted wait returns no events rather than an error.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Event>> {
        let timeout_ms = timeout_millis(timeout);

        // SAFETY: poll requires:
        // - self.fds.as_mut_ptr() points to self.fds.len() initialised pollfds
        // - the slice stays alive and unaliased for the duration of the call
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        Ok(self
            .fds
            .iter()
            .zip(&self.tokens)
            .filter(|(fd, _)| fd.revents != 0)
            .map(|(fd, &token)| Event {
                token,
                readable: fd.revents & libc::POLLIN != 0,
                hangup: fd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
            })
            .collect())
    }
}

/// Wait until `fd` accepts more output. Returns `false` on timeout.
pub fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        // SAFETY: poll requires:
        // - &mut pfd points to one valid, writable pollfd
        // - nfds of 1 matches that single entry
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_millis(timeout)) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(false);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer closed while waiting to send",
            ));
        }
        return Ok(true);
    }
}

/// Put a raw descriptor (such as a child's stdout pipe) in non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl F_GETFL/F_SETFL only read and update the status flags
    // of `fd`; an invalid descriptor is reported through the return value.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn timeout_millis(timeout: Duration) -> libc::c_int {
    // Round up so a sub-millisecond tick does not become a busy spin.
    let ms = timeout.as_micros().div_ceil(1000);
    libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
}

/// Wakes a worker blocked in [`Readiness::wait`].
#[derive(Debug)]
pub struct Waker {
    tx: UnixStream,
}

impl Waker {
    pub fn wake(&self) {
        // A full pipe already guarantees a pending wake-up.
        let _ = (&self.tx).write(&[1]);
    }
}

/// Receiving side of a [`Waker`], registered in the worker's poll set.
#[derive(Debug)]
pub struct WakeReceiver {
    rx: UnixStream,
}

impl WakeReceiver {
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.rx).read(&mut buf), Ok(n) if n > 0) {}
    }
}

impl AsRawFd for WakeReceiver {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

/// Create a connected, non-blocking waker pair.
pub fn waker() -> io::Result<(Waker, WakeReceiver)> {
    let (tx, rx) = UnixStream::pair()?;
    tx.set_nonblocking(true)?;
    rx.set_nonblocking(true)?;
    Ok((Waker { tx }, WakeReceiver { rx }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    #[test]
    fn waker_makes_receiver_readable() {
        let (waker, receiver) = waker().unwrap();
        let mut readiness = Readiness::new();
        readiness.register(receiver.as_raw_fd(), 7);
        assert!(readiness.wait(Duration::from_millis(10)).unwrap().is_empty());

        waker.wake();
        waker.wake();
        let events = readiness.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].readable);

        receiver.drain();
        assert!(readiness.wait(Duration::from_millis(10)).unwrap().is_empty());
    }

    #[test]
    fn wait_times_out_without_events() {
        let (_waker, receiver) = waker().unwrap();
        let mut readiness = Readiness::new();
        readiness.register(receiver.as_raw_fd(), 0);
        let start = Instant::now();
        assert!(readiness.wait(Duration::from_millis(30)).unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn unread_input_does_not_wake_hangup_only_interest() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.write_all(b"\r\n").unwrap();

        let mut readiness = Readiness::new();
        readiness.register(server.as_raw_fd(), 1);
        let events = readiness.wait(Duration::from_secs(1)).unwrap();
        assert!(events.len() == 1 && events[0].readable);

        readiness.clear();
        readiness.register_hangup(server.as_raw_fd(), 1);
        let start = Instant::now();
        assert!(readiness.wait(Duration::from_millis(30)).unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn reset_peer_reports_hangup_without_read_interest() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        // Unread data at close makes the kernel send RST instead of FIN.
        (&server).write_all(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        drop(client);

        let mut readiness = Readiness::new();
        readiness.register_hangup(server.as_raw_fd(), 4);
        let events = readiness.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 4);
        assert!(events[0].hangup);
        assert!(!events[0].readable);
    }

    #[test]
    fn fresh_socket_is_writable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        assert!(wait_writable(client.as_raw_fd(), Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn sub_millisecond_timeouts_round_up() {
        assert_eq!(timeout_millis(Duration::from_micros(1)), 1);
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_millis(1500)), 1500);
    }
}
