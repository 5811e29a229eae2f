//! Incremental line assembly over a non-blocking socket.

use std::io::{self, Read};

/// Bytes requested from the socket per read.
pub const RECV_BUFFER_SIZE: usize = 512;
/// Longest line kept; longer input is split at this length.
pub const LINE_CAPACITY: usize = RECV_BUFFER_SIZE + 1;

const DELETE: u8 = 0x7f;

/// Outcome of [`LineReader::poll_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// No complete line yet; the partial line is kept for the next call.
    Pending,
    /// An empty line (a bare CRLF or LF).
    Blank,
    /// A non-empty line, available from [`LineReader::line`].
    Line,
}

/// Per-connection receive buffer and line under construction.
///
/// Carriage returns are dropped, a line feed ends the line, DEL erases the
/// previous character and other control bytes are ignored. Bytes above
/// 0x7f are kept as Latin-1 characters.
#[derive(Debug)]
pub struct LineReader {
    input: Box<[u8]>,
    start: usize,
    end: usize,
    line: String,
    line_len: usize,
    complete: bool,
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

impl LineReader {
    pub fn new() -> Self {
        Self {
            input: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            line: String::with_capacity(LINE_CAPACITY),
            line_len: 0,
            complete: false,
        }
    }

    /// Forget all buffered input, keeping the allocations.
    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
        self.line.clear();
        self.line_len = 0;
        self.complete = false;
    }

    /// Received bytes not yet consumed into a line.
    pub fn has_buffered(&self) -> bool {
        self.start < self.end
    }

    /// The most recently completed line.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Consume buffered and newly received bytes until a line completes or
    /// the source would block.
    ///
    /// End of stream is reported as [`io::ErrorKind::UnexpectedEof`].
    pub fn poll_line<R: Read>(&mut self, source: &mut R) -> io::Result<LineStatus> {
        if self.complete {
            self.line.clear();
            self.line_len = 0;
            self.complete = false;
        }

        loop {
            if self.start >= self.end {
                match source.read(&mut self.input) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed by client",
                        ));
                    }
                    Ok(n) => {
                        self.start = 0;
                        self.end = n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(LineStatus::Pending);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            while self.start < self.end {
                let byte = self.input[self.start];
                self.start += 1;
                match byte {
                    b'\n' => return Ok(self.finish()),
                    DELETE => {
                        if self.line.pop().is_some() {
                            self.line_len -= 1;
                        }
                    }
                    b' '..=0xfd => {
                        self.line.push(char::from(byte));
                        self.line_len += 1;
                        if self.line_len >= LINE_CAPACITY {
                            return Ok(self.finish());
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Move up to `want - body.len()` raw bytes into `body`, bypassing line
    /// handling. Returns `true` once `body` holds `want` bytes.
    pub fn read_raw<R: Read>(&mut self, source: &mut R, body: &mut Vec<u8>, want: usize) -> io::Result<bool> {
        loop {
            if body.len() >= want {
                return Ok(true);
            }
            if self.start < self.end {
                let take = (want - body.len()).min(self.end - self.start);
                body.extend_from_slice(&self.input[self.start..self.start + take]);
                self.start += take;
                continue;
            }
            match source.read(&mut self.input) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside request body",
                    ));
                }
                Ok(n) => {
                    self.start = 0;
                    self.end = n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn finish(&mut self) -> LineStatus {
        self.complete = true;
        if self.line_len == 0 {
            LineStatus::Blank
        } else {
            LineStatus::Line
        }
    }
}
