//! Response scheduler.
//!
//! Called once per worker iteration for every connection in the
//! `SendFile` state. Each call either arms a new payload (checking
//! credentials and, for videos, whether a new frame is due) or continues
//! draining the current one, a bounded number of chunks at a time, so one
//! slow or large response cannot starve the other clients of a worker.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::error::MediaError;
use crate::media::{Video, avi, mime};
use crate::protocol::response::{self, ErrorPage, SERVER_AGENT};
use crate::protocol::{Method, RequestMode, Resource};
use crate::server::Shared;
use crate::transport::poll::set_nonblocking;
use crate::transport::send_all;

/// Most CGI output relayed for one request.
pub const CGI_OUTPUT_LIMIT: u64 = 1 << 24;

/// Bytes being streamed to a client.
pub enum Payload {
    /// A static file, or the open AVI file of the current video.
    File(File),
    /// A captured frame or a plugin reply.
    Memory(Cursor<Vec<u8>>),
    /// Standard output of a running CGI script.
    Process(CgiProcess),
}

impl Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Payload::File(file) => file.read(buf),
            Payload::Memory(cursor) => cursor.read(buf),
            Payload::Process(process) => process.stdout.read(buf),
        }
    }
}

/// A spawned CGI script. Killed and reaped when dropped.
pub struct CgiProcess {
    child: Child,
    stdout: ChildStdout,
}

impl CgiProcess {
    fn spawn(script: &Path, application: Option<&Path>, query: &str) -> io::Result<Self> {
        let mut command = match application {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(script);
                command
            }
            None => Command::new(script),
        };
        command
            .env("QUERY_STRING", query)
            .env("REQUEST_METHOD", "GET")
            .env("SERVER_SOFTWARE", SERVER_AGENT)
            .env("GATEWAY_INTERFACE", "CGI/1.1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = command.spawn()?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("CGI stdout not captured"));
        };
        let process = Self { child, stdout };
        set_nonblocking(process.stdout.as_raw_fd())?;
        Ok(process)
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Result of one scheduler pass over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Bytes were sent, or the response finished; call again promptly.
    Continue,
    /// Nothing to send yet (frame not due, body or CGI output pending).
    Wait,
    Disconnect(&'static str),
}

/// How arming the next payload went.
enum Arm {
    Ready,
    NotDue,
    /// Answer with this page and go back to waiting for requests.
    Page(ErrorPage),
    /// Answer with this page, then drop the client.
    Fail(ErrorPage, &'static str),
    Drop(&'static str),
}

/// Advance one connection by at most `chunks_per_tick` chunks.
pub fn tick(conn: &mut Connection, shared: &Shared, scratch: &mut [u8], now: Instant) -> Step {
    let timeout = shared.config.send_timeout;

    if conn.need_header {
        if shared.basic_token.is_some() && !conn.auth.authenticated {
            tracing::debug!(id = conn.id, peer = %conn.peer_addr, "authorization required");
            return send_page(conn, ErrorPage::Unauthorized, timeout);
        }

        match arm(conn, shared, now) {
            Arm::Ready => {}
            Arm::NotDue => return Step::Wait,
            Arm::Page(page) => return send_page(conn, page, timeout),
            Arm::Fail(page, reason) => {
                let _ = send_all(&conn.stream, &page.render(), timeout);
                return Step::Disconnect(reason);
            }
            Arm::Drop(reason) => return Step::Disconnect(reason),
        }

        let head = match conn.route.mode {
            RequestMode::Single if matches!(conn.payload, Some(Payload::Process(_))) => response::cgi(),
            RequestMode::Single => response::single(conn.content_length, &conn.content_type),
            RequestMode::MultipartFirst => {
                conn.route.mode = RequestMode::MultipartFrame;
                response::multipart_first(conn.content_length)
            }
            RequestMode::MultipartFrame => response::multipart_next(conn.content_length),
        };
        if send_all(&conn.stream, head.as_bytes(), timeout).is_err() {
            return Step::Disconnect("send failed");
        }
        conn.need_header = false;
        conn.remaining = conn.content_length;
    }

    for _ in 0..shared.config.chunks_per_tick {
        if conn.remaining == 0 {
            break;
        }
        let Some(payload) = conn.payload.as_mut() else {
            return Step::Disconnect("payload missing");
        };
        let want = conn.remaining.min(scratch.len() as u64) as usize;
        let n = match payload.read(&mut scratch[..want]) {
            Ok(0) if matches!(payload, Payload::Process(_)) => return Step::Disconnect("CGI finished"),
            Ok(0) => return Step::Disconnect("payload ended early"),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Wait,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(id = conn.id, error = %e, "payload read failed");
                return Step::Disconnect("payload read failed");
            }
        };
        if send_all(&conn.stream, &scratch[..n], timeout).is_err() {
            return Step::Disconnect("send failed");
        }
        conn.remaining -= n as u64;
    }

    if conn.remaining == 0 {
        return complete(conn);
    }
    Step::Continue
}

/// The current payload has been sent in full.
fn complete(conn: &mut Connection) -> Step {
    match conn.payload {
        Some(Payload::Process(_)) => return Step::Disconnect("CGI output limit reached"),
        // The AVI file stays open for the next frame.
        Some(Payload::File(_)) if matches!(conn.route.resource, Resource::Video(_)) => {}
        _ => conn.payload = None,
    }
    match conn.route.mode {
        RequestMode::Single => conn.finish_request(),
        RequestMode::MultipartFirst | RequestMode::MultipartFrame => conn.need_header = true,
    }
    Step::Continue
}

fn send_page(conn: &mut Connection, page: ErrorPage, timeout: Duration) -> Step {
    conn.payload = None;
    conn.finish_request();
    match send_all(&conn.stream, &page.render(), timeout) {
        Ok(()) => Step::Continue,
        Err(_) => Step::Disconnect("send failed"),
    }
}

fn arm(conn: &mut Connection, shared: &Shared, now: Instant) -> Arm {
    match conn.route.resource.clone() {
        Resource::NotFound => Arm::Page(ErrorPage::NotFound),
        Resource::BadRequest => Arm::Page(ErrorPage::BadRequest),
        Resource::File(path) => {
            let opened = File::open(&path).and_then(|file| file.metadata().map(|meta| (file, meta)));
            match opened {
                Ok((file, meta)) if meta.is_file() => {
                    conn.content_length = meta.len();
                    conn.payload = Some(Payload::File(file));
                    Arm::Ready
                }
                _ => {
                    tracing::debug!(id = conn.id, path = %path.display(), "file not found");
                    Arm::Page(ErrorPage::NotFound)
                }
            }
        }
        Resource::Cgi {
            script,
            application,
            query,
        } => match CgiProcess::spawn(&script, application.as_deref(), &query) {
            Ok(process) => {
                conn.content_length = CGI_OUTPUT_LIMIT;
                conn.payload = Some(Payload::Process(process));
                Arm::Ready
            }
            Err(e) => {
                tracing::warn!(id = conn.id, script = %script.display(), error = %e, "CGI spawn failed");
                Arm::Page(ErrorPage::BadRequest)
            }
        },
        Resource::Plugin { index, query } => arm_plugin(conn, shared, index, &query),
        Resource::Video(index) => arm_video(conn, shared, index, now),
    }
}

fn arm_plugin(conn: &mut Connection, shared: &Shared, index: usize, query: &str) -> Arm {
    let Some(plugin) = shared.plugins.get(index) else {
        return Arm::Page(ErrorPage::NotFound);
    };
    let reply = if conn.method == Method::Post {
        let post = conn.post.get_or_insert_with(Default::default);
        match conn.reader.read_raw(&mut conn.stream, &mut post.data, post.expected) {
            Ok(true) => {}
            Ok(false) => return Arm::NotDue,
            Err(_) => return Arm::Drop("connection closed inside request body"),
        }
        plugin.post(query, &post.data)
    } else {
        plugin.get(query)
    };
    conn.content_length = reply.body.len() as u64;
    conn.content_type = Cow::Owned(reply.content_type);
    conn.payload = Some(Payload::Memory(Cursor::new(reply.body)));
    Arm::Ready
}

fn arm_video(conn: &mut Connection, shared: &Shared, index: usize, now: Instant) -> Arm {
    let Some(video) = shared.videos.get(index) else {
        return Arm::Page(ErrorPage::NotFound);
    };
    conn.content_type = Cow::Borrowed(mime::JPEG);

    match &*video {
        Video::Avi(avi) => {
            let frame = avi.due_frame(now);
            if let Some(last) = conn.last_frame {
                let step = avi.fps() / conn.frame_rate.max(1);
                if frame == last || frame.abs_diff(last) < step {
                    return Arm::NotDue;
                }
            }
            conn.last_frame = Some(frame);
            conn.idle_since = now;

            let mut file = match conn.payload.take() {
                Some(Payload::File(file)) => file,
                _ => match File::open(avi.path()) {
                    Ok(file) => file,
                    Err(e) => {
                        tracing::warn!(path = %avi.path().display(), error = %e, "cannot open video");
                        return Arm::Page(ErrorPage::NotFound);
                    }
                },
            };
            let Some(offset) = avi.frame_offset(frame) else {
                return Arm::Fail(ErrorPage::Video, "frame outside index");
            };
            let len = match avi::read_frame_len(&mut file, offset) {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!(id = conn.id, frame, error = %e, "frame header unreadable");
                    return Arm::Fail(ErrorPage::Video, "frame header unreadable");
                }
            };
            if let Err(e) = check_frame_len(frame, len, shared.config.max_frame_size) {
                tracing::warn!(id = conn.id, path = %avi.path().display(), error = %e, "bad frame");
                return Arm::Fail(ErrorPage::Video, "bad frame");
            }
            conn.content_length = len;
            conn.payload = Some(Payload::File(file));
            Arm::Ready
        }
        Video::Capture(capture) => {
            let limit = [Some(conn.frame_rate), capture.max_fps()]
                .into_iter()
                .flatten()
                .filter(|&fps| fps > 0)
                .min();
            if let (Some(limit), Some(last)) = (limit, conn.last_capture)
                && now.saturating_duration_since(last) < Duration::from_secs(1) / limit
            {
                return Arm::NotDue;
            }
            conn.last_capture = Some(now);
            conn.idle_since = now;

            match capture.capture(shared.config.max_frame_size, conn.jpeg_quality) {
                Ok(image) => {
                    conn.content_length = image.len() as u64;
                    conn.payload = Some(Payload::Memory(Cursor::new(image)));
                    Arm::Ready
                }
                Err(e) => {
                    tracing::warn!(id = conn.id, source = capture.name(), error = %e, "capture failed");
                    Arm::Fail(ErrorPage::Video, "capture failed")
                }
            }
        }
    }
}

fn check_frame_len(frame: u32, len: u64, max: u64) -> Result<(), MediaError> {
    if len == 0 {
        return Err(MediaError::EmptyFrame { frame });
    }
    if len > max {
        return Err(MediaError::FrameTooLarge { frame, len, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::connection::ConnectionState;
    use crate::connection::tests::{connection, shared};
    use crate::media::{AviVideo, VideoRegistry};
    use crate::protocol::Route;
    use std::net::TcpStream;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mjpeg-scheduler-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// A connection whose headers are complete and which is about to be
    /// answered with `route`.
    fn sending(shared: &Shared, route: Route) -> (Connection, TcpStream) {
        let (mut conn, client) = connection(shared);
        conn.state = ConnectionState::SendFile;
        conn.route = route;
        (conn, client)
    }

    /// Everything the client has received so far.
    fn received(client: &mut TcpStream) -> Vec<u8> {
        client.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        out
    }

    fn body_after_head(reply: &[u8]) -> &[u8] {
        let end = reply
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("complete header");
        &reply[end + 4..]
    }

    #[test]
    fn one_tick_sends_at_most_its_chunk_budget() {
        let body: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let path = temp_file("large.bin", &body);
        let shared = shared(ServerConfig {
            chunk_size: 1024,
            chunks_per_tick: 4,
            ..ServerConfig::default()
        });
        let (mut conn, mut client) = sending(&shared, Route::new(Resource::File(path)));
        let mut scratch = vec![0; 1024];

        assert_eq!(tick(&mut conn, &shared, &mut scratch, Instant::now()), Step::Continue);
        assert_eq!(conn.remaining, 10_000 - 4096);
        let reply = received(&mut client);
        assert_eq!(body_after_head(&reply), &body[..4096]);

        assert_eq!(tick(&mut conn, &shared, &mut scratch, Instant::now()), Step::Continue);
        assert_eq!(received(&mut client), &body[4096..8192]);

        assert_eq!(tick(&mut conn, &shared, &mut scratch, Instant::now()), Step::Continue);
        assert_eq!(received(&mut client), &body[8192..]);
        assert_eq!(conn.remaining, 0);
        assert!(conn.payload.is_none());
        assert_ne!(conn.state, ConnectionState::SendFile);
    }

    #[test]
    fn stream_skips_frames_faster_than_client_rate() {
        let frames: Vec<Vec<u8>> = (0..20u8).map(|i| vec![0xff, 0xd8, i, 0xff, 0xd9]).collect();
        let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
        // 100ms per frame: a 10 fps video.
        let path = temp_file("throttle.avi", &avi::tests::build_avi(100_000, &refs, true));
        let start = Instant::now();
        let index = avi::index_file(&path).unwrap();
        let videos = VideoRegistry::new();
        videos.add(Video::Avi(AviVideo::from_index(&path, index, start).unwrap()));
        let shared = Shared::new(ServerConfig::default(), videos, Default::default());

        let route = Route {
            mode: RequestMode::MultipartFirst,
            ..Route::new(Resource::Video(0))
        };
        let (mut conn, _client) = sending(&shared, route);
        conn.frame_rate = 2;
        let mut scratch = vec![0; 1024];
        let at = |ms| start + Duration::from_millis(ms);

        assert_eq!(tick(&mut conn, &shared, &mut scratch, at(0)), Step::Continue);
        assert_eq!(conn.last_frame, Some(0));
        assert!(conn.need_header);

        // At 2 fps out of 10, the next part is at least five frames later.
        for ms in [100, 250, 400, 499] {
            assert_eq!(tick(&mut conn, &shared, &mut scratch, at(ms)), Step::Wait, "at {ms}ms");
        }
        assert_eq!(conn.last_frame, Some(0));

        assert_eq!(tick(&mut conn, &shared, &mut scratch, at(500)), Step::Continue);
        assert_eq!(conn.last_frame, Some(5));
        assert_eq!(tick(&mut conn, &shared, &mut scratch, at(700)), Step::Wait);
        assert_eq!(tick(&mut conn, &shared, &mut scratch, at(1000)), Step::Continue);
        assert_eq!(conn.last_frame, Some(10));
    }

    #[test]
    fn frame_length_limits() {
        assert!(check_frame_len(0, 1, 400_000).is_ok());
        assert!(check_frame_len(0, 400_000, 400_000).is_ok());
        assert!(matches!(
            check_frame_len(4, 0, 400_000),
            Err(MediaError::EmptyFrame { frame: 4 })
        ));
        assert!(matches!(
            check_frame_len(5, 400_001, 400_000),
            Err(MediaError::FrameTooLarge { frame: 5, .. })
        ));
    }

    #[test]
    fn cgi_spawn_failure_is_an_error() {
        let missing = Path::new("/nonexistent/mjpeg-server/script.cgi");
        assert!(CgiProcess::spawn(missing, None, "").is_err());
    }

    #[test]
    fn memory_payload_reads_through() {
        let mut payload = Payload::Memory(Cursor::new(b"jpeg".to_vec()));
        let mut buf = [0u8; 8];
        assert_eq!(payload.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"jpeg");
        assert_eq!(payload.read(&mut buf).unwrap(), 0);
    }
}
