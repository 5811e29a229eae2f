//! Connection slots and per-client request state.
//!
//! The [`ConnectionTable`] is the only state shared between the acceptor
//! and the workers: one atomic state per slot. Everything else about a
//! client lives in its [`Connection`], owned by the worker that serves
//! the slot.

pub mod line;

use std::borrow::Cow;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use crate::protocol::request::{self, RequestLine};
use crate::protocol::{Method, Resource, Route};
use crate::scheduler::Payload;
use crate::server::Shared;
use crate::transport::Accepted;

pub use line::{LineReader, LineStatus};

/// Largest request body accepted for plugin POSTs.
pub const MAX_POST_BODY: usize = 64 * 1024;

/// Lifecycle of a slot in the [`ConnectionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Active = 1,
    /// Being torn down; not yet claimable.
    PendingFree = 2,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Active,
            2 => SlotState::PendingFree,
            _ => SlotState::Free,
        }
    }
}

/// Fixed-capacity table of slot states.
///
/// Only the acceptor moves a slot from `Free` to `Active`; only the worker
/// owning a slot moves it back through `PendingFree` to `Free`.
#[derive(Clone)]
pub struct ConnectionTable {
    states: Arc<[AtomicU8]>,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: (0..capacity)
                .map(|_| AtomicU8::new(SlotState::Free as u8))
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// Claim the lowest free slot, marking it active.
    pub fn claim(&self) -> Option<usize> {
        self.states.iter().position(|state| {
            state
                .compare_exchange(
                    SlotState::Free as u8,
                    SlotState::Active as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
        })
    }

    pub fn state(&self, id: usize) -> SlotState {
        SlotState::from_u8(self.states[id].load(Ordering::Acquire))
    }

    pub fn begin_release(&self, id: usize) {
        self.states[id].store(SlotState::PendingFree as u8, Ordering::Release);
    }

    /// Make the slot claimable again. All teardown must happen before this.
    pub fn release(&self, id: usize) {
        self.states[id].store(SlotState::Free as u8, Ordering::Release);
    }

    pub fn active_count(&self) -> usize {
        self.states
            .iter()
            .filter(|state| state.load(Ordering::Acquire) == SlotState::Active as u8)
            .count()
    }
}

/// Where a connection is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a request line. Blank lines are keep-alive pings.
    Idle,
    /// Reading header lines until the blank line.
    Headers,
    /// The scheduler is producing the response.
    SendFile,
}

/// Credentials seen on the current request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthState {
    pub authenticated: bool,
    /// Only the first `Authorization` header of a request is considered.
    pub header_seen: bool,
}

/// Request body being collected for a plugin POST.
#[derive(Debug, Default)]
pub struct PostBody {
    pub expected: usize,
    pub data: Vec<u8>,
}

/// What the worker should do after a line has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    /// Headers are complete; the scheduler takes over.
    Ready,
    Disconnect(&'static str),
}

/// One client and everything needed to answer it.
pub struct Connection {
    pub id: usize,
    pub peer_addr: SocketAddr,
    pub(crate) stream: TcpStream,
    pub(crate) reader: LineReader,
    pub state: ConnectionState,
    pub method: Method,
    pub route: Route,
    pub content_type: Cow<'static, str>,
    pub(crate) payload: Option<Payload>,
    /// A header (full, or a multipart part header) must precede the next bytes.
    pub need_header: bool,
    pub content_length: u64,
    pub remaining: u64,
    pub last_frame: Option<u32>,
    pub last_capture: Option<Instant>,
    pub frame_rate: u32,
    pub jpeg_quality: u8,
    pub auth: AuthState,
    pub post: Option<PostBody>,
    pub idle_since: Instant,
    pub connected_at: Instant,
}

impl Connection {
    pub fn new(accepted: Accepted, reader: LineReader, shared: &Shared, now: Instant) -> Self {
        Self {
            id: accepted.id,
            peer_addr: accepted.peer_addr,
            stream: accepted.stream,
            reader,
            state: ConnectionState::Idle,
            method: Method::Get,
            route: Route::not_found(),
            content_type: Cow::Borrowed(crate::media::mime::HTML),
            payload: None,
            need_header: true,
            content_length: 0,
            remaining: 0,
            last_frame: None,
            last_capture: None,
            frame_rate: shared.config.frame_rate,
            jpeg_quality: shared.config.jpeg_quality,
            auth: AuthState::default(),
            post: None,
            idle_since: now,
            connected_at: now,
        }
    }

    /// Tear down the client, keeping the line buffers for the slot's next
    /// occupant.
    pub fn into_reader(self) -> LineReader {
        let Connection { mut reader, .. } = self;
        reader.reset();
        reader
    }

    /// Input that has been received but not yet turned into lines.
    pub fn has_buffered_input(&self) -> bool {
        self.reader.has_buffered()
    }

    /// Read and handle at most one line.
    pub fn read_line(&mut self, shared: &Shared, now: Instant) -> LineOutcome {
        match self.reader.poll_line(&mut self.stream) {
            Ok(status) => self.handle_line(status, shared, now),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                LineOutcome::Disconnect("connection closed by client")
            }
            Err(e) => {
                tracing::debug!(id = self.id, peer = %self.peer_addr, error = %e, "read error");
                LineOutcome::Disconnect("read error")
            }
        }
    }

    pub fn handle_line(&mut self, status: LineStatus, shared: &Shared, now: Instant) -> LineOutcome {
        if status == LineStatus::Pending {
            return LineOutcome::Continue;
        }
        self.idle_since = now;

        match (self.state, status) {
            (ConnectionState::Idle, LineStatus::Blank) => LineOutcome::Continue,
            (ConnectionState::Idle, _) => match RequestLine::parse(self.reader.line()) {
                Some(request) => self.begin_request(request, shared),
                None => LineOutcome::Disconnect("unsupported method"),
            },
            (ConnectionState::Headers, LineStatus::Blank) => self.end_headers(),
            (ConnectionState::Headers, _) => {
                self.header_line(shared);
                LineOutcome::Continue
            }
            (ConnectionState::SendFile, _) => LineOutcome::Continue,
        }
    }

    fn begin_request(&mut self, request: RequestLine, shared: &Shared) -> LineOutcome {
        let route = shared.dispatcher.resolve(&request.target);
        tracing::debug!(
            id = self.id,
            peer = %self.peer_addr,
            method = %request.method,
            target = %request.target,
            resource = ?route.resource,
            "request"
        );

        if request.method == Method::Post && !matches!(route.resource, Resource::Plugin { .. }) {
            return LineOutcome::Disconnect("POST outside a plugin URL");
        }

        // Stay on the open AVI file when the same video is requested again.
        let same_video = matches!(
            (&self.route.resource, &route.resource),
            (Resource::Video(a), Resource::Video(b)) if a == b
        );
        if !same_video {
            self.payload = None;
        }

        self.state = ConnectionState::Headers;
        self.method = request.method;
        self.need_header = true;
        self.content_length = 0;
        self.remaining = 0;
        self.last_frame = None;
        self.last_capture = None;
        self.auth = AuthState::default();
        self.post = None;
        self.frame_rate = route.frame_rate.unwrap_or(shared.config.frame_rate);
        self.jpeg_quality = route.jpeg_quality.unwrap_or(shared.config.jpeg_quality);
        self.content_type = Cow::Borrowed(route.content_type);
        self.route = route;
        LineOutcome::Continue
    }

    fn header_line(&mut self, shared: &Shared) {
        let Some((name, value)) = request::header(self.reader.line()) else {
            return;
        };
        if name.eq_ignore_ascii_case("Authorization") {
            if self.auth.header_seen {
                return;
            }
            self.auth.header_seen = true;
            let presented = value
                .split_once(' ')
                .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("Basic"))
                .map(|(_, token)| token.trim());
            self.auth.authenticated =
                presented.is_some() && presented == shared.basic_token.as_deref();
        } else if name.eq_ignore_ascii_case("Content-Length") && self.method == Method::Post {
            self.post = value.parse().ok().map(|expected| PostBody {
                expected,
                data: Vec::new(),
            });
        }
    }

    fn end_headers(&mut self) -> LineOutcome {
        if let Some(post) = &self.post
            && post.expected > MAX_POST_BODY
        {
            tracing::warn!(id = self.id, peer = %self.peer_addr, len = post.expected, "request body too large");
            self.post = None;
            self.route = Route::new(Resource::BadRequest);
        }
        self.state = ConnectionState::SendFile;
        LineOutcome::Ready
    }

    /// Return to waiting for the next request.
    pub(crate) fn finish_request(&mut self) {
        self.state = ConnectionState::Idle;
        self.need_header = true;
        self.remaining = 0;
        self.post = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Credentials, ServerConfig};
    use crate::protocol::RequestMode;
    use std::net::TcpListener;

    pub(crate) fn shared(config: ServerConfig) -> Shared {
        Shared::new(config, Default::default(), Default::default())
    }

    pub(crate) fn connection(shared: &Shared) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer_addr) = listener.accept().unwrap();
        let accepted = Accepted {
            id: 3,
            stream,
            peer_addr,
        };
        (
            Connection::new(accepted, LineReader::new(), shared, Instant::now()),
            client,
        )
    }

    fn feed(conn: &mut Connection, shared: &Shared, lines: &[&str]) -> Vec<LineOutcome> {
        lines
            .iter()
            .map(|line| {
                let mut src = std::io::Cursor::new(format!("{line}\r\n").into_bytes());
                let status = conn.reader.poll_line(&mut src).unwrap();
                conn.handle_line(status, shared, Instant::now())
            })
            .collect()
    }

    #[test]
    fn table_claims_lowest_free_slot() {
        let table = ConnectionTable::new(3);
        assert_eq!(table.claim(), Some(0));
        assert_eq!(table.claim(), Some(1));
        assert_eq!(table.claim(), Some(2));
        assert_eq!(table.claim(), None);
        assert_eq!(table.active_count(), 3);

        table.begin_release(1);
        assert_eq!(table.state(1), SlotState::PendingFree);
        assert_eq!(table.claim(), None);
        table.release(1);
        assert_eq!(table.claim(), Some(1));
    }

    #[test]
    fn request_then_blank_line_is_ready() {
        let shared = shared(ServerConfig::default());
        let (mut conn, _client) = connection(&shared);
        let outcomes = feed(&mut conn, &shared, &["", "GET /missing HTTP/1.1", "Host: x", ""]);
        assert_eq!(
            outcomes,
            [
                LineOutcome::Continue,
                LineOutcome::Continue,
                LineOutcome::Continue,
                LineOutcome::Ready
            ]
        );
        assert_eq!(conn.state, ConnectionState::SendFile);
        assert_eq!(conn.route.resource, Resource::NotFound);
        assert_eq!(conn.route.mode, RequestMode::Single);
    }

    #[test]
    fn unknown_verb_disconnects() {
        let shared = shared(ServerConfig::default());
        let (mut conn, _client) = connection(&shared);
        let outcomes = feed(&mut conn, &shared, &["BREW /pot HTCPCP/1.0"]);
        assert!(matches!(outcomes[0], LineOutcome::Disconnect(_)));
    }

    #[test]
    fn post_outside_plugin_disconnects() {
        let shared = shared(ServerConfig::default());
        let (mut conn, _client) = connection(&shared);
        let outcomes = feed(&mut conn, &shared, &["POST /upload HTTP/1.1"]);
        assert!(matches!(outcomes[0], LineOutcome::Disconnect(_)));
    }

    #[test]
    fn first_authorization_header_wins() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let token = credentials.basic_token();
        let shared = shared(ServerConfig {
            credentials: Some(credentials),
            ..ServerConfig::default()
        });
        let (mut conn, _client) = connection(&shared);

        let good = format!("Authorization: Basic {token}");
        feed(&mut conn, &shared, &["GET / HTTP/1.1", &good, "Authorization: Basic bogus", ""]);
        assert!(conn.auth.authenticated);

        conn.finish_request();
        feed(&mut conn, &shared, &["GET / HTTP/1.1", "Authorization: Basic bogus", &good, ""]);
        assert!(conn.auth.header_seen);
        assert!(!conn.auth.authenticated);
    }

    #[test]
    fn request_resets_frame_rate_from_config() {
        let shared = shared(ServerConfig {
            frame_rate: 12,
            ..ServerConfig::default()
        });
        let (mut conn, _client) = connection(&shared);
        conn.frame_rate = 1;
        conn.last_frame = Some(9);
        feed(&mut conn, &shared, &["GET /x HTTP/1.1"]);
        assert_eq!(conn.frame_rate, 12);
        assert_eq!(conn.last_frame, None);
        assert_eq!(conn.state, ConnectionState::Headers);
    }

    #[test]
    fn into_reader_clears_buffers() {
        let shared = shared(ServerConfig::default());
        let (mut conn, _client) = connection(&shared);
        feed(&mut conn, &shared, &["GET / HTTP/1.1"]);
        let reader = conn.into_reader();
        assert!(!reader.has_buffered());
        assert_eq!(reader.line(), "");
    }
}
