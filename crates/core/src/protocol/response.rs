/// Server identification string included in every response.
pub const SERVER_AGENT: &str = "mjpeg-server/0.1";

/// Fixed `Last-Modified` sent with every file, so clients never cache
/// against it.
pub const LAST_MODIFIED: &str = "Wed, 29 May 1974 07:00:00 GMT";

/// Multipart boundary token, as it appears in the `Content-Type` parameter.
pub const BOUNDARY: &str = "--myboundary";

/// Authentication realm announced on 401 responses.
pub const REALM: &str = "mjpeg-server";

/// A response status line and header block.
///
/// Serializes to:
///
/// ```text
/// HTTP/1.1 200 OK\r\n
/// Server: mjpeg-server/0.1\r\n
/// Content-Length: 5\r\n
/// \r\n
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header), then
/// call [`serialize`](Self::serialize). Bodies are streamed separately by
/// the scheduler.
#[must_use]
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: &'static str,
    pub status_code: u16,
    pub status_text: &'static str,
    pub headers: Vec<(&'static str, String)>,
}

impl ResponseHead {
    pub fn new(status_code: u16, status_text: &'static str) -> Self {
        Self {
            version: "HTTP/1.1",
            status_code,
            status_text,
            headers: vec![("Server", SERVER_AGENT.to_string())],
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn add_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Headers that keep proxies and browsers from caching the response.
    pub fn no_cache(self) -> Self {
        self.add_header("Cache-Control", "no-cache")
            .add_header("Pragma", "no-cache")
    }

    pub fn serialize(&self) -> String {
        let mut head = format!("{} {} {}\r\n", self.version, self.status_code, self.status_text);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head
    }
}

/// Header block for a complete, keep-alive response of known length.
pub fn single(content_length: u64, content_type: &str) -> String {
    ResponseHead::ok()
        .no_cache()
        .add_header("Last-Modified", LAST_MODIFIED)
        .add_header("Connection", "Keep-Alive")
        .add_header("Content-Length", content_length.to_string())
        .add_header("Content-Type", content_type)
        .serialize()
}

/// Status line and headers for CGI output.
///
/// The script writes its own `Content-Type` and the blank line that ends
/// the header block, so this does not terminate it.
pub fn cgi() -> String {
    let mut head = ResponseHead::ok()
        .no_cache()
        .add_header("Last-Modified", LAST_MODIFIED)
        .add_header("Connection", "Close")
        .serialize();
    head.truncate(head.len() - 2);
    head
}

/// Envelope opening a `multipart/x-mixed-replace` stream, followed by the
/// header of its first part.
pub fn multipart_first(content_length: u64) -> String {
    let mut envelope = ResponseHead {
        version: "HTTP/1.0",
        status_code: 200,
        status_text: "OK",
        headers: Vec::new(),
    }
    .no_cache()
    .add_header("Expires", "Thu, 01 Dec 1994 16:00:00 GMT")
    .add_header("Connection", "Close")
    .add_header(
        "Content-Type",
        format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
    )
    .serialize();
    envelope.push_str(&part_header(content_length));
    envelope
}

/// Header of every part after the first, including the CRLF that ends the
/// previous part's body.
pub fn multipart_next(content_length: u64) -> String {
    format!("\r\n{}", part_header(content_length))
}

fn part_header(content_length: u64) -> String {
    format!("{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {content_length}\r\n\r\n")
}

/// Canned HTML error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPage {
    NotFound,
    BadRequest,
    Unauthorized,
    /// A video frame could not be read or exceeds the frame size limit.
    Video,
}

impl ErrorPage {
    fn status(self) -> (u16, &'static str) {
        match self {
            ErrorPage::NotFound => (404, "Not Found"),
            ErrorPage::BadRequest => (400, "Bad Request"),
            ErrorPage::Unauthorized => (401, "Authorization Required"),
            ErrorPage::Video => (200, "OK"),
        }
    }

    pub fn body(self) -> &'static str {
        match self {
            ErrorPage::NotFound => {
                "<html><body><br><br><h1>404 - mjpeg-server FILE NOT FOUND</h1></body></html>\r\n"
            }
            ErrorPage::BadRequest => {
                "<html><body><br><br><h1>400 - mjpeg-server Bad Request</h1></body></html>\r\n"
            }
            ErrorPage::Unauthorized => {
                "<html><body><br><br><h1>401 - mjpeg-server Authorization Required</h1></body></html>\r\n"
            }
            ErrorPage::Video => {
                "<html><body><br><br><h1>mjpeg-server Error: AVI frame too big or parse error</h1></body></html>\r\n"
            }
        }
    }

    /// Full response: header block plus body. The connection stays open.
    pub fn render(self) -> Vec<u8> {
        let (code, text) = self.status();
        let mut head = ResponseHead::new(code, text).add_header("Connection", "Keep-Alive");
        if self == ErrorPage::Unauthorized {
            head = head.add_header("WWW-Authenticate", format!("Basic realm=\"{REALM}\""));
        }
        let body = self.body();
        let mut out = head
            .add_header("Content-Type", "text/html")
            .add_header("Content-Length", body.len().to_string())
            .serialize()
            .into_bytes();
        out.extend_from_slice(body.as_bytes());
        out
    }
}
