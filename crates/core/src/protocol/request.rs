//! Request-line and header parsing.

use std::fmt;

/// Request methods the server answers. Anything else closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// The first line of an HTTP request.
///
/// ```text
/// GET /path?query HTTP/1.1
/// ```
///
/// The method is matched case-insensitively. The target is everything up
/// to the next space and may be empty; the version is not checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub target: String,
}

impl RequestLine {
    /// Parse a request line. Returns `None` for unsupported methods.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next()?;
        let method = if verb.eq_ignore_ascii_case("GET") {
            Method::Get
        } else if verb.eq_ignore_ascii_case("POST") {
            Method::Post
        } else {
            return None;
        };
        Some(Self {
            method,
            target: parts.next().unwrap_or_default().to_string(),
        })
    }

    /// Target with any query string removed.
    pub fn path(&self) -> &str {
        split_query(&self.target).0
    }

    /// Query string after `?`, or empty.
    pub fn query(&self) -> &str {
        split_query(&self.target).1
    }
}

/// Split `target` at the first `?`.
pub fn split_query(target: &str) -> (&str, &str) {
    target.split_once('?').unwrap_or((target, ""))
}

/// Iterate over `name=value` pairs of a query string, in order.
///
/// A pair without `=` yields an empty value.
pub fn query_pairs(query: &str) -> impl Iterator<Item = (&str, &str)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

/// First value of `name` in `query`.
pub fn query_value<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query_pairs(query).find(|(key, _)| *key == name).map(|(_, value)| value)
}

/// Split a header line into trimmed name and value.
pub fn header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim(), value.trim()))
}

/// Decode `%XX` escapes in a URL path.
///
/// Returns `None` on a malformed escape or when decoding yields a control
/// character or invalid UTF-8.
pub fn url_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let byte = match bytes[i] {
            b'%' => {
                let hi = hex_digit(*bytes.get(i + 1)?)?;
                let lo = hex_digit(*bytes.get(i + 2)?)?;
                i += 2;
                (hi << 4) | lo
            }
            other => other,
        };
        if byte < b' ' || byte == 0x7f {
            return None;
        }
        out.push(byte);
        i += 1;
    }
    String::from_utf8(out).ok()
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Reject paths that could escape the document root: any `~`, or a
/// `..` sequence anywhere in the path.
pub fn is_safe_path(path: &str) -> bool {
    !path.contains('~') && !path.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_get_and_post() {
        let req = RequestLine::parse("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/index.html");

        let req = RequestLine::parse("post /echo?x=1 HTTP/1.0").unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path(), "/echo");
        assert_eq!(req.query(), "x=1");
    }

    #[test]
    fn unsupported_methods() {
        assert!(RequestLine::parse("DELETE /x HTTP/1.1").is_none());
        assert!(RequestLine::parse("OPTIONS * HTTP/1.1").is_none());
        assert!(RequestLine::parse("").is_none());
    }

    #[test]
    fn missing_target_is_empty() {
        let req = RequestLine::parse("GET").unwrap();
        assert_eq!(req.target, "");
        assert_eq!(req.path(), "");
    }

    #[test]
    fn query_parsing() {
        let q = "video=2&fps=5&flag&fps=9";
        assert_eq!(query_value(q, "video"), Some("2"));
        assert_eq!(query_value(q, "fps"), Some("5"));
        assert_eq!(query_value(q, "flag"), Some(""));
        assert_eq!(query_value(q, "size"), None);
        assert_eq!(query_pairs("").count(), 0);
    }

    #[test]
    fn header_split() {
        assert_eq!(header("Content-Length: 12"), Some(("Content-Length", "12")));
        assert_eq!(header("Host:example"), Some(("Host", "example")));
        assert_eq!(header("garbage"), None);
    }

    #[test]
    fn decode_escapes() {
        assert_eq!(url_decode("/my%20file.html").as_deref(), Some("/my file.html"));
        assert_eq!(url_decode("/a+b%2Fc%2f").as_deref(), Some("/a+b/c/"));
        assert_eq!(url_decode("/caf%C3%A9").as_deref(), Some("/café"));
        assert_eq!(url_decode("/bad%2"), None);
        assert_eq!(url_decode("/bad%zz"), None);
        assert_eq!(url_decode("/nul%00"), None);
    }

    #[test]
    fn traversal_rejected() {
        assert!(is_safe_path("/index.html"));
        assert!(is_safe_path("/dir/file.v2.txt"));
        assert!(!is_safe_path("/../etc/passwd"));
        assert!(!is_safe_path("/a/..."));
        assert!(!is_safe_path("/~root/.profile"));
    }
}
