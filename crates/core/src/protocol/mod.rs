//! HTTP/1.x request handling for the MJPEG server.
//!
//! The server speaks just enough HTTP for browsers and `<img>` tags:
//!
//! ```text
//! GET /stream?fps=5 HTTP/1.1\r\n
//! Authorization: Basic dXNlcjpwYXNz\r\n
//! \r\n
//! ```
//!
//! Only the request line and a few headers (`Authorization`,
//! `Content-Length`) are interpreted. The blank line ends the header block
//! and hands the connection to the scheduler.
//!
//! ## Response framing
//!
//! | Mode | Status line | Connection |
//! |------|-------------|------------|
//! | Single file/frame | `HTTP/1.1 200 OK` | Keep-Alive |
//! | Multipart stream | `HTTP/1.0 200 OK` | Close |
//! | CGI output | `HTTP/1.1 200 OK` | Close |
//! | Error page | `HTTP/1.1 4xx` | Keep-Alive |
//! | Video error page | `HTTP/1.1 200 OK` | closed after sending |

pub mod dispatch;
pub mod request;
pub mod response;

pub use dispatch::{Alias, AliasKind, CgiHandler, Dispatcher, RequestMode, Resource, Route, VideoSelector};
pub use request::{Method, RequestLine};
pub use response::{ErrorPage, ResponseHead};
