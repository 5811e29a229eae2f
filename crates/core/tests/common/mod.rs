//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use mjpeg::{Server, ServerConfig};

/// A fresh directory under the system temp dir, unique to this test.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mjpeg-it-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    if body.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn list(form: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    let mut body = form.to_vec();
    for child in children {
        body.extend_from_slice(child);
    }
    chunk(b"LIST", &body)
}

/// Write a minimal MJPEG AVI whose `idx1` uses absolute offsets.
pub fn write_avi(path: &Path, microsec_per_frame: u32, frames: &[Vec<u8>]) {
    let mut avih = Vec::new();
    for word in [microsec_per_frame, 0, 0, 0x10, frames.len() as u32, 0, 1, 0, 320, 240, 0, 0, 0, 0] {
        avih.extend_from_slice(&word.to_le_bytes());
    }
    let hdrl = list(b"hdrl", &[chunk(b"avih", &avih)]);

    let frame_chunks: Vec<Vec<u8>> = frames.iter().map(|f| chunk(b"00dc", f)).collect();
    let movi = list(b"movi", &frame_chunks);

    // RIFF header, hdrl, then the movi LIST header and form type.
    let mut offset = 12 + hdrl.len() as u32 + 12;
    let mut records = Vec::new();
    for (frame, encoded) in frames.iter().zip(&frame_chunks) {
        records.extend_from_slice(b"00dc");
        for word in [0x10, offset, frame.len() as u32] {
            records.extend_from_slice(&word.to_le_bytes());
        }
        offset += encoded.len() as u32;
    }

    let mut form = b"AVI ".to_vec();
    form.extend_from_slice(&hdrl);
    form.extend_from_slice(&movi);
    form.extend_from_slice(&chunk(b"idx1", &records));
    fs::write(path, chunk(b"RIFF", &form)).unwrap();
}

/// A fake JPEG of `len` bytes filled with `fill`.
pub fn jpeg(len: usize, fill: u8) -> Vec<u8> {
    let mut image = vec![fill; len];
    image[0] = 0xFF;
    image[1] = 0xD8;
    image[len - 2] = 0xFF;
    image[len - 1] = 0xD9;
    image
}

/// Loopback config on a fixed port.
pub fn config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_host: "127.0.0.1".to_string(),
        port,
        workers: 2,
        ..ServerConfig::default()
    }
}

pub fn start(config: ServerConfig) -> Server {
    let mut server = Server::new(config).expect("server config");
    server.start().expect("server start");
    server
}

pub fn connect(server: &Server) -> TcpStream {
    let addr = server.local_addr().unwrap();
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to server");
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream.set_write_timeout(Some(Duration::from_secs(3))).unwrap();
    stream
}

pub fn send(stream: &mut TcpStream, text: &str) {
    stream.write_all(text.as_bytes()).unwrap();
    stream.flush().unwrap();
}

/// Read up to and including the blank line that ends a header block.
pub fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read header");
        assert_eq!(n, 1, "connection closed inside header: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

pub fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

pub fn content_length(head: &str) -> usize {
    header(head, "Content-Length")
        .and_then(|v| v.parse().ok())
        .expect("Content-Length header")
}

/// Read one complete response with a `Content-Length`.
pub fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let head = read_head(stream);
    let mut body = vec![0u8; content_length(&head)];
    stream.read_exact(&mut body).expect("read body");
    (head, body)
}

/// Whether the server has closed its side of the connection.
pub fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(stream.read(&mut buf), Ok(0))
}

/// Poll `check` until it holds or two seconds pass.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}
