use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};

use super::poll::Waker;
use crate::connection::ConnectionTable;

/// Sent to clients that arrive while every slot is taken.
pub const SERVER_FULL: &[u8] = b"mjpeg-server is full\r\n";

/// A freshly accepted client, already bound to a claimed slot.
#[derive(Debug)]
pub struct Accepted {
    pub id: usize,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

/// The acceptor's handle on one worker thread.
pub struct WorkerHandle {
    pub inbox: Sender<Accepted>,
    pub waker: Waker,
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
/// Each client is assigned the lowest free slot and handed to the worker
/// that owns it (`id % workers`).
pub fn accept_loop(
    listener: TcpListener,
    table: ConnectionTable,
    workers: Vec<WorkerHandle>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let Some(id) = table.claim() else {
                    tracing::warn!(%peer_addr, "connection table full, rejecting client");
                    reject(stream);
                    continue;
                };
                let worker = &workers[id % workers.len()];
                match worker.inbox.try_send(Accepted {
                    id,
                    stream,
                    peer_addr,
                }) {
                    Ok(()) => worker.waker.wake(),
                    Err(TrySendError::Full(accepted) | TrySendError::Disconnected(accepted)) => {
                        tracing::warn!(%peer_addr, id, "worker unavailable, dropping client");
                        table.release(accepted.id);
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    for worker in &workers {
        worker.waker.wake();
    }
    tracing::debug!("accept loop exited");
}

/// Best-effort refusal; the socket is closed on return.
fn reject(mut stream: TcpStream) {
    let _ = stream.write(SERVER_FULL);
}
