//! Worker threads.
//!
//! Worker `i` owns every slot whose id satisfies `id % workers == i`. It
//! learns about new clients from the acceptor over a channel, waits for
//! socket readiness with `poll(2)`, then advances each of its connections
//! once per iteration: one request line, or one scheduler pass. The idle
//! sweep runs inline every `sweep_interval`.

use std::mem;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::connection::{Connection, ConnectionState, ConnectionTable, LineOutcome, LineReader, SlotState};
use crate::scheduler::{self, Step};
use crate::server::Shared;
use crate::transport::{Accepted, Readiness, WakeReceiver};

const WAKE_TOKEN: usize = usize::MAX;

/// Poll timeout while a stream is waiting for its next frame.
const FRAME_TICK: Duration = Duration::from_millis(2);

enum Slot {
    /// Never used, or reclaimed by the sweep.
    Vacant,
    /// Unoccupied, with buffers kept for the next client.
    Free { reader: LineReader, since: Instant },
    Active {
        conn: Box<Connection>,
        /// The last scheduler pass had nothing to send.
        waiting: bool,
    },
}

pub(crate) struct Worker {
    index: usize,
    count: usize,
    shared: Arc<Shared>,
    table: ConnectionTable,
    inbox: Receiver<Accepted>,
    wake: WakeReceiver,
    running: Arc<AtomicBool>,
    slots: Vec<Slot>,
    readiness: Readiness,
    scratch: Vec<u8>,
    last_sweep: Instant,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        shared: Arc<Shared>,
        table: ConnectionTable,
        inbox: Receiver<Accepted>,
        wake: WakeReceiver,
        running: Arc<AtomicBool>,
    ) -> Self {
        let count = shared.config.workers;
        let owned = table.capacity().saturating_sub(index).div_ceil(count);
        let now = Instant::now();
        let slots = (0..owned)
            .map(|local| {
                if local * count + index < shared.config.min_connections {
                    Slot::Free {
                        reader: LineReader::new(),
                        since: now,
                    }
                } else {
                    Slot::Vacant
                }
            })
            .collect();
        Self {
            index,
            count,
            scratch: vec![0; shared.config.chunk_size],
            shared,
            table,
            inbox,
            wake,
            running,
            slots,
            readiness: Readiness::new(),
            last_sweep: now,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!(worker = self.index, slots = self.slots.len(), "worker started");
        let mut readable = vec![false; self.slots.len()];
        let mut hangup = vec![false; self.slots.len()];

        while self.running.load(Ordering::SeqCst) {
            self.admit(Instant::now());

            self.wait(&mut readable, &mut hangup);

            let now = Instant::now();
            for local in 0..self.slots.len() {
                self.advance(local, readable[local], hangup[local], now);
            }

            if now.saturating_duration_since(self.last_sweep) >= self.shared.config.sweep_interval {
                self.sweep(now);
                self.last_sweep = now;
            }
        }

        self.shutdown(Instant::now());
        tracing::debug!(worker = self.index, "worker exited");
    }

    /// Close every client, including those published but not yet admitted.
    ///
    /// Returns once the acceptor has exited and dropped its sender, so no
    /// client can be handed over after the drain.
    fn shutdown(&mut self, now: Instant) {
        for accepted in self.inbox.iter() {
            let id = accepted.id;
            tracing::debug!(id, peer = %accepted.peer_addr, "dropping unadmitted client");
            // The socket closes before the slot can be claimed again.
            drop(accepted);
            self.table.release(id);
        }
        for local in 0..self.slots.len() {
            self.disconnect(local, "server stopping", now);
        }
    }

    /// Take ownership of clients published by the acceptor.
    fn admit(&mut self, now: Instant) {
        while let Ok(accepted) = self.inbox.try_recv() {
            debug_assert_eq!(accepted.id % self.count, self.index);
            debug_assert_eq!(self.table.state(accepted.id), SlotState::Active);
            let local = accepted.id / self.count;
            let reader = match mem::replace(&mut self.slots[local], Slot::Vacant) {
                Slot::Vacant => LineReader::new(),
                Slot::Free { reader, .. } => reader,
                Slot::Active { conn, .. } => {
                    tracing::warn!(id = conn.id, "slot reassigned while active");
                    conn.into_reader()
                }
            };
            tracing::info!(id = accepted.id, peer = %accepted.peer_addr, worker = self.index, "client connected");
            let conn = Connection::new(accepted, reader, &self.shared, now);
            self.slots[local] = Slot::Active {
                conn: Box::new(conn),
                waiting: false,
            };
        }
    }

    /// Block until a client needs attention, recording per slot whether it
    /// is readable or hung up.
    fn wait(&mut self, readable: &mut [bool], hangup: &mut [bool]) {
        let timeout = self.timeout();
        self.readiness.clear();
        self.readiness.register(self.wake.as_raw_fd(), WAKE_TOKEN);
        for (local, slot) in self.slots.iter().enumerate() {
            let Slot::Active { conn, .. } = slot else {
                continue;
            };
            // A streaming client's input is never read, so asking for it
            // would keep the wait returning at once.
            if conn.state == ConnectionState::SendFile {
                self.readiness.register_hangup(conn.stream.as_raw_fd(), local);
            } else {
                self.readiness.register(conn.stream.as_raw_fd(), local);
            }
        }

        readable.fill(false);
        hangup.fill(false);
        match self.readiness.wait(timeout) {
            Ok(events) => {
                for event in events {
                    if event.token == WAKE_TOKEN {
                        self.wake.drain();
                    } else {
                        readable[event.token] = event.readable;
                        hangup[event.token] = event.hangup;
                    }
                }
            }
            Err(e) => {
                tracing::error!(worker = self.index, error = %e, "poll failed");
                thread::sleep(FRAME_TICK);
            }
        }
    }

    fn timeout(&self) -> Duration {
        let mut timeout = self.shared.config.idle_poll;
        for slot in &self.slots {
            let Slot::Active { conn, waiting } = slot else {
                continue;
            };
            if conn.state == ConnectionState::SendFile {
                if !waiting {
                    return Duration::ZERO;
                }
                timeout = timeout.min(FRAME_TICK);
            } else if conn.has_buffered_input() {
                return Duration::ZERO;
            }
        }
        timeout
    }

    fn advance(&mut self, local: usize, readable: bool, hangup: bool, now: Instant) {
        let Slot::Active { conn, waiting } = &mut self.slots[local] else {
            return;
        };

        let reason = 'step: {
            if hangup && !readable {
                break 'step Some("connection hung up");
            }
            if conn.state != ConnectionState::SendFile {
                if !readable && !conn.has_buffered_input() {
                    break 'step None;
                }
                match conn.read_line(&self.shared, now) {
                    LineOutcome::Continue => break 'step None,
                    LineOutcome::Disconnect(reason) => break 'step Some(reason),
                    LineOutcome::Ready => {}
                }
            }

            match scheduler::tick(conn, &self.shared, &mut self.scratch, now) {
                Step::Continue => {
                    *waiting = false;
                    None
                }
                Step::Wait => {
                    *waiting = true;
                    None
                }
                Step::Disconnect(reason) => Some(reason),
            }
        };

        if let Some(reason) = reason {
            self.disconnect(local, reason, now);
        }
    }

    /// Close the client in `local` and return the slot to the table.
    fn disconnect(&mut self, local: usize, reason: &'static str, now: Instant) {
        let Slot::Active { conn, .. } = mem::replace(&mut self.slots[local], Slot::Vacant) else {
            return;
        };
        let id = conn.id;
        self.table.begin_release(id);
        tracing::info!(
            id,
            peer = %conn.peer_addr,
            reason,
            connected_for = ?now.saturating_duration_since(conn.connected_at),
            "client disconnected"
        );
        // Drops the socket and any open payload before the slot is reusable.
        let reader = conn.into_reader();
        self.slots[local] = Slot::Free { reader, since: now };
        self.table.release(id);
    }

    fn sweep(&mut self, now: Instant) {
        let config = &self.shared.config;
        let interval = config.sweep_interval;
        let max_idle = config.max_idle_time;
        let min_connections = config.min_connections;

        let mut reclaimed = 0;
        let mut idle = Vec::new();
        for (local, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Slot::Free { since, .. }
                    if local * self.count + self.index >= min_connections
                        && now.saturating_duration_since(*since) >= interval =>
                {
                    *slot = Slot::Vacant;
                    reclaimed += 1;
                }
                Slot::Active { conn, .. }
                    if !max_idle.is_zero() && now.saturating_duration_since(conn.idle_since) > max_idle =>
                {
                    idle.push(local);
                }
                _ => {}
            }
        }

        for &local in &idle {
            self.disconnect(local, "idle timeout", now);
        }
        if reclaimed > 0 || !idle.is_empty() {
            tracing::debug!(worker = self.index, reclaimed, idle = idle.len(), "sweep");
        }
    }
}
