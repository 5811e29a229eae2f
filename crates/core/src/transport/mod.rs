//! Socket plumbing: accepting clients, readiness polling and bounded sends.

pub mod poll;
pub mod send;
pub mod tcp;

pub use poll::{Readiness, WakeReceiver};
pub use send::send_all;
pub use tcp::{Accepted, WorkerHandle};
