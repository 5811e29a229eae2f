pub mod config;
pub(crate) mod connection;
pub mod error;
pub mod media;
pub mod plugin;
pub mod protocol;
pub(crate) mod scheduler;
pub mod server;
pub(crate) mod transport;
pub(crate) mod worker;

pub use config::{Credentials, PluginSpec, ServerConfig, VideoSpec};
pub use error::{AviErrorKind, MediaError, Result, ServerError};
pub use media::{CaptureSource, SnapshotFile, Video, VideoRegistry};
pub use plugin::{EchoPlugin, Plugin, PluginReply, PluginRegistry};
pub use server::Server;
