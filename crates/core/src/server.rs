use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::{Credentials, ServerConfig, VideoSpec};
use crate::connection::ConnectionTable;
use crate::error::{Result, ServerError};
use crate::media::{AviVideo, CaptureSource, CaptureVideo, SnapshotFile, Video, VideoRegistry};
use crate::plugin::{self, Plugin, PluginRegistry};
use crate::protocol::Dispatcher;
use crate::transport::{WorkerHandle, poll, tcp};
use crate::worker::Worker;

/// Read-only state shared by every worker.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) videos: VideoRegistry,
    pub(crate) plugins: PluginRegistry,
    pub(crate) dispatcher: Dispatcher,
    /// Expected `Authorization: Basic` token, when credentials are set.
    pub(crate) basic_token: Option<String>,
}

impl Shared {
    pub(crate) fn new(config: ServerConfig, videos: VideoRegistry, plugins: PluginRegistry) -> Self {
        Self {
            dispatcher: Dispatcher::new(&config, videos.clone(), plugins.clone()),
            basic_token: config.credentials.as_ref().map(Credentials::basic_token),
            config,
            videos,
            plugins,
        }
    }
}

/// High-level MJPEG server orchestrator.
///
/// Owns the video and plugin registries and the connection table. On
/// [`start`](Self::start) it spawns `workers` worker threads, each serving
/// its share of the slots, and one acceptor thread that hands every new
/// client to the worker owning its slot.
pub struct Server {
    shared: Arc<Shared>,
    table: ConnectionTable,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Build a server from `config`, indexing every configured video.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let config = config.normalized();

        let videos = VideoRegistry::new();
        for spec in &config.videos {
            let video = match spec {
                VideoSpec::Avi(path) => Video::Avi(AviVideo::open(path)?),
                VideoSpec::Snapshot { path, max_fps } => {
                    let source = SnapshotFile::new(path.clone()).with_max_fps(max_fps.unwrap_or(0));
                    Video::Capture(CaptureVideo::new(&path.display().to_string(), Box::new(source)))
                }
            };
            videos.add(video);
        }

        let plugins = PluginRegistry::new();
        for spec in &config.plugins {
            let plugin = plugin::builtin(&spec.library).ok_or_else(|| ServerError::Config {
                line: 0,
                message: format!("plugin `{}` names unknown library `{}`", spec.url, spec.library),
            })?;
            plugins.add(&spec.url, plugin);
        }

        let table = ConnectionTable::new(config.max_connections);
        Ok(Self {
            shared: Arc::new(Shared::new(config, videos, plugins)),
            table,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            threads: Vec::new(),
        })
    }

    /// Mount a plugin at `url`. Plugins are matched in registration order.
    pub fn add_plugin(&self, url: &str, plugin: Arc<dyn Plugin>) -> usize {
        self.shared.plugins.add(url, plugin)
    }

    /// Register a live capture source and return its video index.
    pub fn add_capture(&self, name: &str, source: Box<dyn CaptureSource>) -> usize {
        self.shared.videos.add(Video::Capture(CaptureVideo::new(name, source)))
    }

    pub fn videos(&self) -> &VideoRegistry {
        &self.shared.videos
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        // Threads from a previous run must be gone before slots are reused.
        self.join_threads();

        let shared = self.shared.clone();
        let config = &shared.config;
        let listener = TcpListener::bind(config.bind_addr())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);

        let mut handles = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let (inbox, receiver) = crossbeam_channel::bounded(self.table.capacity());
            let (waker, wake) = match poll::waker() {
                Ok(pair) => pair,
                Err(e) => {
                    self.stop();
                    return Err(e.into());
                }
            };
            let worker = Worker::new(
                index,
                shared.clone(),
                self.table.clone(),
                receiver,
                wake,
                self.running.clone(),
            );
            let spawned = thread::Builder::new()
                .name(format!("mjpeg-worker-{index}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(e.into());
                }
            }
            handles.push(WorkerHandle { inbox, waker });
        }

        let table = self.table.clone();
        let running = self.running.clone();
        let spawned = thread::Builder::new()
            .name("mjpeg-acceptor".to_string())
            .spawn(move || tcp::accept_loop(listener, table, handles, running));
        match spawned {
            Ok(handle) => self.threads.push(handle),
            Err(e) => {
                self.stop();
                return Err(e.into());
            }
        }

        self.local_addr = Some(local_addr);
        tracing::info!(
            addr = %local_addr,
            workers = config.workers,
            max_connections = config.max_connections,
            videos = shared.videos.len(),
            "MJPEG server listening"
        );
        Ok(())
    }

    /// Ask the acceptor and workers to exit at their next tick.
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("server stopping");
        }
    }

    /// Block until every server thread has exited.
    pub fn wait(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            return Err(ServerError::NotStarted);
        }
        self.join_threads();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(ServerError::NotStarted)
    }

    /// Number of slots currently serving a client.
    pub fn active_connections(&self) -> usize {
        self.table.active_count()
    }

    fn join_threads(&mut self) {
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                tracing::error!(thread = ?name, "server thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        self.join_threads();
    }
}
