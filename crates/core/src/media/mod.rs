//! Video sources served by the scheduler.
//!
//! A [`Video`] is either an indexed AVI file looping on a shared
//! [`PlaybackClock`], or a live [`CaptureSource`]. Videos are addressed by
//! their position in the [`VideoRegistry`], in configuration order.

pub mod avi;
pub mod capture;
pub mod clock;
pub mod mime;

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::{AviErrorKind, MediaError, Result, ServerError};

pub use avi::AviIndex;
pub use capture::{CaptureSource, SnapshotFile};
pub use clock::PlaybackClock;

/// An AVI file and the clock that drives its playback.
#[derive(Debug)]
pub struct AviVideo {
    path: PathBuf,
    index: AviIndex,
    clock: PlaybackClock,
}

impl AviVideo {
    /// Index the file at `path`. Playback starts now, at frame 0.
    pub fn open(path: &Path) -> Result<Self> {
        let index = avi::index_file(path)?;
        Self::from_index(path, index, Instant::now())
    }

    pub fn from_index(path: &Path, index: AviIndex, anchor: Instant) -> Result<Self> {
        let invalid = |kind| ServerError::Avi {
            path: path.to_path_buf(),
            kind,
        };
        let fps = NonZeroU32::new(index.fps).ok_or_else(|| invalid(AviErrorKind::InvalidFrameRate))?;
        let total =
            NonZeroU32::new(index.total_frames()).ok_or_else(|| invalid(AviErrorKind::MissingIndex))?;
        tracing::info!(
            path = %path.display(),
            fps = fps.get(),
            frames = total.get(),
            "AVI indexed"
        );
        Ok(Self {
            path: path.to_path_buf(),
            clock: PlaybackClock::new(fps, total, anchor),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fps(&self) -> u32 {
        self.clock.fps()
    }

    pub fn total_frames(&self) -> u32 {
        self.clock.total_frames()
    }

    pub fn index(&self) -> &AviIndex {
        &self.index
    }

    /// Frame due for display at `now`.
    pub fn due_frame(&self, now: Instant) -> u32 {
        self.clock.frame_at(now)
    }

    /// File position of the chunk header for `frame`.
    pub fn frame_offset(&self, frame: u32) -> Option<u64> {
        self.index.offsets.get(frame as usize).copied()
    }
}

/// A live source, with its own lock so one capture runs at a time.
pub struct CaptureVideo {
    name: String,
    source: Mutex<Box<dyn CaptureSource>>,
}

impl CaptureVideo {
    pub fn new(name: &str, source: Box<dyn CaptureSource>) -> Self {
        Self {
            name: name.to_string(),
            source: Mutex::new(source),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_fps(&self) -> Option<u32> {
        self.source.lock().max_fps()
    }

    pub fn capture(&self, max_len: u64, quality: u8) -> std::result::Result<Vec<u8>, MediaError> {
        self.source.lock().capture(max_len, quality)
    }
}

impl std::fmt::Debug for CaptureVideo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureVideo").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
pub enum Video {
    Avi(AviVideo),
    Capture(CaptureVideo),
}

impl Video {
    pub fn describe(&self) -> String {
        match self {
            Video::Avi(avi) => avi.path().display().to_string(),
            Video::Capture(capture) => capture.name().to_string(),
        }
    }
}

/// Ordered list of videos, shared by every worker.
#[derive(Clone, Default)]
pub struct VideoRegistry {
    videos: Arc<RwLock<Vec<Arc<Video>>>>,
}

impl VideoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a video and return its index.
    pub fn add(&self, video: Video) -> usize {
        let mut videos = self.videos.write();
        tracing::debug!(index = videos.len(), source = %video.describe(), "video registered");
        videos.push(Arc::new(video));
        videos.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<Arc<Video>> {
        self.videos.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.videos.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
