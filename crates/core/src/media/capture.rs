//! Live image sources.
//!
//! Device backends are not part of this crate. A [`CaptureSource`] is
//! anything that can hand over one JPEG on request; [`SnapshotFile`]
//! re-reads a file that some external grabber keeps overwriting.

use std::fs;
use std::path::PathBuf;

use crate::error::MediaError;

/// Produces one encoded JPEG image per call.
///
/// Calls for the same source are serialised by the caller, so
/// implementations need not be `Sync`.
pub trait CaptureSource: Send {
    /// Capture one image no larger than `max_len` bytes.
    ///
    /// `quality` is the requested JPEG quality (0-100); sources that
    /// deliver pre-encoded images may ignore it.
    fn capture(&mut self, max_len: u64, quality: u8) -> Result<Vec<u8>, MediaError>;

    /// Upper bound on images per second this source can deliver.
    fn max_fps(&self) -> Option<u32> {
        None
    }
}

/// Serves whatever JPEG currently sits at `path`.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    max_fps: Option<u32>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_fps: None,
        }
    }

    pub fn with_max_fps(mut self, max_fps: u32) -> Self {
        self.max_fps = (max_fps > 0).then_some(max_fps);
        self
    }
}

impl CaptureSource for SnapshotFile {
    fn capture(&mut self, max_len: u64, _quality: u8) -> Result<Vec<u8>, MediaError> {
        let image = fs::read(&self.path)
            .map_err(|e| MediaError::Capture(format!("{}: {e}", self.path.display())))?;
        let len = image.len() as u64;
        if len == 0 {
            return Err(MediaError::EmptyFrame { frame: 0 });
        }
        if len > max_len {
            return Err(MediaError::FrameTooLarge {
                frame: 0,
                len,
                max: max_len,
            });
        }
        Ok(image)
    }

    fn max_fps(&self) -> Option<u32> {
        self.max_fps
    }
}
