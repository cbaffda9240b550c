//! Representative still frame extraction.
//!
//! The pipeline is a short explicit state machine:
//! metadata → seek → draw, with a can-play fallback when seeking fails. Every
//! suspension point is bounded by a timeout. Failures never escape: the caller
//! gets `None` and shows "no frame available".

mod ffmpeg;

use std::{future::Future, io::Cursor, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use image::RgbaImage;
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{FrameImage, FrameOrigin, ImageFormat, VideoFile};

pub use ffmpeg::FfmpegBackend;

pub const FALLBACK_WIDTH: u32 = 640;
pub const FALLBACK_HEIGHT: u32 = 360;
pub const FALLBACK_SEEK_SECONDS: f64 = 0.5;
pub const MAX_SEEK_SECONDS: f64 = 2.0;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Could not open media: {0}")]
    Open(String),

    #[error("Media metadata unavailable: {0}")]
    Metadata(String),

    #[error("Seeking is not supported for this media")]
    SeekUnsupported,

    #[error("Seek failed: {0}")]
    Seek(String),

    #[error("Media never became playable: {0}")]
    NotPlayable(String),

    #[error("Could not draw frame: {0}")]
    Draw(String),

    #[error("Could not encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Facts known once metadata has loaded. Any of them may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MediaMetadata {
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl MediaMetadata {
    /// Raster surface size: intrinsic dimensions, or 640×360 when unknown.
    pub fn surface_size(&self) -> (u32, u32) {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => (FALLBACK_WIDTH, FALLBACK_HEIGHT),
        }
    }
}

/// A temporary decodable reference to a video. Backing storage is removed on
/// [`MediaBackend::release`], or on drop if the extraction was abandoned.
#[derive(Debug)]
pub struct MediaHandle {
    pub id: Uuid,
    pub location: PathBuf,
    /// Current playback position in seconds; `None` until a seek lands.
    pub position: Option<f64>,
    /// Duration in seconds once metadata has loaded, if the media reports one.
    pub duration: Option<f64>,
    temp: Option<TempPath>,
}

impl MediaHandle {
    pub fn new(location: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            location,
            position: None,
            duration: None,
            temp: None,
        }
    }

    pub fn temporary(temp: TempPath) -> Self {
        Self {
            id: Uuid::new_v4(),
            location: temp.to_path_buf(),
            position: None,
            duration: None,
            temp: Some(temp),
        }
    }

    /// Remove any temporary backing file now.
    pub fn revoke(&mut self) -> std::io::Result<()> {
        match self.temp.take() {
            Some(temp) => temp.close(),
            None => Ok(()),
        }
    }
}

/// Decoding primitives the extractor is built on. Handles are opened muted,
/// without autoplay and with metadata-only preloading.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn open(&self, video: &VideoFile) -> Result<MediaHandle, ExtractError>;

    async fn load_metadata(&self, handle: &mut MediaHandle)
    -> Result<MediaMetadata, ExtractError>;

    async fn seek(&self, handle: &mut MediaHandle, seconds: f64) -> Result<(), ExtractError>;

    /// Wait until the media can play from its current position.
    async fn wait_can_play(&self, handle: &mut MediaHandle) -> Result<(), ExtractError>;

    /// Draw the frame at the current position onto a `width`×`height` surface.
    async fn draw(
        &self,
        handle: &mut MediaHandle,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, ExtractError>;

    async fn release(&self, handle: MediaHandle);
}

/// Seek target that skips the often-black first frame while staying inside
/// short clips.
pub fn target_seek_time(duration: Option<f64>) -> f64 {
    match duration {
        Some(d) if d.is_finite() && d > 1.0 => (d / 3.0).min(MAX_SEEK_SECONDS),
        _ => FALLBACK_SEEK_SECONDS,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    AwaitMetadata,
    Seek { target: f64, size: (u32, u32) },
    AwaitCanPlay { size: (u32, u32) },
    /// `after_seek` draws get one retry from the can-play position.
    Draw { size: (u32, u32), after_seek: bool },
}

#[derive(Clone)]
pub struct FrameExtractor {
    backend: Arc<dyn MediaBackend>,
    step_timeout: Duration,
}

impl FrameExtractor {
    pub fn new(backend: Arc<dyn MediaBackend>, step_timeout: Duration) -> Self {
        Self {
            backend,
            step_timeout,
        }
    }

    /// Produce zero or one PNG still from `video`.
    pub async fn extract(&self, video: &VideoFile) -> Option<FrameImage> {
        let mut handle = match self.bounded("open", self.backend.open(video)).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(video = %video.name, error = %e, "frame extraction could not start");
                return None;
            }
        };

        let outcome = self.run(&mut handle).await;
        let handle_id = handle.id;
        self.backend.release(handle).await;

        match outcome {
            Ok(frame) => {
                debug!(%handle_id, bytes = frame.bytes.len(), "frame extracted");
                Some(frame)
            }
            Err(e) => {
                warn!(%handle_id, video = %video.name, error = %e, "frame extraction failed");
                None
            }
        }
    }

    async fn run(&self, handle: &mut MediaHandle) -> Result<FrameImage, ExtractError> {
        let mut stage = Stage::AwaitMetadata;
        loop {
            debug!(handle_id = %handle.id, ?stage, "frame extraction stage");
            stage = match stage {
                Stage::AwaitMetadata => {
                    let metadata = self
                        .bounded("metadata", self.backend.load_metadata(handle))
                        .await?;
                    Stage::Seek {
                        target: target_seek_time(metadata.duration),
                        size: metadata.surface_size(),
                    }
                }
                Stage::Seek { target, size } => {
                    match self.bounded("seek", self.backend.seek(handle, target)).await {
                        Ok(()) => Stage::Draw {
                            size,
                            after_seek: true,
                        },
                        Err(e) => {
                            debug!(target_s = target, error = %e, "seek failed, waiting for can-play");
                            Stage::AwaitCanPlay { size }
                        }
                    }
                }
                Stage::AwaitCanPlay { size } => {
                    self.bounded("can_play", self.backend.wait_can_play(handle))
                        .await?;
                    Stage::Draw {
                        size,
                        after_seek: false,
                    }
                }
                Stage::Draw { size, after_seek } => {
                    let (width, height) = size;
                    match self
                        .bounded("draw", self.backend.draw(handle, width, height))
                        .await
                    {
                        Ok(surface) => return encode_png(surface),
                        Err(e) if after_seek => {
                            debug!(error = %e, "draw after seek failed, waiting for can-play");
                            Stage::AwaitCanPlay { size }
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
        }
    }

    async fn bounded<T>(
        &self,
        stage: &'static str,
        fut: impl Future<Output = Result<T, ExtractError>>,
    ) -> Result<T, ExtractError> {
        tokio::time::timeout(self.step_timeout, fut)
            .await
            .map_err(|_| ExtractError::Timeout {
                stage,
                after: self.step_timeout,
            })?
    }
}

fn encode_png(surface: RgbaImage) -> Result<FrameImage, ExtractError> {
    let mut buf = Cursor::new(Vec::new());
    surface.write_to(&mut buf, image::ImageFormat::Png)?;
    Ok(FrameImage {
        bytes: Bytes::from(buf.into_inner()),
        format: ImageFormat::Png,
        origin: FrameOrigin::Local,
    })
}
