use std::path::Path;

use async_trait::async_trait;
use image::RgbaImage;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExtractError, MediaBackend, MediaHandle, MediaMetadata};
use crate::types::VideoFile;

/// Decodes through `ffprobe`/`ffmpeg` child processes. The upload is copied to
/// a temporary file that lives as long as the handle.
#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl FfmpegBackend {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    fn suffix_for(video: &VideoFile) -> String {
        Path::new(&video.name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_else(|| ".mp4".to_string())
    }
}

fn parse_probe(stdout: &[u8]) -> Result<MediaMetadata, ExtractError> {
    let probe: ProbeOutput =
        serde_json::from_slice(stdout).map_err(|e| ExtractError::Metadata(e.to_string()))?;

    let stream = probe
        .streams
        .first()
        .ok_or_else(|| ExtractError::Metadata("no video stream".to_string()))?;

    let duration = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok());

    Ok(MediaMetadata {
        duration,
        width: stream.width,
        height: stream.height,
    })
}

/// Keep a seek inside the clip. ffmpeg yields no frame at or past the end, so
/// targets beyond it land at the midpoint instead.
fn clamp_to_duration(seconds: f64, duration: Option<f64>) -> f64 {
    match duration {
        Some(d) if d.is_finite() && d > 0.0 && seconds >= d => d / 2.0,
        _ => seconds,
    }
}

#[async_trait]
impl MediaBackend for FfmpegBackend {
    async fn open(&self, video: &VideoFile) -> Result<MediaHandle, ExtractError> {
        let temp = tempfile::Builder::new()
            .prefix("houndforward-")
            .suffix(&Self::suffix_for(video))
            .tempfile()
            .map_err(|e| ExtractError::Open(e.to_string()))?
            .into_temp_path();

        tokio::fs::write(&temp, &video.data).await?;
        let handle = MediaHandle::temporary(temp);
        debug!(handle_id = %handle.id, path = %handle.location.display(), "media handle opened");
        Ok(handle)
    }

    async fn load_metadata(
        &self,
        handle: &mut MediaHandle,
    ) -> Result<MediaMetadata, ExtractError> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height:format=duration")
            .arg("-of")
            .arg("json")
            .arg(&handle.location)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ExtractError::Metadata(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let metadata = parse_probe(&output.stdout)?;
        handle.duration = metadata.duration;
        Ok(metadata)
    }

    async fn seek(&self, handle: &mut MediaHandle, seconds: f64) -> Result<(), ExtractError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ExtractError::SeekUnsupported);
        }
        // ffmpeg seeks when it decodes; record the position for the draw.
        handle.position = Some(clamp_to_duration(seconds, handle.duration));
        Ok(())
    }

    async fn wait_can_play(&self, handle: &mut MediaHandle) -> Result<(), ExtractError> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(&handle.location)
            .arg("-frames:v")
            .arg("1")
            .arg("-f")
            .arg("null")
            .arg("-")
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ExtractError::NotPlayable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        handle.position = None;
        Ok(())
    }

    async fn draw(
        &self,
        handle: &mut MediaHandle,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, ExtractError> {
        let mut command = Command::new(&self.ffmpeg_bin);
        command.arg("-v").arg("error");
        if let Some(position) = handle.position {
            command.arg("-ss").arg(format!("{position:.3}"));
        }
        let output = command
            .arg("-i")
            .arg(&handle.location)
            .arg("-frames:v")
            .arg("1")
            .arg("-vf")
            .arg(format!("scale={width}:{height}"))
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("pipe:1")
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ExtractError::Draw(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let expected = width as usize * height as usize * 4;
        if output.stdout.len() != expected {
            return Err(ExtractError::Draw(format!(
                "expected {expected} bytes of RGBA, decoder produced {}",
                output.stdout.len()
            )));
        }

        RgbaImage::from_raw(width, height, output.stdout)
            .ok_or_else(|| ExtractError::Draw("surface size mismatch".to_string()))
    }

    async fn release(&self, mut handle: MediaHandle) {
        if let Err(e) = handle.revoke() {
            warn!(handle_id = %handle.id, error = %e, "could not remove temporary media");
        } else {
            debug!(handle_id = %handle.id, "media handle released");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn probe_output_is_parsed() {
        let stdout = br#"{"streams": [{"width": 1920, "height": 1080}], "format": {"duration": "12.480000"}}"#;
        let meta = parse_probe(stdout).unwrap();
        assert_eq!(meta.width, Some(1920));
        assert_eq!(meta.height, Some(1080));
        assert_eq!(meta.duration, Some(12.48));
    }

    #[test]
    fn probe_without_duration_is_still_usable() {
        let stdout = br#"{"streams": [{"width": 640, "height": 480}], "format": {"duration": "N/A"}}"#;
        assert_eq!(parse_probe(stdout).unwrap().duration, None);
    }

    #[test]
    fn probe_without_video_stream_is_an_error() {
        assert_matches!(
            parse_probe(br#"{"streams": [], "format": {}}"#),
            Err(ExtractError::Metadata(_))
        );
    }

    #[test]
    fn temp_suffix_follows_file_name() {
        let video = VideoFile::new("Rex.MOV", "video/quicktime", Vec::new());
        assert_eq!(FfmpegBackend::suffix_for(&video), ".mov");
        let video = VideoFile::new("clip", "video/mp4", Vec::new());
        assert_eq!(FfmpegBackend::suffix_for(&video), ".mp4");
    }

    #[tokio::test]
    async fn open_and_release_manage_the_temp_file() {
        let backend = FfmpegBackend::default();
        let video = VideoFile::new("walk.webm", "video/webm", vec![1u8, 2, 3]);
        let handle = backend.open(&video).await.unwrap();
        let path = handle.location.clone();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![1, 2, 3]);

        backend.release(handle).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn negative_seek_is_unsupported() {
        let backend = FfmpegBackend::default();
        let mut handle = MediaHandle::new("unused.mp4".into());
        assert_matches!(
            backend.seek(&mut handle, -1.0).await,
            Err(ExtractError::SeekUnsupported)
        );
        backend.seek(&mut handle, 2.0).await.unwrap();
        assert_eq!(handle.position, Some(2.0));
    }

    #[tokio::test]
    async fn seek_past_a_short_clip_is_clamped() {
        let backend = FfmpegBackend::default();
        let mut handle = MediaHandle::new("unused.mp4".into());
        handle.duration = Some(0.3);
        backend.seek(&mut handle, 0.5).await.unwrap();
        assert_eq!(handle.position, Some(0.15));

        handle.duration = Some(10.0);
        backend.seek(&mut handle, 2.0).await.unwrap();
        assert_eq!(handle.position, Some(2.0));
    }
}
