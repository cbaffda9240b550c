//! Placement and rasterisation of overlay markers over a result frame.

use std::{io::Cursor, path::Path};

use bytes::Bytes;
use image::{Rgba, RgbaImage};
use tracing::debug;

use crate::{
    error::{HoundError, Result},
    session::Step,
    types::{CanonicalResult, FrameImage, OverlayPoint},
};

pub const NO_FRAME_PLACEHOLDER: &str = "No frame available";

/// Radius of the coloured disc, in pixels.
pub const MARKER_RADIUS: i64 = 6;
/// Width of the white ring around each disc.
pub const MARKER_RING: i64 = 2;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Which surface the markers are drawn over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlaySurface {
    StillFrame,
    LiveVideo,
}

impl OverlaySurface {
    /// Surface for a result step. Other steps show no overlay at all.
    pub fn for_step(step: Step) -> Option<Self> {
        match step {
            Step::Result => Some(OverlaySurface::StillFrame),
            Step::ResultOverlay => Some(OverlaySurface::LiveVideo),
            _ => None,
        }
    }
}

/// One marker, positioned as a percentage of the frame's bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerPlacement {
    pub left_percent: f64,
    pub top_percent: f64,
    pub color: String,
}

impl From<&OverlayPoint> for MarkerPlacement {
    fn from(point: &OverlayPoint) -> Self {
        Self {
            left_percent: point.x * 100.0,
            top_percent: point.y * 100.0,
            color: point.color.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayView<'a> {
    /// No frame to draw on: show text, plot nothing.
    Placeholder(&'static str),
    Frame {
        frame: &'a FrameImage,
        surface: OverlaySurface,
        /// In paint order, later markers on top.
        markers: Vec<MarkerPlacement>,
        illustrative: bool,
    },
}

impl OverlayView<'_> {
    pub fn markers(&self) -> &[MarkerPlacement] {
        match self {
            OverlayView::Placeholder(_) => &[],
            OverlayView::Frame { markers, .. } => markers,
        }
    }
}

pub fn render(result: &CanonicalResult, surface: OverlaySurface) -> OverlayView<'_> {
    match &result.frame_image {
        None => OverlayView::Placeholder(NO_FRAME_PLACEHOLDER),
        Some(frame) => OverlayView::Frame {
            frame,
            surface,
            markers: result.drawable_points().iter().map(MarkerPlacement::from).collect(),
            illustrative: result.overlay.is_illustrative(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackSpeed {
    #[default]
    Normal,
    Half,
    Quarter,
}

impl PlaybackSpeed {
    pub const ALL: [PlaybackSpeed; 3] = [
        PlaybackSpeed::Normal,
        PlaybackSpeed::Half,
        PlaybackSpeed::Quarter,
    ];

    pub fn multiplier(&self) -> f64 {
        match self {
            PlaybackSpeed::Normal => 1.0,
            PlaybackSpeed::Half => 0.5,
            PlaybackSpeed::Quarter => 0.25,
        }
    }

    pub fn from_multiplier(value: f64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.multiplier() == value)
    }
}

/// Play/pause and speed for the live video surface. Presentation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackControls {
    pub playing: bool,
    pub speed: PlaybackSpeed,
}

impl PlaybackControls {
    /// Returns the new playing state.
    pub fn toggle_playback(&mut self) -> bool {
        self.playing = !self.playing;
        self.playing
    }

    pub fn set_speed(&mut self, speed: PlaybackSpeed) {
        self.speed = speed;
    }
}

/// Parse `#rgb` or `#rrggbb`. Anything else is drawn white.
pub fn parse_color(value: &str) -> Rgba<u8> {
    let hex = value.trim().trim_start_matches('#');
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();

    let rgb = match hex.len() {
        3 if hex.is_ascii() => {
            let mut out = [0u8; 3];
            for (i, c) in hex.chars().enumerate() {
                let v = channel(&c.to_string());
                out[i] = match v {
                    Some(v) => v * 17,
                    None => return WHITE,
                };
            }
            Some(out)
        }
        6 if hex.is_ascii() => match (channel(&hex[0..2]), channel(&hex[2..4]), channel(&hex[4..6])) {
            (Some(r), Some(g), Some(b)) => Some([r, g, b]),
            _ => None,
        },
        _ => None,
    };

    rgb.map(|[r, g, b]| Rgba([r, g, b, 255])).unwrap_or(WHITE)
}

/// Paint `points` onto `image` in order. Points outside the frame are skipped.
pub fn burn_in(image: &mut RgbaImage, points: &[OverlayPoint]) {
    let (width, height) = image.dimensions();
    let outer = MARKER_RADIUS + MARKER_RING;

    for point in points.iter().filter(|p| p.is_placeable()) {
        let cx = (point.x * width as f64).round() as i64;
        let cy = (point.y * height as f64).round() as i64;
        let color = parse_color(&point.color);

        for dy in -outer..=outer {
            for dx in -outer..=outer {
                let (px, py) = (cx + dx, cy + dy);
                if px < 0 || py < 0 || px >= width as i64 || py >= height as i64 {
                    continue;
                }
                let d2 = dx * dx + dy * dy;
                if d2 <= MARKER_RADIUS * MARKER_RADIUS {
                    image.put_pixel(px as u32, py as u32, color);
                } else if d2 <= outer * outer {
                    image.put_pixel(px as u32, py as u32, WHITE);
                }
            }
        }
    }
}

/// Decode the result frame and burn its drawable points in.
pub fn rasterize(result: &CanonicalResult) -> Result<Option<RgbaImage>> {
    let Some(frame) = &result.frame_image else {
        return Ok(None);
    };
    let mut image = image::load_from_memory(&frame.bytes)?.to_rgba8();
    burn_in(&mut image, result.drawable_points());
    Ok(Some(image))
}

pub fn encode_png(image: &RgbaImage) -> Result<Bytes> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, image::ImageFormat::Png)?;
    Ok(Bytes::from(buf.into_inner()))
}

/// Write the annotated frame to `path`. Returns `false` when there was no
/// frame to write.
pub async fn write_annotated_png(result: &CanonicalResult, path: &Path) -> Result<bool> {
    let Some(image) = rasterize(result)? else {
        return Ok(false);
    };
    let png = encode_png(&image)?;
    tokio::fs::write(path, &png)
        .await
        .map_err(|e| HoundError::FrameWriteFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    debug!(path = %path.display(), markers = result.drawable_points().len(), "annotated frame written");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use base64::{Engine, engine::general_purpose::STANDARD};

    use super::*;
    use crate::{
        reconcile::{apply_illustrative_fallback, reconcile_response},
        types::OverlaySource,
    };

    fn frame_b64(width: u32, height: u32) -> String {
        let mut buf = Cursor::new(Vec::new());
        RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]))
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        STANDARD.encode(buf.into_inner())
    }

    fn from_body(body: &str) -> CanonicalResult {
        reconcile_response(serde_json::from_str(body).unwrap()).finish(None)
    }

    #[test]
    fn missing_frame_renders_placeholder_and_no_markers() {
        let result = from_body(r#"{"score": 2.0}"#);
        let view = render(&result, OverlaySurface::StillFrame);
        assert_eq!(view, OverlayView::Placeholder(NO_FRAME_PLACEHOLDER));
        assert!(view.markers().is_empty());
        assert!(rasterize(&result).unwrap().is_none());
    }

    #[test]
    fn points_without_frame_are_not_plotted() {
        let result = from_body(r##"{"overlay_points": [{"x": 0.2, "y": 0.3, "color": "#f00"}]}"##);
        assert_eq!(result.overlay.points().len(), 1);
        assert!(render(&result, OverlaySurface::LiveVideo).markers().is_empty());
    }

    #[test]
    fn single_point_lands_at_the_midpoint() {
        let body = format!(
            r##"{{"overlay_points": [{{"x": 0.5, "y": 0.5, "color": "#fff"}}], "frame_jpeg_b64": "{}"}}"##,
            frame_b64(40, 20)
        );
        let result = from_body(&body);
        let view = render(&result, OverlaySurface::StillFrame);

        assert_eq!(
            view.markers(),
            [MarkerPlacement {
                left_percent: 50.0,
                top_percent: 50.0,
                color: "#fff".to_string(),
            }]
        );

        let image = rasterize(&result).unwrap().unwrap();
        assert_eq!(*image.get_pixel(20, 10), WHITE);
        assert_eq!(*image.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn markers_keep_order_and_paint_last_on_top() {
        let mut image = RgbaImage::new(20, 20);
        burn_in(
            &mut image,
            &[
                OverlayPoint::new(0.5, 0.5, "#ff0000"),
                OverlayPoint::new(0.5, 0.5, "#0000ff"),
            ],
        );
        assert_eq!(*image.get_pixel(10, 10), Rgba([0, 0, 255, 255]));
        assert_eq!(*image.get_pixel(10, 17), WHITE);
        assert_eq!(*image.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn markers_near_the_edge_are_clipped() {
        let mut image = RgbaImage::new(10, 10);
        burn_in(&mut image, &[OverlayPoint::new(0.0, 1.0, "#2FB36D")]);
        assert_eq!(*image.get_pixel(0, 9), Rgba([0x2F, 0xB3, 0x6D, 255]));
    }

    #[test]
    fn illustrative_markers_are_flagged_in_the_view() {
        let body = format!(r#"{{"frame_jpeg_b64": "{}"}}"#, frame_b64(8, 8));
        let mut result = from_body(&body);
        apply_illustrative_fallback(&mut result, true);
        assert!(matches!(result.overlay, OverlaySource::Illustrative(_)));

        match render(&result, OverlaySurface::StillFrame) {
            OverlayView::Frame { markers, illustrative, .. } => {
                assert!(illustrative);
                assert_eq!(markers.len(), 5);
            }
            other => panic!("expected a frame view, got {other:?}"),
        }
    }

    #[test]
    fn out_of_frame_points_are_skipped() {
        let mut image = RgbaImage::new(10, 10);
        burn_in(
            &mut image,
            &[
                OverlayPoint::new(1e300, 0.5, "#fff"),
                OverlayPoint::new(0.5, f64::NAN, "#fff"),
                OverlayPoint::new(-3.0, f64::INFINITY, "#fff"),
            ],
        );
        assert!(image.pixels().all(|p| *p == Rgba([0, 0, 0, 0])));
    }

    #[test]
    fn colours_parse_or_fall_back_to_white() {
        assert_eq!(parse_color("#fff"), WHITE);
        assert_eq!(parse_color("#E35D5D"), Rgba([0xE3, 0x5D, 0x5D, 255]));
        assert_eq!(parse_color("#0a0"), Rgba([0, 0xAA, 0, 255]));
        assert_eq!(parse_color("teal"), WHITE);
        assert_eq!(parse_color("#12345z"), WHITE);
    }

    #[test]
    fn surface_follows_result_step() {
        assert_eq!(OverlaySurface::for_step(Step::Result), Some(OverlaySurface::StillFrame));
        assert_eq!(
            OverlaySurface::for_step(Step::ResultOverlay),
            Some(OverlaySurface::LiveVideo)
        );
        assert_eq!(OverlaySurface::for_step(Step::Processing), None);
    }

    #[test]
    fn playback_speeds_are_fixed() {
        let mut controls = PlaybackControls::default();
        assert!(controls.toggle_playback());
        assert!(!controls.toggle_playback());

        assert_eq!(PlaybackSpeed::from_multiplier(0.25), Some(PlaybackSpeed::Quarter));
        assert_eq!(PlaybackSpeed::from_multiplier(2.0), None);
        controls.set_speed(PlaybackSpeed::Half);
        assert_eq!(controls.speed.multiplier(), 0.5);
    }

    #[tokio::test]
    async fn annotated_png_is_written() {
        let body = format!(
            r#"{{"overlay_points": [{{"x": 0.25, "y": 0.25}}], "frame_jpeg_b64": "{}"}}"#,
            frame_b64(16, 16)
        );
        let result = from_body(&body);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.png");

        assert!(write_annotated_png(&result, &path).await.unwrap());
        let written = image::open(&path).unwrap().to_rgba8();
        assert_eq!(*written.get_pixel(4, 4), Rgba([0x2F, 0xB3, 0x6D, 255]));

        let empty = from_body("{}");
        assert!(!write_annotated_png(&empty, &dir.path().join("none.png")).await.unwrap());
    }
}
