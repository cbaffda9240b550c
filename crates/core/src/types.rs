use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The video chosen by the user. Cloning shares the underlying buffer.
#[derive(Debug, Clone)]
pub struct VideoFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

impl VideoFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            data: data.into(),
        }
    }

    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Owner supplied metadata that travels with the upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DogProfile {
    pub withers_cm: Option<String>,
    pub breed: Option<String>,
    pub age: Option<String>,
    pub conditions: Vec<String>,
}

/// Everything sent to `POST /api/analyze` for one submission.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub video: VideoFile,
    pub withers_cm: String,
    pub breed: String,
    pub age: String,
    pub conditions: String,
}

impl UploadRequest {
    pub fn new(video: VideoFile, profile: &DogProfile, default_withers_cm: &str) -> Self {
        let withers_cm = profile
            .withers_cm
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .unwrap_or(default_withers_cm)
            .to_string();

        Self {
            video,
            withers_cm,
            breed: profile.breed.clone().unwrap_or_default(),
            age: profile.age.clone().unwrap_or_default(),
            conditions: profile.conditions.join(","),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayPoint {
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_point_color")]
    pub color: String,
}

fn default_point_color() -> String {
    "#2FB36D".to_string()
}

impl OverlayPoint {
    pub fn new(x: f64, y: f64, color: impl Into<String>) -> Self {
        Self {
            x,
            y,
            color: color.into(),
        }
    }

    /// Both coordinates are finite fractions of the frame.
    pub fn is_placeable(&self) -> bool {
        let fraction = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        fraction(self.x) && fraction(self.y)
    }

    /// Parse a JSON array of points, dropping entries that are malformed or
    /// fall outside the frame. `None` when `value` is not an array.
    pub fn list_from_value(value: serde_json::Value) -> Option<Vec<OverlayPoint>> {
        let serde_json::Value::Array(entries) = value else {
            return None;
        };
        Some(
            entries
                .into_iter()
                .filter_map(|entry| serde_json::from_value::<OverlayPoint>(entry).ok())
                .filter(OverlayPoint::is_placeable)
                .collect(),
        )
    }
}

/// Where a set of overlay points came from. Detected and illustrative points
/// are never merged.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OverlaySource {
    /// Keypoints reported by the analysis service.
    Detected(Vec<OverlayPoint>),
    /// Fixed demonstration markers, only used when explicitly enabled.
    Illustrative(Vec<OverlayPoint>),
    #[default]
    None,
}

impl OverlaySource {
    pub fn points(&self) -> &[OverlayPoint] {
        match self {
            OverlaySource::Detected(points) | OverlaySource::Illustrative(points) => points,
            OverlaySource::None => &[],
        }
    }

    pub fn is_illustrative(&self) -> bool {
        matches!(self, OverlaySource::Illustrative(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Rendered by the analysis service.
    Server,
    /// Extracted on this machine from the uploaded video.
    Local,
}

/// An encoded still image owned by a result.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameImage {
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub origin: FrameOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymmetryIndex {
    #[serde(default)]
    pub left_right: Option<f64>,
    #[serde(default)]
    pub top_bottom: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Gait measurements reported by the service. Known keys are typed, anything
/// else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub cadence_hz: Option<f64>,
    #[serde(default)]
    pub stride_time_s: Option<f64>,
    #[serde(default)]
    pub symmetry_index: Option<SymmetryIndex>,
    #[serde(default)]
    pub speed_px_s: Option<f64>,
    #[serde(default)]
    pub stride_length_px_est: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Remove `key` from `map` when it holds a number.
fn take_number(map: &mut JsonMap, key: &str) -> Option<f64> {
    let value = map.get(key).and_then(serde_json::Value::as_f64)?;
    map.remove(key);
    Some(value)
}

impl SymmetryIndex {
    fn from_map(mut map: JsonMap) -> Self {
        Self {
            left_right: take_number(&mut map, "left_right"),
            top_bottom: take_number(&mut map, "top_bottom"),
            extra: map.into_iter().collect(),
        }
    }
}

impl Metrics {
    /// Build from any JSON object. Known keys are typed when they hold numbers;
    /// everything else, malformed known keys included, is kept in `extra`.
    /// `None` when `value` is not an object.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        let serde_json::Value::Object(mut map) = value else {
            return None;
        };
        let symmetry_index = match map.remove("symmetry_index") {
            Some(serde_json::Value::Object(inner)) => Some(SymmetryIndex::from_map(inner)),
            Some(other) => {
                map.insert("symmetry_index".to_string(), other);
                None
            }
            None => None,
        };
        Some(Self {
            cadence_hz: take_number(&mut map, "cadence_hz"),
            stride_time_s: take_number(&mut map, "stride_time_s"),
            symmetry_index,
            speed_px_s: take_number(&mut map, "speed_px_s"),
            stride_length_px_est: take_number(&mut map, "stride_length_px_est"),
            extra: map.into_iter().collect(),
        })
    }
}

/// How an analysis call ended, from the client's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Analysed,
    NetworkFailure,
    ServerError { status: u16 },
    /// The service answered successfully but reported that the analysis
    /// itself did not run.
    AnalysisFailed,
    InvalidResponse,
}

impl Outcome {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Outcome::Analysed)
    }
}

/// Display-ready result of one analysis call.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalResult {
    pub score: f64,
    pub message: String,
    pub overlay: OverlaySource,
    pub frame_image: Option<FrameImage>,
    pub metrics: Option<Metrics>,
    pub outcome: Outcome,
}

impl CanonicalResult {
    /// Points that may be drawn. Empty when there is no frame to draw on.
    pub fn drawable_points(&self) -> &[OverlayPoint] {
        if self.frame_image.is_some() {
            self.overlay.points()
        } else {
            &[]
        }
    }
}
