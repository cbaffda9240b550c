//! Normalizes whatever the analysis service returned into a [`CanonicalResult`].
//!
//! Two payload layouts are in circulation:
//! - flagged: `score`, `flags`, optional `recommendation`
//! - rendered: explicit `overlay_points`, a server drawn `frame_jpeg_b64` and `metrics`
//!
//! The reconciler detects the layout from the fields present and never fails:
//! transport errors, non-2xx statuses and unparsable bodies all become a degraded
//! result carrying the neutral score.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    error::TransportError,
    protocol::{AnalysisResponse, LEFT_FORELIMB_ASYMMETRY},
    types::{
        CanonicalResult, FrameImage, FrameOrigin, ImageFormat, Outcome, OverlayPoint,
        OverlaySource,
    },
};

pub const NEUTRAL_SCORE: f64 = 1.0;

pub const NETWORK_FAILURE_MESSAGE: &str = "Upload failed — try again";
pub const INVALID_RESPONSE_MESSAGE: &str = "Invalid response from the analysis service";
pub const ASYMMETRY_FINDING: &str = "Left forelimb asymmetry elevated";
pub const NO_FINDING: &str = "No significant asymmetry detected";

/// Status line and body of an HTTP reply, whatever the status.
#[derive(Debug, Clone)]
pub struct RawReply {
    pub status: u16,
    pub body: Bytes,
}

impl RawReply {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Flagged,
    Rendered,
}

impl ResponseShape {
    pub fn detect(response: &AnalysisResponse) -> Self {
        if response.overlay_points.as_ref().is_some_and(|v| !v.is_null())
            || response.frame_jpeg_b64.is_some()
            || response.metrics.as_ref().is_some_and(|v| !v.is_null())
        {
            ResponseShape::Rendered
        } else {
            ResponseShape::Flagged
        }
    }
}

/// What the session still has to do to obtain a display frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSource {
    Server(FrameImage),
    ExtractLocally,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub result: CanonicalResult,
    pub frame: FrameSource,
}

impl Reconciled {
    /// Attach the display frame and produce the final result.
    pub fn finish(self, local_frame: Option<FrameImage>) -> CanonicalResult {
        let mut result = self.result;
        result.frame_image = match self.frame {
            FrameSource::Server(frame) => Some(frame),
            FrameSource::ExtractLocally => local_frame,
            FrameSource::Unavailable => None,
        };
        result
    }
}

pub fn reconcile(reply: Result<RawReply, TransportError>) -> Reconciled {
    match reply {
        Err(err) => {
            warn!(error = %err, "analysis request failed before a response arrived");
            degraded(NETWORK_FAILURE_MESSAGE.to_string(), Outcome::NetworkFailure)
        }
        Ok(reply) if !reply.is_success() => {
            let error_text = serde_json::from_slice::<AnalysisResponse>(&reply.body)
                .ok()
                .and_then(|r| r.error_text());
            warn!(status = reply.status, error = ?error_text, "analysis service returned an error");
            degraded(
                server_error_message(reply.status, error_text.as_deref()),
                Outcome::ServerError {
                    status: reply.status,
                },
            )
        }
        Ok(reply) => match serde_json::from_slice::<AnalysisResponse>(&reply.body) {
            Ok(response) => match response.analysis_failure() {
                Some(text) => {
                    warn!(error = %text, "analysis service reported a failed analysis");
                    degraded(analysis_failed_message(&text), Outcome::AnalysisFailed)
                }
                None => reconcile_response(response),
            },
            Err(err) => {
                warn!(error = %err, "analysis response could not be parsed");
                degraded(
                    INVALID_RESPONSE_MESSAGE.to_string(),
                    Outcome::InvalidResponse,
                )
            }
        },
    }
}

pub fn reconcile_response(response: AnalysisResponse) -> Reconciled {
    let shape = ResponseShape::detect(&response);
    let score = response.numeric_score().unwrap_or(NEUTRAL_SCORE);

    let message = match response
        .recommendation
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        Some(recommendation) => recommendation.to_string(),
        None if response.has_flag(LEFT_FORELIMB_ASYMMETRY) => ASYMMETRY_FINDING.to_string(),
        None => NO_FINDING.to_string(),
    };

    let frame = match response.frame_jpeg_b64.as_deref() {
        Some(encoded) => match decode_server_frame(encoded) {
            Some(frame) => FrameSource::Server(frame),
            None => {
                warn!("server frame could not be decoded, extracting locally");
                FrameSource::ExtractLocally
            }
        },
        None => FrameSource::ExtractLocally,
    };

    let overlay = match response.overlay_points() {
        Some(points) => OverlaySource::Detected(points),
        None => OverlaySource::None,
    };

    debug!(?shape, score, points = overlay.points().len(), "reconciled analysis response");

    Reconciled {
        result: CanonicalResult {
            score,
            message,
            overlay,
            frame_image: None,
            metrics: response.metrics(),
            outcome: Outcome::Analysed,
        },
        frame,
    }
}

pub fn analysis_failed_message(error: &str) -> String {
    format!("Analysis failed: {error}")
}

pub fn server_error_message(status: u16, error: Option<&str>) -> String {
    match error {
        Some(text) => format!("Server error ({status}): {text}"),
        None => format!("Server error ({status})"),
    }
}

/// Fixed demonstration markers: shoulder, elbow, spine, hip and knee.
pub fn illustrative_points() -> Vec<OverlayPoint> {
    vec![
        OverlayPoint::new(0.18, 0.40, "#E35D5D"),
        OverlayPoint::new(0.25, 0.55, "#E35D5D"),
        OverlayPoint::new(0.60, 0.36, "#2FB36D"),
        OverlayPoint::new(0.80, 0.44, "#2FB36D"),
        OverlayPoint::new(0.86, 0.62, "#2FB36D"),
    ]
}

/// Substitute the illustrative markers when the service sent none and the
/// fallback is switched on. Detected points are never replaced.
pub fn apply_illustrative_fallback(result: &mut CanonicalResult, enabled: bool) {
    if enabled && result.overlay == OverlaySource::None && !result.outcome.is_degraded() {
        result.overlay = OverlaySource::Illustrative(illustrative_points());
    }
}

fn degraded(message: String, outcome: Outcome) -> Reconciled {
    Reconciled {
        result: CanonicalResult {
            score: NEUTRAL_SCORE,
            message,
            overlay: OverlaySource::None,
            frame_image: None,
            metrics: None,
            outcome,
        },
        frame: FrameSource::Unavailable,
    }
}

fn decode_server_frame(encoded: &str) -> Option<FrameImage> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    let format = match image::guess_format(&bytes).ok()? {
        image::ImageFormat::Png => ImageFormat::Png,
        image::ImageFormat::Jpeg => ImageFormat::Jpeg,
        _ => return None,
    };
    Some(FrameImage {
        bytes: Bytes::from(bytes),
        format,
        origin: FrameOrigin::Server,
    })
}
