//! Wire shapes of the analysis service. Every field is optional: the service
//! has shipped more than one payload layout and the client accepts all of them.

use serde::Deserialize;

use crate::types::{Metrics, OverlayPoint};

pub const ANALYZE_PATH: &str = "/api/analyze";
pub const HEALTH_PATH: &str = "/api/health";
pub const RESULT_PATH: &str = "/api/result";

/// Flag token reported when the left forelimb symmetry index is elevated.
pub const LEFT_FORELIMB_ASYMMETRY: &str = "left_forelimb_asymmetry";

#[derive(Debug, Default, Deserialize)]
pub struct AnalysisResponse {
    /// Kept untyped so a non-numeric score degrades to the neutral default
    /// instead of failing the whole payload.
    #[serde(default)]
    pub score: Option<serde_json::Value>,
    #[serde(default)]
    pub flags: Option<serde_json::Value>,
    #[serde(default)]
    pub recommendation: Option<String>,
    /// Untyped so one bad entry drops that point, not the payload.
    #[serde(default, alias = "keypoints")]
    pub overlay_points: Option<serde_json::Value>,
    #[serde(default)]
    pub frame_jpeg_b64: Option<String>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl AnalysisResponse {
    pub fn numeric_score(&self) -> Option<f64> {
        self.score.as_ref().and_then(serde_json::Value::as_f64)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags
            .as_ref()
            .and_then(serde_json::Value::as_array)
            .is_some_and(|flags| flags.iter().any(|f| f.as_str() == Some(flag)))
    }

    pub fn overlay_points(&self) -> Option<Vec<OverlayPoint>> {
        self.overlay_points
            .clone()
            .and_then(OverlayPoint::list_from_value)
    }

    pub fn metrics(&self) -> Option<Metrics> {
        self.metrics.clone().and_then(Metrics::from_value)
    }

    /// Non-empty `error` text, whatever JSON type carried it.
    pub fn error_text(&self) -> Option<String> {
        let text = match self.error.as_ref()? {
            serde_json::Value::Null => return None,
            serde_json::Value::String(text) => text.trim().to_string(),
            other => other.to_string(),
        };
        (!text.is_empty()).then_some(text)
    }

    /// A successful reply that carries an error and no score: the service ran
    /// but the analysis did not.
    pub fn analysis_failure(&self) -> Option<String> {
        if self.score.as_ref().is_some_and(|s| !s.is_null()) {
            return None;
        }
        self.error_text()
    }
}

/// Body returned by the queued protocol when a job is accepted.
#[derive(Debug, Deserialize)]
pub struct JobAccepted {
    pub job_id: String,
}

/// Body of `GET /api/result/{job_id}`.
#[derive(Debug, Deserialize)]
pub struct JobStatus {
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        self.status == "done" || self.status == "finished"
    }

    pub fn is_failed(&self) -> bool {
        self.status == "error" || self.status == "failed"
    }
}

#[derive(Debug, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypoints_alias_is_accepted() {
        let body = r#"{"score": 5.0, "keypoints": [{"x": 0.1, "y": 0.2}]}"#;
        let parsed: AnalysisResponse = serde_json::from_str(body).unwrap();
        let points = parsed.overlay_points().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].color, "#2FB36D");
    }

    #[test]
    fn string_score_is_not_numeric() {
        let parsed: AnalysisResponse = serde_json::from_str(r#"{"score": "high"}"#).unwrap();
        assert_eq!(parsed.numeric_score(), None);
    }

    #[test]
    fn metrics_keep_unknown_keys() {
        let body = r#"{"metrics": {"cadence_hz": 1.5, "gsa": 4.2, "symmetry_index": {"left_right": 3.0}}}"#;
        let parsed: AnalysisResponse = serde_json::from_str(body).unwrap();
        let metrics = parsed.metrics().unwrap();
        assert_eq!(metrics.cadence_hz, Some(1.5));
        assert_eq!(metrics.extra.get("gsa").and_then(|v| v.as_f64()), Some(4.2));
        assert_eq!(metrics.symmetry_index.unwrap().left_right, Some(3.0));
    }

    #[test]
    fn job_status_states() {
        let done: JobStatus = serde_json::from_str(r#"{"status": "done", "result": {}}"#).unwrap();
        assert!(done.is_done());
        let queued: JobStatus = serde_json::from_str(r#"{"status": "queued"}"#).unwrap();
        assert!(!queued.is_done() && !queued.is_failed());
    }

    #[test]
    fn failed_worker_payload_is_an_analysis_failure() {
        let parsed: AnalysisResponse =
            serde_json::from_str(r#"{"error": "Not enough frames", "trace": "Traceback"}"#).unwrap();
        assert_eq!(parsed.analysis_failure().as_deref(), Some("Not enough frames"));

        let scored: AnalysisResponse =
            serde_json::from_str(r#"{"score": 3.0, "error": "partial"}"#).unwrap();
        assert_eq!(scored.analysis_failure(), None);

        let blank: AnalysisResponse = serde_json::from_str(r#"{"error": "  "}"#).unwrap();
        assert_eq!(blank.analysis_failure(), None);
    }

    #[test]
    fn flags_of_the_wrong_type_are_ignored() {
        let parsed: AnalysisResponse =
            serde_json::from_str(r#"{"flags": "left_forelimb_asymmetry"}"#).unwrap();
        assert!(!parsed.has_flag(LEFT_FORELIMB_ASYMMETRY));
    }
}
