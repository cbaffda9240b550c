use crate::types::{CanonicalResult, FrameOrigin, Metrics, OverlaySource};

pub const MAX_SCORE: f64 = 5.0;

/// Position of `score` on a 0–1 meter, clamped.
pub fn score_fraction(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    (score / MAX_SCORE).clamp(0.0, 1.0)
}

/// Text gauge like `[######----]` for a 0–5 score.
pub fn score_gauge(score: f64, width: usize) -> String {
    let filled = (score_fraction(score) * width as f64).round() as usize;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

fn push_metric(output: &mut String, label: &str, value: Option<f64>, unit: &str) {
    if let Some(value) = value {
        output.push_str(&format!("• {label}: {value:.2}{unit}\n"));
    }
}

pub fn format_metrics(metrics: &Metrics) -> String {
    let mut output = String::new();
    push_metric(&mut output, "Cadence", metrics.cadence_hz, " Hz");
    push_metric(&mut output, "Stride time", metrics.stride_time_s, " s");
    if let Some(symmetry) = &metrics.symmetry_index {
        push_metric(&mut output, "Symmetry (left/right)", symmetry.left_right, "");
        push_metric(&mut output, "Symmetry (top/bottom)", symmetry.top_bottom, "");
        for (key, value) in &symmetry.extra {
            output.push_str(&format!("• Symmetry ({key}): {value}\n"));
        }
    }
    push_metric(&mut output, "Speed", metrics.speed_px_s, " px/s");
    push_metric(&mut output, "Stride length (est.)", metrics.stride_length_px_est, " px");
    for (key, value) in &metrics.extra {
        output.push_str(&format!("• {key}: {value}\n"));
    }
    output
}

pub fn format_result_readable(result: &CanonicalResult) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "# Gait score {:.1} / {:.0}  {}\n\n",
        result.score,
        MAX_SCORE,
        score_gauge(result.score, 20)
    ));
    output.push_str(&result.message);
    output.push_str("\n\n");

    match &result.frame_image {
        Some(frame) => {
            let origin = match frame.origin {
                FrameOrigin::Server => "server",
                FrameOrigin::Local => "local",
            };
            output.push_str(&format!("**Frame:** {} ({origin})", frame.format.extension()));
            let points = result.drawable_points().len();
            match &result.overlay {
                OverlaySource::Detected(_) => {
                    output.push_str(&format!(" | **Keypoints:** {points}\n\n"))
                }
                OverlaySource::Illustrative(_) => {
                    output.push_str(&format!(" | **Keypoints:** {points} (illustrative)\n\n"))
                }
                OverlaySource::None => output.push_str("\n\n"),
            }
        }
        None => output.push_str("**Frame:** No frame available\n\n"),
    }

    // Omitted entirely when the service sent no metrics.
    if let Some(metrics) = &result.metrics {
        output.push_str("## Metrics\n\n");
        output.push_str(&format_metrics(metrics));
        output.push('\n');
    }

    output
}
