use std::path::{Path, PathBuf};

use houndforward_core::get_root_output_dir;
use uuid::Uuid;

/// Guess a MIME type from the file extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Directory for the frames of one session.
pub fn get_session_dir(session_id: Uuid) -> PathBuf {
    get_root_output_dir().join(session_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_extensions_map_to_video_types() {
        assert_eq!(mime_for_path(Path::new("walk.MP4")), "video/mp4");
        assert_eq!(mime_for_path(Path::new("rex/trot.mov")), "video/quicktime");
        assert_eq!(mime_for_path(Path::new("a.webm")), "video/webm");
    }

    #[test]
    fn other_files_are_not_videos() {
        assert_eq!(mime_for_path(Path::new("photo.png")), "image/png");
        assert_eq!(mime_for_path(Path::new("notes")), "application/octet-stream");
    }
}
