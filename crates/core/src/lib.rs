pub mod config;
pub mod error;
pub mod events;
pub mod format;
pub mod frame;
pub mod overlay;
pub mod progress;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod transport;
pub mod types;

pub use config::{ClientConfig, Protocol, get_root_output_dir};
pub use error::{HoundError, Result, SessionError, TransportError};
pub use events::{EventBus, SessionEvent, SessionEventKind};
pub use format::{format_result_readable, score_fraction, score_gauge};
pub use frame::{FfmpegBackend, FrameExtractor, MediaBackend};
pub use overlay::{OverlaySurface, OverlayView, PlaybackControls, PlaybackSpeed};
pub use progress::{ProgressStrategy, ProgressTracker};
pub use reconcile::{reconcile, reconcile_response};
pub use session::{Session, SessionController, Step};
pub use transport::{AnalysisTransport, HttpTransport};
pub use types::{CanonicalResult, DogProfile, OverlayPoint, OverlaySource, VideoFile};
