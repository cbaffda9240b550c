//! The upload → consent → processing → result session.
//!
//! [`Session`] is the synchronous state machine; it owns every transition and
//! rejects the ones its guards forbid without changing state.
//! [`SessionController`] runs the asynchronous side effects around it.

mod controller;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::SessionError,
    types::{CanonicalResult, DogProfile, UploadRequest, VideoFile},
};

pub use controller::SessionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    #[default]
    Upload,
    Consent,
    Processing,
    Result,
    /// Same completed session as `Result`, drawn over the live video.
    ResultOverlay,
}

impl Step {
    pub fn is_result(&self) -> bool {
        matches!(self, Step::Result | Step::ResultOverlay)
    }
}

/// Identifies one submission. Late async results carrying an older ticket
/// are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(Uuid);

impl Ticket {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

/// What the controller needs to run one submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub ticket: Ticket,
    pub request: UploadRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: Step,
    pub to: Step,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    step: Step,
    source_file: Option<VideoFile>,
    consent_granted: bool,
    progress_percent: u8,
    result: Option<CanonicalResult>,
    profile: DogProfile,
    attempt: Option<Ticket>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            step: Step::Upload,
            source_file: None,
            consent_granted: false,
            progress_percent: 0,
            result: None,
            profile: DogProfile::default(),
            attempt: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn source_file(&self) -> Option<&VideoFile> {
        self.source_file.as_ref()
    }

    pub fn consent_granted(&self) -> bool {
        self.consent_granted
    }

    pub fn progress_percent(&self) -> u8 {
        self.progress_percent
    }

    pub fn result(&self) -> Option<&CanonicalResult> {
        self.result.as_ref()
    }

    pub fn profile(&self) -> &DogProfile {
        &self.profile
    }

    pub fn current_ticket(&self) -> Option<Ticket> {
        self.attempt
    }

    /// Submission is possible only with consent and a file.
    pub fn can_submit(&self) -> bool {
        self.step == Step::Consent && self.consent_granted && self.source_file.is_some()
    }

    pub fn select_file(&mut self, file: VideoFile) -> Result<Transition, SessionError> {
        self.expect_step(&[Step::Upload], "select a file")?;
        if !file.is_video() {
            return Err(SessionError::NotAVideo { mime: file.mime });
        }
        debug!(session_id = %self.id, file = %file.name, mime = %file.mime, "file selected");
        self.source_file = Some(file);
        self.consent_granted = false;
        Ok(self.move_to(Step::Consent))
    }

    pub fn set_consent(&mut self, granted: bool) -> Result<(), SessionError> {
        self.expect_step(&[Step::Consent], "change consent")?;
        self.consent_granted = granted;
        Ok(())
    }

    pub fn set_profile(&mut self, profile: DogProfile) -> Result<(), SessionError> {
        self.expect_step(&[Step::Upload, Step::Consent], "edit the dog profile")?;
        self.profile = profile;
        Ok(())
    }

    pub fn begin_submission(
        &mut self,
        default_withers_cm: &str,
    ) -> Result<(Submission, Transition), SessionError> {
        self.expect_step(&[Step::Consent], "submit")?;
        if !self.consent_granted {
            return Err(SessionError::ConsentRequired);
        }
        let file = self.source_file.clone().ok_or(SessionError::NoFile)?;

        let ticket = Ticket(Uuid::new_v4());
        self.attempt = Some(ticket);
        self.progress_percent = 0;
        self.result = None;
        info!(session_id = %self.id, ticket = %ticket.0, "submission started");

        let submission = Submission {
            ticket,
            request: UploadRequest::new(file, &self.profile, default_withers_cm),
        };
        Ok((submission, self.move_to(Step::Processing)))
    }

    /// Record progress for the running attempt. Returns whether it moved.
    pub fn record_progress(&mut self, ticket: Ticket, percent: u8) -> bool {
        if !self.is_current(ticket) || percent <= self.progress_percent || percent >= 100 {
            return false;
        }
        self.progress_percent = percent;
        true
    }

    /// Apply the reconciled result of `ticket`. Stale tickets are ignored and
    /// `None` is returned.
    pub fn complete(&mut self, ticket: Ticket, result: CanonicalResult) -> Option<Transition> {
        if !self.is_current(ticket) {
            debug!(session_id = %self.id, ticket = %ticket.0, "discarding stale result");
            return None;
        }
        info!(
            session_id = %self.id,
            score = result.score,
            outcome = ?result.outcome,
            has_frame = result.frame_image.is_some(),
            "analysis result applied"
        );
        self.attempt = None;
        self.progress_percent = 100;
        self.result = Some(result);
        Some(self.move_to(Step::Result))
    }

    pub fn cancel(&mut self) -> Result<Transition, SessionError> {
        self.expect_step(&[Step::Processing], "cancel")?;
        info!(session_id = %self.id, "submission cancelled");
        self.id = Uuid::new_v4();
        self.attempt = None;
        self.source_file = None;
        self.consent_granted = false;
        self.progress_percent = 0;
        self.result = None;
        Ok(self.move_to(Step::Upload))
    }

    pub fn show_overlay(&mut self) -> Result<Transition, SessionError> {
        self.expect_step(&[Step::Result], "show the overlay")?;
        Ok(self.move_to(Step::ResultOverlay))
    }

    pub fn hide_overlay(&mut self) -> Result<Transition, SessionError> {
        self.expect_step(&[Step::ResultOverlay], "hide the overlay")?;
        Ok(self.move_to(Step::Result))
    }

    /// Back to the initial state under a new session id. The dog profile is
    /// kept for the next video.
    pub fn reset(&mut self) -> Transition {
        debug!(session_id = %self.id, from = ?self.step, "session reset");
        self.id = Uuid::new_v4();
        self.attempt = None;
        self.source_file = None;
        self.consent_granted = false;
        self.progress_percent = 0;
        self.result = None;
        self.move_to(Step::Upload)
    }

    fn is_current(&self, ticket: Ticket) -> bool {
        self.step == Step::Processing && self.attempt == Some(ticket)
    }

    fn expect_step(&self, allowed: &[Step], action: &'static str) -> Result<(), SessionError> {
        if allowed.contains(&self.step) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                from: self.step,
                action,
            })
        }
    }

    fn move_to(&mut self, to: Step) -> Transition {
        let from = std::mem::replace(&mut self.step, to);
        Transition { from, to }
    }
}
