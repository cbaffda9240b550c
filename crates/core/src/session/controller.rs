use std::{future::Future, sync::Arc};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::{
    sync::Mutex,
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Session, Step, Ticket, Transition};
use crate::{
    config::ClientConfig,
    error::{Result, SessionError},
    events::{EventBus, SessionEventKind},
    frame::FrameExtractor,
    progress::{ProgressRun, ProgressStrategy, ProgressTracker},
    reconcile::{FrameSource, apply_illustrative_fallback, reconcile},
    transport::AnalysisTransport,
    types::{CanonicalResult, DogProfile, UploadRequest, VideoFile},
};

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The running submission task. Any number of callers may wait for it to
/// settle without taking ownership of it.
#[derive(Clone)]
struct InFlight {
    abort: AbortHandle,
    settled: Shared<BoxFuture<'static, ()>>,
}

impl InFlight {
    fn spawn(task: impl Future<Output = ()> + Send + 'static) -> Self {
        let handle = tokio::spawn(task);
        let abort = handle.abort_handle();
        let settled = handle
            .map(|joined| {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        warn!(error = %e, "submission task failed");
                    }
                }
            })
            .boxed()
            .shared();
        Self { abort, settled }
    }
}

/// Runs the side effects of a [`Session`]: progress, network submission,
/// reconciliation and frame extraction. The network and media collaborators
/// are injected so several sessions can run side by side.
#[derive(Clone)]
pub struct SessionController {
    session: Arc<Mutex<Session>>,
    transport: Arc<dyn AnalysisTransport>,
    extractor: FrameExtractor,
    config: ClientConfig,
    tracker: ProgressTracker,
    events: EventBus,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

impl SessionController {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn AnalysisTransport>,
        extractor: FrameExtractor,
    ) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::new())),
            transport,
            extractor,
            config,
            tracker: ProgressTracker::new(),
            events: EventBus::new(),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub async fn snapshot(&self) -> Session {
        self.session.lock().await.clone()
    }

    pub async fn step(&self) -> Step {
        self.session.lock().await.step()
    }

    pub async fn select_file(&self, file: VideoFile) -> Result<()> {
        let mut session = self.session.lock().await;
        match session.select_file(file) {
            Ok(transition) => {
                self.publish_transition(session.id(), transition);
                Ok(())
            }
            Err(SessionError::NotAVideo { mime }) => {
                warn!(session_id = %session.id(), %mime, "rejected non-video file");
                self.events.publish(
                    session.id(),
                    SessionEventKind::FileRejected { mime: mime.clone() },
                );
                Err(SessionError::NotAVideo { mime }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_consent(&self, granted: bool) -> Result<()> {
        Ok(self.session.lock().await.set_consent(granted)?)
    }

    pub async fn set_profile(&self, profile: DogProfile) -> Result<()> {
        Ok(self.session.lock().await.set_profile(profile)?)
    }

    /// Enter processing and start the submission in the background. Nothing is
    /// sent unless consent was granted and a file is present.
    ///
    /// The task is registered before the session lock is released, so a
    /// `cancel` can always find and abort it.
    pub async fn submit(&self) -> Result<Ticket> {
        let mut session = self.session.lock().await;
        let (submission, transition) = session.begin_submission(&self.config.default_withers_cm)?;
        let session_id = session.id();
        self.publish_transition(session_id, transition);

        let strategy = ProgressStrategy::select(
            self.transport.reports_upload_progress(),
            self.config.synthetic_ramp(),
        );
        let run = ProgressRun::start(self.tracker.clone(), strategy);
        let ticket = submission.ticket;

        let this = self.clone();
        let task = InFlight::spawn(async move {
            let forwarder = AbortOnDrop(this.spawn_progress_forwarder(session_id, ticket));
            let result = this.analyse(submission.request, &run).await;
            drop(forwarder);
            this.finish(session_id, ticket, result, run).await;
        });

        if let Some(previous) = self.in_flight.lock().await.replace(task) {
            previous.abort.abort();
        }
        drop(session);
        Ok(ticket)
    }

    /// Wait for the latest submission, if any, to settle.
    pub async fn wait(&self) {
        let settled = self
            .in_flight
            .lock()
            .await
            .as_ref()
            .map(|task| task.settled.clone());
        if let Some(settled) = settled {
            settled.await;
        }
    }

    /// Stop processing and return to upload. The in-flight request is aborted
    /// and anything it produces later is ignored.
    pub async fn cancel(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let transition = session.cancel()?;
        self.abort_in_flight().await;
        self.tracker.reset();
        self.publish_transition(session.id(), transition);
        Ok(())
    }

    pub async fn show_overlay(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let transition = session.show_overlay()?;
        self.publish_transition(session.id(), transition);
        Ok(())
    }

    pub async fn hide_overlay(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let transition = session.hide_overlay()?;
        self.publish_transition(session.id(), transition);
        Ok(())
    }

    /// "Analyze another video": back to the initial state from anywhere.
    pub async fn reset(&self) {
        let mut session = self.session.lock().await;
        self.abort_in_flight().await;
        let transition = session.reset();
        self.tracker.reset();
        self.publish_transition(session.id(), transition);
    }

    async fn analyse(&self, request: UploadRequest, run: &ProgressRun) -> CanonicalResult {
        let video = request.video.clone();
        let reply = self.transport.submit(request, run.upload_progress()).await;
        let reconciled = reconcile(reply);

        let local_frame = if reconciled.frame == FrameSource::ExtractLocally {
            self.extractor.extract(&video).await
        } else {
            None
        };

        let mut result = reconciled.finish(local_frame);
        apply_illustrative_fallback(&mut result, self.config.illustrative_overlay);
        result
    }

    async fn finish(
        &self,
        session_id: Uuid,
        ticket: Ticket,
        result: CanonicalResult,
        run: ProgressRun,
    ) {
        let mut session = self.session.lock().await;
        match session.complete(ticket, result) {
            Some(transition) => {
                run.finish();
                self.events
                    .publish(session_id, SessionEventKind::Progress { percent: 100 });
                self.publish_transition(session_id, transition);
                self.events.publish(session_id, SessionEventKind::ResultReady);
            }
            None => {
                run.cancel();
                self.events.publish(
                    session_id,
                    SessionEventKind::StaleDiscarded { ticket: ticket.id() },
                );
            }
        }
    }

    fn spawn_progress_forwarder(&self, session_id: Uuid, ticket: Ticket) -> JoinHandle<()> {
        let mut rx = self.tracker.subscribe();
        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let percent = rx.borrow_and_update().percent;
                if session.lock().await.record_progress(ticket, percent) {
                    events.publish(session_id, SessionEventKind::Progress { percent });
                }
            }
        })
    }

    /// Abort the running submission and wait until its task is gone, so its
    /// progress timer cannot fire after the caller resets the tracker.
    async fn abort_in_flight(&self) {
        let task = self.in_flight.lock().await.take();
        if let Some(task) = task {
            debug!("aborting in-flight submission");
            task.abort.abort();
            task.settled.await;
        }
    }

    fn publish_transition(&self, session_id: Uuid, transition: Transition) {
        info!(%session_id, from = ?transition.from, to = ?transition.to, "session step changed");
        self.events.publish(
            session_id,
            SessionEventKind::StepChanged {
                from: transition.from,
                to: transition.to,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        error::{HoundError, TransportError},
        frame::{
            MediaMetadata,
            tests::{FakeBackend, clip},
        },
        progress::UploadProgress,
        reconcile::{INVALID_RESPONSE_MESSAGE, NEUTRAL_SCORE, NETWORK_FAILURE_MESSAGE, RawReply},
        types::{FrameOrigin, Outcome, OverlaySource},
    };

    enum Reply {
        Body(u16, &'static str),
        Network,
        /// Wait until released, then answer with the body.
        Held(Arc<Notify>, &'static str),
    }

    struct FakeTransport {
        reply: Reply,
        byte_progress: bool,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                byte_progress: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn with_byte_progress(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                byte_progress: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AnalysisTransport for FakeTransport {
        fn reports_upload_progress(&self) -> bool {
            self.byte_progress
        }

        async fn submit(
            &self,
            request: UploadRequest,
            progress: UploadProgress,
        ) -> std::result::Result<RawReply, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let total = request.video.len();
            progress.record(total / 2, total);
            progress.record(total, total);
            match &self.reply {
                Reply::Body(status, body) => Ok(RawReply::new(*status, *body)),
                Reply::Network => Err(TransportError::Network("connection reset".into())),
                Reply::Held(gate, body) => {
                    gate.notified().await;
                    Ok(RawReply::new(200, *body))
                }
            }
        }
    }

    fn decodable_backend() -> Arc<FakeBackend> {
        Arc::new(FakeBackend {
            metadata: Some(MediaMetadata {
                duration: Some(10.0),
                width: Some(64),
                height: Some(36),
            }),
            ..Default::default()
        })
    }

    fn controller(
        transport: Arc<FakeTransport>,
        backend: Arc<FakeBackend>,
        config: ClientConfig,
    ) -> SessionController {
        let extractor = FrameExtractor::new(backend, Duration::from_secs(5));
        SessionController::new(config, transport, extractor)
    }

    async fn ready(controller: &SessionController) {
        controller.select_file(clip()).await.unwrap();
        controller.set_consent(true).await.unwrap();
    }

    #[tokio::test]
    async fn successful_analysis_reaches_result_with_local_frame() {
        let transport = FakeTransport::new(Reply::Body(
            200,
            r#"{"score": 3.5, "flags": ["left_forelimb_asymmetry"], "recommendation": "See vet"}"#,
        ));
        let backend = decodable_backend();
        let controller = controller(transport.clone(), backend.clone(), ClientConfig::default());
        let mut events = controller.events().subscribe();

        ready(&controller).await;
        controller.submit().await.unwrap();
        controller.wait().await;

        let session = controller.snapshot().await;
        assert_eq!(session.step(), Step::Result);
        assert_eq!(session.progress_percent(), 100);
        let result = session.result().unwrap();
        assert_eq!(result.message, "See vet");
        assert_eq!(result.score, 3.5);
        assert_eq!(result.frame_image.as_ref().unwrap().origin, FrameOrigin::Local);
        assert_eq!(result.overlay, OverlaySource::None);
        assert_eq!(backend.released.load(Ordering::SeqCst), 1);
        assert_eq!(controller.progress().percent(), 100);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&SessionEventKind::ResultReady));
        assert!(kinds.contains(&SessionEventKind::StepChanged {
            from: Step::Processing,
            to: Step::Result,
        }));
    }

    #[tokio::test]
    async fn no_request_without_consent() {
        let transport = FakeTransport::new(Reply::Body(200, "{}"));
        let controller = controller(transport.clone(), decodable_backend(), ClientConfig::default());

        assert_matches!(
            controller.submit().await,
            Err(HoundError::Session(SessionError::InvalidTransition { .. }))
        );
        controller.select_file(clip()).await.unwrap();
        assert_matches!(
            controller.submit().await,
            Err(HoundError::Session(SessionError::ConsentRequired))
        );
        controller.wait().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_video_is_rejected_with_event() {
        let controller = controller(
            FakeTransport::new(Reply::Body(200, "{}")),
            decodable_backend(),
            ClientConfig::default(),
        );
        let mut events = controller.events().subscribe();

        let err = controller
            .select_file(VideoFile::new("cat.png", "image/png", Vec::new()))
            .await
            .unwrap_err();
        assert_matches!(err, HoundError::Session(SessionError::NotAVideo { .. }));
        assert_eq!(controller.step().await, Step::Upload);
        assert_eq!(
            events.try_recv().unwrap().kind,
            SessionEventKind::FileRejected {
                mime: "image/png".to_string()
            }
        );
    }

    #[tokio::test]
    async fn network_failure_degrades_to_result() {
        let backend = decodable_backend();
        let controller = controller(
            FakeTransport::new(Reply::Network),
            backend.clone(),
            ClientConfig::default(),
        );
        ready(&controller).await;
        controller.submit().await.unwrap();
        controller.wait().await;

        let session = controller.snapshot().await;
        assert_eq!(session.step(), Step::Result);
        let result = session.result().unwrap();
        assert_eq!(result.message, NETWORK_FAILURE_MESSAGE);
        assert_eq!(result.score, NEUTRAL_SCORE);
        assert!(result.frame_image.is_none());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_body_degrades_to_invalid_response() {
        let controller = controller(
            FakeTransport::new(Reply::Body(200, "<html>")),
            decodable_backend(),
            ClientConfig::default(),
        );
        ready(&controller).await;
        controller.submit().await.unwrap();
        controller.wait().await;

        let session = controller.snapshot().await;
        let result = session.result().unwrap();
        assert_eq!(result.message, INVALID_RESPONSE_MESSAGE);
        assert_eq!(result.outcome, Outcome::InvalidResponse);
        assert_eq!(session.progress_percent(), 100);
    }

    #[tokio::test]
    async fn extraction_failure_still_shows_result() {
        let controller = controller(
            FakeTransport::new(Reply::Body(200, r#"{"score": 4.0}"#)),
            Arc::new(FakeBackend::default()),
            ClientConfig::default(),
        );
        ready(&controller).await;
        controller.submit().await.unwrap();
        controller.wait().await;

        let session = controller.snapshot().await;
        let result = session.result().unwrap();
        assert_eq!(result.score, 4.0);
        assert!(result.frame_image.is_none());
        assert!(result.drawable_points().is_empty());
    }

    #[tokio::test]
    async fn illustrative_points_require_the_flag() {
        let config = ClientConfig {
            illustrative_overlay: true,
            ..Default::default()
        };
        let controller = controller(
            FakeTransport::new(Reply::Body(200, r#"{"score": 4.0}"#)),
            decodable_backend(),
            config,
        );
        ready(&controller).await;
        controller.submit().await.unwrap();
        controller.wait().await;

        let session = controller.snapshot().await;
        let result = session.result().unwrap();
        assert!(result.overlay.is_illustrative());
        assert_eq!(result.drawable_points().len(), 5);
    }

    #[tokio::test]
    async fn byte_progress_is_monotonic_and_ends_at_100() {
        let gate = Arc::new(Notify::new());
        let transport = FakeTransport::with_byte_progress(Reply::Held(gate.clone(), "{}"));
        let controller = controller(transport, decodable_backend(), ClientConfig::default());
        let mut progress = controller.progress().subscribe();

        ready(&controller).await;
        controller.submit().await.unwrap();

        let mut seen = Vec::new();
        while progress.changed().await.is_ok() {
            let percent = progress.borrow_and_update().percent;
            seen.push(percent);
            if percent == 90 {
                break;
            }
        }
        assert_eq!(controller.step().await, Step::Processing);
        gate.notify_one();
        controller.wait().await;

        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|p| *p <= 90));
        assert_eq!(controller.snapshot().await.progress_percent(), 100);
    }

    #[tokio::test]
    async fn cancel_discards_late_response() {
        let gate = Arc::new(Notify::new());
        let transport = FakeTransport::new(Reply::Held(gate.clone(), r#"{"score": 5.0}"#));
        let controller = controller(transport, decodable_backend(), ClientConfig::default());

        ready(&controller).await;
        controller.submit().await.unwrap();
        tokio::task::yield_now().await;
        controller.cancel().await.unwrap();
        gate.notify_one();
        controller.wait().await;
        tokio::task::yield_now().await;

        let session = controller.snapshot().await;
        assert_eq!(session.step(), Step::Upload);
        assert!(session.source_file().is_none());
        assert!(session.result().is_none());
        assert_eq!(session.progress_percent(), 0);
        assert_eq!(controller.progress().percent(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_request_is_sent_after_cancel_returns() {
        for _ in 0..100 {
            let gate = Arc::new(Notify::new());
            let transport = FakeTransport::new(Reply::Held(gate, "{}"));
            let controller = controller(transport.clone(), decodable_backend(), ClientConfig::default());
            ready(&controller).await;

            let submitter = controller.clone();
            let submitted = tokio::spawn(async move { submitter.submit().await.map(|_| ()) });
            while controller.cancel().await.is_err() {
                tokio::task::yield_now().await;
            }
            let calls_at_cancel = transport.calls.load(Ordering::SeqCst);
            submitted.await.unwrap().unwrap();

            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(transport.calls.load(Ordering::SeqCst), calls_at_cancel);
            assert_eq!(controller.step().await, Step::Upload);
        }
    }

    #[tokio::test]
    async fn reset_after_overlay_restores_initial_state() {
        let controller = controller(
            FakeTransport::new(Reply::Body(200, r#"{"score": 2.0}"#)),
            decodable_backend(),
            ClientConfig::default(),
        );
        ready(&controller).await;
        controller.submit().await.unwrap();
        controller.wait().await;
        controller.show_overlay().await.unwrap();
        assert_eq!(controller.step().await, Step::ResultOverlay);

        controller.reset().await;
        let session = controller.snapshot().await;
        assert_eq!(session.step(), Step::Upload);
        assert!(session.source_file().is_none());
        assert!(!session.consent_granted());
        assert_eq!(session.progress_percent(), 0);
        assert!(session.result().is_none());
        assert_eq!(controller.progress().percent(), 0);
    }
}
