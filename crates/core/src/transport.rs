use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{
    Body, Client,
    multipart::{Form, Part},
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    config::{ClientConfig, Protocol},
    error::{Result, TransportError},
    progress::UploadProgress,
    protocol::{ANALYZE_PATH, HEALTH_PATH, HealthStatus, JobAccepted, JobStatus, RESULT_PATH},
    reconcile::RawReply,
    types::UploadRequest,
};

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Delivers an upload to the analysis service. Any HTTP reply, whatever its
/// status, is returned as a [`RawReply`]; errors mean no reply was received.
#[async_trait]
pub trait AnalysisTransport: Send + Sync {
    /// Whether `submit` reports upload bytes through its [`UploadProgress`].
    fn reports_upload_progress(&self) -> bool;

    async fn submit(
        &self,
        request: UploadRequest,
        progress: UploadProgress,
    ) -> std::result::Result<RawReply, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    config: ClientConfig,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(ms) = config.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self
            .client
            .get(self.config.endpoint(HEALTH_PATH))
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        let health: HealthStatus = serde_json::from_slice(&body)?;
        debug!(%status, health = %health.status, "health check");
        Ok(health)
    }

    fn build_form(
        request: UploadRequest,
        progress: UploadProgress,
    ) -> std::result::Result<Form, TransportError> {
        let total = request.video.len();
        let data = request.video.data.clone();
        let chunks: Vec<Bytes> = (0..data.len())
            .step_by(UPLOAD_CHUNK)
            .map(|start| data.slice(start..(start + UPLOAD_CHUNK).min(data.len())))
            .collect();

        let mut sent = 0u64;
        let stream = futures::stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            progress.record(sent, total);
            Ok::<_, std::io::Error>(chunk)
        });

        let video = Part::stream_with_length(Body::wrap_stream(stream), total)
            .file_name(request.video.name.clone())
            .mime_str(&request.video.mime)?;

        Ok(Form::new()
            .part("video", video)
            .text("withers_cm", request.withers_cm)
            .text("breed", request.breed)
            .text("age", request.age)
            .text("conditions", request.conditions))
    }

    async fn poll_job(&self, job_id: &str) -> std::result::Result<RawReply, TransportError> {
        let url = self.config.endpoint(&format!("{RESULT_PATH}/{job_id}"));
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if started.elapsed() > self.config.poll_timeout() {
                return Err(TransportError::PollTimeout {
                    job_id: job_id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let response = self.client.get(&url).send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?;

            if !(200..300).contains(&status) {
                return Ok(RawReply::new(status, body));
            }

            let Ok(job) = serde_json::from_slice::<JobStatus>(&body) else {
                return Ok(RawReply::new(status, body));
            };

            if job.is_done() {
                let result = job.result.unwrap_or(serde_json::Value::Null);
                let body = serde_json::to_vec(&result)
                    .map_err(|e| TransportError::Network(e.to_string()))?;
                return Ok(RawReply::new(status, body));
            }
            if job.is_failed() {
                return Ok(RawReply::new(500, body));
            }
            debug!(job_id, status = %job.status, "analysis job pending");
        }
    }
}

#[async_trait]
impl AnalysisTransport for HttpTransport {
    fn reports_upload_progress(&self) -> bool {
        true
    }

    async fn submit(
        &self,
        request: UploadRequest,
        progress: UploadProgress,
    ) -> std::result::Result<RawReply, TransportError> {
        let url = self.config.endpoint(ANALYZE_PATH);
        info!(
            %url,
            video = %request.video.name,
            bytes = request.video.len(),
            "uploading video for analysis"
        );

        let form = Self::build_form(request, progress)?;
        let response = self.client.post(&url).multipart(form).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        let reply = RawReply::new(status, body);

        match self.config.protocol {
            Protocol::Direct => Ok(reply),
            Protocol::Queued if reply.is_success() => {
                match serde_json::from_slice::<JobAccepted>(&reply.body) {
                    Ok(job) => {
                        info!(job_id = %job.job_id, "analysis job queued");
                        self.poll_job(&job.job_id).await
                    }
                    Err(_) => Ok(reply),
                }
            }
            Protocol::Queued => Ok(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        progress::{ProgressRun, ProgressStrategy, ProgressTracker},
        types::{DogProfile, VideoFile},
    };

    #[test]
    fn transport_builds_from_default_config() {
        let transport = HttpTransport::new(ClientConfig::default()).unwrap();
        assert!(transport.reports_upload_progress());
    }

    #[tokio::test]
    async fn form_builds_before_any_bytes_are_sent() {
        let tracker = ProgressTracker::new();
        let run = ProgressRun::start(tracker.clone(), ProgressStrategy::ByteProgress);
        let video = VideoFile::new("walk.mp4", "video/mp4", vec![7u8; UPLOAD_CHUNK * 2 + 10]);
        let request = UploadRequest::new(video, &DogProfile::default(), "50");

        let form = HttpTransport::build_form(request, run.upload_progress()).unwrap();
        assert!(!form.boundary().is_empty());
        assert_eq!(tracker.percent(), 0);
        run.cancel();
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let config = ClientConfig {
            api_base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: Some(2_000),
            ..Default::default()
        };
        let transport = HttpTransport::new(config).unwrap();
        let video = VideoFile::new("walk.mp4", "video/mp4", vec![0u8; 32]);
        let request = UploadRequest::new(video, &DogProfile::default(), "50");

        let result = transport.submit(request, UploadProgress::disabled()).await;
        assert!(matches!(result, Err(TransportError::Network(_))));
    }
}
