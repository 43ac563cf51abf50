//! The API collaborator: a trait seam plus its reqwest implementation.
//!
//! The orchestrator and resolver only see [`ModelApi`]; tests swap in
//! [`crate::fakes::FakeApi`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::coerce::CoercedInput;
use crate::config::ClientConfig;
use crate::error::{ReplicateError, Result};
use crate::job::{Job, Model, StreamEvent, SubmitTarget, Urls, Version};
use crate::sse::decode_events;

/// Operations the pipeline needs from the remote service.
#[async_trait]
pub trait ModelApi: Send + Sync {
    /// Fetch a version, or the model's latest version when `version` is `None`.
    async fn resolve(&self, owner: &str, name: &str, version: Option<&str>) -> Result<Version>;

    /// Submit a prediction. `stream` asks the service for a stream endpoint.
    async fn create_prediction(
        &self,
        target: &SubmitTarget,
        input: &CoercedInput,
        stream: bool,
    ) -> Result<Job>;

    async fn create_training(
        &self,
        owner: &str,
        name: &str,
        version: &str,
        destination: &str,
        input: &CoercedInput,
    ) -> Result<Job>;

    /// Fresh snapshot of `job`.
    async fn get_job(&self, job: &Job) -> Result<Job>;

    async fn get_prediction(&self, id: &str) -> Result<Job>;

    /// Open the job's event stream.
    async fn subscribe(&self, job: &Job) -> Result<BoxStream<'static, StreamEvent>>;

    /// Upload a local file, returning its retrieval URL.
    async fn upload(&self, path: &Path) -> Result<String>;

    /// Download the body at `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    fn poll_interval(&self) -> Duration;

    /// Snapshots of `job` until it is terminal.
    ///
    /// Yields `job` itself first, then one fresh snapshot per poll interval.
    /// The stream ends after the first terminal snapshot or the first error.
    fn poll<'a>(&'a self, job: Job) -> BoxStream<'a, Result<Job>> {
        let interval = self.poll_interval();
        stream::unfold(Some((job, true)), move |state| async move {
            let (job, first) = state?;
            if first {
                let next = (!job.is_terminal()).then(|| (job.clone(), false));
                return Some((Ok(job), next));
            }

            tokio::time::sleep(interval).await;
            match self.get_job(&job).await {
                Ok(snapshot) => {
                    debug!(id = %snapshot.id, status = %snapshot.status, "polled job");
                    let next = (!snapshot.is_terminal()).then(|| (snapshot.clone(), false));
                    Some((Ok(snapshot), next))
                }
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    urls: Urls,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
    title: Option<String>,
}

/// [`ModelApi`] over HTTPS with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    config: ClientConfig,
}

impl HttpApi {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| ReplicateError::Api(format!("invalid endpoint {path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!(%method, %url, "api request");
        let builder = self.client.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = check_status(builder.send().await?).await?;
        Ok(response.json().await?)
    }

    fn model_path(owner: &str, name: &str) -> String {
        format!("models/{owner}/{name}")
    }
}

/// Pass 2xx responses through; turn anything else into an `Api` error with
/// the service's `detail` message when it sends one.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ReplicateError::Api(format!("{status}: {}", error_detail(&body))))
}

fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: Some(detail),
            ..
        }) => detail,
        Ok(ErrorBody {
            title: Some(title), ..
        }) => title,
        _ => body.trim().to_string(),
    }
}

fn as_submission(err: ReplicateError) -> ReplicateError {
    match err {
        ReplicateError::Api(msg) => ReplicateError::Submission(msg),
        other => other,
    }
}

/// Best-effort content type from the file extension.
fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "txt" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl ModelApi for HttpApi {
    async fn resolve(&self, owner: &str, name: &str, version: Option<&str>) -> Result<Version> {
        let model_path = Self::model_path(owner, name);
        match version {
            Some(version) => {
                let url = self.endpoint(&format!("{model_path}/versions/{version}"))?;
                self.send_json(self.request(Method::GET, url)).await
            }
            None => {
                let url = self.endpoint(&model_path)?;
                let model: Model = self.send_json(self.request(Method::GET, url)).await?;
                model.latest_version.ok_or_else(|| {
                    ReplicateError::Api(format!("model {owner}/{name} has no published version"))
                })
            }
        }
    }

    async fn create_prediction(
        &self,
        target: &SubmitTarget,
        input: &CoercedInput,
        stream: bool,
    ) -> Result<Job> {
        let (url, body) = match target {
            SubmitTarget::Version(version) => (
                self.endpoint("predictions"),
                json!({"version": version, "input": input, "stream": stream}),
            ),
            SubmitTarget::Model { owner, name } => (
                self.endpoint(&format!("{}/predictions", Self::model_path(owner, name))),
                json!({"input": input, "stream": stream}),
            ),
        };
        let request = self.request(Method::POST, url?).json(&body);
        self.send_json(request).await.map_err(as_submission)
    }

    async fn create_training(
        &self,
        owner: &str,
        name: &str,
        version: &str,
        destination: &str,
        input: &CoercedInput,
    ) -> Result<Job> {
        let url = self.endpoint(&format!(
            "{}/versions/{version}/trainings",
            Self::model_path(owner, name)
        ))?;
        let body = json!({"destination": destination, "input": input});
        let request = self.request(Method::POST, url).json(&body);
        self.send_json(request).await.map_err(as_submission)
    }

    async fn get_job(&self, job: &Job) -> Result<Job> {
        let url = match job.urls.get.as_deref().filter(|u| !u.is_empty()) {
            Some(get) => Url::parse(get)
                .map_err(|e| ReplicateError::Api(format!("invalid job URL {get}: {e}")))?,
            None => self.endpoint(&format!("predictions/{}", job.id))?,
        };
        self.send_json(self.request(Method::GET, url)).await
    }

    async fn get_prediction(&self, id: &str) -> Result<Job> {
        let url = self.endpoint(&format!("predictions/{id}"))?;
        self.send_json(self.request(Method::GET, url)).await
    }

    async fn subscribe(&self, job: &Job) -> Result<BoxStream<'static, StreamEvent>> {
        let stream_url = job
            .stream_url()
            .ok_or_else(|| ReplicateError::Streaming(format!("job {} has no stream", job.id)))?;
        let url = Url::parse(stream_url)
            .map_err(|e| ReplicateError::Streaming(format!("invalid stream URL: {e}")))?;

        let response = self
            .request(Method::GET, url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|e| ReplicateError::Streaming(e.to_string()))?;
        let response = check_status(response).await.map_err(|err| match err {
            ReplicateError::Api(msg) => ReplicateError::Streaming(msg),
            other => other,
        })?;

        Ok(decode_events(response.bytes_stream()))
    }

    async fn upload(&self, path: &Path) -> Result<String> {
        let upload_error = |reason: String| ReplicateError::Upload {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| upload_error(e.to_string()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(content_type(path))
            .map_err(|e| upload_error(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("content", part);

        let url = self.endpoint("files")?;
        let uploaded: UploadedFile = self
            .send_json(self.request(Method::POST, url).multipart(form))
            .await
            .map_err(|e| upload_error(e.to_string()))?;

        uploaded
            .urls
            .get
            .ok_or_else(|| upload_error("service returned no file URL".to_string()))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "downloading");
        let response = check_status(self.client.get(url).send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_prefers_detail_field() {
        assert_eq!(
            error_detail(r#"{"title": "Invalid", "detail": "prompt is required"}"#),
            "prompt is required"
        );
        assert_eq!(error_detail(r#"{"title": "Unauthenticated"}"#), "Unauthenticated");
        assert_eq!(error_detail("bad gateway\n"), "bad gateway");
    }

    #[test]
    fn test_api_errors_become_submission_errors() {
        let err = as_submission(ReplicateError::Api("422: bad input".to_string()));
        assert!(matches!(err, ReplicateError::Submission(ref msg) if msg == "422: bad input"));
        let err = as_submission(ReplicateError::Config("x".to_string()));
        assert!(matches!(err, ReplicateError::Config(_)));
    }

    #[test]
    fn test_content_type_from_extension() {
        assert_eq!(content_type(Path::new("a/b.PNG")), "image/png");
        assert_eq!(content_type(Path::new("clip.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("weights")), "application/octet-stream");
    }
}
