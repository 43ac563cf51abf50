//! In-memory fake of [`ModelApi`] (testing only)
//!
//! Holds registered versions, a scripted sequence of job snapshots, an
//! optional stream script and downloadable files. Records every submission
//! and upload so tests can assert on them.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::client::ModelApi;
use crate::coerce::CoercedInput;
use crate::error::{ReplicateError, Result};
use crate::job::{Job, Status, StreamEvent, SubmitTarget, Urls, Version};

/// A recorded `create_prediction` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub target: SubmitTarget,
    pub input: CoercedInput,
    pub stream: bool,
}

/// A recorded `create_training` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSubmission {
    pub model: String,
    pub version: String,
    pub destination: String,
    pub input: CoercedInput,
}

#[derive(Debug, Default)]
struct State {
    versions: HashMap<String, Version>,
    snapshots: VecDeque<Job>,
    stream: Option<Vec<StreamEvent>>,
    files: HashMap<String, Vec<u8>>,
    reject_model_target: bool,
    reject_all_submissions: bool,
    submissions: Vec<Submission>,
    trainings: Vec<TrainingSubmission>,
    uploads: Vec<PathBuf>,
    fetched: Vec<String>,
    subscribed: usize,
}

/// In-memory [`ModelApi`].
#[derive(Debug, Default)]
pub struct FakeApi {
    state: Mutex<State>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `version` for `owner/name`, as both the latest and the pinned version.
    pub fn with_version(self, owner: &str, name: &str, version: Version) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state
                .versions
                .insert(format!("{owner}/{name}:{}", version.id), version.clone());
            state.versions.insert(format!("{owner}/{name}"), version);
        }
        self
    }

    /// Snapshots returned by successive `get_job` calls. Statuses are taken
    /// as given; ids are rewritten to the submitted job's id.
    pub fn with_snapshots(self, snapshots: Vec<Job>) -> Self {
        self.state.lock().unwrap().snapshots = snapshots.into();
        self
    }

    /// Grant a stream endpoint to streaming submissions and replay `events` on it.
    pub fn with_stream(self, events: Vec<StreamEvent>) -> Self {
        self.state.lock().unwrap().stream = Some(events);
        self
    }

    /// Serve `bytes` from `url` for `fetch`.
    pub fn with_file(self, url: &str, bytes: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(url.to_string(), bytes.to_vec());
        self
    }

    /// Fail submissions against a model target, as for models without a
    /// default deployment.
    pub fn reject_model_target(self) -> Self {
        self.state.lock().unwrap().reject_model_target = true;
        self
    }

    pub fn reject_submissions(self) -> Self {
        self.state.lock().unwrap().reject_all_submissions = true;
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn trainings(&self) -> Vec<TrainingSubmission> {
        self.state.lock().unwrap().trainings.clone()
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.state.lock().unwrap().fetched.clone()
    }

    /// How many times a stream was opened.
    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscribed
    }
}

/// A fresh job with the given id and status.
pub fn job(id: &str, status: Status) -> Job {
    Job {
        id: id.to_string(),
        model: None,
        version: None,
        status,
        input: None,
        output: None,
        error: None,
        logs: None,
        urls: Urls {
            get: Some(format!("https://api.example/v1/predictions/{id}")),
            ..Urls::default()
        },
        created_at: None,
        started_at: None,
        completed_at: None,
        metrics: None,
    }
}

#[async_trait]
impl ModelApi for FakeApi {
    async fn resolve(&self, owner: &str, name: &str, version: Option<&str>) -> Result<Version> {
        let key = match version {
            Some(version) => format!("{owner}/{name}:{version}"),
            None => format!("{owner}/{name}"),
        };
        self.state
            .lock()
            .unwrap()
            .versions
            .get(&key)
            .cloned()
            .ok_or_else(|| ReplicateError::Api(format!("404 Not Found: {key}")))
    }

    async fn create_prediction(
        &self,
        target: &SubmitTarget,
        input: &CoercedInput,
        stream: bool,
    ) -> Result<Job> {
        let mut state = self.state.lock().unwrap();
        if state.reject_all_submissions {
            return Err(ReplicateError::Submission("422: invalid input".to_string()));
        }
        if state.reject_model_target && matches!(target, SubmitTarget::Model { .. }) {
            return Err(ReplicateError::Submission(
                "404: model has no default deployment".to_string(),
            ));
        }

        state.submissions.push(Submission {
            target: target.clone(),
            input: input.clone(),
            stream,
        });

        let id = format!("p{}", state.submissions.len());
        let mut created = job(&id, Status::Starting);
        created.input = Some(Value::Object(input.clone()));
        if let SubmitTarget::Version(version) = target {
            created.version = Some(version.clone());
        }
        if stream && state.stream.is_some() {
            created.urls.stream = Some(format!("https://stream.example/v1/predictions/{id}"));
        }
        Ok(created)
    }

    async fn create_training(
        &self,
        owner: &str,
        name: &str,
        version: &str,
        destination: &str,
        input: &CoercedInput,
    ) -> Result<Job> {
        let mut state = self.state.lock().unwrap();
        state.trainings.push(TrainingSubmission {
            model: format!("{owner}/{name}"),
            version: version.to_string(),
            destination: destination.to_string(),
            input: input.clone(),
        });
        let mut created = job(&format!("t{}", state.trainings.len()), Status::Starting);
        created.version = Some(version.to_string());
        Ok(created)
    }

    async fn get_job(&self, current: &Job) -> Result<Job> {
        let mut state = self.state.lock().unwrap();
        let mut next = match state.snapshots.pop_front() {
            Some(snapshot) => snapshot,
            None => {
                let mut done = current.clone();
                done.status = Status::Succeeded;
                done
            }
        };
        next.id = current.id.clone();
        Ok(next)
    }

    async fn get_prediction(&self, id: &str) -> Result<Job> {
        let state = self.state.lock().unwrap();
        state
            .snapshots
            .back()
            .cloned()
            .map(|mut last| {
                last.id = id.to_string();
                last
            })
            .ok_or_else(|| ReplicateError::Api(format!("404 Not Found: prediction {id}")))
    }

    async fn subscribe(&self, job: &Job) -> Result<BoxStream<'static, StreamEvent>> {
        if job.stream_url().is_none() {
            return Err(ReplicateError::Streaming(format!("job {} has no stream", job.id)));
        }
        let mut state = self.state.lock().unwrap();
        state.subscribed += 1;
        let events = state.stream.clone().unwrap_or_default();
        Ok(stream::iter(events).boxed())
    }

    async fn upload(&self, path: &Path) -> Result<String> {
        if !path.is_file() {
            return Err(ReplicateError::Upload {
                path: path.to_path_buf(),
                reason: "no such file".to_string(),
            });
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.state.lock().unwrap().uploads.push(path.to_path_buf());
        Ok(format!("https://files.example/{name}"))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.fetched.push(url.to_string());
        state
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| ReplicateError::Api(format!("404 Not Found: {url}")))
    }

    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }
}
