//! Saving job output to a local directory.
//!
//! Partial results are left on disk when a later step fails.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::future::join_all;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, info};

use crate::client::ModelApi;
use crate::error::{ReplicateError, Result};
use crate::job::{Job, Status};
use crate::schema::OutputShape;

pub const STREAM_FILE: &str = "output.txt";
pub const VALUE_FILE: &str = "output.json";

/// `requested`, or `./{job-id}` when none was given.
pub fn output_dir(job: &Job, requested: Option<&Path>) -> PathBuf {
    match requested {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from(".").join(&job.id),
    }
}

fn persistence(context: impl std::fmt::Display, err: impl std::fmt::Display) -> ReplicateError {
    ReplicateError::Persistence(format!("{context}: {err}"))
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| persistence(format_args!("failed to create {}", dir.display()), e))
}

/// Rewrites `output.txt` with the full token buffer after every token.
#[derive(Debug)]
pub struct StreamSink {
    path: PathBuf,
}

impl StreamSink {
    pub async fn create(dir: &Path) -> Result<Self> {
        ensure_dir(dir).await?;
        Ok(Self {
            path: dir.join(STREAM_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn flush(&self, buffer: &str) -> Result<()> {
        tokio::fs::write(&self.path, buffer)
            .await
            .map_err(|e| persistence(format_args!("failed to write {}", self.path.display()), e))
    }
}

/// Save a succeeded job's output according to `shape`.
///
/// URL outputs are downloaded concurrently, one file per URL named after the
/// URL's last path segment. A failed download fails the whole step once the
/// others have finished.
/// Anything else, including output that does not match the declared shape,
/// is written to `output.json`.
pub async fn save_output<A>(api: &A, job: &Job, shape: OutputShape, dir: &Path) -> Result<Vec<PathBuf>>
where
    A: ModelApi + ?Sized,
{
    if job.status != Status::Succeeded {
        return Err(ReplicateError::Persistence(format!(
            "job {} is {}, not succeeded",
            job.id, job.status
        )));
    }
    let output = job
        .output
        .as_ref()
        .ok_or_else(|| ReplicateError::Persistence(format!("job {} has no output", job.id)))?;

    ensure_dir(dir).await?;

    let urls: Option<Vec<&str>> = match (shape, output) {
        (OutputShape::UriList, Value::Array(items)) => items.iter().map(Value::as_str).collect(),
        (OutputShape::Uri, Value::String(url)) => Some(vec![url.as_str()]),
        _ => None,
    };

    let saved = match urls {
        Some(urls) => download_all(api, &urls, dir).await?,
        None => {
            let path = dir.join(VALUE_FILE);
            let bytes = serde_json::to_vec_pretty(output)?;
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| persistence(format_args!("failed to write {}", path.display()), e))?;
            vec![path]
        }
    };

    info!(dir = %dir.display(), files = saved.len(), "saved output");
    Ok(saved)
}

async fn download_all<A>(api: &A, urls: &[&str], dir: &Path) -> Result<Vec<PathBuf>>
where
    A: ModelApi + ?Sized,
{
    let targets = file_names(urls)?
        .into_iter()
        .zip(urls.iter().copied())
        .map(|(name, url)| (url, dir.join(name)));

    // Every download runs to completion before the first failure is
    // reported, so files that did arrive are on disk.
    join_all(targets.map(|(url, path)| async move {
        debug!(url, path = %path.display(), "downloading output");
        let bytes = api
            .fetch(url)
            .await
            .map_err(|e| persistence(format_args!("failed to download {url}"), e))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| persistence(format_args!("failed to write {}", path.display()), e))?;
        Ok::<_, ReplicateError>(path)
    }))
    .await
    .into_iter()
    .collect()
}

/// Local file names for `urls`; repeated names get an index prefix.
fn file_names(urls: &[&str]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    urls.iter()
        .enumerate()
        .map(|(i, raw)| {
            let url = Url::parse(raw).map_err(|e| persistence(format_args!("invalid URL {raw}"), e))?;
            let base = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .unwrap_or("output")
                .to_string();
            let name = if seen.insert(base.clone()) {
                base
            } else {
                format!("{i}-{base}")
            };
            Ok(name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{self, FakeApi};
    use serde_json::json;

    fn succeeded(output: Value) -> Job {
        let mut job = fakes::job("p1", Status::Succeeded);
        job.output = Some(output);
        job
    }

    #[test]
    fn test_default_directory_is_job_id() {
        let job = fakes::job("abc123", Status::Succeeded);
        assert_eq!(output_dir(&job, None), PathBuf::from("./abc123"));
        assert_eq!(output_dir(&job, Some(Path::new("out"))), PathBuf::from("out"));
    }

    #[test]
    fn test_file_names_from_url_paths() {
        let names = file_names(&[
            "https://replicate.delivery/a/out-0.png",
            "https://replicate.delivery/b/out-0.png",
            "https://replicate.delivery/",
        ])
        .unwrap();
        assert_eq!(names, vec!["out-0.png", "1-out-0.png", "output"]);
    }

    #[tokio::test]
    async fn test_uri_list_downloads_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new()
            .with_file("https://cdn.example/x/a.png", b"A")
            .with_file("https://cdn.example/y/b.png", b"B");
        let job = succeeded(json!(["https://cdn.example/x/a.png", "https://cdn.example/y/b.png"]));

        let saved = save_output(&api, &job, OutputShape::UriList, dir.path())
            .await
            .unwrap();

        assert_eq!(saved.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("a.png")).unwrap(), b"A");
        assert_eq!(std::fs::read(dir.path().join("b.png")).unwrap(), b"B");
    }

    #[tokio::test]
    async fn test_single_uri_download() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new().with_file("https://cdn.example/out.wav", b"RIFF");
        let job = succeeded(json!("https://cdn.example/out.wav"));

        save_output(&api, &job, OutputShape::Uri, dir.path()).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("out.wav")).unwrap(), b"RIFF");
    }

    #[tokio::test]
    async fn test_failed_download_keeps_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new().with_file("https://cdn.example/ok.png", b"ok");
        let job = succeeded(json!(["https://cdn.example/ok.png", "https://cdn.example/missing.png"]));

        let err = save_output(&api, &job, OutputShape::UriList, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicateError::Persistence(ref msg) if msg.contains("missing.png")));
        assert!(!dir.path().join("missing.png").exists());
        assert_eq!(std::fs::read(dir.path().join("ok.png")).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_value_output_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new();
        let job = succeeded(json!({"text": "hello", "score": 0.5}));

        let saved = save_output(&api, &job, OutputShape::Value, dir.path())
            .await
            .unwrap();
        assert_eq!(saved, vec![dir.path().join(VALUE_FILE)]);
        let written: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(VALUE_FILE)).unwrap()).unwrap();
        assert_eq!(written, json!({"text": "hello", "score": 0.5}));
        assert!(api.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_shape_mismatch_falls_back_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new();
        let job = succeeded(json!([1, 2, 3]));

        save_output(&api, &job, OutputShape::UriList, dir.path()).await.unwrap();
        assert!(dir.path().join(VALUE_FILE).exists());
    }

    #[tokio::test]
    async fn test_only_succeeded_jobs_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new();
        let job = fakes::job("p1", Status::Failed);
        let err = save_output(&api, &job, OutputShape::Value, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicateError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_stream_sink_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = StreamSink::create(&dir.path().join("nested")).await.unwrap();
        sink.flush("Hel").await.unwrap();
        sink.flush("Hello").await.unwrap();
        assert_eq!(std::fs::read_to_string(sink.path()).unwrap(), "Hello");
    }
}
