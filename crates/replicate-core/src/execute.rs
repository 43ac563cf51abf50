//! Execution orchestration: submit a job, pick a completion strategy, drive it.
//!
//! The strategy is decided once from the submission response. A stream is
//! only ever opened when the service granted one.

use std::path::PathBuf;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::client::ModelApi;
use crate::coerce::{coerce_inputs, CoercedInput};
use crate::console::Console;
use crate::error::{ReplicateError, Result};
use crate::identifier::ModelIdentifier;
use crate::input::resolve_inputs;
use crate::job::{Job, Status, StreamEvent, SubmitTarget, Version};
use crate::persist::{output_dir, save_output, StreamSink};
use crate::schema::{OutputShape, VersionSchemas};

/// Tracing target for model log lines received on a stream.
pub const LOG_TARGET: &str = "replicate::logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Prediction,
    Training,
}

impl JobKind {
    fn label(self) -> &'static str {
        match self {
            Self::Prediction => "Prediction",
            Self::Training => "Training",
        }
    }
}

/// How a submitted job is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Stream,
    Poll,
    FireAndForget,
}

/// Whether to ask the service for a stream endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamPreference {
    /// Always ask.
    Force,
    /// Never ask.
    Never,
    /// Ask when the output schema is a token stream.
    #[default]
    Auto,
}

impl StreamPreference {
    pub fn wants(self, can_stream: bool) -> bool {
        match self {
            Self::Force => true,
            Self::Never => false,
            Self::Auto => can_stream,
        }
    }
}

/// Caller choices that shape execution.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub kind: JobKind,
    pub wait: bool,
    pub stream: bool,
    pub save: bool,
    pub output_dir: Option<PathBuf>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            kind: JobKind::Prediction,
            wait: true,
            stream: false,
            save: false,
            output_dir: None,
        }
    }
}

/// Pick the strategy for a freshly submitted job.
///
/// Stream requires both the request and the grant. A requested but ungranted
/// stream falls back to polling.
pub fn select_strategy(job: &Job, options: &ExecuteOptions) -> Strategy {
    if options.stream && job.stream_url().is_some() {
        Strategy::Stream
    } else if options.stream || options.wait {
        Strategy::Poll
    } else {
        Strategy::FireAndForget
    }
}

/// What an execution observed.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub strategy: Strategy,
    /// Last known snapshot. For streams this is the submitted job.
    pub job: Job,
    /// Concatenated tokens, for streams.
    pub text: Option<String>,
    pub saved: Vec<PathBuf>,
}

/// Drive a submitted job to the end of its selected strategy.
pub async fn execute<A>(
    api: &A,
    console: &mut Console,
    job: Job,
    shape: OutputShape,
    options: &ExecuteOptions,
) -> Result<Outcome>
where
    A: ModelApi + ?Sized,
{
    let strategy = select_strategy(&job, options);
    info!(id = %job.id, ?strategy, "executing job");

    match strategy {
        Strategy::Stream => stream_job(api, console, job, options).await,
        Strategy::Poll => poll_job(api, console, job, shape, options).await,
        Strategy::FireAndForget => {
            if console.is_interactive() {
                console.println(&format!("{} created: {}", options.kind.label(), job.web_url()))?;
            } else {
                console.println(&serde_json::to_string(&job)?)?;
            }
            Ok(Outcome {
                strategy,
                job,
                text: None,
                saved: Vec::new(),
            })
        }
    }
}

async fn stream_job<A>(
    api: &A,
    console: &mut Console,
    job: Job,
    options: &ExecuteOptions,
) -> Result<Outcome>
where
    A: ModelApi + ?Sized,
{
    let mut events = api.subscribe(&job).await?;
    let sink = if options.save {
        Some(StreamSink::create(&output_dir(&job, options.output_dir.as_deref())).await?)
    } else {
        None
    };

    // JSON mode writes the array incrementally: `[`, each non-empty token,
    // then `]` once the stream ends, even when it ends in an error.
    let json = console.is_json();
    if json {
        console.print("[")?;
    }

    let mut buffer = String::new();
    let mut emitted = 0usize;
    let streamed = async {
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Output(token) => {
                    if !json {
                        console.print(&token)?;
                    } else if !token.is_empty() {
                        let separator = if emitted == 0 { "" } else { ", " };
                        console.print(&format!("{separator}{}", serde_json::to_string(&token)?))?;
                        emitted += 1;
                    }
                    buffer.push_str(&token);
                    if let Some(sink) = &sink {
                        sink.flush(&buffer).await?;
                    }
                }
                StreamEvent::Logs(text) => debug!(target: LOG_TARGET, "{}", text.trim_end()),
                StreamEvent::Done => break,
                StreamEvent::Error(message) => return Err(ReplicateError::Streaming(message)),
            }
        }
        Ok::<(), ReplicateError>(())
    }
    .await;

    console.println(if json { "]" } else { "" })?;
    streamed?;

    Ok(Outcome {
        strategy: Strategy::Stream,
        job,
        text: Some(buffer),
        saved: sink.map(|s| vec![s.path().to_path_buf()]).unwrap_or_default(),
    })
}

async fn poll_job<A>(
    api: &A,
    console: &mut Console,
    job: Job,
    shape: OutputShape,
    options: &ExecuteOptions,
) -> Result<Outcome>
where
    A: ModelApi + ?Sized,
{
    if console.is_interactive() {
        console.println(&format!("{} created: {}", options.kind.label(), job.web_url()))?;
    }

    let mut progress = console.progress(&job);
    let mut last = job.clone();
    {
        let mut snapshots = api.poll(job);
        while let Some(snapshot) = snapshots.next().await {
            let snapshot = snapshot?;
            progress.update(&snapshot);
            last = snapshot;
        }
    }
    progress.clear();

    report(console, &last)?;

    let saved = if options.save && last.status == Status::Succeeded {
        let dir = output_dir(&last, options.output_dir.as_deref());
        save_output(api, &last, shape, &dir).await?
    } else {
        Vec::new()
    };

    Ok(Outcome {
        strategy: Strategy::Poll,
        job: last,
        text: None,
        saved,
    })
}

fn report(console: &mut Console, job: &Job) -> Result<()> {
    if !console.is_interactive() {
        return console.println(&serde_json::to_string(job)?);
    }

    console.println(&format!("{} {}", job.status.symbol(), capitalized(job.status)))?;
    match job.status {
        Status::Succeeded => {
            if let Some(output) = &job.output {
                console.print_json(output)?;
            }
        }
        Status::Failed => {
            if let Some(logs) = job.logs.as_deref().filter(|l| !l.is_empty()) {
                console.println(logs.trim_end())?;
            }
            if let Some(message) = job.error_message() {
                console.println(&message)?;
            }
        }
        Status::Canceled => {
            if let Some(logs) = job.logs.as_deref().filter(|l| !l.is_empty()) {
                console.println(logs.trim_end())?;
            }
        }
        Status::Starting | Status::Processing => {}
    }
    Ok(())
}

fn capitalized(status: Status) -> String {
    let name = status.as_str();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Everything needed to run one prediction from CLI arguments.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub model: ModelIdentifier,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub separator: String,
    pub wait: bool,
    pub stream: StreamPreference,
    pub save: bool,
    pub output_dir: Option<PathBuf>,
}

/// Resolve, coerce, submit and execute a prediction.
///
/// Version lookup is soft: when it fails, inputs are coerced without a
/// schema and the output is treated as a plain value.
pub async fn run_prediction<A>(
    api: &A,
    console: &mut Console,
    request: &PredictionRequest,
) -> Result<Outcome>
where
    A: ModelApi + ?Sized,
{
    let model = &request.model;
    let version = match api
        .resolve(&model.owner, &model.name, model.version.as_deref())
        .await
    {
        Ok(version) => Some(version),
        Err(err) => {
            warn!(%model, error = %err, "could not resolve model version; inferring input types");
            None
        }
    };
    let schemas = match &version {
        Some(version) => version.schemas()?,
        None => VersionSchemas::default(),
    };

    let raw = resolve_inputs(api, &request.args, request.stdin.as_deref(), &request.separator).await?;
    let input = coerce_inputs(&raw, schemas.input.as_ref())?;

    let stream = request.stream.wants(schemas.can_stream());
    let job = submit_prediction(api, model, version.as_ref(), &input, stream).await?;
    info!(id = %job.id, stream, granted = job.stream_url().is_some(), "prediction created");

    let options = ExecuteOptions {
        kind: JobKind::Prediction,
        wait: request.wait,
        stream,
        save: request.save,
        output_dir: request.output_dir.clone(),
    };
    execute(api, console, job, schemas.output_shape(), &options).await
}

/// Submit against the pinned version, or else the model. When the model
/// target is rejected and a version was resolved, submit to that version.
async fn submit_prediction<A>(
    api: &A,
    model: &ModelIdentifier,
    version: Option<&Version>,
    input: &CoercedInput,
    stream: bool,
) -> Result<Job>
where
    A: ModelApi + ?Sized,
{
    if let Some(pinned) = &model.version {
        let target = SubmitTarget::Version(pinned.clone());
        return api.create_prediction(&target, input, stream).await;
    }

    let target = SubmitTarget::Model {
        owner: model.owner.clone(),
        name: model.name.clone(),
    };
    match api.create_prediction(&target, input, stream).await {
        Ok(job) => Ok(job),
        Err(err) => match version {
            Some(version) => {
                warn!(%model, error = %err, version = %version.id, "model submission failed; using latest version");
                let target = SubmitTarget::Version(version.id.clone());
                api.create_prediction(&target, input, stream).await
            }
            None => Err(err),
        },
    }
}

/// Everything needed to start one training from CLI arguments.
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub model: ModelIdentifier,
    pub destination: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub separator: String,
    pub wait: bool,
}

/// Resolve inputs, submit a training and observe it if asked to.
///
/// Trainings declare no input schema, so values are always inferred.
pub async fn run_training<A>(
    api: &A,
    console: &mut Console,
    request: &TrainingRequest,
) -> Result<Outcome>
where
    A: ModelApi + ?Sized,
{
    let model = &request.model;
    ModelIdentifier::parse(&request.destination).map_err(|_| {
        ReplicateError::malformed(
            request.destination.as_str(),
            "destination must be owner/name",
        )
    })?;

    let version = match &model.version {
        Some(version) => version.clone(),
        None => api.resolve(&model.owner, &model.name, None).await?.id,
    };

    let raw = resolve_inputs(api, &request.args, request.stdin.as_deref(), &request.separator).await?;
    let input = coerce_inputs(&raw, None)?;

    let job = api
        .create_training(&model.owner, &model.name, &version, &request.destination, &input)
        .await?;
    info!(id = %job.id, destination = %request.destination, "training created");

    let options = ExecuteOptions {
        kind: JobKind::Training,
        wait: request.wait,
        stream: false,
        save: false,
        output_dir: None,
    };
    execute(api, console, job, OutputShape::Value, &options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes;

    fn options(wait: bool, stream: bool) -> ExecuteOptions {
        ExecuteOptions {
            wait,
            stream,
            ..ExecuteOptions::default()
        }
    }

    fn granted() -> Job {
        let mut job = fakes::job("p1", Status::Starting);
        job.urls.stream = Some("https://stream.example/p1".to_string());
        job
    }

    #[test]
    fn test_stream_needs_request_and_grant() {
        assert_eq!(select_strategy(&granted(), &options(false, true)), Strategy::Stream);
        assert_eq!(select_strategy(&granted(), &options(true, true)), Strategy::Stream);
        assert_eq!(select_strategy(&granted(), &options(true, false)), Strategy::Poll);
        assert_eq!(
            select_strategy(&granted(), &options(false, false)),
            Strategy::FireAndForget
        );
    }

    #[test]
    fn test_ungranted_stream_falls_back_to_poll() {
        let job = fakes::job("p1", Status::Starting);
        assert_eq!(select_strategy(&job, &options(false, true)), Strategy::Poll);
        assert_eq!(select_strategy(&job, &options(true, true)), Strategy::Poll);
        assert_eq!(select_strategy(&job, &options(false, false)), Strategy::FireAndForget);
    }

    #[test]
    fn test_stream_preference() {
        assert!(StreamPreference::Force.wants(false));
        assert!(!StreamPreference::Never.wants(true));
        assert!(StreamPreference::Auto.wants(true));
        assert!(!StreamPreference::Auto.wants(false));
    }

    fn finished(status: Status) -> Job {
        let mut job = fakes::job("p1", status);
        job.logs = Some("loading weights\nstep 1\n".to_string());
        job
    }

    #[test]
    fn test_interactive_report_succeeded_prints_output() {
        let mut job = finished(Status::Succeeded);
        job.output = Some(serde_json::json!(["https://cdn.example/out.png"]));
        let (mut console, captured) = Console::buffered(true, false);

        report(&mut console, &job).unwrap();

        assert_eq!(
            captured.contents(),
            "✅ Succeeded\n[\n  \"https://cdn.example/out.png\"\n]\n"
        );
    }

    #[test]
    fn test_interactive_report_failed_prints_logs_and_error() {
        let mut job = finished(Status::Failed);
        job.error = Some(serde_json::json!("CUDA out of memory"));
        let (mut console, captured) = Console::buffered(true, false);

        report(&mut console, &job).unwrap();

        assert_eq!(
            captured.contents(),
            "❌ Failed\nloading weights\nstep 1\nCUDA out of memory\n"
        );
    }

    #[test]
    fn test_interactive_report_canceled_prints_logs() {
        let job = finished(Status::Canceled);
        let (mut console, captured) = Console::buffered(true, false);

        report(&mut console, &job).unwrap();

        assert_eq!(captured.contents(), "🚫 Canceled\nloading weights\nstep 1\n");
    }

    #[tokio::test]
    async fn test_interactive_poll_announces_then_reports() {
        let mut done = fakes::job("ignored", Status::Succeeded);
        done.output = Some(serde_json::json!("hello"));
        let api = fakes::FakeApi::new().with_snapshots(vec![done]);
        let (mut console, captured) = Console::buffered(true, false);

        let outcome = execute(
            &api,
            &mut console,
            fakes::job("p1", Status::Starting),
            OutputShape::Value,
            &options(true, false),
        )
        .await
        .unwrap();

        assert_eq!(outcome.strategy, Strategy::Poll);
        assert_eq!(
            captured.contents(),
            "Prediction created: https://replicate.com/p/p1\n✅ Succeeded\n\"hello\"\n"
        );
    }

    #[test]
    fn test_capitalized_status() {
        assert_eq!(capitalized(Status::Succeeded), "Succeeded");
        assert_eq!(capitalized(Status::Canceled), "Canceled");
    }
}
