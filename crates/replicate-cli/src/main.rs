//! Replicate CLI
//!
//! The `replicate` command runs models on Replicate.
//!
//! ## Commands
//!
//! - `run` / `prediction create`: run a model with `key=value` inputs
//! - `stream`: run a model and stream its output tokens
//! - `train` / `training create`: start a fine-tuning job
//! - `model schema`: show a model's inputs and output
//! - `prediction show`: show a prediction

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, Level};

use replicate_core::telemetry::init_tracing;
use replicate_core::{
    read_piped_stdin, run_prediction, run_training, Console, HttpApi, Job, ModelApi,
    ModelIdentifier, PredictionRequest, Schema, StreamPreference, TrainingRequest,
    DEFAULT_SEPARATOR,
};

#[derive(Parser)]
#[command(name = "replicate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run models on Replicate from the command line", long_about = None)]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a model (alias for `prediction create`)
    Run(CreateArgs),

    /// Run a model and stream its output
    Stream(StreamArgs),

    /// Start a training (alias for `training create`)
    Train(TrainArgs),

    /// Manage predictions
    Prediction {
        #[command(subcommand)]
        action: PredictionAction,
    },

    /// Manage trainings
    Training {
        #[command(subcommand)]
        action: TrainingAction,
    },

    /// Inspect models
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum PredictionAction {
    /// Create a prediction
    Create(CreateArgs),

    /// Show a prediction
    Show {
        /// Prediction ID
        id: String,

        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TrainingAction {
    /// Create a training
    Create(TrainArgs),
}

#[derive(Subcommand)]
enum ModelAction {
    /// Show a model version's input and output schema
    Schema {
        /// Model as owner/name[:version]
        model: String,

        /// Emit the raw OpenAPI document
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct CreateArgs {
    /// Model as owner/name[:version]
    model: String,

    /// Inputs as key=value; `@path` uploads a file, `{{.path}}` reads piped JSON
    inputs: Vec<String>,

    /// Emit JSON
    #[arg(long)]
    json: bool,

    /// Wait for the prediction to complete (default)
    #[arg(short, long, conflicts_with = "no_wait")]
    wait: bool,

    /// Don't wait for the prediction to complete
    #[arg(long)]
    no_wait: bool,

    /// Stream prediction output
    #[arg(long, conflicts_with_all = ["no_stream", "wait"])]
    stream: bool,

    /// Don't stream prediction output
    #[arg(long)]
    no_stream: bool,

    /// Separator between input key and value
    #[arg(long, default_value = DEFAULT_SEPARATOR)]
    separator: String,

    /// Save prediction outputs to a directory
    #[arg(long)]
    save: bool,

    /// Output directory, defaults to ./{prediction-id}
    #[arg(long)]
    output_directory: Option<PathBuf>,
}

impl CreateArgs {
    fn stream_preference(&self) -> StreamPreference {
        if self.stream {
            StreamPreference::Force
        } else if self.no_stream || self.wait {
            StreamPreference::Never
        } else {
            StreamPreference::Auto
        }
    }

    fn into_request(self, stdin: Option<String>) -> Result<PredictionRequest> {
        let model = ModelIdentifier::parse(&self.model)?;
        Ok(PredictionRequest {
            stream: self.stream_preference(),
            model,
            args: self.inputs,
            stdin,
            separator: self.separator,
            wait: !self.no_wait,
            save: self.save,
            output_dir: self.output_directory,
        })
    }
}

#[derive(Args, Debug, Clone)]
struct StreamArgs {
    /// Model as owner/name[:version]
    model: String,

    /// Inputs as key=value
    inputs: Vec<String>,

    /// Emit the tokens as a JSON array
    #[arg(long)]
    json: bool,

    /// Separator between input key and value
    #[arg(long, default_value = DEFAULT_SEPARATOR)]
    separator: String,

    /// Save streamed output to a directory
    #[arg(long)]
    save: bool,

    /// Output directory, defaults to ./{prediction-id}
    #[arg(long)]
    output_directory: Option<PathBuf>,
}

impl StreamArgs {
    fn into_request(self, stdin: Option<String>) -> Result<PredictionRequest> {
        Ok(PredictionRequest {
            model: ModelIdentifier::parse(&self.model)?,
            args: self.inputs,
            stdin,
            separator: self.separator,
            wait: true,
            stream: StreamPreference::Force,
            save: self.save,
            output_dir: self.output_directory,
        })
    }
}

#[derive(Args, Debug, Clone)]
struct TrainArgs {
    /// Model to fine-tune as owner/name[:version]
    model: String,

    /// Inputs as key=value
    inputs: Vec<String>,

    /// Model to push the trained version to, as owner/name
    #[arg(short, long)]
    destination: String,

    /// Emit JSON
    #[arg(long)]
    json: bool,

    /// Wait for the training to complete
    #[arg(short, long)]
    wait: bool,

    /// Separator between input key and value
    #[arg(long, default_value = DEFAULT_SEPARATOR)]
    separator: String,
}

impl TrainArgs {
    fn into_request(self, stdin: Option<String>) -> Result<TrainingRequest> {
        Ok(TrainingRequest {
            model: ModelIdentifier::parse(&self.model)?,
            destination: self.destination,
            args: self.inputs,
            stdin,
            separator: self.separator,
            wait: self.wait,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    init_tracing(cli.log_json, level);

    tokio::select! {
        result = dispatch(cli.command) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("Error: {err:#}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            // The remote job keeps running; only local work is abandoned.
            eprintln!("Interrupted");
            ExitCode::from(130)
        }
    }
}

async fn dispatch(command: Commands) -> Result<()> {
    let api = HttpApi::from_env().context("Failed to configure API client")?;

    match command {
        Commands::Run(args)
        | Commands::Prediction {
            action: PredictionAction::Create(args),
        } => {
            let mut console = Console::stdout(args.json);
            let stdin = piped_stdin()?;
            cmd_predict(&api, &mut console, args.into_request(stdin)?).await
        }
        Commands::Stream(args) => {
            let mut console = Console::stdout(args.json);
            let stdin = piped_stdin()?;
            cmd_predict(&api, &mut console, args.into_request(stdin)?).await
        }
        Commands::Train(args)
        | Commands::Training {
            action: TrainingAction::Create(args),
        } => {
            let mut console = Console::stdout(args.json);
            let stdin = piped_stdin()?;
            cmd_train(&api, &mut console, args.into_request(stdin)?).await
        }
        Commands::Prediction {
            action: PredictionAction::Show { id, json },
        } => {
            let mut console = Console::stdout(json);
            cmd_show(&api, &mut console, &id).await
        }
        Commands::Model {
            action: ModelAction::Schema { model, json },
        } => {
            let mut console = Console::stdout(json);
            cmd_schema(&api, &mut console, &model).await
        }
    }
}

fn piped_stdin() -> Result<Option<String>> {
    let stdin = read_piped_stdin().context("Failed to read stdin")?;
    debug!(piped = stdin.is_some(), "checked stdin");
    Ok(stdin)
}

async fn cmd_predict<A: ModelApi>(
    api: &A,
    console: &mut Console,
    request: PredictionRequest,
) -> Result<()> {
    let outcome = run_prediction(api, console, &request)
        .await
        .with_context(|| format!("Failed to run {}", request.model))?;
    for path in &outcome.saved {
        debug!(path = %path.display(), "saved");
    }
    Ok(())
}

async fn cmd_train<A: ModelApi>(
    api: &A,
    console: &mut Console,
    request: TrainingRequest,
) -> Result<()> {
    run_training(api, console, &request)
        .await
        .with_context(|| format!("Failed to train {}", request.model))?;
    Ok(())
}

async fn cmd_show<A: ModelApi>(api: &A, console: &mut Console, id: &str) -> Result<()> {
    let job = api
        .get_prediction(id)
        .await
        .with_context(|| format!("Failed to get prediction {id}"))?;

    if console.is_json() || !console.is_interactive() {
        console.print_json(&job)?;
        return Ok(());
    }
    print_job_summary(console, &job)
}

fn print_job_summary(console: &mut Console, job: &Job) -> Result<()> {
    console.println(&format!("{} {}  {}", job.status.symbol(), job.status, job.id))?;
    console.println(&job.web_url())?;
    if let Some(version) = &job.version {
        console.println(&format!("Version: {version}"))?;
    }
    if let Some(created_at) = job.created_at {
        console.println(&format!("Created: {}", created_at.to_rfc3339()))?;
    }
    if let Some(message) = job.error_message() {
        console.println(&format!("Error: {message}"))?;
    }
    if let Some(output) = &job.output {
        console.println("Output:")?;
        console.print_json(output)?;
    }
    Ok(())
}

async fn cmd_schema<A: ModelApi>(api: &A, console: &mut Console, model: &str) -> Result<()> {
    let id = ModelIdentifier::parse(model)?;
    let version = api
        .resolve(&id.owner, &id.name, id.version.as_deref())
        .await
        .with_context(|| format!("Failed to get model {id}"))?;

    if console.is_json() {
        console.print_json(&version.openapi_schema)?;
        return Ok(());
    }

    let schemas = version.schemas().context("Failed to read model schema")?;
    console.println(&format!("{}/{}:{}", id.owner, id.name, version.id))?;
    console.println("")?;
    console.println("Inputs:")?;
    match &schemas.input {
        Some(input) => {
            for line in describe_inputs(input) {
                console.println(&line)?;
            }
        }
        None => console.println("  (none declared)")?,
    }
    console.println("")?;
    console.println("Output:")?;
    let output = schemas
        .output
        .as_ref()
        .map(Schema::type_label)
        .unwrap_or_else(|| "(none declared)".to_string());
    console.println(&format!("  {output}"))?;
    Ok(())
}

/// One block per property, in display order.
fn describe_inputs(input: &Schema) -> Vec<String> {
    let mut lines = Vec::new();
    for (name, prop) in input.ordered_properties() {
        let required = if input.required.iter().any(|r| r == name) {
            " (required)"
        } else {
            ""
        };
        lines.push(format!("- {name}: {}{required}", prop.type_label()));
        if let Some(description) = &prop.description {
            lines.push(format!("    {description}"));
        }
        if let Some(default) = &prop.default {
            lines.push(format!("    default: {default}"));
        }
        if !prop.choices.is_empty() {
            let choices: Vec<String> = prop.choices.iter().map(|c| c.to_string()).collect();
            lines.push(format!("    choices: {}", choices.join(", ")));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use replicate_core::fakes::{self, FakeApi};
    use replicate_core::{Status, Version};
    use serde_json::json;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("replicate").chain(args.iter().copied()))
    }

    fn create_args(args: &[&str]) -> CreateArgs {
        match parse(args).unwrap().command {
            Commands::Run(args) => args,
            Commands::Prediction {
                action: PredictionAction::Create(args),
            } => args,
            _ => panic!("expected a create command"),
        }
    }

    fn version() -> Version {
        serde_json::from_value(json!({
            "id": "v1",
            "openapi_schema": {"components": {"schemas": {
                "Input": {
                    "type": "object",
                    "required": ["prompt"],
                    "properties": {
                        "prompt": {"type": "string", "x-order": 0, "description": "Input prompt"},
                        "seed": {"type": "integer"},
                        "scheduler": {
                            "allOf": [{"$ref": "#/components/schemas/scheduler"}],
                            "default": "DDIM",
                            "x-order": 1
                        }
                    }
                },
                "scheduler": {"type": "string", "enum": ["DDIM", "K_EULER"]},
                "Output": {"type": "array", "items": {"type": "string", "format": "uri"}}
            }}}
        }))
        .unwrap()
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let args = create_args(&["run", "replicate/hello-world", "text=Alice"]);
        assert_eq!(args.inputs, vec!["text=Alice".to_string()]);
        assert_eq!(args.separator, "=");
        assert_eq!(args.stream_preference(), StreamPreference::Auto);

        let request = args.into_request(None).unwrap();
        assert!(request.wait);
        assert_eq!(request.model.to_string(), "replicate/hello-world");
    }

    #[test]
    fn test_stream_and_wait_preferences() {
        let args = create_args(&["prediction", "create", "a/b", "--stream"]);
        assert_eq!(args.stream_preference(), StreamPreference::Force);

        let args = create_args(&["run", "a/b", "--wait"]);
        assert_eq!(args.stream_preference(), StreamPreference::Never);

        let args = create_args(&["run", "a/b", "--no-stream", "--no-wait"]);
        assert_eq!(args.stream_preference(), StreamPreference::Never);
        assert!(!args.into_request(None).unwrap().wait);
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        assert!(parse(&["run", "a/b", "--stream", "--wait"]).is_err());
        assert!(parse(&["run", "a/b", "--stream", "--no-stream"]).is_err());
        assert!(parse(&["run", "a/b", "--wait", "--no-wait"]).is_err());
    }

    #[test]
    fn test_invalid_model_rejected() {
        let args = create_args(&["run", "not-a-model"]);
        let err = args.into_request(None).unwrap_err();
        assert!(err.to_string().contains("invalid model identifier"));
    }

    #[test]
    fn test_train_requires_destination() {
        assert!(parse(&["train", "a/b", "lr=1"]).is_err());
        let cli = parse(&["train", "a/b:v1", "-d", "me/tuned", "lr=1"]).unwrap();
        match cli.command {
            Commands::Train(args) => {
                let request = args.into_request(None).unwrap();
                assert_eq!(request.destination, "me/tuned");
                assert!(!request.wait);
            }
            _ => panic!("expected train"),
        }
    }

    #[test]
    fn test_describe_inputs_in_display_order() {
        let schemas = version().schemas().unwrap();
        let lines = describe_inputs(schemas.input.as_ref().unwrap());
        assert_eq!(
            lines,
            vec![
                "- prompt: string (required)",
                "    Input prompt",
                "- scheduler: string",
                "    default: \"DDIM\"",
                "    choices: \"DDIM\", \"K_EULER\"",
                "- seed: integer",
            ]
        );
    }

    #[tokio::test]
    async fn test_cmd_schema_prints_output_shape() {
        let api = FakeApi::new().with_version("owner", "model", version());
        let (mut console, captured) = Console::buffered(true, false);

        cmd_schema(&api, &mut console, "owner/model").await.unwrap();

        let text = captured.contents();
        assert!(text.starts_with("owner/model:v1\n"));
        assert!(text.contains("Output:\n  array<string (uri)>\n"));
    }

    #[tokio::test]
    async fn test_cmd_schema_json_prints_document() {
        let api = FakeApi::new().with_version("owner", "model", version());
        let (mut console, captured) = Console::buffered(false, true);

        cmd_schema(&api, &mut console, "owner/model:v1").await.unwrap();

        let doc: serde_json::Value = serde_json::from_str(&captured.contents()).unwrap();
        assert!(doc["components"]["schemas"]["Input"].is_object());
    }

    #[tokio::test]
    async fn test_cmd_show_summary() {
        let mut done = fakes::job("ignored", Status::Succeeded);
        done.output = Some(json!("hello"));
        let api = FakeApi::new().with_snapshots(vec![done]);
        let (mut console, captured) = Console::buffered(true, false);

        cmd_show(&api, &mut console, "abc").await.unwrap();

        let text = captured.contents();
        assert!(text.contains("succeeded  abc"));
        assert!(text.contains("https://replicate.com/p/abc"));
        assert!(text.contains("\"hello\""));
    }

    #[tokio::test]
    async fn test_cmd_predict_context_names_model() {
        let api = FakeApi::new().reject_submissions();
        let (mut console, _) = Console::buffered(false, false);
        let request = create_args(&["run", "a/b", "--no-wait"])
            .into_request(None)
            .unwrap();

        let err = cmd_predict(&api, &mut console, request).await.unwrap_err();
        assert!(format!("{err:#}").starts_with("Failed to run a/b"));
    }
}
