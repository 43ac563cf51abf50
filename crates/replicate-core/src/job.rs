//! Remote job, model and version records.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::schema::VersionSchemas;

const WEB_BASE: &str = "https://replicate.com/p";

/// Lifecycle status of a prediction or training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl Status {
    /// `succeeded`, `failed` and `canceled` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Glyph shown next to the status in interactive output.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Starting => "⏳",
            Self::Processing => "⚙",
            Self::Succeeded => "✅",
            Self::Failed => "❌",
            Self::Canceled => "🚫",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Links returned with a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Urls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<String>,
    /// Server-sent events endpoint; present only when streaming was granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<String>,
}

/// A prediction or training as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default)]
    pub urls: Urls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

/// `(current, total)` progress parsed from a job's logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(\d+)%\s*\|.*?\|\s*(\d+)/(\d+)").expect("progress pattern is valid")
    })
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the service granted a stream endpoint for this job.
    pub fn stream_url(&self) -> Option<&str> {
        self.urls.stream.as_deref().filter(|url| !url.is_empty())
    }

    /// Latest tqdm-style progress line in the logs, if any.
    pub fn progress(&self) -> Option<Progress> {
        let logs = self.logs.as_deref()?;
        logs.lines().rev().find_map(|line| {
            let caps = progress_pattern().captures(line)?;
            let current = caps.get(2)?.as_str().parse().ok()?;
            let total = caps.get(3)?.as_str().parse().ok()?;
            Some(Progress { current, total })
        })
    }

    /// Browser URL for the job.
    pub fn web_url(&self) -> String {
        match &self.urls.web {
            Some(web) if !web.is_empty() => web.clone(),
            _ => format!("{WEB_BASE}/{}", self.id),
        }
    }

    /// The job's error rendered for humans.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// A model version and its embedded OpenAPI document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cog_version: Option<String>,
    #[serde(default)]
    pub openapi_schema: Value,
}

impl Version {
    pub fn schemas(&self) -> Result<VersionSchemas> {
        VersionSchemas::from_document(&self.openapi_schema)
    }
}

/// A model as returned by `GET models/{owner}/{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub owner: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<Version>,
}

/// What a prediction is submitted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitTarget {
    /// A specific version id.
    Version(String),
    /// The model's current default deployment.
    Model { owner: String, name: String },
}

impl fmt::Display for SubmitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version(id) => write!(f, "version {id}"),
            Self::Model { owner, name } => write!(f, "model {owner}/{name}"),
        }
    }
}

/// One decoded server-sent event from a job's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One output token.
    Output(String),
    /// Log text; diagnostic only.
    Logs(String),
    Done,
    Error(String),
}
