//! Resolution of `key=value` CLI arguments into raw string inputs.
//!
//! Values may embed `{{ path }}` templates resolved against JSON piped on
//! stdin, and an `@path` value uploads a local file and is replaced by the
//! uploaded file's URL. Templates are expanded before the upload check, so
//! `image=@{{.file}}` is legal.

use std::collections::BTreeMap;
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;
use tracing::debug;

use crate::client::ModelApi;
use crate::error::{ReplicateError, Result};

/// Argument key to raw string value.
pub type RawInput = BTreeMap<String, String>;

/// Default separator between key and value.
pub const DEFAULT_SEPARATOR: &str = "=";

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("template pattern is valid"))
}

/// Read stdin when it is piped. A terminal or empty stdin yields `None`.
pub fn read_piped_stdin() -> std::io::Result<Option<String>> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut buf = String::new();
    stdin.read_to_string(&mut buf)?;
    Ok(if buf.trim().is_empty() { None } else { Some(buf) })
}

/// Split a single argument on `separator`, which must occur exactly once.
pub fn split_argument<'a>(arg: &'a str, separator: &str) -> Result<(&'a str, &'a str)> {
    if separator.is_empty() {
        return Err(ReplicateError::malformed(arg, "separator must not be empty"));
    }
    match arg.matches(separator).count() {
        1 => {}
        0 => {
            return Err(ReplicateError::malformed(
                arg,
                format!("expected key{separator}value"),
            ))
        }
        n => {
            return Err(ReplicateError::malformed(
                arg,
                format!("separator {separator:?} appears {n} times"),
            ))
        }
    }
    let (key, value) = arg
        .split_once(separator)
        .ok_or_else(|| ReplicateError::malformed(arg, "missing separator"))?;
    if key.is_empty() {
        return Err(ReplicateError::malformed(arg, "empty key"));
    }
    Ok((key, value))
}

/// Lazily parsed piped stdin; only parsed once a template needs it.
struct PipedDocument<'a> {
    text: Option<&'a str>,
    parsed: Option<Value>,
}

impl<'a> PipedDocument<'a> {
    fn new(text: Option<&'a str>) -> Self {
        Self { text, parsed: None }
    }

    fn get(&mut self, path: &str) -> Result<&Value> {
        if self.parsed.is_none() {
            let text = self
                .text
                .ok_or_else(|| ReplicateError::template(path, "no JSON was piped on stdin"))?;
            let doc = serde_json::from_str(text).map_err(|e| {
                ReplicateError::template(path, format!("stdin is not valid JSON: {e}"))
            })?;
            self.parsed = Some(doc);
        }
        self.parsed
            .as_ref()
            .ok_or_else(|| ReplicateError::template(path, "no JSON was piped on stdin"))
    }
}

/// Expand every `{{ path }}` in `value`, left to right.
fn expand_templates(value: &str, doc: &mut PipedDocument<'_>) -> Result<String> {
    let pattern = template_pattern();
    if !pattern.is_match(value) {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in pattern.captures_iter(value) {
        let whole = caps.get(0).ok_or_else(|| ReplicateError::template(value, "bad match"))?;
        let raw_path = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let path = if raw_path.starts_with('$') {
            raw_path.to_string()
        } else {
            format!("${raw_path}")
        };

        out.push_str(&value[last..whole.start()]);
        out.push_str(&extract(&path, doc.get(&path)?)?);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

fn extract(path: &str, doc: &Value) -> Result<String> {
    let query = JsonPath::parse(path).map_err(|e| ReplicateError::template(path, e.to_string()))?;
    let nodes = query.query(doc).all();
    match nodes.as_slice() {
        [] => Err(ReplicateError::template(path, "no value at path")),
        [single] => Ok(render(single)),
        many => Ok(Value::Array(many.iter().map(|v| (*v).clone()).collect()).to_string()),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn CLI arguments (and optional piped stdin) into [`RawInput`].
///
/// Every `@path` value triggers one upload through `api`; resolving the same
/// arguments twice uploads twice.
pub async fn resolve_inputs<A>(
    api: &A,
    args: &[String],
    stdin: Option<&str>,
    separator: &str,
) -> Result<RawInput>
where
    A: ModelApi + ?Sized,
{
    let mut pairs = Vec::with_capacity(args.len());
    for arg in args {
        let (key, value) = split_argument(arg, separator)?;
        if pairs.iter().any(|(k, _)| *k == key) {
            return Err(ReplicateError::malformed(
                arg.as_str(),
                format!("duplicate input key {key}"),
            ));
        }
        pairs.push((key, value));
    }

    let mut doc = PipedDocument::new(stdin);
    let mut inputs = RawInput::new();
    for (key, value) in pairs {
        let mut value = expand_templates(value, &mut doc)?;

        if let Some(path) = value.strip_prefix('@') {
            let path = PathBuf::from(path.trim());
            debug!(key, path = %path.display(), "uploading file input");
            value = api.upload(&path).await.map_err(|err| match err {
                upload @ ReplicateError::Upload { .. } => upload,
                other => ReplicateError::Upload {
                    path: path.clone(),
                    reason: other.to_string(),
                },
            })?;
        }

        inputs.insert(key.to_string(), value);
    }

    Ok(inputs)
}
