//! `owner/name[:version]` model references.

use std::fmt;
use std::str::FromStr;

use crate::error::{ReplicateError, Result};

/// A parsed model reference.
///
/// `owner` and `name` are always non-empty. `version` is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelIdentifier {
    pub owner: String,
    pub name: String,
    pub version: Option<String>,
}

impl ModelIdentifier {
    /// Parse `owner/name` or `owner/name:version`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || ReplicateError::InvalidIdentifier(s.to_string());

        let (owner, rest) = s.split_once('/').ok_or_else(invalid)?;
        if rest.contains('/') {
            return Err(invalid());
        }

        let (name, version) = match rest.split_once(':') {
            Some((_, version)) if version.contains(':') => return Err(invalid()),
            Some((name, version)) => (name, Some(version)),
            None => (rest, None),
        };

        if owner.is_empty() || name.is_empty() || version == Some("") {
            return Err(invalid());
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }

    /// The `owner/name` part, without any version.
    pub fn model_ref(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl FromStr for ModelIdentifier {
    type Err = ReplicateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}/{}:{}", self.owner, self.name, version),
            None => write!(f, "{}/{}", self.owner, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_owner_and_name() {
        let id = ModelIdentifier::parse("stability-ai/sdxl").unwrap();
        assert_eq!(id.owner, "stability-ai");
        assert_eq!(id.name, "sdxl");
        assert_eq!(id.version, None);
    }

    #[test]
    fn test_parse_with_version() {
        let id: ModelIdentifier = "meta/llama-2-70b-chat:02e509c7".parse().unwrap();
        assert_eq!(id.owner, "meta");
        assert_eq!(id.name, "llama-2-70b-chat");
        assert_eq!(id.version.as_deref(), Some("02e509c7"));
        assert_eq!(id.model_ref(), "meta/llama-2-70b-chat");
    }

    #[test]
    fn test_render_round_trips() {
        for s in ["a/b", "owner/name:version", "replicate/hello-world:5c7d5dc6dd8b"] {
            let id = ModelIdentifier::parse(s).unwrap();
            assert_eq!(id.to_string(), s);
        }
    }

    #[test]
    fn test_malformed_identifiers_rejected() {
        for s in [
            "",
            "name",
            "a/b/c",
            "/name",
            "owner/",
            "owner/:v1",
            "owner/name:v1:v2",
            "owner/name:",
            "a//b",
        ] {
            let err = ModelIdentifier::parse(s).unwrap_err();
            assert!(
                matches!(err, ReplicateError::InvalidIdentifier(_)),
                "expected InvalidIdentifier for {s:?}, got {err:?}"
            );
        }
    }
}
