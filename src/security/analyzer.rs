use crate::security::file_validator::Attachment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

const OPENAI_MODERATION_URL: &str = "https://api.openai.com/v1/moderations";

/// What the external analyzer is asked to look at.
#[derive(Debug, Clone, Copy)]
pub enum AnalysisInput<'a> {
    Text(&'a str),
    Image(&'a Attachment),
}

/// Analyzer answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerVerdict {
    pub flagged: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl AnalyzerVerdict {
    pub fn clean() -> Self {
        Self::default()
    }
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("analyzer returned status {0}")]
    Status(u16),

    #[error("analyzer returned an unusable response: {0}")]
    Malformed(String),

    #[error("analyzer timed out")]
    Timeout,
}

/// How the pipeline treats analyzer errors and timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerFailurePolicy {
    /// Treat as "not flagged" and log a warning
    #[default]
    FailOpen,
    /// Reject the request as an infrastructure failure
    FailClosed,
}

impl FromStr for AnalyzerFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown analyzer failure policy: {}", other)),
        }
    }
}

impl fmt::Display for AnalyzerFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailOpen => write!(f, "fail_open"),
            Self::FailClosed => write!(f, "fail_closed"),
        }
    }
}

/// Injected content analyzer capability.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(&self, input: AnalysisInput<'_>) -> Result<AnalyzerVerdict, AnalyzerError>;
}

/// Analyzer used when no external service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalyzer;

#[async_trait]
impl ContentAnalyzer for NoopAnalyzer {
    async fn analyze(&self, _input: AnalysisInput<'_>) -> Result<AnalyzerVerdict, AnalyzerError> {
        Ok(AnalyzerVerdict::clean())
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiModerationResponse {
    results: Vec<OpenAiModerationResult>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: BTreeMap<String, bool>,
}

/// Text analyzer backed by the OpenAI moderation endpoint.
///
/// Images are passed through as clean; only metadata reaches this core.
#[derive(Clone)]
pub struct OpenAiModerationAnalyzer {
    api_key: String,
    endpoint: String,
    http_client: reqwest::Client,
}

impl OpenAiModerationAnalyzer {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, OPENAI_MODERATION_URL.to_string())
    }

    pub fn with_endpoint(api_key: String, endpoint: String) -> Self {
        Self {
            api_key,
            endpoint,
            http_client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ContentAnalyzer for OpenAiModerationAnalyzer {
    async fn analyze(&self, input: AnalysisInput<'_>) -> Result<AnalyzerVerdict, AnalyzerError> {
        let text = match input {
            AnalysisInput::Text(text) => text,
            AnalysisInput::Image(attachment) => {
                debug!(filename = %attachment.filename, "Image analysis not supported, skipping");
                return Ok(AnalyzerVerdict::clean());
            }
        };

        let request_body = serde_json::json!({
            "input": text,
            "model": "omni-moderation-latest"
        });

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AnalyzerError::Status(response.status().as_u16()));
        }

        let body: OpenAiModerationResponse = response.json().await?;
        let result = body
            .results
            .into_iter()
            .next()
            .ok_or_else(|| AnalyzerError::Malformed("empty results".to_string()))?;

        Ok(AnalyzerVerdict {
            flagged: result.flagged,
            categories: result
                .categories
                .into_iter()
                .filter(|(_, hit)| *hit)
                .map(|(name, _)| name)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("fail_open".parse::<AnalyzerFailurePolicy>().unwrap(), AnalyzerFailurePolicy::FailOpen);
        assert_eq!("Fail-Closed".parse::<AnalyzerFailurePolicy>().unwrap(), AnalyzerFailurePolicy::FailClosed);
        assert!("sometimes".parse::<AnalyzerFailurePolicy>().is_err());
        assert_eq!(AnalyzerFailurePolicy::default(), AnalyzerFailurePolicy::FailOpen);
    }

    #[test]
    fn test_openai_response_shape() {
        let raw = r#"{
            "id": "modr-1",
            "results": [{
                "flagged": true,
                "categories": {"hate": false, "sexual": true, "violence": true},
                "category_scores": {"hate": 0.01, "sexual": 0.9, "violence": 0.7}
            }]
        }"#;
        let parsed: OpenAiModerationResponse = serde_json::from_str(raw).unwrap();
        let result = &parsed.results[0];
        assert!(result.flagged);
        let hits: Vec<&String> = result.categories.iter().filter(|(_, v)| **v).map(|(k, _)| k).collect();
        assert_eq!(hits, vec!["sexual", "violence"]);
    }

    #[tokio::test]
    async fn test_noop_is_clean() {
        let verdict = NoopAnalyzer.analyze(AnalysisInput::Text("anything")).await.unwrap();
        assert!(!verdict.flagged);
    }
}
