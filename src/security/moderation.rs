use crate::config::ModerationConfig;
use crate::security::analyzer::{
    AnalysisInput, AnalyzerError, AnalyzerFailurePolicy, ContentAnalyzer, NoopAnalyzer,
};
use crate::security::content_filter::TextValidator;
use crate::security::file_validator::{Attachment, FileValidator};
use crate::security::link_validator::LinkValidator;
use crate::security::sanitize::sanitize_field;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why a submission was rejected. Internal only; clients see the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Profanity,
    SexualContent,
    TooLong,
    ExcessiveCaps,
    InvalidUrl,
    MaliciousUrl,
    BlockedDomain,
    TooManyFiles,
    FileTooLarge,
    InvalidFileType,
    InvalidExtension,
    SuspiciousFilename,
    FlaggedContent,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Profanity => "profanity",
            ReasonCode::SexualContent => "sexual_content",
            ReasonCode::TooLong => "too_long",
            ReasonCode::ExcessiveCaps => "excessive_caps",
            ReasonCode::InvalidUrl => "invalid_url",
            ReasonCode::MaliciousUrl => "malicious_url",
            ReasonCode::BlockedDomain => "blocked_domain",
            ReasonCode::TooManyFiles => "too_many_files",
            ReasonCode::FileTooLarge => "file_too_large",
            ReasonCode::InvalidFileType => "invalid_file_type",
            ReasonCode::InvalidExtension => "invalid_extension",
            ReasonCode::SuspiciousFilename => "suspicious_filename",
            ReasonCode::FlaggedContent => "flagged_content",
        }
    }
}

/// A failed check: the code for logs and metrics, and one user-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ReasonCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The pipeline could not reach a decision.
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("content analyzer unavailable: {0}")]
    AnalyzerUnavailable(#[source] AnalyzerError),
}

/// User input as it arrives from a mutating endpoint.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// Free-text fields by name (title, description, content, ...)
    pub fields: BTreeMap<String, String>,
    pub link: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Submission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn link(mut self, link: Option<String>) -> Self {
        self.link = link.filter(|l| !l.trim().is_empty());
        self
    }

    pub fn attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Outcome of one pipeline run. Never persisted.
#[derive(Debug, Clone)]
pub struct ModerationVerdict {
    pub allowed: bool,
    pub rejection: Option<Rejection>,
    /// Names of fields rewritten by sanitization
    pub sanitized_fields: Vec<String>,
    /// The submission after sanitization; what the caller should store
    pub submission: Submission,
}

impl ModerationVerdict {
    pub fn reason_code(&self) -> Option<ReasonCode> {
        self.rejection.as_ref().map(|r| r.code)
    }
}

/// Synchronous stages, run in this order after sanitization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Text,
    Link,
    Files,
}

pub const STAGES: [Stage; 3] = [Stage::Text, Stage::Link, Stage::Files];

/// Sanitize, then text, link and file checks, then the external analyzer.
/// The first failing stage decides the verdict.
#[derive(Clone)]
pub struct ModerationPipeline {
    text: TextValidator,
    links: LinkValidator,
    files: FileValidator,
    analyzer: Arc<dyn ContentAnalyzer>,
    analyzer_timeout: Duration,
    failure_policy: AnalyzerFailurePolicy,
    max_field_length: usize,
    text_fields: Vec<String>,
}

impl ModerationPipeline {
    pub fn new(
        config: &ModerationConfig,
        analyzer: Arc<dyn ContentAnalyzer>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            text: TextValidator::new(config)?,
            links: LinkValidator::new(config)?,
            files: FileValidator::new(config)?,
            analyzer,
            analyzer_timeout: config.analyzer_timeout(),
            failure_policy: config.analyzer_failure_policy,
            max_field_length: config.max_field_length,
            text_fields: config.text_fields.clone(),
        })
    }

    /// Pipeline without an external analyzer.
    pub fn without_analyzer(config: &ModerationConfig) -> Result<Self, regex::Error> {
        Self::new(config, Arc::new(NoopAnalyzer))
    }

    pub fn failure_policy(&self) -> AnalyzerFailurePolicy {
        self.failure_policy
    }

    /// Run the whole pipeline over a submission.
    pub async fn moderate(&self, submission: Submission) -> Result<ModerationVerdict, ModerationError> {
        let (submission, sanitized_fields) = self.sanitize(submission);

        let mut outcome = STAGES
            .iter()
            .try_for_each(|stage| self.run_stage(*stage, &submission));
        if outcome.is_ok() {
            outcome = self.consult_analyzer(&submission).await?;
        }

        match &outcome {
            Ok(()) => debug!(fields = submission.fields.len(), "Submission passed moderation"),
            Err(rejection) => {
                info!(reason = rejection.code.as_str(), "Submission rejected by moderation");
                metrics::increment_counter!("moderation_rejections_total", "reason" => rejection.code.as_str());
            }
        }

        Ok(ModerationVerdict {
            allowed: outcome.is_ok(),
            rejection: outcome.err(),
            sanitized_fields,
            submission,
        })
    }

    /// Clean every free-text field, recording which ones changed.
    fn sanitize(&self, mut submission: Submission) -> (Submission, Vec<String>) {
        let mut changed = Vec::new();
        for (name, value) in submission.fields.iter_mut() {
            let cleaned = sanitize_field(value, self.max_field_length);
            if cleaned != *value {
                changed.push(name.clone());
                *value = cleaned;
            }
        }
        (submission, changed)
    }

    fn run_stage(&self, stage: Stage, submission: &Submission) -> Result<(), Rejection> {
        match stage {
            Stage::Text => self
                .text_fields_of(submission)
                .try_for_each(|text| self.text.check(text)),
            Stage::Link => match &submission.link {
                Some(link) => self.links.check(link),
                None => Ok(()),
            },
            Stage::Files => self.files.check_all(&submission.attachments),
        }
    }

    fn text_fields_of<'a>(&'a self, submission: &'a Submission) -> impl Iterator<Item = &'a str> + 'a {
        self.text_fields
            .iter()
            .filter_map(move |name| submission.get(name))
            .filter(|text| !text.is_empty())
    }

    /// One analyzer call per text field, then per file.
    async fn consult_analyzer(
        &self,
        submission: &Submission,
    ) -> Result<Result<(), Rejection>, ModerationError> {
        let inputs = self
            .text_fields_of(submission)
            .map(AnalysisInput::Text)
            .chain(submission.attachments.iter().map(AnalysisInput::Image));

        for input in inputs {
            if let Some(rejection) = self.analyze_one(input).await? {
                return Ok(Err(rejection));
            }
        }
        Ok(Ok(()))
    }

    async fn analyze_one(&self, input: AnalysisInput<'_>) -> Result<Option<Rejection>, ModerationError> {
        let result = match tokio::time::timeout(self.analyzer_timeout, self.analyzer.analyze(input)).await {
            Ok(result) => result,
            Err(_) => Err(AnalyzerError::Timeout),
        };

        match result {
            Ok(verdict) if verdict.flagged => {
                debug!(categories = ?verdict.categories, "Analyzer flagged content");
                Ok(Some(Rejection::new(
                    ReasonCode::FlaggedContent,
                    "Content violates the community guidelines",
                )))
            }
            Ok(_) => Ok(None),
            Err(e) => match self.failure_policy {
                AnalyzerFailurePolicy::FailOpen => {
                    warn!(error = %e, "Content analyzer failed, treating as not flagged");
                    metrics::increment_counter!("moderation_analyzer_failures_total", "policy" => "fail_open");
                    Ok(None)
                }
                AnalyzerFailurePolicy::FailClosed => {
                    error!(error = %e, "Content analyzer failed, rejecting submission");
                    metrics::increment_counter!("moderation_analyzer_failures_total", "policy" => "fail_closed");
                    Err(ModerationError::AnalyzerUnavailable(e))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::analyzer::AnalyzerVerdict;
    use crate::security::file_validator::AttachmentField;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Analyzer double that counts calls and returns a fixed outcome.
    struct ScriptedAnalyzer {
        calls: AtomicUsize,
        outcome: fn() -> Result<AnalyzerVerdict, AnalyzerError>,
        delay: Option<Duration>,
    }

    impl ScriptedAnalyzer {
        fn new(outcome: fn() -> Result<AnalyzerVerdict, AnalyzerError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome: || Ok(AnalyzerVerdict::clean()),
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl ContentAnalyzer for ScriptedAnalyzer {
        async fn analyze(&self, _input: AnalysisInput<'_>) -> Result<AnalyzerVerdict, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.outcome)()
        }
    }

    fn pipeline() -> ModerationPipeline {
        ModerationPipeline::without_analyzer(&ModerationConfig::default()).unwrap()
    }

    fn photo(name: &str, size: u64) -> Attachment {
        Attachment {
            field: AttachmentField::Images,
            filename: name.to_string(),
            content_type: "image/png".to_string(),
            size,
        }
    }

    #[tokio::test]
    async fn test_clean_submission_allowed() {
        let submission = Submission::new()
            .field("title", "Reading nook")
            .field("description", "A cozy corner with plants and a lamp")
            .link(Some("https://example.com/nook".to_string()))
            .attachments(vec![photo("nook.png", 1024)]);

        let verdict = pipeline().moderate(submission).await.unwrap();
        assert!(verdict.allowed);
        assert!(verdict.rejection.is_none());
        assert!(verdict.sanitized_fields.is_empty());
    }

    #[tokio::test]
    async fn test_sanitization_runs_first_and_is_reported() {
        let submission = Submission::new()
            .field("title", "<b>Bold</b> title")
            .field("description", "Nice <script>alert(1)</script>view");

        let verdict = pipeline().moderate(submission).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.sanitized_fields, vec!["description".to_string(), "title".to_string()]);
        assert_eq!(verdict.submission.get("description"), Some("Nice view"));
        assert_eq!(verdict.submission.get("title"), Some("bBold/b title"));
    }

    #[tokio::test]
    async fn test_text_fails_before_link_and_files() {
        let submission = Submission::new()
            .field("description", "x".repeat(501))
            .link(Some("https://bit.ly/abc".to_string()))
            .attachments(vec![photo("huge.png", 50 * 1024 * 1024)]);

        let verdict = pipeline().moderate(submission).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason_code(), Some(ReasonCode::TooLong));
    }

    #[tokio::test]
    async fn test_link_fails_before_files() {
        let submission = Submission::new()
            .field("description", "fine words")
            .link(Some("ftp://example.com".to_string()))
            .attachments(vec![photo("huge.png", 50 * 1024 * 1024)]);

        let verdict = pipeline().moderate(submission).await.unwrap();
        assert_eq!(verdict.reason_code(), Some(ReasonCode::InvalidUrl));
    }

    #[tokio::test]
    async fn test_only_configured_fields_are_text_checked() {
        // Titles are sanitized but not length-checked
        let submission = Submission::new().field("title", "t".repeat(600));
        let verdict = pipeline().moderate(submission).await.unwrap();
        assert!(verdict.allowed);

        let submission = Submission::new().field("content", "t".repeat(600));
        let verdict = pipeline().moderate(submission).await.unwrap();
        assert_eq!(verdict.reason_code(), Some(ReasonCode::TooLong));
    }

    #[tokio::test]
    async fn test_blank_link_is_ignored() {
        let submission = Submission::new().link(Some("   ".to_string()));
        assert!(submission.link.is_none());
        assert!(pipeline().moderate(submission).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_analyzer_called_once_per_field_and_file() {
        let analyzer = ScriptedAnalyzer::new(|| Ok(AnalyzerVerdict::clean()));
        let pipeline = ModerationPipeline::new(&ModerationConfig::default(), analyzer.clone()).unwrap();

        let submission = Submission::new()
            .field("title", "not analyzed")
            .field("description", "first")
            .field("content", "second")
            .attachments(vec![photo("a.png", 1), photo("b.png", 1)]);

        assert!(pipeline.moderate(submission).await.unwrap().allowed);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_analyzer_not_called_when_sync_stage_fails() {
        let analyzer = ScriptedAnalyzer::new(|| Ok(AnalyzerVerdict::clean()));
        let pipeline = ModerationPipeline::new(&ModerationConfig::default(), analyzer.clone()).unwrap();

        let submission = Submission::new().field("description", "y".repeat(501));
        assert!(!pipeline.moderate(submission).await.unwrap().allowed);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flagged_content_rejected() {
        let analyzer = ScriptedAnalyzer::new(|| {
            Ok(AnalyzerVerdict {
                flagged: true,
                categories: vec!["violence".to_string()],
            })
        });
        let pipeline = ModerationPipeline::new(&ModerationConfig::default(), analyzer).unwrap();

        let verdict = pipeline
            .moderate(Submission::new().field("description", "something"))
            .await
            .unwrap();
        assert_eq!(verdict.reason_code(), Some(ReasonCode::FlaggedContent));
        // Internal category names are not surfaced
        assert!(!verdict.rejection.unwrap().message.contains("violence"));
    }

    #[tokio::test]
    async fn test_analyzer_error_fails_open_by_default() {
        let analyzer = ScriptedAnalyzer::new(|| Err(AnalyzerError::Status(503)));
        let pipeline = ModerationPipeline::new(&ModerationConfig::default(), analyzer).unwrap();
        assert_eq!(pipeline.failure_policy(), AnalyzerFailurePolicy::FailOpen);

        let verdict = pipeline
            .moderate(Submission::new().field("description", "hello there"))
            .await
            .unwrap();
        assert!(verdict.allowed);
    }

    #[tokio::test]
    async fn test_analyzer_timeout_fails_open() {
        let analyzer = ScriptedAnalyzer::slow(Duration::from_secs(5));
        let config = ModerationConfig {
            analyzer_timeout_ms: 20,
            ..Default::default()
        };
        let pipeline = ModerationPipeline::new(&config, analyzer).unwrap();

        let verdict = pipeline
            .moderate(Submission::new().field("description", "hello there"))
            .await
            .unwrap();
        assert!(verdict.allowed);
    }

    #[tokio::test]
    async fn test_analyzer_error_fail_closed() {
        let analyzer = ScriptedAnalyzer::new(|| Err(AnalyzerError::Status(500)));
        let config = ModerationConfig {
            analyzer_failure_policy: AnalyzerFailurePolicy::FailClosed,
            ..Default::default()
        };
        let pipeline = ModerationPipeline::new(&config, analyzer).unwrap();

        let result = pipeline
            .moderate(Submission::new().field("description", "hello there"))
            .await;
        assert!(matches!(result, Err(ModerationError::AnalyzerUnavailable(_))));
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(STAGES, [Stage::Text, Stage::Link, Stage::Files]);
    }
}
