pub mod analyzer;
pub mod content_filter;
pub mod file_validator;
pub mod link_validator;
pub mod middleware;
pub mod moderation;
pub mod rate_limiter;
pub mod sanitize;

pub use analyzer::{ContentAnalyzer, NoopAnalyzer, OpenAiModerationAnalyzer};
pub use file_validator::{Attachment, AttachmentField};
pub use moderation::{ModerationPipeline, ModerationVerdict, ReasonCode, Rejection, Submission};
pub use rate_limiter::{RateLimitPolicy, RateLimitResult, RateLimiter};
