use crate::config::ModerationConfig;
use crate::security::moderation::{ReasonCode, Rejection};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];

/// Filenames matching any of these are rejected even with an image extension.
pub const DEFAULT_SUSPICIOUS_FILENAME_PATTERNS: &[&str] = &[
    // executable or script extension anywhere in the name (shell.php.jpg)
    r"\.(?:exe|bat|cmd|com|scr|msi|sh|bash|ps1|vbs|js|mjs|jsp|php\d?|phtml|asp|aspx|cgi|pl|py|rb|jar|dll|hta|svg|html?)(?:\.|$)",
    // path traversal and separators
    r"\.\.|[/\\]",
    // control characters, including NUL
    r"[\x00-\x1f]",
];

/// Which upload slot an attachment was sent in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentField {
    /// Regular content images
    Images,
    /// The single custom pin image
    CustomPin,
}

/// Metadata of one uploaded file. The bytes themselves are relayed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub field: AttachmentField,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// File stage of the moderation pipeline.
#[derive(Clone)]
pub struct FileValidator {
    max_size_bytes: u64,
    max_content_images: usize,
    max_pin_images: usize,
    allowed_extensions: Vec<String>,
    suspicious_patterns: Vec<Regex>,
}

impl FileValidator {
    pub fn new(config: &ModerationConfig) -> Result<Self, regex::Error> {
        let suspicious_patterns = config
            .suspicious_filename_patterns
            .iter()
            .map(|pattern| RegexBuilder::new(pattern).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;

        let allowed_extensions = config
            .allowed_extensions
            .iter()
            .map(|ext| {
                let ext = ext.trim().to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect();

        Ok(Self {
            max_size_bytes: config.max_file_size_bytes,
            max_content_images: config.max_content_images,
            max_pin_images: config.max_pin_images,
            allowed_extensions,
            suspicious_patterns,
        })
    }

    /// Validate the whole attachment set: slot counts, then each file in order.
    pub fn check_all(&self, attachments: &[Attachment]) -> Result<(), Rejection> {
        let images = attachments
            .iter()
            .filter(|a| a.field == AttachmentField::Images)
            .count();
        let pins = attachments.len() - images;

        if images > self.max_content_images {
            return Err(Rejection::new(
                ReasonCode::TooManyFiles,
                format!("At most {} images can be attached", self.max_content_images),
            ));
        }
        if pins > self.max_pin_images {
            return Err(Rejection::new(
                ReasonCode::TooManyFiles,
                format!("At most {} custom pin image can be attached", self.max_pin_images),
            ));
        }

        attachments.iter().try_for_each(|a| self.check(a))
    }

    /// Validate a single file's metadata.
    pub fn check(&self, attachment: &Attachment) -> Result<(), Rejection> {
        if attachment.size > self.max_size_bytes {
            return Err(Rejection::new(
                ReasonCode::FileTooLarge,
                format!(
                    "File {} exceeds the {} MB limit",
                    attachment.filename,
                    self.max_size_bytes / (1024 * 1024)
                ),
            ));
        }

        let content_type = attachment.content_type.trim().to_lowercase();
        if !content_type.starts_with("image/") {
            return Err(Rejection::new(
                ReasonCode::InvalidFileType,
                "Only image uploads are allowed",
            ));
        }

        let extension = extension_of(&attachment.filename);
        let allowed = extension
            .as_deref()
            .map(|ext| self.allowed_extensions.iter().any(|a| a == ext))
            .unwrap_or(false);
        if !allowed {
            return Err(Rejection::new(
                ReasonCode::InvalidExtension,
                format!(
                    "Allowed file types: {}",
                    self.allowed_extensions.join(" ")
                ),
            ));
        }

        if self
            .suspicious_patterns
            .iter()
            .any(|re| re.is_match(&attachment.filename))
        {
            return Err(Rejection::new(
                ReasonCode::SuspiciousFilename,
                "File name is not allowed",
            ));
        }

        Ok(())
    }
}

/// Lowercased extension including the dot, if the name has one.
fn extension_of(filename: &str) -> Option<String> {
    let idx = filename.rfind('.')?;
    let ext = &filename[idx..];
    if ext.len() < 2 {
        return None;
    }
    Some(ext.to_lowercase())
}
