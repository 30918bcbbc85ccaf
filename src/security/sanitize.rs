use once_cell::sync::Lazy;
use regex::Regex;

// Whole script/style elements, including their bodies
static SCRIPT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<\s*(script|style)\b[^>]*>.*?<\s*/\s*(script|style)\s*>").unwrap()
});

static JS_PROTOCOL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)javascript\s*:").unwrap());

// Inline event handlers such as onclick= or onerror =
static EVENT_HANDLER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bon\w+\s*=").unwrap());

const STRIPPED_CHARS: &[char] = &['<', '>', '"', '\'', '`'];

/// One pass of every removal rule.
fn strip_once(input: &str) -> String {
    let without_blocks = SCRIPT_BLOCK.replace_all(input, "");
    let without_protocol = JS_PROTOCOL.replace_all(&without_blocks, "");
    let without_handlers = EVENT_HANDLER.replace_all(&without_protocol, "");
    without_handlers.replace(STRIPPED_CHARS, "")
}

/// Normalize a free-text field before any validation sees it.
///
/// Removes script/style blocks, angle brackets, quote characters,
/// `javascript:` prefixes and `on<word>=` handlers, then truncates to
/// `max_chars` characters and trims surrounding whitespace.
///
/// Removal repeats until nothing changes, so fragments that only become
/// dangerous once an inner match is cut out (`javajavascript:script:`) are
/// caught too, and sanitizing twice equals sanitizing once.
pub fn sanitize_field(input: &str, max_chars: usize) -> String {
    let mut current = input.to_string();
    loop {
        let next = strip_once(&current);
        if next == current {
            break;
        }
        current = next;
    }

    let truncated: String = match current.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => current[..byte_idx].to_string(),
        None => current,
    };
    truncated.trim().to_string()
}
