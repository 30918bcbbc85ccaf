use crate::config::ModerationConfig;
use crate::security::moderation::{ReasonCode, Rejection};
use regex::{Regex, RegexBuilder};

/// Terms rejected on a whole-word, case-insensitive match.
///
/// English plus common Hinglish slurs. Deployments replace this list through
/// `MODERATION_LISTS_PATH`.
pub const DEFAULT_BLOCKED_TERMS: &[&str] = &[
    // English
    "fuck", "fucking", "fucker", "motherfucker", "shit", "bullshit", "bitch", "bastard",
    "asshole", "dick", "cock", "pussy", "whore", "slut", "cunt", "wanker", "twat",
    "retard", "faggot", "nigger", "nigga", "spic", "kike", "chink", "tranny",
    // Shorthand and censored spellings
    "fk", "fck", "fcuk", "fuk", "sh1t", "shyt", "biatch", "btch", "azz", "wh0re", "c0ck",
    "mofo", "stfu",
    // Hinglish
    "chutiya", "chutiye", "chutya", "gaandu", "gandu", "harami", "haramkhor",
    "madarchod", "behenchod", "bhenchod", "bhosdike", "randi", "lodu", "loda",
    // Spanish / French / German
    "puta", "pendejo", "cabron", "connard", "salope", "putain", "arschloch", "fotze",
];

/// Sexual-content categories, one case-insensitive pattern each.
pub const DEFAULT_SEXUAL_PATTERNS: &[&str] = &[
    // explicit media
    r"\bporn\w*|\bxxx\b|\bnsfw\b|\bhentai\b",
    // nudity
    r"\bnudes?\b|\bnaked\s+(pics?|photos?|videos?)\b|\btopless\b",
    // solicitation
    r"\bescort\s+services?\b|\bsugar\s+daddy\b|\bhook\s*ups?\s+tonight\b|\bonlyfans\b",
    // sexual acts
    r"\bsexting\b|\bblow\s*jobs?\b|\bhand\s*jobs?\b|\borgy\b|\bsex\s*cams?\b|\bcam\s*girls?\b",
];

// Leet speak substitutions undone before the second blocklist pass
static LEET_SPEAK_MAP: &[(char, char)] = &[
    ('@', 'a'),
    ('4', 'a'),
    ('1', 'i'),
    ('!', 'i'),
    ('3', 'e'),
    ('0', 'o'),
    ('5', 's'),
    ('$', 's'),
    ('7', 't'),
    ('+', 't'),
    ('8', 'b'),
    ('9', 'g'),
];

/// Text stage of the moderation pipeline.
///
/// Checks run in a fixed order and the first failure is returned:
/// blocked terms, sexual-content patterns, length, shouting.
#[derive(Clone)]
pub struct TextValidator {
    blocked_terms: Option<Regex>,
    sexual_patterns: Vec<Regex>,
    normalize_leet: bool,
    max_chars: usize,
    caps_ratio: f64,
    caps_min_length: usize,
}

impl TextValidator {
    pub fn new(config: &ModerationConfig) -> Result<Self, regex::Error> {
        let blocked_terms = build_term_regex(&config.blocked_terms)?;

        let sexual_patterns = config
            .sexual_patterns
            .iter()
            .map(|pattern| RegexBuilder::new(pattern).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            blocked_terms,
            sexual_patterns,
            normalize_leet: config.normalize_leet,
            max_chars: config.max_text_length,
            caps_ratio: config.caps_ratio,
            caps_min_length: config.caps_min_length,
        })
    }

    /// Run every text check against one field.
    pub fn check(&self, text: &str) -> Result<(), Rejection> {
        self.check_blocked_terms(text)?;
        self.check_sexual_content(text)?;
        self.check_length(text)?;
        self.check_caps(text)?;
        Ok(())
    }

    fn check_blocked_terms(&self, text: &str) -> Result<(), Rejection> {
        let Some(terms) = &self.blocked_terms else {
            return Ok(());
        };

        let hit = terms.is_match(text)
            || (self.normalize_leet && terms.is_match(&normalize_leet_speak(text)));
        if hit {
            return Err(Rejection::new(
                ReasonCode::Profanity,
                "Content contains inappropriate language",
            ));
        }
        Ok(())
    }

    fn check_sexual_content(&self, text: &str) -> Result<(), Rejection> {
        if self.sexual_patterns.iter().any(|re| re.is_match(text)) {
            return Err(Rejection::new(
                ReasonCode::SexualContent,
                "Content contains sexual or explicit material",
            ));
        }
        Ok(())
    }

    fn check_length(&self, text: &str) -> Result<(), Rejection> {
        if text.chars().count() > self.max_chars {
            return Err(Rejection::new(
                ReasonCode::TooLong,
                format!("Text must be {} characters or fewer", self.max_chars),
            ));
        }
        Ok(())
    }

    /// Uppercase letters over total length, only for text longer than
    /// `caps_min_length` so that short replies like "OK" pass.
    fn check_caps(&self, text: &str) -> Result<(), Rejection> {
        let length = text.chars().count();
        if length <= self.caps_min_length {
            return Ok(());
        }

        let caps = text.chars().filter(|c| c.is_uppercase()).count();
        let ratio = caps as f64 / length as f64;
        if ratio > self.caps_ratio {
            return Err(Rejection::new(
                ReasonCode::ExcessiveCaps,
                "Please avoid excessive use of capital letters",
            ));
        }
        Ok(())
    }
}

/// One alternation over all terms, anchored on non-alphanumeric boundaries
/// so that terms with punctuation (e.g. hyphens) still match as whole words.
fn build_term_regex(terms: &[String]) -> Result<Option<Regex>, regex::Error> {
    let escaped: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(regex::escape)
        .collect();

    if escaped.is_empty() {
        return Ok(None);
    }

    let pattern = format!(
        r"(?:^|[^\p{{L}}\p{{N}}_])(?:{})(?:$|[^\p{{L}}\p{{N}}_])",
        escaped.join("|")
    );
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .size_limit(1 << 24)
        .build()
        .map(Some)
}

/// Undo common character substitutions and drop censoring asterisks.
fn normalize_leet_speak(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '*')
        .map(|c| {
            LEET_SPEAK_MAP
                .iter()
                .find(|(leet, _)| *leet == c)
                .map(|(_, plain)| *plain)
                .unwrap_or(c)
        })
        .collect()
}
