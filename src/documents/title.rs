//! Title derivation.

/// Longest title taken from a body prefix, in characters.
pub const TITLE_PREFIX_CHARS: usize = 80;

/// Where a title came from. Only derived titles may be replaced by a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleSource {
    Explicit,
    Heading,
    BodyPrefix,
    FileName,
    /// Chosen by a model role
    Generated,
}

impl TitleSource {
    pub fn is_explicit(&self) -> bool {
        matches!(self, TitleSource::Explicit)
    }
}

/// Text of the first top-level (`# `) heading outside fenced code.
pub fn first_heading(body: &str) -> Option<String> {
    let mut in_fence = false;
    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(text) = trimmed.strip_prefix("# ") {
            let text = text.trim().trim_end_matches('#').trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

/// First non-blank line with markup stripped, bounded to `TITLE_PREFIX_CHARS`.
pub fn body_prefix(body: &str) -> Option<String> {
    let line = body
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())?;
    Some(truncate_chars(line, TITLE_PREFIX_CHARS))
}

/// Resolve a never-empty title.
///
/// Explicit metadata wins, then the first heading, then a body prefix, then the
/// file stem.
pub fn derive_title(explicit: Option<&str>, body: &str, file_stem: &str) -> (String, TitleSource) {
    if let Some(title) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return (title.to_string(), TitleSource::Explicit);
    }
    if let Some(heading) = first_heading(body) {
        return (heading, TitleSource::Heading);
    }
    if let Some(prefix) = body_prefix(body) {
        return (prefix, TitleSource::BodyPrefix);
    }
    let stem = file_stem.trim();
    let stem = if stem.is_empty() { "untitled" } else { stem };
    (stem.to_string(), TitleSource::FileName)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_title_wins() {
        let (title, source) = derive_title(Some(" Given "), "# Heading", "file");
        assert_eq!(title, "Given");
        assert_eq!(source, TitleSource::Explicit);
    }

    #[test]
    fn test_first_top_level_heading() {
        let body = "intro\n## Sub\n```\n# not a heading\n```\n# Real Title #\n";
        assert_eq!(first_heading(body).as_deref(), Some("Real Title"));
    }

    #[test]
    fn test_body_prefix_is_bounded() {
        let long = "word ".repeat(40);
        let (title, source) = derive_title(None, &long, "file");
        assert_eq!(source, TitleSource::BodyPrefix);
        assert!(title.chars().count() <= TITLE_PREFIX_CHARS);
        assert!(!title.is_empty());
    }

    #[test]
    fn test_multibyte_truncation() {
        let text = "日本語".repeat(50);
        let out = truncate_chars(&text, 10);
        assert_eq!(out.chars().count(), 10);
    }

    #[test]
    fn test_file_stem_fallback() {
        let (title, source) = derive_title(None, "   \n\n", "notes");
        assert_eq!(title, "notes");
        assert_eq!(source, TitleSource::FileName);

        let (title, _) = derive_title(None, "", "");
        assert_eq!(title, "untitled");
    }
}
