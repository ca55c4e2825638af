//! Optional metadata block at the head of a document.
//!
//! Two marker pairs are recognized: `---` (YAML) and `+++` (TOML). Parsing is
//! lenient at the call site: [`parse_lenient`] turns every [`ParseError`] into
//! "no metadata, whole file is body".

use serde::Deserialize;
use thiserror::Error;

use crate::types::{DocType, InsightType, KnowledgeType, Tags, normalize_tags};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("front-matter opened with '{marker}' is never closed")]
    Unterminated { marker: &'static str },

    #[error("invalid YAML front-matter: {0}")]
    Yaml(String),

    #[error("invalid TOML front-matter: {0}")]
    Toml(String),

    #[error("front-matter field '{field}': {reason}")]
    Field { field: &'static str, reason: String },
}

/// Metadata recognized in front-matter. Unknown keys are ignored.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrontMatter {
    pub title: Option<String>,
    pub knowledge_type: Option<KnowledgeType>,
    pub insight_type: Option<InsightType>,
    pub doc_type: Option<DocType>,
    pub tags: Tags,
}

#[derive(Debug, Deserialize, Default)]
struct RawFrontMatter {
    title: Option<String>,
    #[serde(alias = "type")]
    knowledge_type: Option<String>,
    insight_type: Option<String>,
    doc_type: Option<String>,
    tags: Option<RawTags>,
}

/// Tags may be a list or a comma-separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTags {
    List(Vec<String>),
    Csv(String),
}

#[derive(Clone, Copy)]
enum Marker {
    Yaml,
    Toml,
}

impl Marker {
    fn text(self) -> &'static str {
        match self {
            Marker::Yaml => "---",
            Marker::Toml => "+++",
        }
    }
}

/// Split `content` into front-matter and body.
///
/// Returns `Ok(None)` when the document does not start with a marker line.
pub fn split(content: &str) -> Result<Option<(FrontMatter, &str)>, ParseError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let (first_line, rest) = match content.split_once('\n') {
        Some((line, rest)) => (line, rest),
        None => (content, ""),
    };
    let marker = match first_line.trim_end() {
        "---" => Marker::Yaml,
        "+++" => Marker::Toml,
        _ => return Ok(None),
    };

    let mut offset = 0;
    let mut closing = None;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == marker.text() {
            closing = Some((offset, offset + line.len()));
            break;
        }
        offset += line.len();
    }
    let (header_end, body_start) = closing.ok_or(ParseError::Unterminated {
        marker: marker.text(),
    })?;

    let header = &rest[..header_end];
    let body = &rest[body_start..];

    let raw: RawFrontMatter = if header.trim().is_empty() {
        RawFrontMatter::default()
    } else {
        match marker {
            Marker::Yaml => {
                serde_yaml::from_str(header).map_err(|e| ParseError::Yaml(e.to_string()))?
            }
            Marker::Toml => toml::from_str(header).map_err(|e| ParseError::Toml(e.to_string()))?,
        }
    };

    Ok(Some((raw.into_front_matter()?, body)))
}

/// Split `content`, falling back to "no metadata" on any parse error.
pub fn parse_lenient(content: &str) -> (Option<FrontMatter>, &str) {
    match split(content) {
        Ok(Some((front_matter, body))) => (Some(front_matter), body),
        Ok(None) => (None, content),
        Err(e) => {
            tracing::debug!(target: "documents", "ignoring front-matter: {e}");
            (None, content)
        }
    }
}

impl RawFrontMatter {
    fn into_front_matter(self) -> Result<FrontMatter, ParseError> {
        let knowledge_type = parse_optional(self.knowledge_type, "knowledge_type")?;
        let insight_type = parse_optional(self.insight_type, "insight_type")?;
        let doc_type = parse_optional(self.doc_type, "doc_type")?;

        let tags = match self.tags {
            Some(RawTags::List(list)) => normalize_tags(list),
            Some(RawTags::Csv(csv)) => normalize_tags(csv.split(',')),
            None => Tags::new(),
        };

        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(FrontMatter {
            title,
            knowledge_type,
            insight_type,
            doc_type,
            tags,
        })
    }
}

fn parse_optional<T>(value: Option<String>, field: &'static str) -> Result<Option<T>, ParseError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|e: T::Err| ParseError::Field {
            field,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_front_matter() {
        let content = "---\nknowledge_type: insight\ninsight_type: lesson\ntags: [golang, migration]\n---\n# Moving to Go\n\nBody.\n";
        let (fm, body) = split(content).unwrap().unwrap();

        assert_eq!(fm.knowledge_type, Some(KnowledgeType::Insight));
        assert_eq!(fm.insight_type, Some(InsightType::Lesson));
        assert_eq!(fm.tags.iter().collect::<Vec<_>>(), vec!["golang", "migration"]);
        assert!(body.starts_with("# Moving to Go"));
    }

    #[test]
    fn test_toml_front_matter_with_csv_tags() {
        let content = "+++\ntitle = \"Cache design\"\ntype = \"doc\"\ntags = \"cache, redis\"\n+++\nText\n";
        let (fm, body) = split(content).unwrap().unwrap();

        assert_eq!(fm.title.as_deref(), Some("Cache design"));
        assert_eq!(fm.knowledge_type, Some(KnowledgeType::Doc));
        assert_eq!(fm.tags.len(), 2);
        assert_eq!(body, "Text\n");
    }

    #[test]
    fn test_doc_type_field() {
        let (fm, _) = split("---\ndoc_type: progress\n---\nbody\n").unwrap().unwrap();
        assert_eq!(fm.doc_type, Some(DocType::Progress));
        assert_eq!(fm.knowledge_type, None);
    }

    #[test]
    fn test_no_front_matter() {
        assert!(split("# Title\n\nbody").unwrap().is_none());
    }

    #[test]
    fn test_unterminated_is_error_and_lenient_fallback() {
        let content = "---\nknowledge_type: insight\n# Heading\n";
        assert!(matches!(split(content), Err(ParseError::Unterminated { .. })));

        let (fm, body) = parse_lenient(content);
        assert!(fm.is_none());
        assert_eq!(body, content);
    }

    #[test]
    fn test_malformed_yaml_falls_back() {
        let content = "---\ntags: [unclosed\n---\nbody\n";
        let (fm, body) = parse_lenient(content);
        assert!(fm.is_none());
        assert_eq!(body, content);
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let content = "---\nknowledge_type: recipe\n---\nbody\n";
        assert!(matches!(split(content), Err(ParseError::Field { .. })));
    }

    #[test]
    fn test_empty_header() {
        let (fm, body) = split("---\n---\nbody").unwrap().unwrap();
        assert_eq!(fm, FrontMatter::default());
        assert_eq!(body, "body");
    }
}
