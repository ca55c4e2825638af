//! Lexical classification of a source by where it sits below its root.

use std::path::{Component, Path, PathBuf};

use crate::types::{Categories, DecayRule, DocType};

/// Directories holding exported conversations with coding assistants.
pub const DIALOGUE_DIRS: [&str; 4] = ["chat_history", ".claude", ".codex", ".gemini"];

/// Files recognized by name wherever they sit.
const NAMED_FILES: [(&str, DocType); 7] = [
    ("readme.md", DocType::Delivery),
    ("tasks.md", DocType::Progress),
    ("changelog.md", DocType::Progress),
    ("todo.md", DocType::Progress),
    ("notes.md", DocType::Progress),
    ("design.md", DocType::Architecture),
    ("architecture.md", DocType::Architecture),
];

pub fn is_dialogue_dir(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    DIALOGUE_DIRS.contains(&lower.as_str())
}

/// Everything the path alone says about a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathClass {
    pub categories: Categories,
    pub doc_type: Option<DocType>,
    /// Some directory on the path is a dialogue export
    pub dialogue: bool,
}

impl PathClass {
    pub fn decay_rule(&self) -> DecayRule {
        DecayRule::for_doc_type(self.doc_type)
    }
}

/// Classify a `/`-separated path relative to its root.
pub fn classify(relative: &str) -> PathClass {
    let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
    let dirs = parts.split_last().map(|(_, dirs)| dirs).unwrap_or_default();

    PathClass {
        categories: Categories::from_relative(relative),
        doc_type: infer_doc_type(&parts),
        dialogue: dirs.iter().any(|d| is_dialogue_dir(d)),
    }
}

/// Named files first, then `docs/<section>/` anywhere on the path.
fn infer_doc_type(parts: &[&str]) -> Option<DocType> {
    let file_name = parts.last()?.to_ascii_lowercase();
    if let Some((_, doc_type)) = NAMED_FILES.iter().find(|(name, _)| *name == file_name) {
        return Some(*doc_type);
    }

    let dirs = &parts[..parts.len() - 1];
    dirs.windows(2)
        .find(|pair| pair[0].eq_ignore_ascii_case("docs"))
        .and_then(|pair| pair[1].parse().ok())
}

/// `path` relative to the most specific root containing it, `/`-separated.
///
/// Falls back to the file name when no root contains the path.
pub fn relative_to(roots: &[PathBuf], path: &Path) -> String {
    let root = roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count());

    let rel = match root.and_then(|root| path.strip_prefix(root).ok()) {
        Some(rel) => rel,
        None => return path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
