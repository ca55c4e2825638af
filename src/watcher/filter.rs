//! Path allow-listing for watched roots.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::config::WatcherConfig;
use crate::documents::classify::is_dialogue_dir;

/// Decides which paths under the configured roots are knowledge sources.
///
/// A file qualifies when it sits under a root, its first directory below the
/// root is in `watch_dirs` (or it is a listed root file), no component is
/// hidden or ignored, and its suffix is allowed. Dialogue export directories
/// (`.claude`, `chat_history`, ...) are accepted at the top level even when not
/// listed, and are never treated as hidden.
#[derive(Debug, Clone)]
pub struct PathFilter {
    roots: Vec<PathBuf>,
    watch_dirs: HashSet<String>,
    root_files: HashSet<String>,
    /// Lowercased, without the leading dot
    extensions: Vec<String>,
    ignore_dirs: HashSet<String>,
}

impl PathFilter {
    pub fn new(
        roots: Vec<PathBuf>,
        watch_dirs: &[String],
        root_files: &[String],
        extensions: &[String],
        ignore_dirs: &[String],
    ) -> Self {
        let extensions = extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        Self {
            roots,
            watch_dirs: watch_dirs.iter().map(|d| d.trim().to_string()).collect(),
            root_files: root_files.iter().map(|f| f.trim().to_string()).collect(),
            extensions,
            ignore_dirs: ignore_dirs.iter().map(|d| d.trim().to_string()).collect(),
        }
    }

    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(
            config.roots.clone(),
            &config.watch_dirs,
            &config.watch_root_files,
            &config.extensions,
            &config.ignore_dirs,
        )
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// The most specific root containing `path`.
    pub fn root_for(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(PathBuf::as_path)
    }

    /// Whether `path` names a file that should be ingested.
    ///
    /// Purely lexical: the file need not exist, so deletions can be filtered too.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(root) = self.root_for(path) else {
            return false;
        };
        let Some(parts) = relative_parts(root, path) else {
            return false;
        };
        let Some((file_name, dirs)) = parts.split_last() else {
            return false;
        };

        if dirs.iter().any(|d| self.is_skipped_dir(d)) || file_name.starts_with('.') {
            return false;
        }

        match dirs.first() {
            None => {
                self.root_files.contains(*file_name)
                    || (self.watch_dirs.is_empty() && self.extension_allowed(file_name))
            }
            Some(top) => self.top_dir_watched(top) && self.extension_allowed(file_name),
        }
    }

    /// Whether a directory walk should descend into `dir`.
    pub fn should_descend(&self, dir: &Path) -> bool {
        let Some(root) = self.root_for(dir) else {
            return false;
        };
        let Some(parts) = relative_parts(root, dir) else {
            return false;
        };

        if parts.iter().any(|d| self.is_skipped_dir(d)) {
            return false;
        }
        match parts.first() {
            None => true,
            Some(top) => self.top_dir_watched(top),
        }
    }

    pub fn extension_allowed(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.extensions.iter().any(|ext| {
            lower
                .strip_suffix(ext.as_str())
                .is_some_and(|stem| stem.len() > 1 && stem.ends_with('.'))
        })
    }

    fn top_dir_watched(&self, top: &str) -> bool {
        self.watch_dirs.is_empty() || self.watch_dirs.contains(top) || is_dialogue_dir(top)
    }

    fn is_skipped_dir(&self, name: &str) -> bool {
        self.ignore_dirs.contains(name) || (name.starts_with('.') && !is_dialogue_dir(name))
    }
}

fn relative_parts<'a>(root: &Path, path: &'a Path) -> Option<Vec<&'a str>> {
    let rel = path.strip_prefix(root).ok()?;
    rel.components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect()
}
