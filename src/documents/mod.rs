//! Source document loading.
//!
//! This module provides:
//! - Content fingerprinting over raw bytes
//! - Lenient front-matter parsing (`---` YAML, `+++` TOML)
//! - Title derivation that never yields an empty title
//! - Path classification (categories, doc type, dialogue exports)

pub mod classify;
pub mod frontmatter;
mod loader;
pub mod title;

pub use classify::{PathClass, classify, relative_to};
pub use frontmatter::{FrontMatter, ParseError};
pub use loader::{ContentLoader, LoadError, SourceDocument, fingerprint};
pub use title::{TitleSource, derive_title};
