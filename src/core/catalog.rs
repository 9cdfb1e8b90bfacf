//! Named ISO images with their published checksums.
//!
//! Downloading is left to the caller; the catalog only supplies the URL to
//! fetch and the SHA-256 to expect once the file is on disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// First entry whose name appears in the image's file name.
    ///
    /// Matching is case-insensitive and treats spaces in the entry name as
    /// interchangeable with `-`, `_` and `.`, since ISO file names rarely
    /// contain spaces.
    pub fn lookup(&self, image: &Path) -> Option<&CatalogEntry> {
        let file_name = normalize(&image.file_name()?.to_string_lossy());
        self.entries
            .iter()
            .find(|e| !e.name.trim().is_empty() && file_name.contains(&normalize(&e.name)))
    }

    /// Expected digest for `image`, if the catalog knows one.
    pub fn expected_digest(&self, image: &Path) -> Option<(&str, &str)> {
        let entry = self.lookup(image)?;
        let sha = entry.sha256.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((entry.name.as_str(), sha))
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '_' | '.' => '-',
            other => other,
        })
        .collect()
}
