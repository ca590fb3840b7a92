//! Duplicate detection: classify manifest entries against existing
//! destination content before handing work to a `DestinationQueue` (spec §4.4).

use crate::error::FileOpError;
use crate::hash;
use crate::scanner::manifest::{Manifest, ManifestEntry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Destination has `dest_root/<org>/relative_path` with matching size and digest.
    ExactDuplicate,
    /// Destination has some other file with the same digest.
    RenamedDuplicate,
    Unique,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub total_source_files: usize,
    pub exact_duplicates: Vec<String>,
    pub renamed_duplicates: Vec<String>,
    pub unique_files: usize,
    pub potential_space_saved_bytes: u64,
    pub destination_drive_identifier: Option<String>,
}

/// Indexes a destination root's existing content by digest so manifest
/// entries can be classified in O(1) per lookup.
pub struct DuplicateDetector {
    /// digest -> one or more existing destination paths carrying it
    by_digest: HashMap<String, Vec<PathBuf>>,
    /// relative_path -> (size, digest) for exact-match lookups
    by_relative_path: HashMap<String, (u64, String)>,
}

impl DuplicateDetector {
    /// Walk `dest_root` up to `scan_depth` and index existing content by
    /// digest and by relative path. Ignores the engine's own bookkeeping
    /// directories (`.imageintact_*`).
    pub async fn build(
        dest_root: &Path,
        organization_name: &str,
        scan_depth: usize,
        cancel: &CancellationToken,
    ) -> Result<Self, FileOpError> {
        let org_root = if organization_name.is_empty() {
            dest_root.to_path_buf()
        } else {
            dest_root.join(organization_name)
        };

        if !org_root.exists() {
            return Ok(Self {
                by_digest: HashMap::new(),
                by_relative_path: HashMap::new(),
            });
        }

        let org_root_owned = org_root.clone();
        let cancel = cancel.clone();
        let by_relative_path = tokio::task::spawn_blocking(move || {
            let mut index = HashMap::new();
            let walker = WalkDir::new(&org_root_owned)
                .max_depth(scan_depth)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| {
                    !e.file_name()
                        .to_str()
                        .map(|s| s.starts_with(".imageintact_"))
                        .unwrap_or(false)
                });

            for entry in walker.flatten() {
                if cancel.is_cancelled() {
                    break;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                let Ok(rel) = entry.path().strip_prefix(&org_root_owned) else {
                    continue;
                };
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                let Ok(digest) = hash::digest_blocking(entry.path()) else {
                    continue;
                };
                index.insert(rel_str, (metadata.len(), digest));
            }
            index
        })
        .await
        .map_err(|e| FileOpError::Internal(format!("duplicate index task panicked: {e}")))?;

        let mut by_digest: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for (rel, (_, digest)) in &by_relative_path {
            by_digest.entry(digest.clone()).or_default().push(org_root.join(rel));
        }

        Ok(Self {
            by_digest,
            by_relative_path,
        })
    }

    pub fn classify(&self, entry: &ManifestEntry) -> Classification {
        if let Some((size, digest)) = self.by_relative_path.get(&entry.relative_path) {
            if *size == entry.size_bytes && *digest == entry.source_digest {
                return Classification::ExactDuplicate;
            }
        }
        if self.by_digest.contains_key(&entry.source_digest) {
            return Classification::RenamedDuplicate;
        }
        Classification::Unique
    }

    /// Classify every entry in `manifest`, filter per `skip_exact` /
    /// `skip_renamed`, and return the filtered manifest plus an analysis
    /// record for reporting.
    pub fn analyze_and_filter(
        &self,
        manifest: &Manifest,
        skip_exact: bool,
        skip_renamed: bool,
        destination_drive_identifier: Option<String>,
    ) -> (Vec<ManifestEntry>, Analysis) {
        let mut kept = Vec::new();
        let mut exact = Vec::new();
        let mut renamed = Vec::new();
        let mut unique = 0usize;
        let mut space_saved = 0u64;

        for entry in manifest.iter() {
            match self.classify(entry) {
                Classification::ExactDuplicate => {
                    exact.push(entry.relative_path.clone());
                    space_saved += entry.size_bytes;
                    if !skip_exact {
                        kept.push(entry.clone());
                    }
                }
                Classification::RenamedDuplicate => {
                    renamed.push(entry.relative_path.clone());
                    space_saved += entry.size_bytes;
                    if !skip_renamed {
                        kept.push(entry.clone());
                    }
                }
                Classification::Unique => {
                    unique += 1;
                    kept.push(entry.clone());
                }
            }
        }

        debug!(
            "duplicate analysis: {} exact, {} renamed, {} unique",
            exact.len(),
            renamed.len(),
            unique
        );

        (
            kept,
            Analysis {
                total_source_files: manifest.len(),
                exact_duplicates: exact,
                renamed_duplicates: renamed,
                unique_files: unique,
                potential_space_saved_bytes: space_saved,
                destination_drive_identifier,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn entry(path: &str, digest: &str, size: u64) -> ManifestEntry {
        ManifestEntry {
            relative_path: path.to_string(),
            source_absolute_path: PathBuf::from(format!("/src/{path}")),
            source_digest: digest.to_string(),
            size_bytes: size,
            image_width: None,
            image_height: None,
        }
    }

    #[tokio::test]
    async fn classifies_exact_duplicate() {
        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("a.jpg"), b"aaaaaaaaaa").unwrap();

        let cancel = CancellationToken::new();
        let detector = DuplicateDetector::build(dest.path(), "", 50, &cancel)
            .await
            .unwrap();

        let digest = hash::digest_blocking(&dest.path().join("a.jpg")).unwrap();
        let m = entry("a.jpg", &digest, 10);
        assert_eq!(detector.classify(&m), Classification::ExactDuplicate);
    }

    #[tokio::test]
    async fn classifies_renamed_duplicate() {
        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("original_name.jpg"), b"shared content").unwrap();

        let cancel = CancellationToken::new();
        let detector = DuplicateDetector::build(dest.path(), "", 50, &cancel)
            .await
            .unwrap();

        let digest = hash::digest_blocking(&dest.path().join("original_name.jpg")).unwrap();
        let m = entry("renamed.jpg", &digest, 14);
        assert_eq!(detector.classify(&m), Classification::RenamedDuplicate);
    }

    #[tokio::test]
    async fn classifies_unique_when_absent() {
        let dest = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let detector = DuplicateDetector::build(dest.path(), "", 50, &cancel)
            .await
            .unwrap();

        let m = entry("new.jpg", "abc123", 5);
        assert_eq!(detector.classify(&m), Classification::Unique);
    }

    #[tokio::test]
    async fn ignores_bookkeeping_directories() {
        let dest = TempDir::new().unwrap();
        fs::create_dir_all(dest.path().join(".imageintact_quarantine")).unwrap();
        fs::write(
            dest.path().join(".imageintact_quarantine/old.jpg"),
            b"quarantined",
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let detector = DuplicateDetector::build(dest.path(), "", 50, &cancel)
            .await
            .unwrap();

        assert!(detector.by_relative_path.is_empty());
    }

    #[tokio::test]
    async fn analyze_and_filter_respects_skip_flags() {
        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("a.jpg"), b"aaaaaaaaaa").unwrap();
        let digest_a = hash::digest_blocking(&dest.path().join("a.jpg")).unwrap();

        let manifest = Manifest::from_sorted_entries(vec![
            entry("a.jpg", &digest_a, 10),
            entry("b.jpg", "unique-digest", 5),
        ]);

        let cancel = CancellationToken::new();
        let detector = DuplicateDetector::build(dest.path(), "", 50, &cancel)
            .await
            .unwrap();

        let (kept, analysis) = detector.analyze_and_filter(&manifest, true, true, None);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].relative_path, "b.jpg");
        assert_eq!(analysis.exact_duplicates.len(), 1);
        assert_eq!(analysis.unique_files, 1);
        assert_eq!(analysis.potential_space_saved_bytes, 10);
    }
}
