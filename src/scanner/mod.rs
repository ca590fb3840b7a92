//! Source-tree traversal and manifest construction (spec §4.3).

pub mod manifest;

use crate::error::FileOpError;
use crate::hash;
use manifest::{Manifest, ManifestEntry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// File-type classification used by the inclusion filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Raw,
    StandardImage,
    Video,
    Sidecar,
    Catalog,
    Other,
}

const RAW_EXTS: &[&str] = &[
    "cr2", "cr3", "nef", "arw", "raf", "orf", "rw2", "dng", "pef", "srw", "raw", "3fr", "erf",
    "kdc", "mrw", "x3f", "nrw",
];
const STANDARD_IMAGE_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "tif", "tiff", "bmp", "gif", "webp",
];
const VIDEO_EXTS: &[&str] = &["mov", "mp4", "m4v", "avi", "mts", "m2ts", "braw", "mxf"];
const SIDECAR_EXTS: &[&str] = &["xmp", "aae", "thm"];
const CATALOG_EXTS: &[&str] = &["lrcat", "catalog", "nksc"];

/// Photo-library "package" directory extensions: treated as directories
/// that the walker descends into, unlike opaque OS bundles.
const PACKAGE_EXTS: &[&str] = &["photoslibrary", "lrdata", "cosessiondb"];

/// Opaque OS bundle extensions: not descended into.
const BUNDLE_EXTS: &[&str] = &[
    "app", "bundle", "framework", "plugin", "prefpane", "qlgenerator", "saver", "kext",
];

/// Cache-looking subpath markers excluded inside photo packages.
const CACHE_MARKERS: &[&str] = &["/Cache/", "/Proxies/", "/Thumbnails/"];

pub fn classify_extension(path: &Path) -> MediaKind {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return MediaKind::Other;
    };
    let ext = ext.to_ascii_lowercase();
    if RAW_EXTS.contains(&ext.as_str()) {
        MediaKind::Raw
    } else if STANDARD_IMAGE_EXTS.contains(&ext.as_str()) {
        MediaKind::StandardImage
    } else if VIDEO_EXTS.contains(&ext.as_str()) {
        MediaKind::Video
    } else if SIDECAR_EXTS.contains(&ext.as_str()) {
        MediaKind::Sidecar
    } else if CATALOG_EXTS.contains(&ext.as_str()) {
        MediaKind::Catalog
    } else {
        MediaKind::Other
    }
}

fn is_package_dir(entry: &DirEntry) -> bool {
    entry
        .path()
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| PACKAGE_EXTS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_bundle_dir(entry: &DirEntry) -> bool {
    entry
        .path()
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| BUNDLE_EXTS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn looks_like_cache_path(path: &Path, root: &Path) -> bool {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel_str = format!("/{}/", rel.to_string_lossy().replace('\\', "/"));
    CACHE_MARKERS.iter().any(|m| rel_str.contains(m))
        || rel
            .to_string_lossy()
            .to_ascii_lowercase()
            .contains("previews.lrdata")
}

/// Options controlling traversal and filtering (spec §4.3, §6).
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub include_subdirectories: bool,
    pub exclude_cache_files: bool,
    pub file_type_filter: crate::config::FileTypeFilter,
    pub max_depth: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_subdirectories: true,
            exclude_cache_files: false,
            file_type_filter: crate::config::FileTypeFilter::All,
            max_depth: 50,
        }
    }
}

/// An entry that was skipped or could not be read during the walk,
/// recorded as a `warning` event (never a failed file, per spec §4.3).
#[derive(Debug, Clone)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// The fully-populated, ordered manifest plus any non-fatal warnings
/// accumulated along the way.
pub struct ScanResult {
    pub manifest: Manifest,
    pub warnings: Vec<ScanWarning>,
}

fn passes_type_filter(kind: MediaKind, filter: crate::config::FileTypeFilter) -> bool {
    use crate::config::FileTypeFilter as F;
    match filter {
        F::All => true,
        F::Raw => kind == MediaKind::Raw,
        F::Standard => kind == MediaKind::StandardImage,
        F::Video => kind == MediaKind::Video,
        F::Sidecar => kind == MediaKind::Sidecar,
        F::Catalog => kind == MediaKind::Catalog,
    }
}

/// Walk `source_root` and collect candidate file paths, applying the
/// directory-level exclusion rules (hidden entries, opaque bundles, depth
/// cap, cache subpaths, subdirectory toggle). Returns absolute paths of
/// files that passed every structural and extension filter.
fn walk_candidates(
    source_root: &Path,
    options: &ScanOptions,
    cancel: &CancellationToken,
    warnings: &mut Vec<ScanWarning>,
) -> Result<Vec<PathBuf>, FileOpError> {
    let mut candidates = Vec::new();

    let effective_depth = if options.include_subdirectories {
        options.max_depth
    } else {
        1
    };

    let walker = WalkDir::new(source_root)
        .max_depth(effective_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true; // root itself
            }
            if entry.file_type().is_dir() {
                if is_bundle_dir(entry) {
                    return false; // opaque bundle: do not descend
                }
                if is_hidden(entry) && !is_package_dir(entry) {
                    return false; // hidden dir, not a photo package: skip
                }
                return true;
            }
            // files: hidden files are excluded at the file-visiting stage below
            true
        });

    for entry in walker {
        if cancel.is_cancelled() {
            return Err(FileOpError::Cancelled);
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warnings.push(ScanWarning {
                    path: e.path().map(|p| p.to_path_buf()).unwrap_or_default(),
                    reason: format!("unreadable directory entry: {e}"),
                });
                continue;
            }
        };

        if entry.depth() == 0 {
            continue; // the root directory itself is never a manifest entry
        }

        if entry.file_type().is_dir() {
            continue;
        }

        if is_hidden(&entry) {
            continue;
        }

        let path = entry.path().to_path_buf();

        if entry.depth() as usize == effective_depth && options.include_subdirectories {
            warnings.push(ScanWarning {
                path: path.clone(),
                reason: "max traversal depth reached".to_string(),
            });
        }

        if options.exclude_cache_files && looks_like_cache_path(&path, source_root) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warnings.push(ScanWarning {
                    path: path.clone(),
                    reason: format!("unreadable metadata: {e}"),
                });
                continue;
            }
        };

        if metadata.file_type().is_symlink() {
            warnings.push(ScanWarning {
                path: path.clone(),
                reason: "symlink".to_string(),
            });
            continue;
        }

        let kind = classify_extension(&path);
        if !passes_type_filter(kind, options.file_type_filter) {
            continue;
        }

        candidates.push(path);
    }

    Ok(candidates)
}

/// Walk `source_root` and build the complete, ordered manifest, digesting
/// every candidate file. Digest computation is parallelized across a
/// bounded pool of blocking tasks, but the function does not return until
/// every entry is populated (spec §4.3: "MUST present a fully-populated,
/// ordered manifest ... before distribution begins").
pub async fn build_manifest(
    source_root: &Path,
    options: ScanOptions,
    cancel: &CancellationToken,
) -> Result<ScanResult, FileOpError> {
    let mut warnings = Vec::new();
    let root = source_root.to_path_buf();
    let opts = options.clone();
    let cancel_for_walk = cancel.clone();

    let (candidates, mut warnings_from_walk) = tokio::task::spawn_blocking(move || {
        let mut warnings = Vec::new();
        let candidates = walk_candidates(&root, &opts, &cancel_for_walk, &mut warnings);
        candidates.map(|c| (c, warnings))
    })
    .await
    .map_err(|e| FileOpError::Internal(format!("scan task panicked: {e}")))??;

    warnings.append(&mut warnings_from_walk);

    if cancel.is_cancelled() {
        return Err(FileOpError::Cancelled);
    }

    // Bounded concurrency for digest computation; presented fully-populated
    // and ordered to the caller only once every digest has resolved.
    let semaphore = Arc::new(Semaphore::new(8));
    let mut handles = Vec::with_capacity(candidates.len());

    for path in candidates {
        let root = source_root.to_path_buf();
        let sem = Arc::clone(&semaphore);
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire().await.expect("semaphore closed");
            if cancel.is_cancelled() {
                return Err(FileOpError::Cancelled);
            }

            let size = match tokio::fs::metadata(&path).await {
                Ok(m) => m.len(),
                Err(e) => {
                    return Ok(Err(ScanWarning {
                        path,
                        reason: format!("unreadable metadata: {e}"),
                    }));
                }
            };

            let digest_result = hash::digest(&path, &cancel).await;
            let digest = match digest_result {
                Ok(d) => d,
                Err(FileOpError::Cancelled) => return Err(FileOpError::Cancelled),
                Err(e) => {
                    return Ok(Err(ScanWarning {
                        path,
                        reason: format!("unreadable file: {e}"),
                    }));
                }
            };

            let relative_path = path
                .strip_prefix(&root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");

            Ok(Ok(ManifestEntry {
                relative_path,
                source_absolute_path: path,
                source_digest: digest,
                size_bytes: size,
                image_width: None,
                image_height: None,
            }))
        }));
    }

    let mut entries = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(Ok(entry))) => entries.push(entry),
            Ok(Ok(Err(warning))) => warnings.push(warning),
            Ok(Err(FileOpError::Cancelled)) => return Err(FileOpError::Cancelled),
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(FileOpError::Internal(format!("digest task panicked: {e}")));
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(FileOpError::Cancelled);
    }

    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    debug!("manifest built: {} entries", entries.len());

    Ok(ScanResult {
        manifest: Manifest::from_sorted_entries(entries),
        warnings,
    })
}
