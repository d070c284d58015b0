//! Library walking and collection candidate discovery.
//!
//! A candidate is either a supported archive file or the topmost folder
//! that directly contains at least one supported image; everything below a
//! candidate folder belongs to that collection, so duplicate filenames in
//! subfolders are distinguished by their relative path.

pub mod archive;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use imago_model::{CollectionType, ImageFormatTag};

use crate::error::{ImagoError, Result};

pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "webp"];
pub const ARCHIVE_EXTENSIONS: [&str; 6] = ["zip", "rar", "7z", "cbz", "cbr", "tar"];

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_supported_image(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_supported_archive(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionCandidate {
    pub name: String,
    pub path: PathBuf,
    pub kind: CollectionType,
}

/// Walks a library root and returns its collection candidates in a stable
/// order. With `include_subfolders` false only the root's direct children
/// are considered.
pub fn discover_candidates(root: &Path, include_subfolders: bool) -> Result<Vec<CollectionCandidate>> {
    if !root.is_dir() {
        return Err(ImagoError::Validation(format!(
            "library path {} is not a directory",
            root.display()
        )));
    }

    let max_depth = if include_subfolders { usize::MAX } else { 1 };
    let mut archive_paths = BTreeSet::new();
    let mut image_dirs: BTreeSet<PathBuf> = BTreeSet::new();

    for entry in WalkDir::new(root).max_depth(max_depth).follow_links(false) {
        let entry = entry.map_err(|e| {
            ImagoError::TransientIo(format!("failed to walk {}: {e}", root.display()))
        })?;
        if entry.file_type().is_file() {
            let path = entry.path();
            if is_supported_archive(path) {
                archive_paths.insert(path.to_path_buf());
            } else if is_supported_image(path)
                && let Some(parent) = path.parent()
            {
                image_dirs.insert(parent.to_path_buf());
            }
        }
    }

    let mut candidates = Vec::new();
    // Topmost image-bearing folders win; nested ones fold into them.
    for dir in &image_dirs {
        let nested = dir
            .ancestors()
            .skip(1)
            .any(|ancestor| image_dirs.contains(ancestor));
        if !nested {
            candidates.push(CollectionCandidate {
                name: folder_name(dir),
                path: dir.clone(),
                kind: CollectionType::Folder,
            });
        }
    }
    for path in archive_paths {
        candidates.push(CollectionCandidate {
            name: archive_name(&path),
            path,
            kind: CollectionType::Archive,
        });
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(candidates)
}

fn folder_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn archive_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredImage {
    pub filename: String,
    /// Slash-separated path relative to the collection folder.
    pub relative_path: String,
    pub byte_size: u64,
    pub format: ImageFormatTag,
    pub absolute_path: PathBuf,
}

/// Enumerates a folder collection's images, sorted case-insensitively by
/// relative path so reruns see the same order.
pub fn list_folder_images(collection_path: &Path) -> Result<Vec<DiscoveredImage>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(collection_path).follow_links(false) {
        let entry = entry.map_err(|e| {
            ImagoError::TransientIo(format!(
                "failed to walk {}: {e}",
                collection_path.display()
            ))
        })?;
        if !entry.file_type().is_file() || !is_supported_image(entry.path()) {
            continue;
        }
        let Some(format) = ImageFormatTag::from_path(entry.path()) else {
            continue;
        };
        let metadata = entry.metadata().map_err(|e| {
            ImagoError::TransientIo(format!("failed to stat {}: {e}", entry.path().display()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(collection_path)
            .unwrap_or(entry.path());
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        images.push(DiscoveredImage {
            filename: entry.file_name().to_string_lossy().into_owned(),
            relative_path,
            byte_size: metadata.len(),
            format,
            absolute_path: entry.path().to_path_buf(),
        });
    }
    images.sort_by_key(|img| img.relative_path.to_lowercase());
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn topmost_image_folders_become_candidates() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("CollA/1.jpg"));
        touch(&root.path().join("CollA/sub/2.jpg"));
        touch(&root.path().join("CollB/cover.png"));
        touch(&root.path().join("CollB/notes.txt"));
        touch(&root.path().join("pack.cbz"));

        let candidates = discover_candidates(root.path(), true).unwrap();
        let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["CollA", "CollB", "pack"]);
        assert_eq!(candidates[2].kind, CollectionType::Archive);
        // `CollA/sub` folded into CollA.
        assert!(candidates.iter().all(|c| !c.path.ends_with("sub")));
    }

    #[test]
    fn shallow_walk_ignores_nested_folders() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("top.zip"));
        touch(&root.path().join("deep/far/1.jpg"));

        let candidates = discover_candidates(root.path(), false).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "top");
    }

    #[test]
    fn folder_listing_is_sorted_case_insensitively() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("coll/B.jpg"));
        touch(&root.path().join("coll/a.jpg"));
        touch(&root.path().join("coll/sub/a.jpg"));
        touch(&root.path().join("coll/readme.md"));

        let images = list_folder_images(&root.path().join("coll")).unwrap();
        let rels: Vec<_> = images.iter().map(|i| i.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["a.jpg", "B.jpg", "sub/a.jpg"]);
    }

    #[test]
    fn missing_library_root_is_a_validation_error() {
        let err = discover_candidates(Path::new("/does/not/exist"), true).unwrap_err();
        assert!(matches!(err, ImagoError::Validation(_)));
    }
}
