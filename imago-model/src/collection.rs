//! The `Collection` aggregate: a browsable set of images rooted at one
//! folder or one archive file, together with its embedded derivative
//! entries and denormalized statistics.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, ImageId, LibraryId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    Folder,
    Archive,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Folder => "folder",
            CollectionType::Archive => "archive",
        }
    }
}

/// Media format tag carried by embedded images and derivatives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormatTag {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Webp,
}

impl ImageFormatTag {
    /// Maps a file extension (without the dot, any case) to a format tag.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormatTag::Jpeg),
            "png" => Some(ImageFormatTag::Png),
            "gif" => Some(ImageFormatTag::Gif),
            "bmp" => Some(ImageFormatTag::Bmp),
            "webp" => Some(ImageFormatTag::Webp),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Data-URL content-type prefix for summary inlining.
    pub fn data_url_prefix(&self) -> &'static str {
        match self {
            ImageFormatTag::Jpeg => "data:image/jpeg;base64,",
            ImageFormatTag::Png => "data:image/png;base64,",
            ImageFormatTag::Webp => "data:image/webp;base64,",
            ImageFormatTag::Gif => "data:image/gif;base64,",
            ImageFormatTag::Bmp => "data:image/bmp;base64,",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormatTag::Jpeg => "jpg",
            ImageFormatTag::Png => "png",
            ImageFormatTag::Gif => "gif",
            ImageFormatTag::Bmp => "bmp",
            ImageFormatTag::Webp => "webp",
        }
    }
}

/// Per-collection behaviour switches.
///
/// `use_direct_file_access` only applies to folder collections; archives
/// always produce real derivative bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSettings {
    pub auto_scan: bool,
    pub generate_thumbnails: bool,
    pub generate_cache: bool,
    pub use_direct_file_access: bool,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            auto_scan: true,
            generate_thumbnails: true,
            generate_cache: true,
            use_direct_file_access: false,
        }
    }
}

/// Denormalized aggregate statistics, maintained by atomic increments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatistics {
    pub total_items: u64,
    pub total_size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEmbedded {
    pub id: ImageId,
    pub filename: String,
    /// Relative path within the folder, or the archive entry name.
    pub relative_path: String,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormatTag,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailEmbedded {
    pub image_id: ImageId,
    /// Derivative file path, or the original file path when `is_direct`.
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub format: ImageFormatTag,
    pub is_direct: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheImageEmbedded {
    pub image_id: ImageId,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub format: ImageFormatTag,
    pub is_direct: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: CollectionType,
    pub library_id: LibraryId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub settings: CollectionSettings,
    pub statistics: CollectionStatistics,
    pub images: Vec<ImageEmbedded>,
    pub thumbnails: Vec<ThumbnailEmbedded>,
    pub cache_images: Vec<CacheImageEmbedded>,
}

impl Collection {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        kind: CollectionType,
        library_id: LibraryId,
        mut settings: CollectionSettings,
    ) -> Self {
        // Direct file access is meaningless for archive entries.
        if kind == CollectionType::Archive {
            settings.use_direct_file_access = false;
        }
        let now = Utc::now();
        Self {
            id: CollectionId::generate(),
            name: name.into(),
            path: path.into(),
            kind,
            library_id,
            created_at: now,
            updated_at: now,
            deleted: false,
            settings,
            statistics: CollectionStatistics::default(),
            images: Vec::new(),
            thumbnails: Vec::new(),
            cache_images: Vec::new(),
        }
    }

    /// Whether derivatives should be stored as direct references.
    pub fn direct_access(&self) -> bool {
        self.kind == CollectionType::Folder && self.settings.use_direct_file_access
    }

    pub fn first_image(&self) -> Option<&ImageEmbedded> {
        self.images.first()
    }

    pub fn image(&self, image_id: &ImageId) -> Option<&ImageEmbedded> {
        self.images.iter().find(|img| img.id == *image_id)
    }

    pub fn has_image_entry(&self, filename: &str, relative_path: &str) -> bool {
        self.images
            .iter()
            .any(|img| img.filename == filename && img.relative_path == relative_path)
    }

    pub fn thumbnail_for(&self, image_id: &ImageId) -> Option<&ThumbnailEmbedded> {
        self.thumbnails.iter().find(|t| t.image_id == *image_id)
    }

    pub fn cache_image_for(&self, image_id: &ImageId) -> Option<&CacheImageEmbedded> {
        self.cache_images.iter().find(|c| c.image_id == *image_id)
    }

    /// Images with no thumbnail entry yet, in aggregate order.
    pub fn images_missing_thumbnails(&self) -> Vec<&ImageEmbedded> {
        self.images
            .iter()
            .filter(|img| self.thumbnail_for(&img.id).is_none())
            .collect()
    }

    /// Images with no cache entry yet, in aggregate order.
    pub fn images_missing_cache(&self) -> Vec<&ImageEmbedded> {
        self.images
            .iter()
            .filter(|img| self.cache_image_for(&img.id).is_none())
            .collect()
    }
}
