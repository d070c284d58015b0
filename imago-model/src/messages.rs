//! Pipeline message payloads.
//!
//! One concrete struct per stage; ids travel as their string forms inside
//! JSON bodies and are converted once at the consumer boundary. The
//! `MessageType` discriminator doubles as the routing key / queue name and
//! as the header DLQ recovery uses to restore messages.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::collection::CollectionType;
use crate::ids::{CollectionId, ImageId, JobId, LibraryId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    LibraryScan,
    CollectionScan,
    ImageProcess,
    ThumbnailGen,
    CacheGen,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::LibraryScan,
        MessageType::CollectionScan,
        MessageType::ImageProcess,
        MessageType::ThumbnailGen,
        MessageType::CacheGen,
    ];

    /// Queue name == routing key == header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::LibraryScan => "library-scan",
            MessageType::CollectionScan => "collection-scan",
            MessageType::ImageProcess => "image-process",
            MessageType::ThumbnailGen => "thumbnail-gen",
            MessageType::CacheGen => "cache-gen",
        }
    }

    pub fn queue(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "library-scan" => Ok(MessageType::LibraryScan),
            "collection-scan" => Ok(MessageType::CollectionScan),
            "image-process" => Ok(MessageType::ImageProcess),
            "thumbnail-gen" => Ok(MessageType::ThumbnailGen),
            "cache-gen" => Ok(MessageType::CacheGen),
            _ => Err(()),
        }
    }
}

/// Where an original image's bytes live.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ImageSource {
    File { path: PathBuf },
    ArchiveEntry { archive_path: PathBuf, entry_name: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryScanMessage {
    pub library_id: LibraryId,
    pub library_path: PathBuf,
    #[serde(default)]
    pub include_subfolders: bool,
    #[serde(default)]
    pub force_rescan: bool,
    #[serde(default)]
    pub resume_incomplete: bool,
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default)]
    pub use_direct_file_access: bool,
    #[serde(default)]
    pub auto_scan: bool,
    pub job_id: JobId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionScanMessage {
    pub collection_id: CollectionId,
    pub collection_path: PathBuf,
    pub collection_type: CollectionType,
    #[serde(default)]
    pub force_rescan: bool,
    #[serde(default)]
    pub use_direct_file_access: bool,
    pub job_id: JobId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProcessMessage {
    pub collection_id: CollectionId,
    pub image_id: ImageId,
    pub source: ImageSource,
    pub scan_job_id: JobId,
}

/// Shared payload of the `thumbnail-gen` and `cache-gen` queues; the two
/// stages differ only in target box and destination key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivativeGenMessage {
    pub collection_id: CollectionId,
    pub image_id: ImageId,
    pub source: ImageSource,
    pub scan_job_id: JobId,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

/// Typed union over the five stage payloads, used where a single code path
/// publishes or republishes arbitrary pipeline messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "payload", rename_all = "kebab-case")]
pub enum StageMessage {
    LibraryScan(LibraryScanMessage),
    CollectionScan(CollectionScanMessage),
    ImageProcess(ImageProcessMessage),
    ThumbnailGen(DerivativeGenMessage),
    CacheGen(DerivativeGenMessage),
}

impl StageMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            StageMessage::LibraryScan(_) => MessageType::LibraryScan,
            StageMessage::CollectionScan(_) => MessageType::CollectionScan,
            StageMessage::ImageProcess(_) => MessageType::ImageProcess,
            StageMessage::ThumbnailGen(_) => MessageType::ThumbnailGen,
            StageMessage::CacheGen(_) => MessageType::CacheGen,
        }
    }
}
