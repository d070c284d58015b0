//! Archive enumeration and entry extraction for the container formats the
//! pipeline accepts: zip/cbz, rar/cbr, 7z, and tar.
//!
//! Everything here is synchronous; consumers run it on blocking threads.
//! An unreadable container is `DataCorruption` — the scan stage fails once
//! and the message is never retried.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use imago_model::ImageFormatTag;

use crate::error::{ImagoError, Result};
use crate::scanner::extension_of;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Rar,
    SevenZ,
    Tar,
}

impl ArchiveKind {
    fn of(path: &Path) -> Result<Self> {
        match extension_of(path).as_deref() {
            Some("zip") | Some("cbz") => Ok(ArchiveKind::Zip),
            Some("rar") | Some("cbr") => Ok(ArchiveKind::Rar),
            Some("7z") => Ok(ArchiveKind::SevenZ),
            Some("tar") => Ok(ArchiveKind::Tar),
            _ => Err(ImagoError::Validation(format!(
                "unsupported archive container: {}",
                path.display()
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveImageEntry {
    /// Full entry name inside the container; the uniqueness key.
    pub entry_name: String,
    /// Basename of the entry.
    pub filename: String,
    pub byte_size: u64,
    pub format: ImageFormatTag,
}

fn entry_basename(entry_name: &str) -> String {
    entry_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(entry_name)
        .to_string()
}

fn image_format_of_entry(entry_name: &str) -> Option<ImageFormatTag> {
    let ext = entry_name.rsplit('.').next()?;
    if ext.len() == entry_name.len() {
        return None;
    }
    ImageFormatTag::from_extension(ext)
}

fn corrupt(path: &Path, what: impl std::fmt::Display) -> ImagoError {
    ImagoError::DataCorruption(format!("unreadable archive {}: {what}", path.display()))
}

/// Lists supported image entries, deterministically sorted
/// (case-insensitive by entry name).
pub fn list_archive_images(path: &Path) -> Result<Vec<ArchiveImageEntry>> {
    let mut entries = match ArchiveKind::of(path)? {
        ArchiveKind::Zip => list_zip(path)?,
        ArchiveKind::Rar => list_rar(path)?,
        ArchiveKind::SevenZ => list_sevenz(path)?,
        ArchiveKind::Tar => list_tar(path)?,
    };
    entries.sort_by_key(|entry| entry.entry_name.to_lowercase());
    Ok(entries)
}

/// Extracts one entry's bytes.
pub fn read_archive_entry(path: &Path, entry_name: &str) -> Result<Vec<u8>> {
    match ArchiveKind::of(path)? {
        ArchiveKind::Zip => read_zip_entry(path, entry_name),
        ArchiveKind::Rar => read_rar_entry(path, entry_name),
        ArchiveKind::SevenZ => read_sevenz_entry(path, entry_name),
        ArchiveKind::Tar => read_tar_entry(path, entry_name),
    }
}

fn list_zip(path: &Path) -> Result<Vec<ArchiveImageEntry>> {
    let file = File::open(path).map_err(|e| corrupt(path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(path, e))?;
    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(|e| corrupt(path, e))?;
        if !entry.is_file() {
            continue;
        }
        let name = entry.name().to_string();
        if let Some(format) = image_format_of_entry(&name) {
            entries.push(ArchiveImageEntry {
                filename: entry_basename(&name),
                byte_size: entry.size(),
                format,
                entry_name: name,
            });
        }
    }
    Ok(entries)
}

fn read_zip_entry(path: &Path, entry_name: &str) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| corrupt(path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(path, e))?;
    let mut entry = archive
        .by_name(entry_name)
        .map_err(|_| ImagoError::NotFound(format!("entry `{entry_name}` in {}", path.display())))?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| corrupt(path, e))?;
    Ok(bytes)
}

fn list_tar(path: &Path) -> Result<Vec<ArchiveImageEntry>> {
    let file = File::open(path).map_err(|e| corrupt(path, e))?;
    let mut archive = tar::Archive::new(file);
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(|e| corrupt(path, e))? {
        let entry = entry.map_err(|e| corrupt(path, e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| corrupt(path, e))?
            .to_string_lossy()
            .into_owned();
        if let Some(format) = image_format_of_entry(&name) {
            entries.push(ArchiveImageEntry {
                filename: entry_basename(&name),
                byte_size: entry.size(),
                format,
                entry_name: name,
            });
        }
    }
    Ok(entries)
}

fn read_tar_entry(path: &Path, entry_name: &str) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| corrupt(path, e))?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries().map_err(|e| corrupt(path, e))? {
        let mut entry = entry.map_err(|e| corrupt(path, e))?;
        let matches = entry
            .path()
            .map(|p| p.to_string_lossy() == entry_name)
            .unwrap_or(false);
        if matches {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| corrupt(path, e))?;
            return Ok(bytes);
        }
    }
    Err(ImagoError::NotFound(format!(
        "entry `{entry_name}` in {}",
        path.display()
    )))
}

fn list_sevenz(path: &Path) -> Result<Vec<ArchiveImageEntry>> {
    let reader = sevenz_rust::SevenZReader::open(path, sevenz_rust::Password::empty())
        .map_err(|e| corrupt(path, e))?;
    let mut entries = Vec::new();
    for entry in &reader.archive().files {
        if entry.is_directory() {
            continue;
        }
        let name = entry.name().to_string();
        if let Some(format) = image_format_of_entry(&name) {
            entries.push(ArchiveImageEntry {
                filename: entry_basename(&name),
                byte_size: entry.size(),
                format,
                entry_name: name,
            });
        }
    }
    Ok(entries)
}

fn read_sevenz_entry(path: &Path, entry_name: &str) -> Result<Vec<u8>> {
    let mut reader = sevenz_rust::SevenZReader::open(path, sevenz_rust::Password::empty())
        .map_err(|e| corrupt(path, e))?;
    let mut bytes = None;
    reader
        .for_each_entries(|entry, entry_reader| {
            if entry.is_directory() || entry.name() != entry_name {
                return Ok(true);
            }
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            entry_reader.read_to_end(&mut buffer)?;
            bytes = Some(buffer);
            Ok(false)
        })
        .map_err(|e| corrupt(path, e))?;
    bytes.ok_or_else(|| {
        ImagoError::NotFound(format!("entry `{entry_name}` in {}", path.display()))
    })
}

fn list_rar(path: &Path) -> Result<Vec<ArchiveImageEntry>> {
    let archive = unrar::Archive::new(path)
        .open_for_listing()
        .map_err(|e| corrupt(path, format!("{e:?}")))?;
    let mut entries = Vec::new();
    for header in archive {
        let header = header.map_err(|e| corrupt(path, format!("{e:?}")))?;
        if !header.is_file() {
            continue;
        }
        let name = header.filename.to_string_lossy().into_owned();
        if let Some(format) = image_format_of_entry(&name) {
            entries.push(ArchiveImageEntry {
                filename: entry_basename(&name),
                byte_size: header.unpacked_size as u64,
                format,
                entry_name: name,
            });
        }
    }
    Ok(entries)
}

fn read_rar_entry(path: &Path, entry_name: &str) -> Result<Vec<u8>> {
    let mut archive = unrar::Archive::new(path)
        .open_for_processing()
        .map_err(|e| corrupt(path, format!("{e:?}")))?;
    while let Some(header) = archive
        .read_header()
        .map_err(|e| corrupt(path, format!("{e:?}")))?
    {
        let wanted = header.entry().is_file()
            && header.entry().filename.to_string_lossy() == entry_name;
        archive = if wanted {
            let (bytes, _rest) = header
                .read()
                .map_err(|e| corrupt(path, format!("{e:?}")))?;
            return Ok(bytes);
        } else {
            header
                .skip()
                .map_err(|e| corrupt(path, format!("{e:?}")))?
        };
    }
    Err(ImagoError::NotFound(format!(
        "entry `{entry_name}` in {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_fixture(entries: &[(&str, &[u8])]) -> tempfile::TempPath {
        let mut file = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        {
            let mut writer = zip::ZipWriter::new(&mut file);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        file.into_temp_path()
    }

    #[test]
    fn zip_listing_filters_and_sorts() {
        let path = zip_fixture(&[
            ("b.jpg", b"bb"),
            ("A.png", b"aa"),
            ("c.txt", b"ignored"),
            ("nested/d.webp", b"dd"),
        ]);
        let entries = list_archive_images(&path).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.entry_name.as_str()).collect();
        assert_eq!(names, vec!["A.png", "b.jpg", "nested/d.webp"]);
        assert_eq!(entries[2].filename, "d.webp");
        assert_eq!(entries[0].format, ImageFormatTag::Png);
    }

    #[test]
    fn zip_entry_bytes_round_trip() {
        let path = zip_fixture(&[("a.jpg", b"payload")]);
        let bytes = read_archive_entry(&path, "a.jpg").unwrap();
        assert_eq!(bytes, b"payload");
        assert!(matches!(
            read_archive_entry(&path, "missing.jpg"),
            Err(ImagoError::NotFound(_))
        ));
    }

    #[test]
    fn truncated_zip_is_data_corruption() {
        let mut file = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        file.write_all(b"PK\x03\x04 not really a zip").unwrap();
        let path = file.into_temp_path();
        let err = list_archive_images(&path).unwrap_err();
        assert!(matches!(err, ImagoError::DataCorruption(_)));
    }

    #[test]
    fn tar_listing_and_read() {
        let mut file = tempfile::Builder::new().suffix(".tar").tempfile().unwrap();
        {
            let mut builder = tar::Builder::new(&mut file);
            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "x.gif", &b"gif!"[..]).unwrap();
            let mut header = tar::Header::new_gnu();
            header.set_size(3);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "skip.txt", &b"txt"[..]).unwrap();
            builder.finish().unwrap();
        }
        let path = file.into_temp_path();

        let entries = list_archive_images(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_name, "x.gif");
        assert_eq!(read_archive_entry(&path, "x.gif").unwrap(), b"gif!");
    }

    #[test]
    fn unknown_container_is_rejected() {
        let err = list_archive_images(Path::new("/tmp/whatever.lzh")).unwrap_err();
        assert!(matches!(err, ImagoError::Validation(_)));
    }
}
