//! Image payload containers
//!
//! A payload is either a raw `.vhdx` disk, a `.zip` archive, or a tar
//! archive (gzip or zstd compressed). Archives must hold exactly one file.

use hvnode_core::{HvnodeError, HvnodeResult};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
// End-of-central-directory record; what an empty zip starts with.
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];

/// How a payload file is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Raw,
    Zip,
    TarGz,
    TarZst,
}

impl PayloadKind {
    /// Recognize a payload from its file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(PayloadKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(PayloadKind::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(PayloadKind::TarZst)
        } else if name.ends_with(".vhdx") {
            Some(PayloadKind::Raw)
        } else {
            None
        }
    }

    /// Recognize a downloaded payload from its leading bytes.
    ///
    /// Anything that is not a known compressed stream is treated as a raw
    /// disk; the checksum decides whether it is usable.
    pub fn sniff(path: &Path) -> HvnodeResult<Self> {
        let mut header = [0u8; 4];
        let mut file = File::open(path)?;
        let mut filled = 0;
        while filled < header.len() {
            let read = file.read(&mut header[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        let kind = if filled >= 2 && header[..2] == GZIP_MAGIC {
            PayloadKind::TarGz
        } else if filled == 4 && header == ZSTD_MAGIC {
            PayloadKind::TarZst
        } else if filled == 4 && (header == ZIP_MAGIC || header == ZIP_EMPTY_MAGIC) {
            PayloadKind::Zip
        } else {
            PayloadKind::Raw
        };
        Ok(kind)
    }

    pub fn is_archive(&self) -> bool {
        !matches!(self, PayloadKind::Raw)
    }
}

/// Extract the single file held by the archive at `archive_path` into a
/// temporary file inside `scratch_dir`.
///
/// The temporary file is removed when the returned handle is dropped.
pub fn extract_single(
    kind: PayloadKind,
    archive_path: &Path,
    scratch_dir: &Path,
) -> HvnodeResult<NamedTempFile> {
    let input = BufReader::new(File::open(archive_path)?);
    let format_error = |e: std::io::Error| HvnodeError::format(archive_path, e.to_string());

    match kind {
        PayloadKind::TarGz => {
            unpack_one(flate2::read::GzDecoder::new(input), archive_path, scratch_dir)
        }
        PayloadKind::TarZst => {
            let decoder = zstd::stream::read::Decoder::new(input).map_err(format_error)?;
            unpack_one(decoder, archive_path, scratch_dir)
        }
        PayloadKind::Zip => unzip_one(input, archive_path, scratch_dir),
        PayloadKind::Raw => Err(HvnodeError::format(archive_path, "not an archive")),
    }
}

fn unpack_one<R: Read>(
    reader: R,
    archive_path: &Path,
    scratch_dir: &Path,
) -> HvnodeResult<NamedTempFile> {
    let format_error = |e: std::io::Error| HvnodeError::format(archive_path, e.to_string());

    let mut archive = tar::Archive::new(reader);
    let mut extracted: Option<NamedTempFile> = None;

    for entry in archive.entries().map_err(format_error)? {
        let mut entry = entry.map_err(format_error)?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        if extracted.is_some() {
            return Err(HvnodeError::format(
                archive_path,
                "archive contains more than one file",
            ));
        }

        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let mut scratch = NamedTempFile::new_in(scratch_dir)?;
        let size = std::io::copy(&mut entry, scratch.as_file_mut()).map_err(format_error)?;
        debug!(
            "Extracted {} ({} bytes) from {}",
            name,
            size,
            archive_path.display()
        );
        extracted = Some(scratch);
    }

    extracted.ok_or_else(|| HvnodeError::format(archive_path, "archive is empty"))
}

fn unzip_one<R: Read + Seek>(
    reader: R,
    archive_path: &Path,
    scratch_dir: &Path,
) -> HvnodeResult<NamedTempFile> {
    let zip_error = |e: zip::result::ZipError| HvnodeError::format(archive_path, e.to_string());

    let mut archive = zip::ZipArchive::new(reader).map_err(zip_error)?;
    let mut file_index = None;
    for index in 0..archive.len() {
        if archive.by_index(index).map_err(zip_error)?.is_dir() {
            continue;
        }
        if file_index.is_some() {
            return Err(HvnodeError::format(
                archive_path,
                "archive contains more than one file",
            ));
        }
        file_index = Some(index);
    }
    let index = file_index.ok_or_else(|| HvnodeError::format(archive_path, "archive is empty"))?;

    let mut entry = archive.by_index(index).map_err(zip_error)?;
    let name = entry.name().to_string();
    let mut scratch = NamedTempFile::new_in(scratch_dir)?;
    let size = std::io::copy(&mut entry, scratch.as_file_mut())
        .map_err(|e| HvnodeError::format(archive_path, e.to_string()))?;
    debug!(
        "Extracted {} ({} bytes) from {}",
        name,
        size,
        archive_path.display()
    );
    Ok(scratch)
}
