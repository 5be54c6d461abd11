//! Container codecs
//!
//! A codec knows how to place serialized manifest bytes inside an asset
//! container and how to find them again. The pipeline never looks inside
//! the container itself; it only needs the byte range the codec will
//! occupy so that range can be left out of the asset hash.

mod trailer;

pub use trailer::TrailerCodec;

use crate::error::PSError;
use crate::manifest::Exclusion;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Sidecar file extension, appended to the full asset file name
pub const SIDECAR_EXTENSION: &str = "c2pa";

/// Manifest container codec
pub trait ManifestCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether assets of MIME type `format` can carry an embedded manifest.
    fn supports(&self, format: &str) -> bool;

    /// Region the manifest will occupy once embedded in `asset`.
    fn exclusion(&self, asset: &Path) -> Result<Exclusion, PSError>;

    /// Write `asset` with `manifest` embedded to `output`.
    fn embed(&self, manifest: &[u8], asset: &Path, output: &Path) -> Result<(), PSError>;

    /// Embedded manifest bytes, if any.
    fn read_manifest(&self, asset: &Path) -> Result<Option<Vec<u8>>, PSError>;
}

/// `<asset>.c2pa`, next to the asset.
pub fn sidecar_path(asset: &Path) -> PathBuf {
    let mut name = asset
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    asset.with_file_name(name)
}

/// MIME type from the leading bytes of the file, if recognized.
pub fn sniff_format(path: &Path) -> Result<Option<&'static str>, PSError> {
    let mut header = [0u8; 12];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < header.len() {
        let read = file.read(&mut header[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(format_from_magic(&header[..filled]))
}

fn format_from_magic(header: &[u8]) -> Option<&'static str> {
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    if header.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("image/jpeg")
    } else if header.starts_with(PNG) {
        Some("image/png")
    } else if header.len() >= 12 && &header[4..8] == b"ftyp" {
        Some("video/mp4")
    } else if header.starts_with(b"RIFF") && header.len() >= 12 && &header[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// MIME type guessed from the file extension.
pub fn format_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "heic" => Some("image/heic"),
        "webp" => Some("image/webp"),
        "mp4" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sidecar_path_keeps_extension() {
        assert_eq!(
            sidecar_path(Path::new("/photos/IMG_1.jpg")),
            PathBuf::from("/photos/IMG_1.jpg.c2pa")
        );
    }

    #[test]
    fn test_sniff_format() {
        let dir = tempdir().unwrap();
        let jpeg = dir.path().join("a.bin");
        std::fs::write(&jpeg, [0xff, 0xd8, 0xff, 0xe0, 0, 0]).unwrap();
        assert_eq!(sniff_format(&jpeg).unwrap(), Some("image/jpeg"));

        let text = dir.path().join("b.bin");
        std::fs::write(&text, b"hello").unwrap();
        assert_eq!(sniff_format(&text).unwrap(), None);
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(format_from_extension(Path::new("a.JPG")), Some("image/jpeg"));
        assert_eq!(format_from_extension(Path::new("a.heic")), Some("image/heic"));
        assert_eq!(format_from_extension(Path::new("a")), None);
    }
}
