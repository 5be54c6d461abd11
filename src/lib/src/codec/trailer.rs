//! Development container: manifest appended after the asset bytes
//!
//! ```text
//! [ asset bytes ][ manifest ][ manifest length: u64 BE ][ "PSMANIF1" ]
//! ```
//!
//! Viewers ignore trailing data after the JPEG EOI or PNG IEND, so the asset
//! still renders. Re-embedding replaces an existing trailer.

use super::{format_from_magic, ManifestCodec};
use crate::error::PSError;
use crate::manifest::Exclusion;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"PSMANIF1";
const FOOTER_LEN: u64 = 16;
/// Upper bound on an embedded manifest
const MAX_MANIFEST_LEN: u64 = 16 * 1024 * 1024;

const SUPPORTED_FORMATS: &[&str] = &["image/jpeg", "image/png"];

#[derive(Debug, Clone, Copy, Default)]
pub struct TrailerCodec;

struct Layout {
    /// Bytes belonging to the asset itself
    content_len: u64,
    manifest: Option<(u64, u64)>,
}

impl TrailerCodec {
    pub fn new() -> Self {
        Self
    }

    fn layout(file: &mut File) -> Result<Layout, PSError> {
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN {
            return Ok(Layout {
                content_len: file_len,
                manifest: None,
            });
        }
        file.seek(SeekFrom::Start(file_len - FOOTER_LEN))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer)?;
        if &footer[8..] != MAGIC {
            return Ok(Layout {
                content_len: file_len,
                manifest: None,
            });
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&footer[..8]);
        let manifest_len = u64::from_be_bytes(len_bytes);
        if manifest_len > MAX_MANIFEST_LEN || manifest_len > file_len - FOOTER_LEN {
            return Err(PSError::MalformedManifest(format!(
                "Trailer declares {} manifest bytes in a {} byte file",
                manifest_len, file_len
            )));
        }
        let manifest_start = file_len - FOOTER_LEN - manifest_len;
        Ok(Layout {
            content_len: manifest_start,
            manifest: Some((manifest_start, manifest_len)),
        })
    }
}

impl ManifestCodec for TrailerCodec {
    fn name(&self) -> &'static str {
        "trailer"
    }

    fn supports(&self, format: &str) -> bool {
        SUPPORTED_FORMATS.contains(&format)
    }

    fn exclusion(&self, asset: &Path) -> Result<Exclusion, PSError> {
        let layout = Self::layout(&mut File::open(asset)?)?;
        Ok(Exclusion::to_end(layout.content_len))
    }

    fn embed(&self, manifest: &[u8], asset: &Path, output: &Path) -> Result<(), PSError> {
        let mut input = File::open(asset)
            .map_err(|e| PSError::EmbedFailed(format!("Cannot open asset: {}", e)))?;
        let layout = Self::layout(&mut input)?;

        let mut header = [0u8; 12];
        input.seek(SeekFrom::Start(0))?;
        let header_len = input.read(&mut header)?;
        match format_from_magic(&header[..header_len]) {
            Some(format) if self.supports(format) => {}
            other => {
                return Err(PSError::EmbedFailed(format!(
                    "Container {} cannot carry an embedded manifest",
                    other.unwrap_or("unknown")
                )));
            }
        }
        if manifest.len() as u64 > MAX_MANIFEST_LEN {
            return Err(PSError::EmbedFailed(format!(
                "Manifest of {} bytes exceeds the container limit",
                manifest.len()
            )));
        }

        input.seek(SeekFrom::Start(0))?;
        let mut writer = BufWriter::new(File::create(output)?);
        let copied = io::copy(&mut (&mut input).take(layout.content_len), &mut writer)?;
        if copied != layout.content_len {
            return Err(PSError::EmbedFailed("Asset shrank while embedding".to_string()));
        }
        writer.write_all(manifest)?;
        writer.write_all(&(manifest.len() as u64).to_be_bytes())?;
        writer.write_all(MAGIC)?;
        writer
            .into_inner()
            .map_err(|e| PSError::IOError(e.into_error()))?
            .sync_all()?;
        Ok(())
    }

    fn read_manifest(&self, asset: &Path) -> Result<Option<Vec<u8>>, PSError> {
        let mut file = File::open(asset)?;
        let Some((start, len)) = Self::layout(&mut file)?.manifest else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(start))?;
        let mut manifest = vec![0u8; len as usize];
        file.read_exact(&mut manifest)?;
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 1, 2, 3, 4, 0xff, 0xd9];

    #[test]
    fn test_embed_and_read() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.jpg");
        let out = dir.path().join("a.signed.jpg");
        std::fs::write(&asset, JPEG).unwrap();

        let codec = TrailerCodec::new();
        assert_eq!(codec.read_manifest(&asset).unwrap(), None);
        assert_eq!(codec.exclusion(&asset).unwrap(), Exclusion::to_end(JPEG.len() as u64));

        codec.embed(b"{\"m\":1}", &asset, &out).unwrap();
        assert_eq!(codec.read_manifest(&out).unwrap().unwrap(), b"{\"m\":1}");
        assert!(std::fs::read(&out).unwrap().starts_with(JPEG));
        assert_eq!(codec.exclusion(&out).unwrap(), Exclusion::to_end(JPEG.len() as u64));
    }

    #[test]
    fn test_reembed_replaces_trailer() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.jpg");
        let once = dir.path().join("once.jpg");
        let twice = dir.path().join("twice.jpg");
        std::fs::write(&asset, JPEG).unwrap();

        let codec = TrailerCodec::new();
        codec.embed(b"first", &asset, &once).unwrap();
        codec.embed(b"second", &once, &twice).unwrap();
        assert_eq!(codec.read_manifest(&twice).unwrap().unwrap(), b"second");
        assert_eq!(
            std::fs::metadata(&twice).unwrap().len(),
            JPEG.len() as u64 + 6 + FOOTER_LEN
        );
    }

    #[test]
    fn test_unsupported_container_fails_embed() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.heic");
        std::fs::write(&asset, b"\0\0\0\x18ftypheic....").unwrap();
        let result = TrailerCodec::new().embed(b"m", &asset, &dir.path().join("out"));
        assert!(matches!(result, Err(PSError::EmbedFailed(_))));
        assert!(!TrailerCodec::new().supports("image/heic"));
    }

    #[test]
    fn test_corrupt_length_rejected() {
        let dir = tempdir().unwrap();
        let asset = dir.path().join("a.jpg");
        let mut data = JPEG.to_vec();
        data.extend_from_slice(&u64::MAX.to_be_bytes());
        data.extend_from_slice(MAGIC);
        std::fs::write(&asset, data).unwrap();
        assert!(matches!(
            TrailerCodec::new().read_manifest(&asset),
            Err(PSError::MalformedManifest(_))
        ));
    }
}
