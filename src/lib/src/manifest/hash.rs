//! Asset hashing with excluded byte ranges

use crate::error::PSError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub const HASH_ALGORITHM: &str = "sha256";

const CHUNK_SIZE: usize = 64 * 1024;

/// Byte range left out of the asset hash, where the manifest is inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub start: u64,
    /// `None` runs to the end of the asset
    pub length: Option<u64>,
}

impl Exclusion {
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            length: Some(length),
        }
    }

    pub fn to_end(start: u64) -> Self {
        Self {
            start,
            length: None,
        }
    }

    fn end(&self) -> u64 {
        self.length.map_or(u64::MAX, |len| self.start.saturating_add(len))
    }

    fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }
}

/// SHA-256 over `reader`, skipping `exclusions`. Returns lowercase hex.
pub fn hash_reader<R: Read>(mut reader: R, exclusions: &[Exclusion]) -> Result<String, PSError> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut offset = 0u64;
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        let chunk = &buf[..read];
        let chunk_end = offset + read as u64;
        let mut pos = offset;
        while pos < chunk_end {
            let next = match exclusions.iter().find(|e| e.contains(pos)) {
                Some(excluded) => excluded.end().min(chunk_end),
                None => {
                    let next = exclusions
                        .iter()
                        .map(|e| e.start)
                        .filter(|&start| start > pos)
                        .min()
                        .unwrap_or(u64::MAX)
                        .min(chunk_end);
                    hasher.update(&chunk[(pos - offset) as usize..(next - offset) as usize]);
                    next
                }
            };
            pos = next;
        }
        offset = chunk_end;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of the file at `path`, skipping `exclusions`.
pub fn hash_asset(path: &Path, exclusions: &[Exclusion]) -> Result<String, PSError> {
    let file = File::open(path)?;
    hash_reader(BufReader::new(file), exclusions)
}

pub fn hash_bytes(data: &[u8], exclusions: &[Exclusion]) -> Result<String, PSError> {
    hash_reader(data, exclusions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_exclusions_is_plain_sha256() {
        assert_eq!(
            hash_bytes(b"abc", &[]).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_exclusion_to_end() {
        let with_trailer = hash_bytes(b"abcTRAILER", &[Exclusion::to_end(3)]).unwrap();
        assert_eq!(with_trailer, hash_bytes(b"abc", &[]).unwrap());
    }

    #[test]
    fn test_bounded_exclusion() {
        let hashed = hash_bytes(b"abXXXc", &[Exclusion::new(2, 3)]).unwrap();
        assert_eq!(hashed, hash_bytes(b"abc", &[]).unwrap());
    }

    #[test]
    fn test_exclusion_across_chunks() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let start = CHUNK_SIZE as u64 - 10;
        let hashed = hash_bytes(&data, &[Exclusion::new(start, 100)]).unwrap();

        let mut kept = data[..start as usize].to_vec();
        kept.extend_from_slice(&data[start as usize + 100..]);
        assert_eq!(hashed, hash_bytes(&kept, &[]).unwrap());
    }

    #[test]
    fn test_change_outside_exclusion_detected() {
        let a = hash_bytes(b"abcTRAILER", &[Exclusion::to_end(3)]).unwrap();
        let b = hash_bytes(b"abdTRAILER", &[Exclusion::to_end(3)]).unwrap();
        assert_ne!(a, b);
    }
}
