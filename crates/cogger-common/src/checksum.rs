//! Checksum utilities for artifact verification

use crate::error::{CoggerError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 checksum, hex-encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum(String);

impl Checksum {
    /// Compute the checksum of a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        Self::from_reader(&mut file)
    }

    /// Compute the checksum of an in-memory buffer
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Checksum(hex::encode(hasher.finalize()))
    }

    /// Compute the checksum of any readable source
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Checksum(hex::encode(hasher.finalize())))
    }

    /// Verify this checksum against an expected hex string
    pub fn verify(&self, expected: &str) -> Result<()> {
        if self.0 == expected {
            Ok(())
        } else {
            Err(CoggerError::ChecksumMismatch {
                expected: expected.to_string(),
                actual: self.0.clone(),
            })
        }
    }

    /// Hex representation of the digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
