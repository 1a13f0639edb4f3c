use std::{
    fs::File,
    io::Read,
    path::Path,
};

use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};

const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Computes content digests on demand. Thread-safe: concurrent hashing of
/// distinct files is permitted since each call opens its own handle and
/// owns its own buffer (spec.md §4.3).
///
/// Generalized from the teacher's `security.rs::fingerprint_from_raw`,
/// which hashes a single in-memory byte slice with the same `sha2`
/// crate; this hashes a file in buffered chunks instead of loading it
/// whole.
#[derive(Clone, Copy, Debug)]
pub struct Hasher {
    buffer_size: usize,
}

impl Default for Hasher {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Hasher {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// The chunk size this instance reads per iteration.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns `(size, hex SHA-256)`. Any buffer size yields identical
    /// digests, by construction.
    pub fn hash_file(&self, path: &Path) -> Result<(u64, String)> {
        let mut file = File::open(path).map_err(|err| SyncError::io(path.to_path_buf(), err))?;
        let mut digest = Sha256::new();
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;

        loop {
            let read = file
                .read(&mut buf)
                .map_err(|err| SyncError::io(path.to_path_buf(), err))?;
            if read == 0 {
                break;
            }
            digest.update(&buf[..read]);
            total += read as u64;
        }

        let hex = digest
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect();
        Ok((total, hex))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn hash_is_stable_across_buffer_sizes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; 10_000]).unwrap();

        let small = Hasher::with_buffer_size(16).hash_file(file.path()).unwrap();
        let large = Hasher::with_buffer_size(1 << 20)
            .hash_file(file.path())
            .unwrap();

        assert_eq!(small, large);
        assert_eq!(small.0, 10_000);
    }

    #[test]
    fn different_content_yields_different_hash() {
        let mut a = NamedTempFile::new().unwrap();
        a.write_all(b"alpha").unwrap();
        let mut b = NamedTempFile::new().unwrap();
        b.write_all(b"beta").unwrap();

        let hasher = Hasher::default();
        let (_, hash_a) = hasher.hash_file(a.path()).unwrap();
        let (_, hash_b) = hasher.hash_file(b.path()).unwrap();
        assert_ne!(hash_a, hash_b);
    }
}
