//! Content fingerprints for query definitions.
//!
//! A fingerprint scopes checkpoints to one version of a query: editing the
//! query file changes the fingerprint and therefore starts a new
//! checkpoint lineage. Content is streamed through SHA-256 in
//! block-sized chunks, so arbitrarily large inputs hash in constant memory.

use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;

/// Read size, roughly one filesystem block.
pub const CHUNK_SIZE: usize = 4096;

/// Fingerprint everything readable from `reader`.
pub fn fingerprint_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint a file on disk.
pub fn fingerprint_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    fingerprint_reader(&mut file)
}

/// Fingerprint an in-memory buffer.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for chunk in bytes.chunks(CHUNK_SIZE) {
        hasher.update(chunk);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::io::Cursor;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            fingerprint_bytes(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_reader_matches_bytes_across_chunks() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let mut cursor = Cursor::new(&data);
        assert_eq!(fingerprint_reader(&mut cursor).unwrap(), fingerprint_bytes(&data));
    }

    #[test]
    fn test_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("query.json");
        std::fs::write(&path, b"{\"tables\": []}").unwrap();
        assert_eq!(
            fingerprint_file(&path).unwrap(),
            fingerprint_bytes(b"{\"tables\": []}")
        );
        assert!(fingerprint_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            fingerprint_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    proptest! {
        #[test]
        fn fingerprint_is_stable(data in prop::collection::vec(any::<u8>(), 0..10_000)) {
            prop_assert_eq!(fingerprint_bytes(&data), fingerprint_bytes(&data));
            let mut cursor = Cursor::new(&data);
            prop_assert_eq!(fingerprint_reader(&mut cursor).unwrap(), fingerprint_bytes(&data));
        }

        #[test]
        fn distinct_inputs_distinct_fingerprints(
            inputs in prop::collection::hash_set(prop::collection::vec(any::<u8>(), 0..64), 1..50)
        ) {
            let digests: HashSet<String> = inputs.iter().map(|d| fingerprint_bytes(d)).collect();
            prop_assert_eq!(digests.len(), inputs.len());
        }
    }
}
