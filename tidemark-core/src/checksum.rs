use sha2::{Digest, Sha256};

/// Normalize line endings so checksums match across platforms.
fn normalize(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n")
}

/// SHA-256 hex digest over line-ending-normalized content.
pub fn calculate_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checksum over both halves of a SQL pair, separated by a NUL byte.
pub fn calculate_pair_checksum(up: &str, down: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(up).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(down).as_bytes());
    format!("{:x}", hasher.finalize())
}
