use sha2::{Digest, Sha256};

pub const INSTALLATION_NAMESPACE_PREFIX: &str = "neutree-cluster-";

/// Hex encoded SHA-256 of `input`.
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// First 8 hex characters of the SHA-256 of `input`, short enough for object names.
pub fn short_hash(input: &str) -> String {
    let mut digest = sha256_hex(input.as_bytes());
    digest.truncate(8);
    digest
}

/// The namespace every per-cluster sub-component lands in.
pub fn installation_namespace(name: &str, workspace: &str) -> String {
    format!(
        "{}{}",
        INSTALLATION_NAMESPACE_PREFIX,
        short_hash(&format!("{name}/{workspace}"))
    )
}
