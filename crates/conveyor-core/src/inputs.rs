//! Build input fingerprinting.
//!
//! Every run derives a short deterministic fingerprint from the full set of
//! inputs that contribute to its artifact identity: the declared inputs of
//! every step, the serialized configuration, user-supplied extra inputs, and
//! the binary's mtime and size. The fingerprint names the execution
//! namespace, so jobs with identical inputs share cluster-side artifacts.

use std::path::Path;
use std::sync::LazyLock;

use sha2::{Digest, Sha256};

/// The ordered list of strings contributing to the input hash.
pub type InputDefinition = Vec<String>;

/// Number of hash bytes kept before encoding. Object names cannot be long,
/// so the hash is truncated; the input space is tiny enough to tolerate the
/// increased collision chance.
const HASH_BYTES: usize = 5;

/// Encoded length of a truncated hash: 40 bits at 5 bits per symbol.
pub const ENCODED_HASH_LEN: usize = 8;

/// Base32 alphabet safe for Kubernetes resource names. 0 and 1 stand in for
/// the letters dropped from the front of the alphabet, keeping the encoding
/// one-way friendly for short display names.
pub const NAME_ALPHABET: &str = "bcdfghijklmnpqrstvwxyz0123456789";

static NAME_ENCODING: LazyLock<data_encoding::Encoding> = LazyLock::new(|| {
    let mut spec = data_encoding::Specification::new();
    spec.symbols.push_str(NAME_ALPHABET);
    spec.encoding().expect("static base32 specification")
});

/// Hashes the unique parts of the input to avoid collisions.
///
/// The inputs are sorted before hashing, so any permutation of the same set
/// produces the same value.
#[must_use]
pub fn input_hash(inputs: &InputDefinition) -> String {
    let mut sorted: Vec<&str> = inputs.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hash = Sha256::new();
    for input in sorted {
        hash.update(input.as_bytes());
    }
    NAME_ENCODING.encode(&hash.finalize()[..HASH_BYTES])
}

/// Hashes arbitrary bytes into the short resource-name form, used to name
/// derived objects such as clone-auth secrets.
#[must_use]
pub fn name_hash(data: &[u8]) -> String {
    let mut hash = Sha256::new();
    hash.update(data);
    NAME_ENCODING.encode(&hash.finalize()[..HASH_BYTES])
}

/// Describes the running binary as an input, in lieu of a content hash.
///
/// Returns `None` when the binary cannot be inspected; the caller logs and
/// proceeds without it.
#[must_use]
pub fn binary_identity(path: &Path) -> Option<String> {
    let stat = std::fs::metadata(path).ok()?;
    let mtime = stat
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?;
    Some(format!("{}-{}", mtime.as_secs(), stat.len()))
}
