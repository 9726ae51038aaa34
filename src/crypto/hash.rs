// Cryptographic hashing facade (C1).
use sha2::{Digest, Sha256};

/// SHA-256: the chain's single hash function, used for block headers,
/// transaction ids and Merkle roots alike.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hashes `a` then `b` without allocating a temporary concatenation buffer.
pub fn hash_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_length() {
        assert_eq!(hash(b"forumcoin").len(), 32);
    }

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"a"), hash(b"a"));
        assert_ne!(hash(b"a"), hash(b"b"));
    }

    #[test]
    fn test_hash_concat_matches_hash_of_joined_bytes() {
        let mut joined = b"foo".to_vec();
        joined.extend_from_slice(b"bar");
        assert_eq!(hash_concat(b"foo", b"bar"), hash(&joined));
    }
}
