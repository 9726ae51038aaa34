// Signing keys and Base64 codec facade (C1).
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

pub const PUBKEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

/// Generates a fresh signing keypair. Used by wallets and by the miner to
/// mint the address it gets paid to.
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Signs a digest with a signer's secret key.
pub fn sign(signing_key: &SigningKey, digest: &[u8]) -> [u8; SIGNATURE_BYTES] {
    signing_key.sign(digest).to_bytes()
}

/// Verifies a signature against a digest and a public key.
/// Returns `false` on any malformed input rather than panicking.
pub fn verify(pubkey: &[u8; PUBKEY_BYTES], digest: &[u8], sig: &[u8; SIGNATURE_BYTES]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    let signature = Signature::from_bytes(sig);
    vk.verify(digest, &signature).is_ok()
}

/// Restricts to the standard 64-character Base64 alphabet plus padding `=`,
/// via a round-trip decode with the standard engine.
pub fn is_valid_base64(s: &str) -> bool {
    !s.is_empty() && STANDARD.decode(s).is_ok()
}
