use serde::{Deserialize, Serialize};

use crate::crypto;

use super::{transaction::Transaction, BlockId, Hash, Pubkey, Signature};

/// A block header plus its ordered transaction list.
///
/// `hash` and `cumulative_pow` are not part of the hash preimage (a hash
/// obviously cannot commit to itself, and cumulative difficulty depends on
/// ancestry a lone header doesn't carry) — they are populated by whoever
/// assembles or accepts the block. `header_bytes` is the actual preimage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub hash: Hash,
    pub pre_hash: Hash,
    pub utc: u64,
    pub version: u32,
    pub zero_bits: u32,
    pub miner_pubkey: Pubkey,
    pub nonce: u64,
    pub tx_list: Vec<Transaction>,
    pub miner_sign: Signature,
    pub cumulative_pow: u128,
}

impl Block {
    /// Bytes hashed to produce `hash`: everything the miner can fix before
    /// signing, in the exact field order required for deterministic
    /// hashing (§6). Excludes `hash`, `miner_sign` and `cumulative_pow`.
    pub fn header_bytes(
        id: BlockId,
        pre_hash: &Hash,
        utc: u64,
        version: u32,
        zero_bits: u32,
        miner_pubkey: &Pubkey,
        nonce: u64,
        merkle_root: &Hash,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + 32 + 8 * 4 + 4 * 2);
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(pre_hash);
        buf.extend_from_slice(&utc.to_be_bytes());
        buf.extend_from_slice(&version.to_be_bytes());
        buf.extend_from_slice(&zero_bits.to_be_bytes());
        buf.extend_from_slice(miner_pubkey);
        buf.extend_from_slice(&nonce.to_be_bytes());
        buf.extend_from_slice(merkle_root);
        buf
    }

    pub fn compute_merkle_root(tx_list: &[Transaction]) -> Hash {
        merkle_root(&tx_list.iter().map(|tx| tx.id).collect::<Vec<_>>())
    }

    pub fn compute_hash(&self) -> Hash {
        let root = Self::compute_merkle_root(&self.tx_list);
        let bytes = Self::header_bytes(
            self.id,
            &self.pre_hash,
            self.utc,
            self.version,
            self.zero_bits,
            &self.miner_pubkey,
            self.nonce,
            &root,
        );
        crypto::hash::hash(&bytes)
    }

    pub fn verify_pow(&self) -> bool {
        crypto::pow_ok(&self.hash, self.zero_bits)
    }

    pub fn verify_miner_signature(&self) -> bool {
        crypto::verify(&self.miner_pubkey, &self.hash, &self.miner_sign)
    }
}

fn merkle_root(ids: &[Hash]) -> Hash {
    if ids.is_empty() {
        return [0u8; 32];
    }
    let mut level = ids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let h = if pair.len() == 2 {
                crypto::hash::hash_concat(&pair[0], &pair[1])
            } else {
                crypto::hash::hash_concat(&pair[0], &pair[0])
            };
            next.push(h);
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::transaction::TxKind;

    fn mock_tx(n: u8) -> Transaction {
        let sk = crate::crypto::keys::generate_keypair();
        Transaction::new_signed(1000, &sk, TxKind::Send { to: n as u64, amount: 1, fee: 0 })
    }

    #[test]
    fn test_empty_merkle_root_is_zero() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn test_merkle_root_changes_with_tx_set() {
        let a = merkle_root(&[mock_tx(1).id]);
        let b = merkle_root(&[mock_tx(2).id]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_odd_tx_count_duplicates_last() {
        let t1 = mock_tx(1).id;
        let t2 = mock_tx(2).id;
        let t3 = mock_tx(3).id;
        let root_odd = merkle_root(&[t1, t2, t3]);
        let root_padded = merkle_root(&[t1, t2, t3, t3]);
        assert_eq!(root_odd, root_padded);
    }

    #[test]
    fn test_hash_matches_header_bytes() {
        let miner_sk = crate::crypto::keys::generate_keypair();
        let miner_pubkey = miner_sk.verifying_key().to_bytes();
        let mut block = Block {
            id: 1,
            hash: [0u8; 32],
            pre_hash: [1u8; 32],
            utc: 1000,
            version: 1,
            zero_bits: 1,
            miner_pubkey,
            nonce: 0,
            tx_list: vec![],
            miner_sign: [0u8; 64],
            cumulative_pow: 0,
        };
        block.hash = block.compute_hash();
        assert_eq!(block.hash, block.compute_hash());
    }
}
