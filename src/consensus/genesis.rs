use crate::model::Block;

use super::constants::GENESIS_ZERO_BITS;

pub const GENESIS_TIMESTAMP: u64 = 1_735_689_600; // 2025-01-01T00:00:00Z

/// The one block every node must agree on without having to validate it:
/// height 0, no parent, unsigned (there is no miner to sign it). Applied
/// directly by `ChainState::new`, bypassing the normal validation pipeline
/// the same way the reference repo special-cases `create_genesis_block()`.
pub fn create_genesis_block() -> Block {
    let mut block = Block {
        id: 0,
        hash: [0u8; 32],
        pre_hash: [0u8; 32],
        utc: GENESIS_TIMESTAMP,
        version: super::constants::PROTOCOL_VERSION,
        zero_bits: GENESIS_ZERO_BITS,
        miner_pubkey: [0u8; 32],
        nonce: 0,
        tx_list: Vec::new(),
        miner_sign: [0u8; 64],
        cumulative_pow: 0,
    };
    block.hash = block.compute_hash();
    block.cumulative_pow = 1u128 << block.zero_bits;
    block
}
