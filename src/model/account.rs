use serde::{Deserialize, Serialize};

use super::{AccountId, BlockId, Hash, Pubkey};

/// Minimum and maximum length, in bytes, of an account name (§3).
pub const NAME_MIN_LEN: usize = 1;
pub const NAME_MAX_LEN: usize = 20;

/// An event in an account's activity log. Kept append-only so a client can
/// reconstruct an activity feed without replaying the whole chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEntry {
    Registered { block_id: BlockId },
    SendOut { block_id: BlockId, to: AccountId, amount: u64 },
    SendIn { block_id: BlockId, from: AccountId, amount: u64 },
    TopicLocked { block_id: BlockId, topic_key: Hash, reward: u64 },
    TopicRefunded { block_id: BlockId, topic_key: Hash, amount: u64 },
    ReplyPosted { block_id: BlockId, topic_key: Hash },
    AwardReceived { block_id: BlockId, topic_key: Hash, amount: u64 },
    MinerReward { block_id: BlockId, amount: u64 },
}

/// An account entry. Immutable except for `balance` and `history`, both of
/// which are mutated only through `Chain State`'s journaled apply/rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub pubkey: Pubkey,
    pub avatar: u16,
    pub balance: u64,
    pub reg_block_id: BlockId,
    pub history: Vec<HistoryEntry>,
}

impl Account {
    pub fn new(id: AccountId, name: String, pubkey: Pubkey, avatar: u16, reg_block_id: BlockId) -> Self {
        Account {
            id,
            name,
            pubkey,
            avatar,
            balance: 0,
            reg_block_id,
            history: vec![HistoryEntry::Registered { block_id: reg_block_id }],
        }
    }
}

/// Printable-ASCII subset used for account names: everything from `!`
/// (0x21) to `~` (0x7e), i.e. no whitespace or control characters.
pub fn is_valid_name(name: &str) -> bool {
    let len = name.len();
    if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
        return false;
    }
    name.bytes().all(|b| (0x21..=0x7e).contains(&b))
}
