use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{AccountId, BlockId, Hash};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub id: Hash,
    pub author: AccountId,
    pub block_id: BlockId,
}

/// A short-lived discussion thread with an attached reward pool.
/// Exists for exactly `TOPIC_LIFE_TIME` blocks after creation; see
/// `consensus::constants::TOPIC_LIFE_TIME`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub key: Hash,
    pub owner: AccountId,
    pub reward: u64,
    pub block_id: BlockId,
    pub reply_list: Vec<Reply>,
    pub reply_set: HashSet<Hash>,
}

impl Topic {
    pub fn new(key: Hash, owner: AccountId, reward: u64, block_id: BlockId) -> Self {
        Topic { key, owner, reward, block_id, reply_list: Vec::new(), reply_set: HashSet::new() }
    }

    pub fn push_reply(&mut self, reply: Reply) {
        self.reply_set.insert(reply.id);
        self.reply_list.push(reply);
    }

    pub fn find_reply(&self, id: &Hash) -> Option<&Reply> {
        self.reply_list.iter().find(|r| &r.id == id)
    }

    pub fn expires_at(&self, life_time: BlockId) -> BlockId {
        self.block_id + life_time
    }

    pub fn is_expired_at(&self, tip_id: BlockId, life_time: BlockId) -> bool {
        self.expires_at(life_time) <= tip_id
    }
}
