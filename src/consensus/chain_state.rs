//! Chain State (C4): the authoritative in-memory indices plus the
//! apply/rollback/switch_chain algorithms. Owned exclusively by the
//! dispatcher thread; every other component sees only narrow handles
//! (a tip snapshot, a read-only account lookup) never this struct itself.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::consensus::constants::{block_reward, TOPIC_LIFE_TIME};
use crate::consensus::difficulty::expected_zero_bits;
use crate::consensus::genesis::create_genesis_block;
use crate::consensus::validation::{
    validate_block_header, validate_tx, AccountTopicView, TxEffect,
};
use crate::error::{StateError, ValidationError};
use crate::model::{Account, AccountId, Block, Hash, HistoryEntry, Pubkey, Topic, Transaction};
use crate::store::Store;

/// One inverse operation, pushed on `apply`/mutation and popped in reverse
/// order by `rollback` (§9 rollback journaling).
#[derive(Debug, Clone)]
enum UndoOp {
    AccountCreated(AccountId),
    BalanceDelta { account: AccountId, delta: i128 },
    TopicCreated(Hash),
    TopicRewardDelta { topic: Hash, delta: i128 },
    ReplyAdded { topic: Hash, reply_id: Hash },
    TopicRestored(Topic),
    TopicRemoved(Hash),
    TxIdInserted(Hash),
    /// An entry was appended to `account`'s history log; undone by popping
    /// it back off (safe because history pushes and their undos nest in
    /// the same LIFO order as every other undo op).
    HistoryAppended(AccountId),
}

/// A read-only snapshot of the tip, handed to the mining thread. Cheap to
/// clone: it carries only what a miner needs to assemble a candidate
/// header, not the whole index set.
#[derive(Debug, Clone)]
pub struct TipSnapshot {
    pub id: u64,
    pub hash: Hash,
    pub utc: u64,
    pub expected_zero_bits: u32,
}

pub struct ChainState {
    store: Store,

    blocks: HashMap<Hash, Block>,
    children: HashMap<Hash, Vec<Hash>>,
    active_chain: BTreeMap<u64, Hash>,

    cur_block_hash: Hash,
    most_difficult: (Hash, u128),

    accounts_by_id: HashMap<AccountId, Account>,
    accounts_by_pubkey: HashMap<Pubkey, AccountId>,
    accounts_by_name: HashMap<String, AccountId>,
    accounts_by_rich: BTreeSet<(u64, AccountId)>,
    next_account_id: AccountId,

    topics: HashMap<Hash, Topic>,
    topics_by_expiry: BTreeMap<u64, HashSet<Hash>>,

    tx_id_index: HashSet<Hash>,

    undo_log: BTreeMap<u64, Vec<UndoOp>>,
}

impl ChainState {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let store = Store::open(path)?;
        let mut state = ChainState {
            store,
            blocks: HashMap::new(),
            children: HashMap::new(),
            active_chain: BTreeMap::new(),
            cur_block_hash: [0u8; 32],
            most_difficult: ([0u8; 32], 0),
            accounts_by_id: HashMap::new(),
            accounts_by_pubkey: HashMap::new(),
            accounts_by_name: HashMap::new(),
            accounts_by_rich: BTreeSet::new(),
            next_account_id: 1,
            topics: HashMap::new(),
            topics_by_expiry: BTreeMap::new(),
            tx_id_index: HashSet::new(),
            undo_log: BTreeMap::new(),
        };

        match state.store.get_tip()? {
            Some(_) => state.load_from_store()?,
            None => state.apply_genesis()?,
        }
        Ok(state)
    }

    fn apply_genesis(&mut self) -> Result<(), StateError> {
        let genesis = create_genesis_block();
        self.index_block(genesis.clone());
        self.active_chain.insert(genesis.id, genesis.hash);
        self.cur_block_hash = genesis.hash;
        self.most_difficult = (genesis.hash, genesis.cumulative_pow);

        let mut batch = self.store.new_batch();
        batch.put_block(&genesis);
        batch.set_tip(&genesis.hash);
        self.store.commit(batch)?;
        Ok(())
    }

    /// Rebuilds every in-memory index from the persisted record set. Only
    /// the active-chain path and the accounts are reconstructed this way;
    /// side branches are not retained across restarts, matching the
    /// reference's own behaviour of only ever walking the chain it has a
    /// tip for.
    fn load_from_store(&mut self) -> Result<(), StateError> {
        let tip_hash = self.store.get_tip()?.expect("checked by caller");
        let mut chain = Vec::new();
        let mut cursor = tip_hash;
        loop {
            let block =
                self.store.get_block(&cursor)?.ok_or(StateError::Corruption("missing block"))?;
            let parent = block.pre_hash;
            let is_genesis = block.id == 0;
            chain.push(block);
            if is_genesis {
                break;
            }
            cursor = parent;
        }
        chain.reverse();

        for account in self.store.iter_accounts()? {
            self.accounts_by_pubkey.insert(account.pubkey, account.id);
            self.accounts_by_name.insert(account.name.clone(), account.id);
            self.accounts_by_rich.insert((account.balance, account.id));
            self.next_account_id = self.next_account_id.max(account.id + 1);
            self.accounts_by_id.insert(account.id, account);
        }

        for block in chain {
            self.active_chain.insert(block.id, block.hash);
            for tx in &block.tx_list {
                self.tx_id_index.insert(tx.id);
            }
            self.most_difficult = (block.hash, block.cumulative_pow);
            self.cur_block_hash = block.hash;
            self.index_block(block);
        }
        Ok(())
    }

    /// Idempotent: re-indexing an already-known block (as happens when
    /// `switch_chain` restores a suffix it had to roll back) must not
    /// duplicate its entry in the parent's child list.
    fn index_block(&mut self, block: Block) {
        let hash = block.hash;
        let parent = block.pre_hash;
        let siblings = self.children.entry(parent).or_default();
        if !siblings.contains(&hash) {
            siblings.push(hash);
        }
        self.blocks.insert(hash, block);
    }

    pub fn tip(&self) -> &Block {
        self.blocks.get(&self.cur_block_hash).expect("tip always indexed")
    }

    pub fn tip_snapshot(&self) -> TipSnapshot {
        let tip = self.tip();
        TipSnapshot {
            id: tip.id,
            hash: tip.hash,
            utc: tip.utc,
            expected_zero_bits: self.next_expected_zero_bits(),
        }
    }

    pub fn most_difficult_pow(&self) -> u128 {
        self.most_difficult.1
    }

    pub fn tx_already_applied(&self, id: &Hash) -> bool {
        self.tx_id_index.contains(id)
    }

    /// The hash of the active-chain block at `height`, if any — used by
    /// the sync component to locate a fork point in a peer's header run.
    pub fn block_hash_at(&self, height: u64) -> Option<Hash> {
        self.active_chain.get(&height).copied()
    }

    /// Walks the active chain forward from just after `from_hash` (or from
    /// genesis if `from_hash` is unknown), returning up to `chunk_size`
    /// headers for a brief response.
    pub fn brief_headers_from(&self, from_hash: Hash, chunk_size: usize) -> Vec<crate::net::protocol::ChainBrief> {
        let start_id = self.blocks.get(&from_hash).map(|b| b.id + 1).unwrap_or(0);
        let mut out = Vec::with_capacity(chunk_size);
        for (id, hash) in self.active_chain.range(start_id..) {
            if out.len() >= chunk_size {
                break;
            }
            out.push(crate::net::protocol::ChainBrief { id: *id, hash: *hash });
        }
        out
    }

    /// Full bodies for a detail response, in the order requested.
    pub fn blocks_for(&self, hashes: &[Hash]) -> Vec<Block> {
        hashes.iter().filter_map(|h| self.blocks.get(h).cloned()).collect()
    }

    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.accounts_by_id.get(&id)
    }

    pub fn account_by_name(&self, name: &str) -> Option<&Account> {
        self.accounts_by_name.get(name).and_then(|id| self.accounts_by_id.get(id))
    }

    pub fn topic(&self, key: &Hash) -> Option<&Topic> {
        self.topics.get(key)
    }

    pub fn richest_accounts(&self, n: usize) -> Vec<&Account> {
        self.accounts_by_rich
            .iter()
            .rev()
            .take(n)
            .filter_map(|(_, id)| self.accounts_by_id.get(id))
            .collect()
    }

    fn next_expected_zero_bits(&self) -> u32 {
        let tip = self.tip();
        let window_actual = if tip.id > 0 && tip.id.is_multiple_of(super::constants::RETARGET_PERIOD) {
            self.window_actual_secs(tip.id)
        } else {
            None
        };
        expected_zero_bits(tip.id + 1, tip.zero_bits, window_actual)
    }

    fn window_actual_secs(&self, height: u64) -> Option<u64> {
        let period = super::constants::RETARGET_PERIOD;
        if height < period {
            return None;
        }
        let start_hash = self.active_chain.get(&(height - period))?;
        let start = self.blocks.get(start_hash)?;
        let end_hash = self.active_chain.get(&height)?;
        let end = self.blocks.get(end_hash)?;
        Some(end.utc.saturating_sub(start.utc).max(1))
    }

    /// Applies `block` on top of the current tip: validates it (§4.4),
    /// mutates every index, journals the inverse operations, and commits
    /// one atomic store batch.
    pub fn apply(&mut self, mut block: Block, now: u64) -> Result<(), ValidationError> {
        let parent = self.tip().clone();
        let expected_zb = self.next_expected_zero_bits();
        validate_block_header(&parent, &block, expected_zb, now)?;

        let mut undo = Vec::new();
        let mut fees_collected: u128 = 0;

        for tx in block.tx_list.clone() {
            let effect = validate_tx(self, &tx, block.utc, parent.id)?;
            fees_collected += self.apply_tx_effect(&effect, block.id, &mut undo) as u128;
            self.tx_id_index.insert(tx.id);
            undo.push(UndoOp::TxIdInserted(tx.id));
        }

        let reward = block_reward(block.id) as u128 + fees_collected;
        let miner_id = self.ensure_miner_account(&block.miner_pubkey, block.id, &mut undo);
        self.credit(miner_id, reward as u64, &mut undo);
        self.push_history(
            miner_id,
            HistoryEntry::MinerReward { block_id: block.id, amount: reward as u64 },
            &mut undo,
        );

        self.expire_topics(block.id, &mut undo);

        block.cumulative_pow = parent.cumulative_pow + (1u128 << block.zero_bits);

        self.undo_log.insert(block.id, undo);
        self.active_chain.insert(block.id, block.hash);
        self.cur_block_hash = block.hash;
        if block.cumulative_pow > self.most_difficult.1 {
            self.most_difficult = (block.hash, block.cumulative_pow);
        }

        let pre_hash = block.pre_hash;
        self.index_block(block.clone());

        let mut batch = self.store.new_batch();
        batch.put_block(&block);
        batch.put_children(&pre_hash, &self.children[&pre_hash]);
        batch.set_tip(&block.hash);
        for id in self.touched_accounts(&self.undo_log[&block.id]) {
            if let Some(acc) = self.accounts_by_id.get(&id) {
                batch.put_account(acc);
            }
        }
        for key in self.touched_topics(&self.undo_log[&block.id]) {
            match self.topics.get(&key) {
                Some(topic) => batch.put_topic(topic),
                None => batch.delete_topic(&key),
            }
        }
        let block_id_for_panic = block.id;
        self.store.commit(batch).unwrap_or_else(|e| {
            panic!("store commit failed applying block {block_id_for_panic}: {e}")
        });

        Ok(())
    }

    fn touched_accounts(&self, undo: &[UndoOp]) -> Vec<AccountId> {
        let mut ids = Vec::new();
        for op in undo {
            match op {
                UndoOp::AccountCreated(id) | UndoOp::BalanceDelta { account: id, .. } => {
                    if !ids.contains(id) {
                        ids.push(*id);
                    }
                }
                _ => {}
            }
        }
        ids
    }

    fn touched_topics(&self, undo: &[UndoOp]) -> Vec<Hash> {
        let mut keys = Vec::new();
        for op in undo {
            let key = match op {
                UndoOp::TopicCreated(k) => Some(*k),
                UndoOp::TopicRewardDelta { topic, .. } => Some(*topic),
                UndoOp::ReplyAdded { topic, .. } => Some(*topic),
                UndoOp::TopicRemoved(k) => Some(*k),
                UndoOp::TopicRestored(t) => Some(t.key),
                _ => None,
            };
            if let Some(k) = key
                && !keys.contains(&k)
            {
                keys.push(k);
            }
        }
        keys
    }

    fn ensure_miner_account(&mut self, pubkey: &Pubkey, block_id: u64, undo: &mut Vec<UndoOp>) -> AccountId {
        if let Some(id) = self.accounts_by_pubkey.get(pubkey) {
            return *id;
        }
        // A miner with no registered account yet is paid into an
        // auto-created account keyed by its pubkey, named after its id.
        let id = self.next_account_id;
        self.next_account_id += 1;
        let name = format!("miner_{id}");
        let account = Account::new(id, name.clone(), *pubkey, 0, block_id);
        self.accounts_by_id.insert(id, account);
        self.accounts_by_pubkey.insert(*pubkey, id);
        self.accounts_by_name.insert(name, id);
        self.accounts_by_rich.insert((0, id));
        undo.push(UndoOp::AccountCreated(id));
        id
    }

    /// Applies one transaction's effect, returning the fee it paid (to be
    /// accumulated into the block's miner reward).
    fn apply_tx_effect(&mut self, effect: &TxEffect, block_id: u64, undo: &mut Vec<UndoOp>) -> u64 {
        match effect {
            TxEffect::Register { name, pubkey, referrer, fee } => {
                let id = self.next_account_id;
                self.next_account_id += 1;
                let account = Account::new(id, name.clone(), *pubkey, 0, block_id);
                self.accounts_by_id.insert(id, account);
                self.accounts_by_pubkey.insert(*pubkey, id);
                self.accounts_by_name.insert(name.clone(), id);
                self.accounts_by_rich.insert((0, id));
                undo.push(UndoOp::AccountCreated(id));
                self.debit(*referrer, *fee, undo);
                *fee
            }
            TxEffect::Send { from, to, amount, fee } => {
                self.debit(*from, amount + fee, undo);
                self.push_history(*from, HistoryEntry::SendOut { block_id, to: *to, amount: *amount }, undo);
                self.credit(*to, *amount, undo);
                self.push_history(*to, HistoryEntry::SendIn { block_id, from: *from, amount: *amount }, undo);
                *fee
            }
            TxEffect::NewTopic { author, key, reward, fee } => {
                self.debit(*author, reward + fee, undo);
                self.push_history(
                    *author,
                    HistoryEntry::TopicLocked { block_id, topic_key: *key, reward: *reward },
                    undo,
                );
                let topic = Topic::new(*key, *author, *reward, block_id);
                self.topics.insert(*key, topic);
                self.topics_by_expiry.entry(block_id + TOPIC_LIFE_TIME).or_default().insert(*key);
                undo.push(UndoOp::TopicCreated(*key));
                *fee
            }
            TxEffect::Reply { topic, replier, reply_id, reward_to, amount, fee } => {
                self.debit(*replier, *fee, undo);
                self.push_history(*replier, HistoryEntry::ReplyPosted { block_id, topic_key: *topic }, undo);
                if let Some(to) = reward_to {
                    let t = self.topics.get_mut(topic).expect("validated to exist");
                    t.reward -= amount;
                    undo.push(UndoOp::TopicRewardDelta { topic: *topic, delta: -(*amount as i128) });
                    self.credit(*to, *amount, undo);
                    self.push_history(
                        *to,
                        HistoryEntry::AwardReceived { block_id, topic_key: *topic, amount: *amount },
                        undo,
                    );
                }
                let t = self.topics.get_mut(topic).expect("validated to exist");
                t.push_reply(crate::model::topic::Reply {
                    id: *reply_id,
                    author: *replier,
                    block_id,
                });
                undo.push(UndoOp::ReplyAdded { topic: *topic, reply_id: *reply_id });
                *fee
            }
        }
    }

    fn push_history(&mut self, id: AccountId, entry: HistoryEntry, undo: &mut Vec<UndoOp>) {
        let acc = self.accounts_by_id.get_mut(&id).expect("account must exist to log history");
        acc.history.push(entry);
        undo.push(UndoOp::HistoryAppended(id));
    }

    fn debit(&mut self, id: AccountId, amount: u64, undo: &mut Vec<UndoOp>) {
        self.adjust_balance(id, -(amount as i128), undo);
    }

    fn credit(&mut self, id: AccountId, amount: u64, undo: &mut Vec<UndoOp>) {
        self.adjust_balance(id, amount as i128, undo);
    }

    fn adjust_balance(&mut self, id: AccountId, delta: i128, undo: &mut Vec<UndoOp>) {
        let acc = self.accounts_by_id.get_mut(&id).expect("account must exist to adjust balance");
        let old_balance = acc.balance;
        let new_balance = (old_balance as i128 + delta).max(0) as u64;
        acc.balance = new_balance;
        self.accounts_by_rich.remove(&(old_balance, id));
        self.accounts_by_rich.insert((new_balance, id));
        undo.push(UndoOp::BalanceDelta { account: id, delta });
    }

    fn expire_topics(&mut self, cur_block_id: u64, undo: &mut Vec<UndoOp>) -> u64 {
        let mut refunded = 0u64;
        let due: Vec<u64> = self
            .topics_by_expiry
            .range(..=cur_block_id)
            .map(|(id, _)| *id)
            .collect();
        for expiry in due {
            let Some(keys) = self.topics_by_expiry.remove(&expiry) else { continue };
            for key in keys {
                if let Some(topic) = self.topics.remove(&key) {
                    if topic.reward > 0 {
                        self.credit(topic.owner, topic.reward, undo);
                        self.push_history(
                            topic.owner,
                            HistoryEntry::TopicRefunded { block_id: cur_block_id, topic_key: key, amount: topic.reward },
                            undo,
                        );
                        refunded += topic.reward;
                    }
                    undo.push(UndoOp::TopicRemoved(key));
                    undo.push(UndoOp::TopicRestored(topic));
                }
            }
        }
        refunded
    }

    /// Reverts the tip back to height `target_id`, undoing tx effects in
    /// reverse order and restoring any topic that re-enters life because
    /// its expiring block is being rolled back past.
    pub fn rollback(&mut self, target_id: u64) -> Result<(), StateError> {
        if target_id > self.tip().id {
            return Err(StateError::RollbackNotAncestor(target_id));
        }
        while self.tip().id > target_id {
            let cur = self.tip().id;
            let undo =
                self.undo_log.remove(&cur).ok_or(StateError::UndoLogExhausted)?;
            for op in undo.into_iter().rev() {
                self.undo_one(op);
            }
            let block = self.tip().clone();
            self.active_chain.remove(&cur);
            let parent_hash = block.pre_hash;
            if self.most_difficult.0 == block.hash {
                // fall back to whatever the active chain now points at
                let parent = self.blocks.get(&parent_hash).expect("parent indexed");
                self.most_difficult = (parent.hash, parent.cumulative_pow);
            }
            self.cur_block_hash = parent_hash;
        }

        let mut batch = self.store.new_batch();
        batch.set_tip(&self.cur_block_hash);
        for acc in self.accounts_by_id.values() {
            batch.put_account(acc);
        }
        for topic in self.topics.values() {
            batch.put_topic(topic);
        }
        self.store.commit(batch)?;
        Ok(())
    }

    fn undo_one(&mut self, op: UndoOp) {
        match op {
            UndoOp::AccountCreated(id) => {
                if let Some(acc) = self.accounts_by_id.remove(&id) {
                    self.accounts_by_pubkey.remove(&acc.pubkey);
                    self.accounts_by_name.remove(&acc.name);
                    self.accounts_by_rich.remove(&(acc.balance, id));
                }
                self.next_account_id = self.next_account_id.min(id);
            }
            UndoOp::BalanceDelta { account, delta } => {
                if let Some(acc) = self.accounts_by_id.get_mut(&account) {
                    let old = acc.balance;
                    let restored = (old as i128 - delta).max(0) as u64;
                    acc.balance = restored;
                    self.accounts_by_rich.remove(&(old, account));
                    self.accounts_by_rich.insert((restored, account));
                }
            }
            UndoOp::TopicCreated(key) => {
                self.topics.remove(&key);
            }
            UndoOp::TopicRewardDelta { topic, delta } => {
                if let Some(t) = self.topics.get_mut(&topic) {
                    t.reward = (t.reward as i128 - delta).max(0) as u64;
                }
            }
            UndoOp::ReplyAdded { topic, reply_id } => {
                if let Some(t) = self.topics.get_mut(&topic) {
                    t.reply_list.retain(|r| r.id != reply_id);
                    t.reply_set.remove(&reply_id);
                }
            }
            UndoOp::TopicRemoved(key) => {
                // Paired with a following `TopicRestored`; nothing to do on
                // its own, the restore reinserts the full topic.
                let _ = key;
            }
            UndoOp::TopicRestored(topic) => {
                let expiry = topic.block_id + TOPIC_LIFE_TIME;
                self.topics_by_expiry.entry(expiry).or_default().insert(topic.key);
                self.topics.insert(topic.key, topic);
            }
            UndoOp::TxIdInserted(id) => {
                self.tx_id_index.remove(&id);
            }
            UndoOp::HistoryAppended(account) => {
                if let Some(acc) = self.accounts_by_id.get_mut(&account) {
                    acc.history.pop();
                }
            }
        }
    }

    /// Replaces the active chain's suffix above the fork point with
    /// `suffix`, a contiguous, already-header-validated run of blocks.
    /// Requires the resulting tip's cumulative PoW to strictly exceed what
    /// the original tip had (§4.3/§8.3) — a peer whose claimed PoW doesn't
    /// hold up once recomputed locally is rejected rather than trusted. On
    /// any failure, the original suffix — still in the undo log — is
    /// re-applied and the id of the highest successfully restored block is
    /// returned. On success, also returns any transaction exclusive to the
    /// rolled-back suffix that isn't present in the new chain, so the
    /// caller can re-enqueue it as unverified (§8.2).
    pub fn switch_chain(
        &mut self,
        fork_point: u64,
        suffix: Vec<Block>,
        now: u64,
    ) -> Result<(u64, Vec<Transaction>), u64> {
        let original_tip_id = self.tip().id;
        let original_most_difficult_pow = self.most_difficult_pow();
        let mut original_suffix_hashes = Vec::new();
        let mut orphaned_candidates = Vec::new();
        for id in (fork_point + 1)..=original_tip_id {
            if let Some(hash) = self.active_chain.get(&id) {
                original_suffix_hashes.push(*hash);
                if let Some(block) = self.blocks.get(hash) {
                    orphaned_candidates.extend(block.tx_list.clone());
                }
            }
        }

        if self.rollback(fork_point).is_err() {
            return Err(original_tip_id);
        }

        for block in suffix {
            if self.apply(block, now).is_err() {
                // restore the original suffix from the blocks map (still
                // present; only the index pointers were rolled back).
                self.restore_original_suffix(fork_point, &original_suffix_hashes, now);
                return Err(self.tip().id);
            }
        }

        if self.most_difficult_pow() <= original_most_difficult_pow {
            self.restore_original_suffix(fork_point, &original_suffix_hashes, now);
            return Err(self.tip().id);
        }

        let orphaned_txs: Vec<Transaction> = orphaned_candidates
            .into_iter()
            .filter(|tx| !self.tx_id_index.contains(&tx.id))
            .collect();
        Ok((self.tip().id, orphaned_txs))
    }

    fn restore_original_suffix(&mut self, fork_point: u64, hashes: &[Hash], now: u64) {
        // the failed attempt may have applied part (or all) of the
        // candidate suffix on top of `fork_point`; undo that first so the
        // original blocks re-apply onto the same parent they did before.
        if self.tip().id > fork_point {
            let _ = self.rollback(fork_point);
        }
        for hash in hashes {
            let Some(block) = self.blocks.get(hash).cloned() else { break };
            if self.apply(block, now).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining::{mine_one, MiningJob, MiningSignal};
    use crate::model::{Transaction, TxKind};
    use ed25519_dalek::SigningKey;
    use std::sync::atomic::{AtomicU64, Ordering};

    static CTR: AtomicU64 = AtomicU64::new(0);

    fn tmp_state() -> ChainState {
        let id = CTR.fetch_add(1, Ordering::SeqCst);
        let p = std::path::PathBuf::from(format!(
            "/tmp/forumcoin_chain_state_{}_{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&p);
        ChainState::open(&p).unwrap()
    }

    fn mine_on(tip: TipSnapshot, miner_key: &SigningKey, txs: Vec<Transaction>, now: u64) -> Block {
        let signal = MiningSignal::default();
        signal.set_enabled(true);
        let job = MiningJob { tip, candidate_txs: txs };
        mine_one(&job, miner_key, &signal, now).expect("mining at genesis difficulty should succeed quickly")
    }

    fn mine_next(state: &ChainState, miner_key: &SigningKey, txs: Vec<Transaction>, now: u64) -> Block {
        mine_on(state.tip_snapshot(), miner_key, txs, now)
    }

    fn snapshot_of(block: &Block) -> TipSnapshot {
        TipSnapshot { id: block.id, hash: block.hash, utc: block.utc, expected_zero_bits: block.zero_bits }
    }

    #[test]
    fn test_apply_genesis_sets_tip_at_height_zero() {
        let state = tmp_state();
        assert_eq!(state.tip().id, 0);
        assert_eq!(state.most_difficult_pow(), state.tip().cumulative_pow);
    }

    #[test]
    fn test_apply_block_pays_miner_reward() {
        let mut state = tmp_state();
        let miner_key = crate::crypto::keys::generate_keypair();
        let block = mine_next(&state, &miner_key, vec![], 2_000_000_000);
        state.apply(block, 2_000_000_000).unwrap();
        let miner_pubkey = miner_key.verifying_key().to_bytes();
        let miner_id = *state.accounts_by_pubkey.get(&miner_pubkey).unwrap();
        let miner = state.account(miner_id).unwrap();
        assert_eq!(miner.balance, super::super::constants::block_reward(1));
    }

    /// Scenario: register two accounts through a funded referrer, then have
    /// that referrer send funds to one of them. The new account's own
    /// balance is untouched by registering it; conservation holds overall.
    #[test]
    fn test_register_then_send_flow() {
        let mut state = tmp_state();
        let now = 2_000_000_000;

        let miner_key = crate::crypto::keys::generate_keypair();
        let b1 = mine_next(&state, &miner_key, vec![], now);
        state.apply(b1, now).unwrap();
        let miner_pubkey = miner_key.verifying_key().to_bytes();
        let miner_id = *state.accounts_by_pubkey.get(&miner_pubkey).unwrap();

        let alice_key = crate::crypto::keys::generate_keypair();
        let bob_key = crate::crypto::keys::generate_keypair();
        let register_alice = Transaction::new_signed(
            now,
            &alice_key,
            TxKind::Register { name: "alice".into(), referrer: miner_id, fee: 1 },
        );
        let register_bob = Transaction::new_signed(
            now,
            &bob_key,
            TxKind::Register { name: "bob".into(), referrer: miner_id, fee: 1 },
        );
        let b2 = mine_next(&state, &miner_key, vec![register_alice, register_bob], now);
        state.apply(b2, now).unwrap();

        let alice_id = *state.accounts_by_name.get("alice").unwrap();
        let bob_id = *state.accounts_by_name.get("bob").unwrap();
        assert_eq!(state.account(alice_id).unwrap().balance, 0);

        let send_to_bob =
            Transaction::new_signed(now, &miner_key, TxKind::Send { to: bob_id, amount: 10, fee: 1 });
        let b3 = mine_next(&state, &miner_key, vec![send_to_bob], now);
        state.apply(b3, now).unwrap();

        assert_eq!(state.account(alice_id).unwrap().balance, 0);
        assert_eq!(state.account(bob_id).unwrap().balance, 10);

        let total_emitted: u128 = (1..=3).map(|h| super::super::constants::block_reward(h) as u128).sum();
        let total_balances: u128 = state.accounts_by_id.values().map(|a| a.balance as u128).sum();
        assert_eq!(total_balances, total_emitted);
    }

    #[test]
    fn test_overdraw_tx_rejected_tip_unchanged() {
        let mut state = tmp_state();
        let now = 2_000_000_000;
        let miner_key = crate::crypto::keys::generate_keypair();
        let b1 = mine_next(&state, &miner_key, vec![], now);
        state.apply(b1, now).unwrap();
        let miner_pubkey = miner_key.verifying_key().to_bytes();
        let miner_id = *state.accounts_by_pubkey.get(&miner_pubkey).unwrap();

        let poor_key = crate::crypto::keys::generate_keypair();
        let register_poor = Transaction::new_signed(
            now,
            &poor_key,
            TxKind::Register { name: "poor".into(), referrer: miner_id, fee: 1 },
        );
        let b2 = mine_next(&state, &miner_key, vec![register_poor], now);
        state.apply(b2, now).unwrap();

        let before_id = state.tip().id;
        let before_pow = state.most_difficult_pow();

        let overdraw =
            Transaction::new_signed(now, &poor_key, TxKind::Send { to: miner_id, amount: 1_000_000, fee: 1 });
        let bad_block = mine_next(&state, &miner_key, vec![overdraw], now);
        let err = state.apply(bad_block, now).unwrap_err();
        assert_eq!(err, ValidationError::InsufficientBalance);
        assert_eq!(state.tip().id, before_id);
        assert_eq!(state.most_difficult_pow(), before_pow);
    }

    #[test]
    fn test_rollback_then_reapply_matches_original_state() {
        let mut state = tmp_state();
        let now = 2_000_000_000;
        let miner_key = crate::crypto::keys::generate_keypair();
        let block = mine_next(&state, &miner_key, vec![], now);
        state.apply(block.clone(), now).unwrap();

        let accounts_before: Vec<_> = {
            let mut v: Vec<_> = state.accounts_by_id.values().cloned().collect();
            v.sort_by_key(|a| a.id);
            v
        };
        let tip_before = state.tip().clone();

        state.rollback(0).unwrap();
        assert_eq!(state.tip().id, 0);

        state.apply(block, now).unwrap();
        let accounts_after: Vec<_> = {
            let mut v: Vec<_> = state.accounts_by_id.values().cloned().collect();
            v.sort_by_key(|a| a.id);
            v
        };
        assert_eq!(accounts_before, accounts_after);
        assert_eq!(tip_before, *state.tip());
    }

    #[test]
    fn test_duplicate_tx_id_rejected_across_blocks() {
        let mut state = tmp_state();
        let now = 2_000_000_000;
        let miner_key = crate::crypto::keys::generate_keypair();
        let b1 = mine_next(&state, &miner_key, vec![], now);
        state.apply(b1, now).unwrap();

        let miner_pubkey = miner_key.verifying_key().to_bytes();
        let miner_id = *state.accounts_by_pubkey.get(&miner_pubkey).unwrap();
        let funded_send =
            Transaction::new_signed(now, &miner_key, TxKind::Send { to: miner_id, amount: 1, fee: 1 });
        let b2 = mine_next(&state, &miner_key, vec![funded_send.clone()], now);
        state.apply(b2, now).unwrap();

        let b3 = mine_next(&state, &miner_key, vec![funded_send], now);
        let err = state.apply(b3, now).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateTxId);
    }

    #[test]
    fn test_switch_chain_adopts_higher_cumulative_pow_branch() {
        let mut state = tmp_state();
        let now = 2_000_000_000;
        let miner_a = crate::crypto::keys::generate_keypair();
        let miner_b = crate::crypto::keys::generate_keypair();

        let b1 = mine_next(&state, &miner_a, vec![], now);
        state.apply(b1.clone(), now).unwrap();
        let snap_after_b1 = snapshot_of(&b1);

        let b2 = mine_on(snap_after_b1.clone(), &miner_a, vec![], now + 1);
        state.apply(b2, now + 1).unwrap();
        let original_tip = state.tip().clone();
        let original_pow = state.most_difficult_pow();

        // the alt branch is one block longer than the original, so at the
        // same per-block difficulty its cumulative PoW ends up higher.
        let alt_b2 = mine_on(snap_after_b1, &miner_b, vec![], now + 1);
        let alt_b3 = mine_on(snapshot_of(&alt_b2), &miner_b, vec![], now + 2);
        let expected_tip_hash = alt_b3.hash;

        let result = state.switch_chain(1, vec![alt_b2, alt_b3], now + 2);
        assert_eq!(result, Ok((3, vec![])));
        assert_eq!(state.tip().hash, expected_tip_hash);
        assert!(state.most_difficult_pow() > original_pow);
        assert!(state.blocks.contains_key(&original_tip.hash));
    }

    /// §8.2: a transaction exclusive to the rolled-back suffix reappears as
    /// unverified once the competing branch wins, provided it isn't also
    /// carried by the new suffix.
    #[test]
    fn test_switch_chain_returns_orphaned_transaction_from_old_suffix() {
        let mut state = tmp_state();
        let now = 2_000_000_000;
        let miner_a = crate::crypto::keys::generate_keypair();
        let miner_b = crate::crypto::keys::generate_keypair();

        let b1 = mine_next(&state, &miner_a, vec![], now);
        state.apply(b1.clone(), now).unwrap();
        let miner_a_pubkey = miner_a.verifying_key().to_bytes();
        let miner_a_id = *state.accounts_by_pubkey.get(&miner_a_pubkey).unwrap();
        let snap_after_b1 = snapshot_of(&b1);

        let orphaned_tx = Transaction::new_signed(
            now,
            &miner_a,
            TxKind::Send { to: miner_a_id, amount: 1, fee: 1 },
        );
        let b2 = mine_on(snap_after_b1.clone(), &miner_a, vec![orphaned_tx.clone()], now + 1);
        state.apply(b2, now + 1).unwrap();

        let alt_b2 = mine_on(snap_after_b1, &miner_b, vec![], now + 1);
        let alt_b3 = mine_on(snapshot_of(&alt_b2), &miner_b, vec![], now + 2);

        let (tip_id, orphaned_txs) = state.switch_chain(1, vec![alt_b2, alt_b3], now + 2).unwrap();
        assert_eq!(tip_id, 3);
        assert_eq!(orphaned_txs, vec![orphaned_tx]);
    }

    /// §3's per-account activity feed: a send appends `SendOut`/`SendIn` to
    /// sender/receiver, and the block reward appends `MinerReward` to the
    /// miner, beyond the `Registered` entry seeded at account creation.
    #[test]
    fn test_send_and_reward_append_history_entries() {
        let mut state = tmp_state();
        let now = 2_000_000_000;
        let miner_key = crate::crypto::keys::generate_keypair();
        let b1 = mine_next(&state, &miner_key, vec![], now);
        state.apply(b1, now).unwrap();
        let miner_pubkey = miner_key.verifying_key().to_bytes();
        let miner_id = *state.accounts_by_pubkey.get(&miner_pubkey).unwrap();
        assert_eq!(
            state.account(miner_id).unwrap().history,
            vec![HistoryEntry::MinerReward { block_id: 1, amount: super::super::constants::block_reward(1) }]
        );

        let bob_key = crate::crypto::keys::generate_keypair();
        let register_bob = Transaction::new_signed(
            now,
            &bob_key,
            TxKind::Register { name: "bob".into(), referrer: miner_id, fee: 1 },
        );
        let b2 = mine_next(&state, &miner_key, vec![register_bob], now);
        state.apply(b2, now).unwrap();
        let bob_id = *state.accounts_by_name.get("bob").unwrap();

        let send_to_bob =
            Transaction::new_signed(now, &miner_key, TxKind::Send { to: bob_id, amount: 10, fee: 1 });
        let b3 = mine_next(&state, &miner_key, vec![send_to_bob], now);
        state.apply(b3, now).unwrap();

        assert!(state
            .account(miner_id)
            .unwrap()
            .history
            .contains(&HistoryEntry::SendOut { block_id: 3, to: bob_id, amount: 10 }));
        assert_eq!(
            state.account(bob_id).unwrap().history,
            vec![
                HistoryEntry::Registered { block_id: 2 },
                HistoryEntry::SendIn { block_id: 3, from: miner_id, amount: 10 },
            ]
        );
    }

    #[test]
    fn test_expire_topics_refunds_owner() {
        let mut state = tmp_state();
        let now = 2_000_000_000;
        let miner_key = crate::crypto::keys::generate_keypair();
        let b1 = mine_next(&state, &miner_key, vec![], now);
        state.apply(b1, now).unwrap();
        let miner_pubkey = miner_key.verifying_key().to_bytes();
        let miner_id = *state.accounts_by_pubkey.get(&miner_pubkey).unwrap();

        let topic_key = [42u8; 32];
        let topic = Topic::new(topic_key, miner_id, 100, 1);
        state.topics.insert(topic_key, topic);
        state.topics_by_expiry.entry(1 + super::super::constants::TOPIC_LIFE_TIME).or_default().insert(topic_key);

        let balance_before = state.account(miner_id).unwrap().balance;
        let mut undo = Vec::new();
        let refunded = state.expire_topics(1 + super::super::constants::TOPIC_LIFE_TIME, &mut undo);
        assert_eq!(refunded, 100);
        assert_eq!(state.account(miner_id).unwrap().balance, balance_before + 100);
        assert!(state.topic(&topic_key).is_none());
    }
}

impl AccountTopicView for ChainState {
    fn account_by_id(&self, id: AccountId) -> Option<&Account> {
        self.accounts_by_id.get(&id)
    }
    fn account_by_pubkey(&self, pubkey: &Pubkey) -> Option<&Account> {
        self.accounts_by_pubkey.get(pubkey).and_then(|id| self.accounts_by_id.get(id))
    }
    fn name_taken(&self, name: &str) -> bool {
        self.accounts_by_name.contains_key(name)
    }
    fn topic(&self, key: &Hash) -> Option<&Topic> {
        self.topics.get(key)
    }
    fn tx_id_seen(&self, id: &Hash) -> bool {
        self.tx_id_index.contains(id)
    }
}
