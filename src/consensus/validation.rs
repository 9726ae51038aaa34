//! Validation pipeline (C5): pure, read-only rule checks. Each function
//! borrows just enough of Chain State to decide pass/fail and, for
//! transactions, what the resulting effect on state should be — `Chain
//! State` (C4) is the only thing that actually mutates anything, once a
//! validation function here has said it may.

use std::collections::HashSet;

use crate::consensus::constants::{
    MAX_FUTURE_DRIFT_SECS, MIN_REPLY_FEE, MIN_SEND_FEE, MIN_TOPIC_FEE, REGISTRATION_FEE,
    TOPIC_LIFE_TIME, TX_UTC_WINDOW_SECS,
};
use crate::error::ValidationError;
use crate::model::account::is_valid_name;
use crate::model::{Account, AccountId, Block, Hash, Pubkey, Topic, Transaction, TxKind};

/// What a transaction, once validated, should do to the account/topic
/// indices. Built by `validate_tx`, applied by `ChainState::apply_tx_effect`.
#[derive(Debug, Clone)]
pub enum TxEffect {
    Register { name: String, pubkey: Pubkey, referrer: AccountId, fee: u64 },
    Send { from: AccountId, to: AccountId, amount: u64, fee: u64 },
    NewTopic { author: AccountId, key: Hash, reward: u64, fee: u64 },
    Reply {
        topic: Hash,
        replier: AccountId,
        reply_id: Hash,
        reward_to: Option<AccountId>,
        amount: u64,
        fee: u64,
    },
}

/// The minimal read-only view over Chain State that transaction validation
/// needs. Kept as a trait so tests can supply a stub without building a
/// full `ChainState`/`Store` pair.
pub trait AccountTopicView {
    fn account_by_id(&self, id: AccountId) -> Option<&Account>;
    fn account_by_pubkey(&self, pubkey: &Pubkey) -> Option<&Account>;
    fn name_taken(&self, name: &str) -> bool;
    fn topic(&self, key: &Hash) -> Option<&Topic>;
    fn tx_id_seen(&self, id: &Hash) -> bool;
}

/// Validates rules 1–5 of §4.4's block checklist (everything except the
/// per-transaction pass, which is rule 6 and needs the mutable walk in
/// Chain State).
pub fn validate_block_header(
    parent: &Block,
    block: &Block,
    expected_zero_bits: u32,
    now: u64,
) -> Result<(), ValidationError> {
    if parent.hash != block.pre_hash {
        return Err(ValidationError::ParentMismatch);
    }
    if block.id != parent.id + 1 {
        return Err(ValidationError::NonSequentialHeight);
    }
    if block.utc < parent.utc {
        return Err(ValidationError::TimestampRegression);
    }
    if block.utc > now + MAX_FUTURE_DRIFT_SECS {
        return Err(ValidationError::TimestampInFuture);
    }
    if block.zero_bits != expected_zero_bits {
        return Err(ValidationError::WrongDifficulty);
    }
    if block.hash != block.compute_hash() || !block.verify_pow() {
        return Err(ValidationError::PowNotSatisfied);
    }
    if !block.verify_miner_signature() {
        return Err(ValidationError::BadMinerSignature);
    }
    Ok(())
}

/// Validates one transaction against the state after preceding
/// transactions in the same block have already been applied, and returns
/// the effect Chain State should carry out if it accepts the result.
pub fn validate_tx(
    view: &impl AccountTopicView,
    tx: &Transaction,
    block_utc: u64,
    tip_id: u64,
) -> Result<TxEffect, ValidationError> {
    if view.tx_id_seen(&tx.id) {
        return Err(ValidationError::DuplicateTxId);
    }
    if !tx.verify_signature() {
        return Err(ValidationError::BadTxSignature);
    }
    let utc_delta = tx.utc.abs_diff(block_utc);
    if utc_delta > TX_UTC_WINDOW_SECS {
        return Err(ValidationError::StaleTimestamp);
    }

    match &tx.kind {
        TxKind::Register { name, referrer, fee } => {
            validate_register(view, &tx.pubkey, name, *referrer, *fee)
        }
        TxKind::Send { to, amount, fee } => validate_send(view, &tx.pubkey, *to, *amount, *fee),
        TxKind::NewTopic { reward, fee, .. } => {
            validate_new_topic(view, &tx.pubkey, tx.id, *reward, *fee)
        }
        TxKind::Reply { topic_key, fee, reward_to, amount, .. } => {
            validate_reply(view, &tx.pubkey, tx.id, *topic_key, *fee, *reward_to, *amount, tip_id)
        }
    }
}

fn validate_register(
    view: &impl AccountTopicView,
    pubkey: &Pubkey,
    name: &str,
    referrer: AccountId,
    fee: u64,
) -> Result<TxEffect, ValidationError> {
    if !is_valid_name(name) {
        return Err(ValidationError::BadAccountName);
    }
    if view.name_taken(name) {
        return Err(ValidationError::DuplicateName);
    }
    if view.account_by_pubkey(pubkey).is_some() {
        return Err(ValidationError::DuplicatePubkey);
    }
    let referrer_acc = view.account_by_id(referrer).ok_or(ValidationError::UnknownAccount)?;
    if referrer_acc.balance < fee {
        return Err(ValidationError::InsufficientBalance);
    }
    if fee < REGISTRATION_FEE {
        return Err(ValidationError::FeeTooLow);
    }
    Ok(TxEffect::Register { name: name.to_string(), pubkey: *pubkey, referrer, fee })
}

fn validate_send(
    view: &impl AccountTopicView,
    pubkey: &Pubkey,
    to: AccountId,
    amount: u64,
    fee: u64,
) -> Result<TxEffect, ValidationError> {
    let sender = view.account_by_pubkey(pubkey).ok_or(ValidationError::UnknownAccount)?;
    if amount == 0 {
        return Err(ValidationError::NonPositiveAmount);
    }
    if fee < MIN_SEND_FEE {
        return Err(ValidationError::FeeTooLow);
    }
    let total = amount.checked_add(fee).ok_or(ValidationError::InsufficientBalance)?;
    if sender.balance < total {
        return Err(ValidationError::InsufficientBalance);
    }
    if view.account_by_id(to).is_none() {
        return Err(ValidationError::UnknownAccount);
    }
    Ok(TxEffect::Send { from: sender.id, to, amount, fee })
}

fn validate_new_topic(
    view: &impl AccountTopicView,
    pubkey: &Pubkey,
    tx_id: Hash,
    reward: u64,
    fee: u64,
) -> Result<TxEffect, ValidationError> {
    let author = view.account_by_pubkey(pubkey).ok_or(ValidationError::UnknownAccount)?;
    if fee < MIN_TOPIC_FEE {
        return Err(ValidationError::FeeTooLow);
    }
    let total = reward.checked_add(fee).ok_or(ValidationError::InsufficientBalance)?;
    if author.balance < total {
        return Err(ValidationError::InsufficientBalance);
    }
    if view.topic(&tx_id).is_some() {
        return Err(ValidationError::DuplicateTopicKey);
    }
    Ok(TxEffect::NewTopic { author: author.id, key: tx_id, reward, fee })
}

#[allow(clippy::too_many_arguments)]
fn validate_reply(
    view: &impl AccountTopicView,
    pubkey: &Pubkey,
    tx_id: Hash,
    topic_key: Hash,
    fee: u64,
    reward_to: Option<Hash>,
    amount: u64,
    tip_id: u64,
) -> Result<TxEffect, ValidationError> {
    let replier = view.account_by_pubkey(pubkey).ok_or(ValidationError::UnknownAccount)?;
    if fee < MIN_REPLY_FEE {
        return Err(ValidationError::FeeTooLow);
    }
    if replier.balance < fee {
        return Err(ValidationError::InsufficientBalance);
    }
    let topic = view.topic(&topic_key).ok_or(ValidationError::TopicNotFound)?;
    if topic.is_expired_at(tip_id, TOPIC_LIFE_TIME) {
        return Err(ValidationError::TopicExpired);
    }
    let reward_to_account = match reward_to {
        Some(reply_id) => {
            let reply = topic.find_reply(&reply_id).ok_or(ValidationError::UnknownRewardTarget)?;
            if topic.reward < amount {
                return Err(ValidationError::InsufficientTopicPool);
            }
            Some(reply.author)
        }
        None => None,
    };
    Ok(TxEffect::Reply {
        topic: topic_key,
        replier: replier.id,
        reply_id: tx_id,
        reward_to: reward_to_account,
        amount: if reward_to_account.is_some() { amount } else { 0 },
        fee,
    })
}

/// Classification of a validation failure (§4.4), used to decide whether
/// the offending peer is punished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Malformed,
    StateConflict,
    Stale,
}

pub fn classify(err: &ValidationError) -> FailureClass {
    match err {
        ValidationError::StaleTimestamp => FailureClass::Stale,
        ValidationError::InsufficientBalance
        | ValidationError::InsufficientTopicPool
        | ValidationError::DuplicateTxId
        | ValidationError::DuplicateName
        | ValidationError::DuplicatePubkey
        | ValidationError::DuplicateTopicKey
        | ValidationError::TopicExpired
        // A block whose parent isn't our current tip is just as often an
        // honest competing block that lost a timing race as it is an
        // attack — it may become valid after a reorganization, so it is
        // rejected quietly rather than treated as a protocol violation.
        | ValidationError::ParentMismatch
        | ValidationError::NonSequentialHeight => FailureClass::StateConflict,
        _ => FailureClass::Malformed,
    }
}

/// A `HashSet`-backed stand-in implementing `AccountTopicView` purely for
/// unit tests exercising the rule functions in isolation.
#[cfg(test)]
pub(crate) struct TestView {
    pub accounts: Vec<Account>,
    pub topics: Vec<Topic>,
    pub seen_tx_ids: HashSet<Hash>,
}

#[cfg(test)]
impl AccountTopicView for TestView {
    fn account_by_id(&self, id: AccountId) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }
    fn account_by_pubkey(&self, pubkey: &Pubkey) -> Option<&Account> {
        self.accounts.iter().find(|a| &a.pubkey == pubkey)
    }
    fn name_taken(&self, name: &str) -> bool {
        self.accounts.iter().any(|a| a.name == name)
    }
    fn topic(&self, key: &Hash) -> Option<&Topic> {
        self.topics.iter().find(|t| &t.key == key)
    }
    fn tx_id_seen(&self, id: &Hash) -> bool {
        self.seen_tx_ids.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::transaction::TxKind;

    fn signed(sk: &ed25519_dalek::SigningKey, utc: u64, kind: TxKind) -> Transaction {
        Transaction::new_signed(utc, sk, kind)
    }

    #[test]
    fn test_register_requires_funded_referrer() {
        let sk_new = crate::crypto::keys::generate_keypair();
        let referrer = Account::new(1, "genesis_owner".into(), [9u8; 32], 0, 0);
        let view = TestView { accounts: vec![referrer], topics: vec![], seen_tx_ids: HashSet::new() };
        let tx = signed(
            &sk_new,
            1000,
            TxKind::Register { name: "alice".into(), referrer: 1, fee: 1 },
        );
        let err = validate_tx(&view, &tx, 1000, 0).unwrap_err();
        assert_eq!(err, ValidationError::InsufficientBalance);
    }

    #[test]
    fn test_register_success() {
        let sk_new = crate::crypto::keys::generate_keypair();
        let mut referrer = Account::new(1, "genesis_owner".into(), [9u8; 32], 0, 0);
        referrer.balance = 100;
        let view = TestView { accounts: vec![referrer], topics: vec![], seen_tx_ids: HashSet::new() };
        let tx = signed(
            &sk_new,
            1000,
            TxKind::Register { name: "alice".into(), referrer: 1, fee: 1 },
        );
        let effect = validate_tx(&view, &tx, 1000, 0).unwrap();
        assert!(matches!(effect, TxEffect::Register { .. }));
    }

    #[test]
    fn test_send_insufficient_balance() {
        let sk = crate::crypto::keys::generate_keypair();
        let pk = sk.verifying_key().to_bytes();
        let sender = Account::new(1, "alice".into(), pk, 0, 0);
        let receiver = Account::new(2, "bob".into(), [2u8; 32], 0, 0);
        let view = TestView { accounts: vec![sender, receiver], topics: vec![], seen_tx_ids: HashSet::new() };
        let tx = signed(&sk, 1000, TxKind::Send { to: 2, amount: 10, fee: 1 });
        assert_eq!(
            validate_tx(&view, &tx, 1000, 0).unwrap_err(),
            ValidationError::InsufficientBalance
        );
    }

    #[test]
    fn test_send_success() {
        let sk = crate::crypto::keys::generate_keypair();
        let pk = sk.verifying_key().to_bytes();
        let mut sender = Account::new(1, "alice".into(), pk, 0, 0);
        sender.balance = 100;
        let receiver = Account::new(2, "bob".into(), [2u8; 32], 0, 0);
        let view = TestView { accounts: vec![sender, receiver], topics: vec![], seen_tx_ids: HashSet::new() };
        let tx = signed(&sk, 1000, TxKind::Send { to: 2, amount: 10, fee: 1 });
        let effect = validate_tx(&view, &tx, 1000, 0).unwrap();
        match effect {
            TxEffect::Send { from, to, amount, fee } => {
                assert_eq!((from, to, amount, fee), (1, 2, 10, 1));
            }
            _ => panic!("wrong effect"),
        }
    }

    #[test]
    fn test_duplicate_tx_id_rejected() {
        let sk = crate::crypto::keys::generate_keypair();
        let pk = sk.verifying_key().to_bytes();
        let mut sender = Account::new(1, "alice".into(), pk, 0, 0);
        sender.balance = 100;
        let receiver = Account::new(2, "bob".into(), [2u8; 32], 0, 0);
        let tx = signed(&sk, 1000, TxKind::Send { to: 2, amount: 10, fee: 1 });
        let view = TestView {
            accounts: vec![sender, receiver],
            topics: vec![],
            seen_tx_ids: HashSet::from([tx.id]),
        };
        assert_eq!(validate_tx(&view, &tx, 1000, 0).unwrap_err(), ValidationError::DuplicateTxId);
    }

    #[test]
    fn test_reply_topic_expired() {
        let sk = crate::crypto::keys::generate_keypair();
        let pk = sk.verifying_key().to_bytes();
        let mut replier = Account::new(1, "alice".into(), pk, 0, 0);
        replier.balance = 100;
        let topic = Topic::new([7u8; 32], 2, 50, 0);
        let view = TestView { accounts: vec![replier], topics: vec![topic], seen_tx_ids: HashSet::new() };
        let tx = signed(
            &sk,
            1000,
            TxKind::Reply {
                topic_key: [7u8; 32],
                content: "hi".into(),
                fee: 1,
                reward_to: None,
                amount: 0,
            },
        );
        assert_eq!(
            validate_tx(&view, &tx, 1000, TOPIC_LIFE_TIME).unwrap_err(),
            ValidationError::TopicExpired
        );
    }

    #[test]
    fn test_stale_tx_timestamp_rejected() {
        let sk = crate::crypto::keys::generate_keypair();
        let pk = sk.verifying_key().to_bytes();
        let mut sender = Account::new(1, "alice".into(), pk, 0, 0);
        sender.balance = 100;
        let receiver = Account::new(2, "bob".into(), [2u8; 32], 0, 0);
        let view = TestView { accounts: vec![sender, receiver], topics: vec![], seen_tx_ids: HashSet::new() };
        let tx = signed(&sk, 0, TxKind::Send { to: 2, amount: 10, fee: 1 });
        assert_eq!(
            validate_tx(&view, &tx, 1_000_000, 0).unwrap_err(),
            ValidationError::StaleTimestamp
        );
    }
}
