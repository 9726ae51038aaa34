//! Crate-wide error taxonomy (C13), following the four-way split in the
//! node's error handling design: protocol, validation, transient, state.

use thiserror::Error;

/// A malformed message or an incompatible peer. The sender is punished and
/// the message is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("incompatible protocol version: local {local}, peer {peer}")]
    VersionMismatch { local: u32, peer: u32 },
    #[error("frame exceeds maximum size")]
    FrameTooLarge,
}

/// A block or transaction broke a consensus rule (§4.4). Whether the peer
/// is punished depends on whether it asserted the data as its own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("parent hash mismatch")]
    ParentMismatch,
    #[error("block id is not parent id + 1")]
    NonSequentialHeight,
    #[error("block timestamp precedes parent")]
    TimestampRegression,
    #[error("block timestamp too far in the future")]
    TimestampInFuture,
    #[error("zero_bits does not match expected difficulty")]
    WrongDifficulty,
    #[error("proof of work does not satisfy zero_bits")]
    PowNotSatisfied,
    #[error("miner signature does not verify")]
    BadMinerSignature,
    #[error("transaction signature does not verify")]
    BadTxSignature,
    #[error("transaction id already present in chain history")]
    DuplicateTxId,
    #[error("account name already registered")]
    DuplicateName,
    #[error("account pubkey already registered")]
    DuplicatePubkey,
    #[error("account name has invalid charset or length")]
    BadAccountName,
    #[error("unknown account")]
    UnknownAccount,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("amount must be greater than zero")]
    NonPositiveAmount,
    #[error("topic key already used")]
    DuplicateTopicKey,
    #[error("topic not found")]
    TopicNotFound,
    #[error("topic has expired")]
    TopicExpired,
    #[error("reward target is not a reply in this topic")]
    UnknownRewardTarget,
    #[error("topic reward pool too small for award")]
    InsufficientTopicPool,
    #[error("fee too low")]
    FeeTooLow,
    #[error("transaction utc outside the ±24h window of its block")]
    StaleTimestamp,
}

/// A condition that may resolve itself given time or another peer; never a
/// reason to treat local state as suspect.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("queue is full, drop and let the sender retry")]
    QueueFull,
    #[error("no peer available to retry against")]
    NoPeerAvailable,
}

/// Anything that leaves Chain State's invariants in doubt. Per the error
/// handling design these are fatal: the node refuses to continue.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("rollback target {0} is not an ancestor of the current tip")]
    RollbackNotAncestor(u64),
    #[error("undo log exhausted before reaching rollback target")]
    UndoLogExhausted,
    #[error("persistence failure: {0}")]
    Persistence(#[from] rocksdb::Error),
    #[error("store corruption: {0}")]
    Corruption(&'static str),
}

/// Stable numeric reason codes returned to client-interface callers, per
/// the external interfaces section of the error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum ClientReasonCode {
    Ok = 0,
    UnknownAccount = 1,
    InsufficientBalance = 2,
    DuplicateName = 3,
    InvalidSignature = 4,
    TopicExpired = 5,
    TopicNotFound = 6,
    FeeTooLow = 7,
    NodeNotSynced = 8,
}

impl From<&ValidationError> for ClientReasonCode {
    fn from(e: &ValidationError) -> Self {
        match e {
            ValidationError::UnknownAccount => ClientReasonCode::UnknownAccount,
            ValidationError::InsufficientBalance | ValidationError::InsufficientTopicPool => {
                ClientReasonCode::InsufficientBalance
            }
            ValidationError::DuplicateName => ClientReasonCode::DuplicateName,
            ValidationError::BadTxSignature => ClientReasonCode::InvalidSignature,
            ValidationError::TopicExpired => ClientReasonCode::TopicExpired,
            ValidationError::TopicNotFound => ClientReasonCode::TopicNotFound,
            ValidationError::FeeTooLow => ClientReasonCode::FeeTooLow,
            _ => ClientReasonCode::UnknownAccount,
        }
    }
}
