//! Data model (C3): accounts, blocks, topics and transactions, plus the
//! invariants each carries. Types here know nothing about persistence,
//! validation rules or chain selection — those live in `store` and
//! `consensus`.

pub mod account;
pub mod block;
pub mod topic;
pub mod transaction;

pub use account::{Account, HistoryEntry};
pub use block::Block;
pub use topic::{Reply, Topic};
pub use transaction::{Transaction, TxKind};

pub type AccountId = u64;
pub type BlockId = u64;
pub type Hash = [u8; 32];
pub type Pubkey = [u8; 32];
pub type Signature = [u8; 64];
