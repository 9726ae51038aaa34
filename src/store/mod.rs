//! Persistent store facade (C2): an ordered key/value store with atomic
//! batched writes. Follows the reference repo's RocksDB-backed `ChainDB`
//! (tuned `Options`, a `WriteBatch` per commit) but with the flatter key
//! space named directly in the persisted layout (§6) rather than one
//! column family per entity type.

use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rocksdb::{Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StateError;
use crate::model::{Account, AccountId, Block, Hash, Topic};

const KEY_CHILD_PREFIX: &str = "child:";
const KEY_BLOCK_PREFIX: &str = "block:";
const KEY_ACCOUNT_PREFIX: &str = "account:";
const KEY_TOPIC_PREFIX: &str = "topic:";
const KEY_CUR_BLOCK: &str = "meta:cur_block";

/// Hash-keyed records (blocks, children, topics) key on the Base64 text of
/// the hash rather than its raw bytes, per the persisted layout (§6).
fn hash_key(prefix: &str, hash: &Hash) -> Vec<u8> {
    let mut k = prefix.as_bytes().to_vec();
    k.extend_from_slice(STANDARD.encode(hash).as_bytes());
    k
}

fn block_key(hash: &Hash) -> Vec<u8> {
    hash_key(KEY_BLOCK_PREFIX, hash)
}

fn child_key(parent_hash: &Hash) -> Vec<u8> {
    hash_key(KEY_CHILD_PREFIX, parent_hash)
}

fn account_key(id: AccountId) -> Vec<u8> {
    let mut k = KEY_ACCOUNT_PREFIX.as_bytes().to_vec();
    k.extend_from_slice(&id.to_be_bytes());
    k
}

fn topic_key(key: &Hash) -> Vec<u8> {
    hash_key(KEY_TOPIC_PREFIX, key)
}

fn encode<T: Serialize>(v: &T) -> Vec<u8> {
    serde_json::to_vec(v).expect("in-memory types always serialize")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StateError> {
    serde_json::from_slice(bytes).map_err(|_| StateError::Corruption("malformed record"))
}

/// A single atomic commit: the store never observes a partially-applied
/// tip transition.
pub struct Store {
    db: Arc<DB>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let cache = rocksdb::Cache::new_lru_cache(256 * 1024 * 1024);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);
        let db = DB::open(&opts, path)?;
        Ok(Store { db: Arc::new(db) })
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, StateError> {
        match self.db.get(block_key(hash))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_children(&self, parent_hash: &Hash) -> Result<Vec<Hash>, StateError> {
        match self.db.get(child_key(parent_hash))? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_account(&self, id: AccountId) -> Result<Option<Account>, StateError> {
        match self.db.get(account_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_topic(&self, key: &Hash) -> Result<Option<Topic>, StateError> {
        match self.db.get(topic_key(key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_tip(&self) -> Result<Option<Hash>, StateError> {
        match self.db.get(KEY_CUR_BLOCK)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                Ok(Some(h))
            }
            Some(_) => Err(StateError::Corruption("meta:cur_block has wrong length")),
            None => Ok(None),
        }
    }

    /// Every account currently persisted, for rebuilding the in-memory
    /// multi-index structures at startup.
    pub fn iter_accounts(&self) -> Result<Vec<Account>, StateError> {
        let prefix = KEY_ACCOUNT_PREFIX.as_bytes();
        let mut out = Vec::new();
        let iter = self.db.prefix_iterator(prefix);
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push(decode(&v)?);
        }
        Ok(out)
    }

    pub fn new_batch(&self) -> StoreBatch {
        StoreBatch { batch: WriteBatch::default() }
    }

    pub fn commit(&self, batch: StoreBatch) -> Result<(), StateError> {
        self.db.write(batch.batch)?;
        Ok(())
    }
}

/// A staged set of writes, committed atomically by `Store::commit`. Chain
/// State builds one of these per `apply`/`rollback`/`switch_chain` step and
/// commits it only once every in-memory mutation for that step has already
/// succeeded, so a crash mid-commit never leaves the tip pointing at a
/// block whose effects weren't durably recorded.
pub struct StoreBatch {
    batch: WriteBatch,
}

impl StoreBatch {
    pub fn put_block(&mut self, block: &Block) {
        self.batch.put(block_key(&block.hash), encode(block));
    }

    pub fn put_children(&mut self, parent_hash: &Hash, children: &[Hash]) {
        self.batch.put(child_key(parent_hash), encode(&children.to_vec()));
    }

    pub fn put_account(&mut self, account: &Account) {
        self.batch.put(account_key(account.id), encode(account));
    }

    pub fn delete_topic(&mut self, key: &Hash) {
        self.batch.delete(topic_key(key));
    }

    pub fn put_topic(&mut self, topic: &Topic) {
        self.batch.put(topic_key(&topic.key), encode(topic));
    }

    pub fn set_tip(&mut self, hash: &Hash) {
        self.batch.put(KEY_CUR_BLOCK, hash);
    }
}
