//! Mining loop (C7): runs on its own thread, reading an immutable tip
//! snapshot and a candidate transaction list, searching for a nonce that
//! satisfies the target difficulty. Never touches Chain State directly —
//! a mined block is submitted back through the dispatcher's peer-message
//! queue exactly like one that arrived from a peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};

use ed25519_dalek::SigningKey;

use crate::consensus::TipSnapshot;
use crate::crypto;
use crate::model::{Block, Transaction};

/// Shared control surface between the dispatcher and the miner thread.
/// `need_remine` is set whenever the tip advances underneath an
/// in-progress attempt; `enable_mine` gates whether the miner searches at
/// all. Neither requires the miner to busy-wait: disabled mining parks on
/// the condvar, and a stale attempt notices `need_remine` between nonce
/// batches and restarts from a fresh snapshot.
pub struct MiningSignal {
    pub need_remine: AtomicBool,
    pub enable_mine: Mutex<bool>,
    pub enable_cv: Condvar,
}

impl Default for MiningSignal {
    fn default() -> Self {
        MiningSignal {
            need_remine: AtomicBool::new(false),
            enable_mine: Mutex::new(false),
            enable_cv: Condvar::new(),
        }
    }
}

impl MiningSignal {
    pub fn request_remine(&self) {
        self.need_remine.store(true, Ordering::SeqCst);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut guard = self.enable_mine.lock().expect("mining signal mutex poisoned");
        *guard = enabled;
        if enabled {
            self.enable_cv.notify_all();
        }
    }

    fn wait_until_enabled(&self) {
        let guard = self.enable_mine.lock().expect("mining signal mutex poisoned");
        let _unused = self
            .enable_cv
            .wait_while(guard, |enabled| !*enabled)
            .expect("mining signal mutex poisoned");
    }

    fn is_enabled(&self) -> bool {
        *self.enable_mine.lock().expect("mining signal mutex poisoned")
    }
}

/// Whatever the dispatcher hands the miner to try next: a tip to build on
/// and the transactions it may include, already deduplicated/ordered by
/// arrival.
#[derive(Clone)]
pub struct MiningJob {
    pub tip: TipSnapshot,
    pub candidate_txs: Vec<Transaction>,
}

/// Cross-thread mailbox for the current job: the dispatcher (T1) is the
/// sole writer, publishing a fresh job after every state change that could
/// affect what a miner should build on; the miner thread (T2) only reads.
#[derive(Default)]
pub struct JobBoard(Mutex<Option<MiningJob>>);

impl JobBoard {
    pub fn publish(&self, job: MiningJob) {
        *self.0.lock().expect("job board mutex poisoned") = Some(job);
    }

    /// Returns a clone of whatever job is currently posted, if any. Reading
    /// does not consume it: the miner may poll the same job again after an
    /// abandoned search if nothing newer has been published since.
    pub fn current(&self) -> Option<MiningJob> {
        self.0.lock().expect("job board mutex poisoned").clone()
    }
}

const NONCE_BATCH: u64 = 50_000;

/// Assembles a candidate block on top of `job.tip` and searches nonces
/// until either a solution is found, `signal.need_remine` is raised, or
/// mining is disabled mid-search. Returns `None` if the search was
/// abandoned rather than completed.
pub fn mine_one(job: &MiningJob, miner_key: &SigningKey, signal: &MiningSignal, now: u64) -> Option<Block> {
    if !signal.is_enabled() {
        signal.wait_until_enabled();
    }
    signal.need_remine.store(false, Ordering::SeqCst);

    let miner_pubkey = miner_key.verifying_key().to_bytes();
    let mut nonce: u64 = 0;
    loop {
        for _ in 0..NONCE_BATCH {
            let mut block = Block {
                id: job.tip.id + 1,
                hash: [0u8; 32],
                pre_hash: job.tip.hash,
                utc: now,
                version: crate::consensus::constants::PROTOCOL_VERSION,
                zero_bits: job.tip.expected_zero_bits,
                miner_pubkey,
                nonce,
                tx_list: job.candidate_txs.clone(),
                miner_sign: [0u8; 64],
                cumulative_pow: 0,
            };
            block.hash = block.compute_hash();
            if block.verify_pow() {
                block.miner_sign = crypto::sign(miner_key, &block.hash);
                return Some(block);
            }
            nonce = nonce.wrapping_add(1);
        }
        if signal.need_remine.load(Ordering::SeqCst) || !signal.is_enabled() {
            return None;
        }
    }
}

/// The miner thread's outer loop: fetches a fresh job via `next_job`,
/// mines it, and submits any solution to `submit`. `next_job` returning
/// `None` means there is nothing to mine yet (e.g. node still syncing);
/// the thread then waits briefly rather than spinning.
pub fn run_miner_loop(
    miner_key: SigningKey,
    signal: Arc<MiningSignal>,
    next_job: impl Fn() -> Option<MiningJob>,
    submit: Sender<Block>,
    now_fn: impl Fn() -> u64,
    should_stop: impl Fn() -> bool,
) {
    while !should_stop() {
        if !signal.is_enabled() {
            signal.wait_until_enabled();
            continue;
        }
        let Some(job) = next_job() else {
            std::thread::sleep(std::time::Duration::from_millis(200));
            continue;
        };
        if let Some(block) = mine_one(&job, &miner_key, &signal, now_fn()) {
            let _ = submit.send(block);
        }
    }
}
