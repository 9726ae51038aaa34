//! Sync protocol (C6): fetching and verifying a foreign chain segment
//! before handing it to `ChainState::switch_chain`. Everything here runs
//! on the dispatcher thread; there is no locking because there is only
//! one writer.

use std::collections::HashMap;

use crate::consensus::constants::{
    BRIEF_CHUNK_SIZE, BRIEF_REQUEST_TIMEOUT_SECS, DETAIL_REQUEST_TIMEOUT_SECS,
};
use crate::model::{Block, Hash};
use crate::net::protocol::ChainBrief;

/// A header-only block a peer has advertised, whose parent we may not yet
/// have. Headers are trusted only as far as the detail phase re-verifies
/// every PoW/signature field on the full body.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub id: u64,
    pub hash: Hash,
}

/// An ordered run of block hashes advertised by one peer, with that
/// peer's claimed cumulative PoW for the tip of the run.
#[derive(Debug, Clone, Default)]
pub struct PendingChain {
    pub headers: Vec<PendingBlock>,
    pub claimed_cumulative_pow: u128,
    pub fork_point: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PendingBriefRequest {
    pub peer: String,
    pub from_hash: Hash,
    pub issued_at_utc: u64,
}

#[derive(Debug, Clone)]
pub struct PendingDetailRequest {
    pub peer: String,
    pub hashes: Vec<Hash>,
    pub issued_at_utc: u64,
    pub received_blocks: HashMap<Hash, Block>,
}

/// Keeps at most one outstanding brief or detail request per peer key
/// (§4.5): concurrent requests across different peers are fine, but a
/// peer that already has a request in flight gets no second one until it
/// resolves or times out.
#[derive(Default)]
pub struct SyncManager {
    brief_requests: HashMap<String, PendingBriefRequest>,
    detail_requests: HashMap<String, PendingDetailRequest>,
    pending_chains: HashMap<String, PendingChain>,
}

pub enum SyncOutcome {
    /// No action needed — advertised tip isn't more difficult than ours.
    NotInteresting,
    /// A brief request should be sent to `peer`.
    IssueBriefRequest { peer: String, from_hash: Hash },
    /// A detail request should be sent to `peer` for the given hashes.
    IssueDetailRequest { peer: String, hashes: Vec<Hash> },
    /// The full suffix has arrived and verified against its headers; ready
    /// for `ChainState::switch_chain`.
    ReadyToSwitch { fork_point: u64, blocks: Vec<Block> },
    /// The peer violated the protocol (bad headers, timeout) and should be
    /// punished.
    PunishPeer { peer: String, reason: &'static str },
}

impl SyncManager {
    pub fn new() -> Self {
        SyncManager::default()
    }

    /// Called when a peer advertises a new tip. `local_most_difficult`
    /// is our own `ChainState::most_difficult_pow()`.
    pub fn on_peer_tip_advertised(
        &mut self,
        peer: &str,
        tip_hash: Hash,
        tip_cumulative_pow: u128,
        local_most_difficult: u128,
    ) -> SyncOutcome {
        if tip_cumulative_pow <= local_most_difficult {
            return SyncOutcome::NotInteresting;
        }
        if self.brief_requests.contains_key(peer) || self.detail_requests.contains_key(peer) {
            return SyncOutcome::NotInteresting;
        }
        self.brief_requests.insert(
            peer.to_string(),
            PendingBriefRequest { peer: peer.to_string(), from_hash: tip_hash, issued_at_utc: 0 },
        );
        SyncOutcome::IssueBriefRequest { peer: peer.to_string(), from_hash: tip_hash }
    }

    /// Re-stamps a just-issued request with the wall-clock time it went
    /// out, so deadlines can be evaluated later.
    pub fn mark_brief_issued(&mut self, peer: &str, now: u64) {
        if let Some(req) = self.brief_requests.get_mut(peer) {
            req.issued_at_utc = now;
        }
    }

    pub fn mark_detail_issued(&mut self, peer: &str, now: u64) {
        if let Some(req) = self.detail_requests.get_mut(peer) {
            req.issued_at_utc = now;
        }
    }

    /// Processes a `CHAIN_BRIEF_RESP`: locates the fork point (the first
    /// header whose predecessor is a block we already know about) and, if
    /// found, moves on to a detail request for the remaining suffix.
    pub fn on_brief_response(
        &mut self,
        peer: &str,
        headers: Vec<ChainBrief>,
        tip_cumulative_pow: u128,
        known_block_ids: &dyn Fn(u64) -> Option<Hash>,
    ) -> SyncOutcome {
        let Some(_req) = self.brief_requests.remove(peer) else {
            return SyncOutcome::PunishPeer { peer: peer.to_string(), reason: "unsolicited brief response" };
        };
        if headers.is_empty() || headers.len() > BRIEF_CHUNK_SIZE {
            return SyncOutcome::PunishPeer { peer: peer.to_string(), reason: "empty or oversized header run" };
        }

        let mut fork_point = None;
        for h in &headers {
            if h.id == 0 {
                continue;
            }
            if let Some(local_hash) = known_block_ids(h.id - 1) {
                let _ = local_hash;
                fork_point = Some(h.id - 1);
                break;
            }
        }
        let Some(fork_point) = fork_point else {
            return SyncOutcome::PunishPeer { peer: peer.to_string(), reason: "no common ancestor in header run" };
        };

        let pending_blocks: Vec<PendingBlock> =
            headers.iter().map(|h| PendingBlock { id: h.id, hash: h.hash }).collect();
        let hashes: Vec<Hash> = pending_blocks.iter().map(|b| b.hash).collect();
        self.pending_chains.insert(
            peer.to_string(),
            PendingChain { headers: pending_blocks, claimed_cumulative_pow: tip_cumulative_pow, fork_point: Some(fork_point) },
        );
        self.detail_requests.insert(
            peer.to_string(),
            PendingDetailRequest {
                peer: peer.to_string(),
                hashes: hashes.clone(),
                issued_at_utc: 0,
                received_blocks: HashMap::new(),
            },
        );
        SyncOutcome::IssueDetailRequest { peer: peer.to_string(), hashes }
    }

    /// Processes a `CHAIN_DETAIL_RESP`. Bodies may arrive incrementally;
    /// once every hash in the outstanding request has a body, the suffix
    /// is ready to hand to `ChainState::switch_chain`.
    pub fn on_detail_response(&mut self, peer: &str, blocks: Vec<Block>) -> SyncOutcome {
        let Some(req) = self.detail_requests.get_mut(peer) else {
            return SyncOutcome::PunishPeer { peer: peer.to_string(), reason: "unsolicited detail response" };
        };
        for block in blocks {
            if req.hashes.contains(&block.hash) {
                req.received_blocks.insert(block.hash, block);
            }
        }
        if req.received_blocks.len() < req.hashes.len() {
            return SyncOutcome::NotInteresting;
        }

        let Some(chain) = self.pending_chains.remove(peer) else {
            return SyncOutcome::PunishPeer { peer: peer.to_string(), reason: "detail response with no pending chain" };
        };
        let req = self.detail_requests.remove(peer).expect("checked above");
        let fork_point = chain.fork_point.expect("set when the brief response resolved");

        let mut ordered = Vec::with_capacity(req.hashes.len());
        for hash in &req.hashes {
            match req.received_blocks.get(hash) {
                Some(b) => ordered.push(b.clone()),
                None => {
                    return SyncOutcome::PunishPeer { peer: peer.to_string(), reason: "missing body for advertised header" };
                }
            }
        }
        SyncOutcome::ReadyToSwitch { fork_point, blocks: ordered }
    }

    /// Evaluated by the dispatcher's timer on every tick. Returns the
    /// peers whose outstanding request has exceeded its deadline.
    pub fn expire_stale_requests(&mut self, now: u64) -> Vec<String> {
        let mut punished = Vec::new();
        self.brief_requests.retain(|peer, req| {
            let expired = req.issued_at_utc != 0 && now.saturating_sub(req.issued_at_utc) > BRIEF_REQUEST_TIMEOUT_SECS;
            if expired {
                punished.push(peer.clone());
            }
            !expired
        });
        self.detail_requests.retain(|peer, req| {
            let expired = req.issued_at_utc != 0 && now.saturating_sub(req.issued_at_utc) > DETAIL_REQUEST_TIMEOUT_SECS;
            if expired {
                punished.push(peer.clone());
            }
            !expired
        });
        self.pending_chains.retain(|peer, _| !punished.contains(peer));
        punished
    }
}
