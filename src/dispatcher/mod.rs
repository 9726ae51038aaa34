//! Message/command dispatcher (C8): the single-writer event loop. Every
//! mutation to Chain State happens here and only here — peer messages,
//! client requests, mined blocks and operator commands all funnel through
//! three bounded queues that this loop drains in round-robin.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::consensus::validation::classify;
use crate::consensus::ChainState;
use crate::error::ClientReasonCode;
use crate::mining::{JobBoard, MiningJob};
use crate::model::{Block, Transaction};
use crate::net::protocol::PeerMessage;
use crate::sync::{SyncManager, SyncOutcome};

#[derive(Debug, Clone)]
pub struct MergePoint {
    pub peer_addr: String,
    pub since_block_id: u64,
}

#[derive(Debug, Clone)]
pub struct ExchangeAccount {
    pub account_id: u64,
    pub note: String,
}

/// The operator/command-queue surface (§6 "Command interface").
#[derive(Debug, Clone)]
pub enum Command {
    Stop,
    EnableMine,
    DisableMine,
    SetMergePoint(MergePoint),
    SetExchangeAccount(ExchangeAccount),
}

/// What the client-facing websocket translates wallet requests into.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Register { name: String, referrer: u64, fee: u64, pubkey: crate::model::Pubkey, sign_payload: Transaction },
    Send { tx: Transaction },
    QueryBalance { account_id: u64 },
    NewTopic { tx: Transaction },
    Reply { tx: Transaction },
    SubscribeAccount { account_id: u64 },
}

#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub ok: bool,
    pub reason: Option<ClientReasonCode>,
    pub balance: Option<u64>,
}

pub enum DispatchMessage {
    Peer { peer: String, message: PeerMessage },
    Client { request: ClientRequest, respond_to: std::sync::mpsc::Sender<ClientResponse> },
    Command(Command),
    MinedBlock(Block),
    /// Fired by the dispatcher's own timer on a regular cadence so
    /// `proc_topic_expired` and sync-request deadline checks happen even
    /// when no message arrives.
    Tick { now: u64 },
}

/// Punishes a peer by whatever bookkeeping the transport layer maintains;
/// narrow interface so the dispatcher doesn't need to know about
/// reputation scoring internals.
pub trait PeerPunisher {
    fn punish(&mut self, peer: &str, reason: &str);
    fn broadcast(&mut self, message: PeerMessage);
    fn send_to(&mut self, peer: &str, message: PeerMessage);
}

pub struct Dispatcher<P: PeerPunisher> {
    pub state: ChainState,
    pub sync: SyncManager,
    pub mining_signal: std::sync::Arc<crate::mining::MiningSignal>,
    pub job_board: std::sync::Arc<JobBoard>,
    pub shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
    pub unverified_txs: Vec<Transaction>,
    pub peers: P,
}

impl<P: PeerPunisher> Dispatcher<P> {
    pub fn new(
        state: ChainState,
        peers: P,
        mining_signal: std::sync::Arc<crate::mining::MiningSignal>,
        job_board: std::sync::Arc<JobBoard>,
        shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Dispatcher {
            state,
            sync: SyncManager::new(),
            mining_signal,
            job_board,
            shutdown,
            unverified_txs: Vec::new(),
            peers,
        }
    }

    /// Publishes the current tip and pending transactions as the next
    /// mining job. Called after anything that changes either.
    fn refresh_job_board(&self) {
        self.job_board.publish(MiningJob {
            tip: self.state.tip_snapshot(),
            candidate_txs: self.unverified_txs.clone(),
        });
    }

    /// Drains `inbox` until `Command::Stop` or the channel closes. Blocks
    /// with a timeout so the periodic `Tick` can fire even when no real
    /// message arrives for a while.
    pub fn run(&mut self, inbox: &Receiver<DispatchMessage>, now_fn: impl Fn() -> u64) {
        self.refresh_job_board();
        loop {
            match inbox.recv_timeout(Duration::from_secs(1)) {
                Ok(msg) => {
                    if !self.handle(msg, &now_fn) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.handle(DispatchMessage::Tick { now: now_fn() }, &now_fn);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Returns `false` to signal the loop should stop.
    fn handle(&mut self, msg: DispatchMessage, now_fn: &impl Fn() -> u64) -> bool {
        match msg {
            DispatchMessage::Command(Command::Stop) => {
                self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
                self.mining_signal.set_enabled(false);
                return false;
            }
            DispatchMessage::Command(Command::EnableMine) => self.mining_signal.set_enabled(true),
            DispatchMessage::Command(Command::DisableMine) => self.mining_signal.set_enabled(false),
            DispatchMessage::Command(Command::SetMergePoint(_)) => {
                // Operator hint only; no consensus rule attaches to it.
            }
            DispatchMessage::Command(Command::SetExchangeAccount(ea)) => {
                if self.state.account(ea.account_id).is_none() {
                    // account must exist; otherwise this is a silent no-op
                }
            }
            DispatchMessage::MinedBlock(block) => self.accept_block("self", block, now_fn()),
            DispatchMessage::Peer { peer, message } => self.handle_peer_message(peer, message, now_fn()),
            DispatchMessage::Client { request, respond_to } => {
                let response = self.handle_client_request(request, now_fn());
                let _ = respond_to.send(response);
            }
            DispatchMessage::Tick { now } => self.on_tick(now),
        }
        true
    }

    fn on_tick(&mut self, now: u64) {
        for peer in self.sync.expire_stale_requests(now) {
            self.peers.punish(&peer, "sync request deadline exceeded");
        }
    }

    fn handle_peer_message(&mut self, peer: String, message: PeerMessage, now: u64) {
        if !crate::net::protocol::version_compatible(
            crate::consensus::constants::PROTOCOL_VERSION,
            message.version(),
        ) {
            self.peers.punish(&peer, "incompatible protocol version");
            return;
        }
        match message {
            PeerMessage::BlockBroadcast { block, .. } => self.accept_block(&peer, block, now),
            PeerMessage::TxBroadcast { tx, .. } => self.accept_tx(&peer, tx),
            PeerMessage::Ping { .. } => self.peers.send_to(&peer, PeerMessage::pong()),
            PeerMessage::Pong { .. } => {}
            PeerMessage::ChainBriefReq { from_hash, chunk_size, .. } => {
                self.respond_brief(&peer, from_hash, chunk_size as usize);
            }
            PeerMessage::ChainBriefResp { tip_cumulative_pow, headers, .. } => {
                let outcome = {
                    let state = &self.state;
                    self.sync.on_brief_response(&peer, headers, tip_cumulative_pow, &|id| {
                        state.block_hash_at(id)
                    })
                };
                self.apply_sync_outcome(outcome, now);
            }
            PeerMessage::ChainDetailReq { hashes, .. } => self.respond_detail(&peer, hashes),
            PeerMessage::ChainDetailResp { blocks, .. } => {
                let outcome = self.sync.on_detail_response(&peer, blocks);
                self.apply_sync_outcome(outcome, now);
            }
        }
    }

    fn apply_sync_outcome(&mut self, outcome: SyncOutcome, now: u64) {
        match outcome {
            SyncOutcome::NotInteresting => {}
            SyncOutcome::IssueBriefRequest { peer, from_hash } => {
                self.sync.mark_brief_issued(&peer, now);
                self.peers.send_to(
                    &peer,
                    PeerMessage::ChainBriefReq {
                        version: crate::consensus::constants::PROTOCOL_VERSION,
                        from_hash,
                        chunk_size: crate::consensus::constants::BRIEF_CHUNK_SIZE as u32,
                    },
                );
            }
            SyncOutcome::IssueDetailRequest { peer, hashes } => {
                self.sync.mark_detail_issued(&peer, now);
                self.peers.send_to(
                    &peer,
                    PeerMessage::ChainDetailReq { version: crate::consensus::constants::PROTOCOL_VERSION, hashes },
                );
            }
            SyncOutcome::ReadyToSwitch { fork_point, blocks } => {
                if let Ok((_, orphaned_txs)) = self.state.switch_chain(fork_point, blocks, now) {
                    for tx in orphaned_txs {
                        if !self.unverified_txs.iter().any(|t| t.id == tx.id) {
                            self.unverified_txs.push(tx);
                        }
                    }
                    self.mining_signal.request_remine();
                    self.refresh_job_board();
                }
            }
            SyncOutcome::PunishPeer { peer, reason } => self.peers.punish(&peer, reason),
        }
    }

    fn accept_block(&mut self, source: &str, block: Block, now: u64) {
        let cumulative_before = self.state.most_difficult_pow();
        let advertised_hash = block.hash;
        let advertised_pow = block.cumulative_pow;
        match self.state.apply(block, now) {
            Ok(()) => {
                self.mining_signal.request_remine();
                self.unverified_txs.retain(|tx| !self.state.tx_already_applied(&tx.id));
                self.refresh_job_board();
            }
            Err(e) => {
                if self.state.most_difficult_pow() == cumulative_before {
                    let class = classify(&e);
                    match class {
                        crate::consensus::validation::FailureClass::Malformed => {
                            self.peers.punish(source, "block failed validation");
                        }
                        // A parent we don't have, or a height that doesn't
                        // follow our tip, is exactly the shape of "this peer
                        // is ahead of us on a branch we haven't fetched" —
                        // kick off the brief/detail sync protocol (§4.5)
                        // rather than silently dropping the block. A
                        // self-mined block has no peer to sync from.
                        crate::consensus::validation::FailureClass::StateConflict if source != "self" => {
                            let outcome = self.sync.on_peer_tip_advertised(
                                source,
                                advertised_hash,
                                advertised_pow,
                                cumulative_before,
                            );
                            self.apply_sync_outcome(outcome, now);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn accept_tx(&mut self, source: &str, tx: Transaction) {
        if self.unverified_txs.iter().any(|t| t.id == tx.id) {
            return;
        }
        if !tx.verify_signature() {
            self.peers.punish(source, "transaction signature does not verify");
            return;
        }
        self.unverified_txs.push(tx);
        self.refresh_job_board();
    }

    fn respond_brief(&mut self, peer: &str, from_hash: crate::model::Hash, chunk_size: usize) {
        let headers = self.state.brief_headers_from(from_hash, chunk_size.min(crate::consensus::constants::BRIEF_CHUNK_SIZE));
        self.peers.send_to(
            peer,
            PeerMessage::ChainBriefResp {
                version: crate::consensus::constants::PROTOCOL_VERSION,
                tip_cumulative_pow: self.state.most_difficult_pow(),
                headers,
            },
        );
    }

    fn respond_detail(&mut self, peer: &str, hashes: Vec<crate::model::Hash>) {
        let blocks = self.state.blocks_for(&hashes);
        self.peers.send_to(
            peer,
            PeerMessage::ChainDetailResp { version: crate::consensus::constants::PROTOCOL_VERSION, blocks },
        );
    }

    fn handle_client_request(&mut self, request: ClientRequest, now: u64) -> ClientResponse {
        match request {
            ClientRequest::QueryBalance { account_id } => match self.state.account(account_id) {
                Some(acc) => ClientResponse { ok: true, reason: None, balance: Some(acc.balance) },
                None => ClientResponse { ok: false, reason: Some(ClientReasonCode::UnknownAccount), balance: None },
            },
            ClientRequest::Register { sign_payload, .. }
            | ClientRequest::Send { tx: sign_payload }
            | ClientRequest::NewTopic { tx: sign_payload }
            | ClientRequest::Reply { tx: sign_payload } => {
                self.accept_tx("client", sign_payload);
                let _ = now;
                ClientResponse { ok: true, reason: None, balance: None }
            }
            ClientRequest::SubscribeAccount { account_id } => match self.state.account(account_id) {
                Some(acc) => ClientResponse { ok: true, reason: None, balance: Some(acc.balance) },
                None => ClientResponse { ok: false, reason: Some(ClientReasonCode::UnknownAccount), balance: None },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ChainState, TipSnapshot};
    use crate::mining::{mine_one, MiningSignal};
    use crate::model::TxKind;
    use ed25519_dalek::SigningKey;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    static CTR: AtomicU64 = AtomicU64::new(0);

    #[derive(Default)]
    struct RecordingPeers {
        punished: Vec<(String, String)>,
    }

    impl PeerPunisher for RecordingPeers {
        fn punish(&mut self, peer: &str, reason: &str) {
            self.punished.push((peer.to_string(), reason.to_string()));
        }
        fn broadcast(&mut self, _message: PeerMessage) {}
        fn send_to(&mut self, _peer: &str, _message: PeerMessage) {}
    }

    fn tmp_state() -> ChainState {
        let id = CTR.fetch_add(1, AtomicOrdering::SeqCst);
        let p = std::path::PathBuf::from(format!("/tmp/forumcoin_dispatcher_{}_{}", std::process::id(), id));
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

    fn new_dispatcher(state: ChainState) -> Dispatcher<RecordingPeers> {
        Dispatcher::new(
            state,
            RecordingPeers::default(),
            Arc::new(crate::mining::MiningSignal::default()),
            Arc::new(JobBoard::default()),
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
        )
    }

    /// Scenario: a block that overdraws its sender is rejected and the
    /// source that broadcast it is punished; the tip does not move.
    #[test]
    fn test_malformed_block_punishes_source_tip_unchanged() {
        let state = tmp_state();
        let now = 2_000_000_000;
        let miner_key = crate::crypto::keys::generate_keypair();
        let mut dispatcher = new_dispatcher(state);

        let b1 = mine_next(&dispatcher.state, &miner_key, vec![], now);
        dispatcher.accept_block("self", b1, now);
        assert!(dispatcher.peers.punished.is_empty());

        let miner_id = dispatcher.state.richest_accounts(1)[0].id;

        let before_tip = dispatcher.state.tip().hash;
        let before_pow = dispatcher.state.most_difficult_pow();

        let overdraw = Transaction::new_signed(
            now,
            &miner_key,
            TxKind::Send { to: miner_id, amount: u64::MAX, fee: 1 },
        );
        let bad_block = mine_next(&dispatcher.state, &miner_key, vec![overdraw], now);
        dispatcher.accept_block("bad_peer", bad_block, now);

        assert_eq!(dispatcher.state.tip().hash, before_tip);
        assert_eq!(dispatcher.state.most_difficult_pow(), before_pow);
        assert_eq!(dispatcher.peers.punished.len(), 1);
        assert_eq!(dispatcher.peers.punished[0].0, "bad_peer");
    }

    /// Scenario: the local miner's block loses a timing race against an
    /// equally valid sibling that reached the dispatcher first. The earlier
    /// block stays the tip and the sibling's source is not punished, since
    /// losing a race is not a protocol violation.
    #[test]
    fn test_sibling_block_not_punished_tip_keeps_first_arrival() {
        let state = tmp_state();
        let now = 2_000_000_000;
        let miner_key = crate::crypto::keys::generate_keypair();
        let rival_key = crate::crypto::keys::generate_keypair();
        let mut dispatcher = new_dispatcher(state);

        let genesis_tip = dispatcher.state.tip_snapshot();
        let first = mine_on(genesis_tip.clone(), &miner_key, vec![], now);
        let second = mine_on(genesis_tip, &rival_key, vec![], now);

        dispatcher.accept_block("peer_a", first.clone(), now);
        let tip_after_first = dispatcher.state.tip().hash;
        let pow_after_first = dispatcher.state.most_difficult_pow();
        assert_eq!(tip_after_first, first.hash);

        dispatcher.accept_block("peer_b", second, now);

        assert_eq!(dispatcher.state.tip().hash, tip_after_first);
        assert_eq!(dispatcher.state.most_difficult_pow(), pow_after_first);
        assert!(dispatcher.peers.punished.is_empty());
    }

    /// Scenario: a peer broadcasts a block whose parent we don't have and
    /// whose claimed cumulative PoW exceeds ours. That's the live-traffic
    /// trigger for §4.5: the dispatcher should start a brief/detail sync
    /// against that peer rather than silently dropping the block.
    #[test]
    fn test_unknown_parent_with_higher_claimed_pow_starts_sync() {
        let state = tmp_state();
        let now = 2_000_000_000;
        let miner_key = crate::crypto::keys::generate_keypair();
        let mut dispatcher = new_dispatcher(state);

        let b1 = mine_next(&dispatcher.state, &miner_key, vec![], now);
        dispatcher.accept_block("self", b1, now);
        let local_pow = dispatcher.state.most_difficult_pow();

        let ahead = Block {
            id: 99,
            hash: [42u8; 32],
            pre_hash: [9u8; 32],
            utc: now,
            version: crate::consensus::constants::PROTOCOL_VERSION,
            zero_bits: 1,
            miner_pubkey: miner_key.verifying_key().to_bytes(),
            nonce: 0,
            tx_list: vec![],
            miner_sign: [0u8; 64],
            cumulative_pow: local_pow + 1,
        };
        dispatcher.accept_block("ahead_peer", ahead, now);

        assert!(dispatcher.peers.punished.is_empty());
        let outcome = dispatcher.sync.on_peer_tip_advertised("ahead_peer", [1u8; 32], local_pow + 1, local_pow);
        assert!(matches!(outcome, SyncOutcome::NotInteresting), "a request should already be in flight for this peer");
    }

    /// Scenario: a peer we sent a chain-brief request to never answers
    /// before the deadline. The dispatcher's own tick handling notices and
    /// punishes that peer, closing the loop from `SyncManager` expiry
    /// through to `PeerPunisher`.
    #[test]
    fn test_tick_punishes_peer_for_expired_sync_request() {
        let state = tmp_state();
        let mut dispatcher = new_dispatcher(state);
        let local_pow = dispatcher.state.most_difficult_pow();

        let outcome = dispatcher.sync.on_peer_tip_advertised("slow_peer", [7u8; 32], local_pow + 1, local_pow);
        dispatcher.apply_sync_outcome(outcome, 1000);
        assert!(dispatcher.peers.punished.is_empty());

        dispatcher.on_tick(1000 + crate::consensus::constants::BRIEF_REQUEST_TIMEOUT_SECS + 1);

        assert_eq!(dispatcher.peers.punished.len(), 1);
        assert_eq!(dispatcher.peers.punished[0].0, "slow_peer");
    }
}
