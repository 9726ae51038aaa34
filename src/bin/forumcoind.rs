//! The node binary (C12): wires config, Chain State, the three worker
//! threads and the two network-facing edges together. Status is reported
//! with plain `println!`/`eprintln!`, matching the reference node's own
//! choice not to pull in a logging crate for this.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use forumcoin::config::{self, NodeConfig};
use forumcoin::consensus::ChainState;
use forumcoin::crypto;
use forumcoin::dispatcher::{DispatchMessage, Dispatcher, PeerPunisher};
use forumcoin::mining::{self, JobBoard, MiningSignal};
use forumcoin::net::protocol::PeerMessage;

/// Minimal peer book: enough to satisfy the dispatcher's narrow
/// `PeerPunisher` interface for a standalone node with no peers
/// connected yet. A full implementation would track outbound senders per
/// peer address and a reputation score; that bookkeeping is explicitly
/// out of scope (§1) beyond this narrow edge.
struct StderrPeerBook;

impl PeerPunisher for StderrPeerBook {
    fn punish(&mut self, peer: &str, reason: &str) {
        eprintln!("punishing peer {peer}: {reason}");
    }

    fn broadcast(&mut self, message: PeerMessage) {
        println!("broadcast: {message:?}");
    }

    fn send_to(&mut self, peer: &str, message: PeerMessage) {
        println!("-> {peer}: {message:?}");
    }
}

fn now_utc() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_secs()
}

fn main() {
    let cfg = NodeConfig::from_env();
    println!("forumcoind starting, data dir: {}", cfg.data_dir);

    std::fs::create_dir_all(&cfg.data_dir).expect("failed to create data directory");
    let store_path = std::path::PathBuf::from(&cfg.data_dir).join("chain");
    let state = ChainState::open(&store_path).expect("failed to open chain state");
    println!("chain state opened at tip height {}", state.tip().id);

    let mining_signal = Arc::new(MiningSignal::default());
    mining_signal.set_enabled(cfg.mining_enabled);
    let job_board = Arc::new(JobBoard::default());
    let shutdown = Arc::new(AtomicBool::new(false));

    let (to_dispatcher, inbox) = mpsc::channel::<DispatchMessage>();
    let (mined_tx, mined_rx) = mpsc::channel();

    let miner_key = crypto::keys::generate_keypair();
    {
        let to_dispatcher = to_dispatcher.clone();
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            // relay mined blocks into the dispatcher's queue as if they
            // had arrived over the peer protocol from ourselves.
            while !shutdown.load(Ordering::SeqCst) {
                match mined_rx.recv_timeout(std::time::Duration::from_millis(500)) {
                    Ok(block) => {
                        let _ = to_dispatcher.send(DispatchMessage::MinedBlock(block));
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });
    }
    {
        let signal = Arc::clone(&mining_signal);
        let job_board = Arc::clone(&job_board);
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            mining::run_miner_loop(
                miner_key,
                signal,
                move || job_board.current(),
                mined_tx,
                now_utc,
                move || shutdown.load(Ordering::SeqCst),
            );
        });
    }

    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    {
        let to_dispatcher = to_dispatcher.clone();
        let bind = format!("{}:{}", config::CLIENT_BIND_ADDRESS, cfg.client_port);
        rt.spawn(async move {
            if let Err(e) = forumcoin::rpc::run_client_server(&bind, to_dispatcher).await {
                eprintln!("client server stopped: {e}");
            }
        });
    }

    let mut dispatcher = Dispatcher::new(state, StderrPeerBook, mining_signal, job_board, shutdown);
    dispatcher.run(&inbox, now_utc);
    println!("forumcoind stopped");
}
