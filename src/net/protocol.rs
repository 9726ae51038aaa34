//! Peer wire protocol (C10): JSON messages over a length-prefixed stream.
//! Kept free of any actual I/O — `net::peer` does the framing over a real
//! socket, this module only defines what goes inside a frame.

use serde::{Deserialize, Serialize};

use crate::consensus::constants::PROTOCOL_VERSION;
use crate::model::{Block, Hash, Transaction};

/// Decomposes a protocol version integer the way the original chain's own
/// `version.hpp` does: `major = v / 10_000_000`, `minor = (v % 10_000_000)
/// / 10_000`, `revision = v % 10_000`. Two peers are compatible iff major
/// and minor both match; revision may differ freely.
pub fn version_compatible(local: u32, peer: u32) -> bool {
    let major_minor = |v: u32| (v / 10_000_000, (v % 10_000_000) / 10_000);
    major_minor(local) == major_minor(peer)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainBrief {
    pub id: u64,
    pub hash: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PeerMessage {
    #[serde(rename = "BLOCK_BROADCAST")]
    BlockBroadcast { version: u32, block: Block },
    #[serde(rename = "TX_BROADCAST")]
    TxBroadcast { version: u32, tx: Transaction },
    #[serde(rename = "CHAIN_BRIEF_REQ")]
    ChainBriefReq { version: u32, from_hash: Hash, chunk_size: u32 },
    #[serde(rename = "CHAIN_BRIEF_RESP")]
    ChainBriefResp { version: u32, tip_cumulative_pow: u128, headers: Vec<ChainBrief> },
    #[serde(rename = "CHAIN_DETAIL_REQ")]
    ChainDetailReq { version: u32, hashes: Vec<Hash> },
    #[serde(rename = "CHAIN_DETAIL_RESP")]
    ChainDetailResp { version: u32, blocks: Vec<Block> },
    #[serde(rename = "PING")]
    Ping { version: u32 },
    #[serde(rename = "PONG")]
    Pong { version: u32 },
}

impl PeerMessage {
    pub fn version(&self) -> u32 {
        match self {
            PeerMessage::BlockBroadcast { version, .. }
            | PeerMessage::TxBroadcast { version, .. }
            | PeerMessage::ChainBriefReq { version, .. }
            | PeerMessage::ChainBriefResp { version, .. }
            | PeerMessage::ChainDetailReq { version, .. }
            | PeerMessage::ChainDetailResp { version, .. }
            | PeerMessage::Ping { version }
            | PeerMessage::Pong { version } => *version,
        }
    }

    pub fn ping() -> Self {
        PeerMessage::Ping { version: PROTOCOL_VERSION }
    }

    pub fn pong() -> Self {
        PeerMessage::Pong { version: PROTOCOL_VERSION }
    }
}
