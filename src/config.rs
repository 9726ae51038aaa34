//! Node configuration (C9): environment overrides over a set of defaults,
//! in the same shape as a minimal network-config loader — no file format,
//! no CLI parser, just the handful of knobs the node actually needs.

/// Standard protocol ports.
pub const P2P_PORT: u16 = 9000;
pub const CLIENT_PORT: u16 = 9001;

/// Maximum number of peers to connect to.
pub const MAX_PEERS: usize = 12;

/// Maximum frame size accepted on the peer protocol (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Bind address for the local client websocket — loopback only.
pub const CLIENT_BIND_ADDRESS: &str = "127.0.0.1";

/// Bind address for the peer listener.
pub const P2P_BIND_ADDRESS_DEFAULT: &str = "0.0.0.0";

/// Data directory name, relative to the resolved home directory.
pub const DATA_DIR: &str = ".forumcoin/mainnet";

/// Bounded-queue capacities for the dispatcher's three input channels (§5).
pub const PEER_QUEUE_CAPACITY: usize = 4096;
pub const CLIENT_QUEUE_CAPACITY: usize = 1024;
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

pub struct NodeConfig {
    pub p2p_port: u16,
    pub client_port: u16,
    pub data_dir: String,
    pub mining_enabled: bool,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let home = resolve_home_dir();
        let mut cfg = NodeConfig {
            p2p_port: P2P_PORT,
            client_port: CLIENT_PORT,
            data_dir: format!("{}/{}", home, DATA_DIR),
            mining_enabled: false,
        };
        if let Ok(p) = std::env::var("FORUMCOIN_P2P_PORT")
            && let Ok(port) = p.parse()
        {
            cfg.p2p_port = port;
        }
        if let Ok(p) = std::env::var("FORUMCOIN_CLIENT_PORT")
            && let Ok(port) = p.parse()
        {
            cfg.client_port = port;
        }
        if let Ok(d) = std::env::var("FORUMCOIN_DATA_DIR") {
            cfg.data_dir = d;
        }
        if let Ok(m) = std::env::var("FORUMCOIN_MINE") {
            cfg.mining_enabled = m == "1" || m.eq_ignore_ascii_case("true");
        }
        cfg
    }
}

pub fn p2p_bind_address() -> String {
    let v = std::env::var("FORUMCOIN_P2P_BIND")
        .unwrap_or_else(|_| P2P_BIND_ADDRESS_DEFAULT.to_string());
    if v.trim().is_empty() {
        P2P_BIND_ADDRESS_DEFAULT.to_string()
    } else {
        v
    }
}

fn resolve_home_dir() -> String {
    if let Ok(home) = std::env::var("HOME")
        && !home.trim().is_empty()
    {
        return home;
    }
    #[cfg(windows)]
    {
        if let Ok(home) = std::env::var("USERPROFILE")
            && !home.trim().is_empty()
        {
            return home;
        }
        let drive = std::env::var("HOMEDRIVE").unwrap_or_default();
        let path = std::env::var("HOMEPATH").unwrap_or_default();
        if !drive.is_empty() || !path.is_empty() {
            return format!("{drive}{path}");
        }
    }
    ".".to_string()
}
