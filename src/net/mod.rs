//! Networking edges (C10): peer wire protocol and its TCP transport.

pub mod peer;
pub mod protocol;
