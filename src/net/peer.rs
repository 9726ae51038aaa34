//! Peer transport (C10): length-prefixed JSON frames over TCP. Thin glue
//! that turns bytes on a socket into `PeerMessage`s on the dispatcher's
//! peer queue, and outbound `PeerMessage`s back into bytes. No protocol
//! logic lives here — see `net::protocol` and `dispatcher`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::MAX_MESSAGE_SIZE;
use crate::net::protocol::PeerMessage;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds maximum size")]
    TooLarge(usize),
    #[error("malformed json frame: {0}")]
    Json(#[from] serde_json::Error),
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<PeerMessage, FrameError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

pub async fn write_frame(stream: &mut TcpStream, msg: &PeerMessage) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    Ok(())
}

/// A connected peer, identified by its socket address. Owns the half of
/// the TCP stream used to push outbound messages; inbound messages are
/// forwarded into `inbound` as they arrive.
pub struct PeerHandle {
    pub peer_addr: String,
    pub outbound: mpsc::Sender<PeerMessage>,
}

/// Drives one peer connection: reads frames and forwards them to
/// `inbound`, and writes whatever arrives on `outbound_rx`. Runs until the
/// socket closes or a frame error occurs, at which point it notifies the
/// dispatcher via `disconnected` so the peer can be punished/dropped.
pub async fn run_peer_connection(
    mut stream: TcpStream,
    peer_addr: String,
    inbound: mpsc::Sender<(String, PeerMessage)>,
    mut outbound_rx: mpsc::Receiver<PeerMessage>,
) {
    loop {
        tokio::select! {
            read_result = read_frame(&mut stream) => {
                match read_result {
                    Ok(msg) => {
                        if inbound.send((peer_addr.clone(), msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            to_send = outbound_rx.recv() => {
                match to_send {
                    Some(msg) => {
                        if write_frame(&mut stream, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}
