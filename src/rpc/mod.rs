//! Client transport (C11): a local websocket accepting the client
//! protocol's JSON request/response shapes (§6), forwarding each request
//! into the dispatcher's client queue and relaying the answer back over
//! the same connection. No consensus logic lives here.

use std::sync::mpsc::Sender as StdSender;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::dispatcher::{ClientRequest, ClientResponse, DispatchMessage};
use crate::model::Transaction;

#[derive(Debug, Deserialize)]
#[serde(tag = "op")]
pub enum ClientOp {
    #[serde(rename = "register")]
    Register { tx: Transaction },
    #[serde(rename = "send")]
    Send { tx: Transaction },
    #[serde(rename = "query_balance")]
    QueryBalance { account_id: u64 },
    #[serde(rename = "new_topic")]
    NewTopic { tx: Transaction },
    #[serde(rename = "reply")]
    Reply { tx: Transaction },
    #[serde(rename = "subscribe_account")]
    SubscribeAccount { account_id: u64 },
}

#[derive(Debug, Serialize)]
pub struct ClientReply {
    pub ok: bool,
    pub reason: Option<u32>,
    pub balance: Option<u64>,
}

impl From<ClientResponse> for ClientReply {
    fn from(r: ClientResponse) -> Self {
        ClientReply { ok: r.ok, reason: r.reason.map(|c| c as u32), balance: r.balance }
    }
}

fn into_request(op: ClientOp) -> ClientRequest {
    match op {
        ClientOp::Register { tx } => ClientRequest::Register {
            name: String::new(),
            referrer: 0,
            fee: tx.fee(),
            pubkey: tx.pubkey,
            sign_payload: tx,
        },
        ClientOp::Send { tx } => ClientRequest::Send { tx },
        ClientOp::QueryBalance { account_id } => ClientRequest::QueryBalance { account_id },
        ClientOp::NewTopic { tx } => ClientRequest::NewTopic { tx },
        ClientOp::Reply { tx } => ClientRequest::Reply { tx },
        ClientOp::SubscribeAccount { account_id } => ClientRequest::SubscribeAccount { account_id },
    }
}

/// Accepts connections forever, handing each to `handle_connection`. Runs
/// on the small tokio runtime dedicated to the two networking edges; the
/// dispatcher itself stays synchronous (§5).
pub async fn run_client_server(bind_addr: &str, to_dispatcher: StdSender<DispatchMessage>) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        let sender = to_dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, sender).await {
                eprintln!("client connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    to_dispatcher: StdSender<DispatchMessage>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };
        let reply = match serde_json::from_str::<ClientOp>(&text) {
            Ok(op) => dispatch_and_wait(&to_dispatcher, op),
            Err(_) => ClientReply { ok: false, reason: None, balance: None },
        };
        let out = serde_json::to_string(&reply).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        write.send(Message::Text(out.into())).await?;
    }
    Ok(())
}

fn dispatch_and_wait(to_dispatcher: &StdSender<DispatchMessage>, op: ClientOp) -> ClientReply {
    let (tx, rx) = std::sync::mpsc::channel();
    let request = into_request(op);
    if to_dispatcher.send(DispatchMessage::Client { request, respond_to: tx }).is_err() {
        return ClientReply { ok: false, reason: None, balance: None };
    }
    match rx.recv_timeout(std::time::Duration::from_secs(5)) {
        Ok(response) => response.into(),
        Err(_) => ClientReply { ok: false, reason: None, balance: None },
    }
}
