//! A thin CLI client (C12) for a running node: sends one client-protocol
//! request over the local websocket and prints the response.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

fn usage() -> ! {
    eprintln!("usage: forumcoin-cli <ws-url> query_balance <account_id>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        usage();
    }
    let url = &args[1];
    let op = args[2].as_str();

    let request = match op {
        "query_balance" => {
            let account_id: u64 = args[3].parse().unwrap_or_else(|_| usage());
            serde_json::json!({ "op": "query_balance", "account_id": account_id })
        }
        "subscribe_account" => {
            let account_id: u64 = args[3].parse().unwrap_or_else(|_| usage());
            serde_json::json!({ "op": "subscribe_account", "account_id": account_id })
        }
        _ => usage(),
    };

    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("failed to connect to node");
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(request.to_string().into()))
        .await
        .expect("failed to send request");

    match read.next().await {
        Some(Ok(Message::Text(text))) => println!("{text}"),
        Some(Ok(_)) => eprintln!("unexpected non-text response"),
        Some(Err(e)) => eprintln!("connection error: {e}"),
        None => eprintln!("connection closed without a response"),
    }
}
