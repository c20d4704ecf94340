//! WebSocket handler for gateway connections

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame as WsCloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures::stream::{self, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use tracing::{debug, warn};

use super::connection::{run_connection, ConnectionMeta, Inbound};
use super::sequencer::{channel, Outbound};
use crate::state::Gateway;

/// Close reasons must fit in a control frame
const MAX_CLOSE_REASON: usize = 123;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler
pub async fn gateway_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(gateway): State<Gateway>,
) -> Response {
    // Frames between max_payload and this hard cap are refused by the codec
    // with a proper close code; beyond it the socket layer drops them.
    let hard_cap = gateway.config().max_payload.saturating_mul(2);
    ws.max_message_size(hard_cap)
        .on_upgrade(move |socket| handle_gateway_socket(socket, gateway, remote))
}

/// Handle an individual gateway WebSocket connection
async fn handle_gateway_socket(socket: WebSocket, gateway: Gateway, remote: SocketAddr) {
    let (mut ws_sender, ws_receiver) = socket.split();
    let (queue, mut outbound) = channel(gateway.config().max_buffered_bytes);

    // Task to drain the outbound queue into the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = outbound.next().await {
            match item {
                Outbound::Frame(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { farewell, frame } => {
                    if let Some(farewell) = farewell {
                        let _ = ws_sender.send(Message::Text(farewell.into())).await;
                    }
                    let close = WsCloseFrame {
                        code: frame.code,
                        reason: truncate_reason(&frame.reason).to_string().into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let meta = ConnectionMeta {
        remote_ip: Some(remote.ip().to_string()),
    };
    run_connection(gateway, meta, Box::pin(inbound_messages(ws_receiver)), queue).await;

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        warn!(%remote, "Socket writer did not drain in time");
        send_task.abort();
    }
}

/// Text and binary data messages; control frames are handled by the socket
fn inbound_messages(receiver: SplitStream<WebSocket>) -> impl Stream<Item = Inbound> {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.next().await? {
                Ok(Message::Text(text)) => return Some((Inbound::Text(text.as_str().to_string()), receiver)),
                Ok(Message::Binary(_)) => return Some((Inbound::Binary, receiver)),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(frame)) => {
                    debug!(code = ?frame.as_ref().map(|frame| frame.code), "Peer sent close frame");
                    return None;
                }
                Err(e) => {
                    debug!("WebSocket read error: {}", e);
                    return None;
                }
            }
        }
    })
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_are_cut_on_char_boundaries() {
        assert_eq!(truncate_reason("slow consumer"), "slow consumer");
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert_eq!(cut.len() % 2, 0);
    }
}
