// =============================================================================
// WebSocket Handler — fan-out of conflated live candle updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive the hub's Partial/Close
// messages as JSON, already conflated and sequence-stamped upstream. The
// handler forwards the shared broadcast feed, answers Ping frames, and
// cleans up on disconnect. Slow clients that fall behind the broadcast
// buffer are dropped.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::rest::ApiContext;
use crate::conflation::{Emitter, HubMessage, MessageKind};
use crate::types::Candle;

/// Wire form of a hub message.
#[derive(Serialize)]
struct WireMessage<'a> {
    kind: &'static str,
    symbol: &'a str,
    interval: &'a str,
    sequence: u64,
    candle: &'a Candle,
}

/// Build the hub emitter that serialises messages into the broadcast feed.
/// Send errors just mean nobody is connected.
pub fn broadcast_emitter(feed: broadcast::Sender<String>) -> Emitter {
    Arc::new(move |msg: HubMessage| {
        let interval = msg.interval.label();
        let wire = WireMessage {
            kind: match msg.kind {
                MessageKind::Partial => "partial",
                MessageKind::Close => "close",
            },
            symbol: &msg.symbol,
            interval: &interval,
            sequence: msg.sequence,
            candle: &msg.candle,
        };
        match serde_json::to_string(&wire) {
            Ok(json) => {
                let _ = feed.send(json);
            }
            Err(err) => warn!(error = %err, "failed to serialise hub message"),
        }
    })
}

// =============================================================================
// Upgrade & connection handling
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ApiContext>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, ctx))
}

async fn handle_ws_connection(socket: WebSocket, ctx: Arc<ApiContext>) {
    let mut feed = ctx.ws_feed.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            update = feed.recv() => {
                match update {
                    Ok(json) => {
                        if let Err(err) = sender.send(Message::Text(json)).await {
                            debug!(error = %err, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagging — dropping");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket connection closed");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/Binary/Pong from clients carry nothing for us.
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
