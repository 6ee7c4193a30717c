// =============================================================================
// WebSocket Handler — per-display snapshot stream
// =============================================================================
//
// Renderers connect to `/api/v1/ws/{display_id}?token=<token>` and receive:
//   1. The display's latest state immediately on connect.
//   2. A push whenever the display publishes a new snapshot.
//
// The channel is a `watch`: a renderer slower than the snapshot rate simply
// observes the latest value, skipping intermediates — the newest state is
// always delivered eventually. Each payload also carries the rendering
// context derived from the display's current config and visual range, so the
// renderer never computes geometry on its own.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::auth::validate_token;
use crate::app_state::AppState;
use crate::display::DisplayUpdate;
use crate::layout::{self, RenderContext};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// One message on the renderer stream: the display state plus its derived
/// geometry.
#[derive(Serialize)]
struct WsPayload<'a> {
    #[serde(flatten)]
    update: &'a DisplayUpdate,
    #[serde(skip_serializing_if = "Option::is_none")]
    render: Option<RenderContext>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if !validate_token(&query.token.unwrap_or_default()) {
        warn!(display = %id, "WebSocket rejected: invalid token");
        return (StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    let Some(rx) = state.displays.watch(id) else {
        return (StatusCode::NOT_FOUND, "No such display").into_response();
    };

    info!(display = %id, "snapshot stream attached");
    ws.on_upgrade(move |socket| handle_connection(socket, state, id, rx))
        .into_response()
}

// =============================================================================
// Connection loop
// =============================================================================

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    id: Uuid,
    mut rx: watch::Receiver<DisplayUpdate>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Latest state goes out immediately.
    let initial = rx.borrow_and_update().clone();
    if send_update(&mut sender, &state, id, &initial).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    // Display destroyed; close the stream.
                    info!(display = %id, "display gone, closing snapshot stream");
                    break;
                }
                let update = rx.borrow_and_update().clone();
                if send_update(&mut sender, &state, id, &update).await.is_err() {
                    debug!(display = %id, "snapshot stream send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Text(text))) => {
                        // Clients have nothing to say on this stream.
                        debug!(display = %id, msg = %text, "ignoring client text message");
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    info!(display = %id, "snapshot stream detached");
}

/// Serialize and push one update, attaching the derived rendering context
/// when a snapshot is present.
async fn send_update<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    id: Uuid,
    update: &DisplayUpdate,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let render = match (&update.snapshot, state.displays.config_of(id)) {
        (Some(snapshot), Some(config)) => Some(layout::derive(
            config.container_size,
            &config.layout_options(),
            &snapshot.visual_range,
        )),
        _ => None,
    };

    let payload = WsPayload { update, render };
    match serde_json::to_string(&payload) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation problems are not connection problems.
            warn!(display = %id, error = %e, "failed to serialise snapshot payload");
            Ok(())
        }
    }
}
