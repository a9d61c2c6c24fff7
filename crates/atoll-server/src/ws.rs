use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use atoll_common::DeploymentEvent;

use crate::state::AppState;

pub async fn deployment_logs_ws(
    State(st): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_logs(st, id, socket))
}

/// Replay the full backlog from seq 1, then relay live events until the
/// stream closes or the client falls behind its buffer.
async fn stream_logs(st: AppState, deployment_id: String, mut socket: WebSocket) {
    let sub = match st.events.subscribe(&deployment_id).await {
        Ok(sub) => sub,
        Err(e) => {
            debug!(%deployment_id, error = %e, "log subscription failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let mut last_seq = 0;
    for event in &sub.backlog {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
        last_seq = event.seq;
    }

    let Some(mut rx) = sub.live else {
        // Terminal deployment: history is all there is.
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    loop {
        match rx.recv().await {
            // The backlog replay may overlap the live buffer.
            Ok(event) if event.seq <= last_seq => {}
            Ok(event) => {
                if send_event(&mut socket, &event).await.is_err() {
                    return;
                }
                last_seq = event.seq;
            }
            Err(RecvError::Lagged(missed)) => {
                let notice = json!({
                    "notice": "fell behind",
                    "missed": missed,
                })
                .to_string();
                let _ = socket.send(Message::Text(notice)).await;
                break;
            }
            Err(RecvError::Closed) => break,
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}

async fn send_event(socket: &mut WebSocket, event: &DeploymentEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(text)).await
}
