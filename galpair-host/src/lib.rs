use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use galpair_core::{MAX_FRAME_BYTES, WireMessage, decode_frame, encode_frame};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
};
use tracing::{debug, error, info, warn};

pub mod dispatcher;
pub mod error;

pub use dispatcher::{DispatcherConfig, PairingHandle, spawn_dispatcher};
pub use error::{HostError, HostResult};

#[derive(Debug, Clone)]
pub struct AppState {
    pairing: PairingHandle,
}

impl AppState {
    /// Starts a fresh dispatcher. Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self::from_handle(spawn_dispatcher(config))
    }

    #[must_use]
    pub fn from_handle(pairing: PairingHandle) -> Self {
        Self { pairing }
    }

    pub fn pairing(&self) -> &PairingHandle {
        &self.pairing
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/devices", get(list_devices_handler))
        .route("/devices/{serial_number}", get(get_device_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> HostResult<()> {
    info!(
        "pairing host listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn list_devices_handler(State(state): State<AppState>) -> Response {
    match state.pairing.list_connected().await {
        Ok(devices) => Json(devices).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_device_handler(
    State(state): State<AppState>,
    Path(serial_number): Path<String>,
) -> Response {
    match state.pairing.get(&serial_number).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            axum::http::StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("device {} is not connected", serial_number)
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("presentation session ended with error: {}", err);
            }
        })
}

async fn handle_socket(state: AppState, socket: WebSocket) -> HostResult<()> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    // Subscribe before reading anything so the client sees the effects of its own events.
    let mut notifications = state.pairing.subscribe();

    // Periodic writes keep the split sink flushing pongs through idle proxies.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                biased;

                received = notifications.recv() => {
                    match received {
                        Ok(notification) => {
                            let name = notification.name();
                            match encode_frame(&WireMessage::Notification(notification)) {
                                Ok(frame) => {
                                    if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Err(err) => error!("failed to encode {} notification: {}", name, err),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("presentation client lagged, {} notification(s) skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    info!("presentation client connected");
    let result = receive_loop(&state, &mut ws_receiver, &outbound_tx).await;

    send_task.abort();
    info!("presentation client disconnected");
    result
}

async fn receive_loop(
    state: &AppState,
    ws_receiver: &mut futures::stream::SplitStream<WebSocket>,
    outbound_tx: &mpsc::UnboundedSender<Message>,
) -> HostResult<()> {
    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => continue,
        };

        if data.len() > MAX_FRAME_BYTES {
            warn!("dropping oversized frame ({} bytes)", data.len());
            continue;
        }

        let wire = match decode_frame(&data) {
            Ok(wire) => wire,
            Err(err) => {
                warn!("failed to decode frame: {}", err);
                continue;
            }
        };

        match wire {
            WireMessage::Event(event) => {
                let name = event.name();
                match state.pairing.submit(event).await {
                    Ok(()) => debug!("{} applied", name),
                    Err(HostError::Pairing(err)) => send_reply(
                        outbound_tx,
                        WireMessage::Error {
                            message: err.to_string(),
                        },
                    ),
                    Err(err) => return Err(err),
                }
            }
            WireMessage::ListConnected => {
                let devices = state.pairing.list_connected().await?;
                send_reply(outbound_tx, WireMessage::DeviceList(devices));
            }
            WireMessage::Notification(_) | WireMessage::DeviceList(_) | WireMessage::Error { .. } => {
                warn!("ignoring client-bound frame sent by a client");
            }
        }
    }

    Ok(())
}

fn send_reply(outbound_tx: &mpsc::UnboundedSender<Message>, reply: WireMessage) {
    let frame = match encode_frame(&reply) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to encode reply: {}", err);
            match encode_frame(&WireMessage::Error {
                message: err.to_string(),
            }) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };

    let _ = outbound_tx.send(Message::Binary(frame.into()));
}
