//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::session::SESSION_CLOSED;
use crate::game::{DirectoryError, FireRequest, SessionError, SessionHandle, VehicleIntent};
use crate::http::routes::AppError;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// WebSocket upgrade handler, routed by session code
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let Some(handle) = state.directory.get(&code) else {
        warn!(code = %code, "WebSocket upgrade for unknown session");
        return Err(AppError::NotFound(format!("No game with code {code}")));
    };

    info!(code = %code, "WebSocket upgrade");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, handle, state)))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, handle: Arc<SessionHandle>, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let Some(gamer_name) = read_introduction(&mut ws_stream).await else {
        let notice = ServerMsg::Error {
            code: "introduce_required".to_string(),
            message: "The first message must introduce the gamer.".to_string(),
        };
        let _ = send_msg(&mut ws_sink, &notice).await;
        return;
    };

    // Subscribe before binding so nothing broadcast after the bind is missed
    let session_rx = handle.subscribe();
    let bound = {
        let mut session = handle.lock().await;
        if session.is_closed() {
            Err(DirectoryError::InvalidCode)
        } else {
            session
                .attach(&gamer_name)
                .map(|connection_id| (connection_id, session.catch_up()))
                .map_err(DirectoryError::from)
        }
    };

    let (connection_id, catch_up) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            warn!(code = %handle.code, gamer_name = %gamer_name, error = %e, "Introduction rejected");
            let _ = send_msg(&mut ws_sink, &error_notice(&e)).await;
            return;
        }
    };

    info!(code = %handle.code, gamer_name = %gamer_name, %connection_id, "New WebSocket connection");

    for msg in &catch_up {
        if let Err(e) = send_msg(&mut ws_sink, msg).await {
            debug!(%connection_id, error = %e, "WebSocket send failed");
            state.directory.disconnect(&handle.code, &connection_id).await;
            return;
        }
    }

    run_session(
        &state,
        &handle,
        &gamer_name,
        connection_id,
        ws_sink,
        ws_stream,
        session_rx,
    )
    .await;

    state.directory.disconnect(&handle.code, &connection_id).await;
    info!(code = %handle.code, gamer_name = %gamer_name, "WebSocket connection closed");
}

/// Wait for the client's `introduce` message
async fn read_introduction(ws_stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(ClientMsg::Introduce { gamer_name }) => Some(gamer_name),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Failed to parse introduction");
                        None
                    }
                };
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Binary(_)) | Ok(Message::Close(_)) => return None,
            Err(e) => {
                debug!(error = %e, "WebSocket error before introduction");
                return None;
            }
        }
    }
    None
}

/// Run the WebSocket session with read/write split
async fn run_session(
    state: &AppState,
    handle: &SessionHandle,
    gamer_name: &str,
    connection_id: Uuid,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    mut session_rx: broadcast::Receiver<ServerMsg>,
) {
    let rate_limiter = ConnectionRateLimiter::new();
    let (direct_tx, mut direct_rx) = mpsc::channel::<ServerMsg>(16);

    // Spawn writer task: session broadcasts and direct replies -> WebSocket
    let writer_handle = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(msg) => msg,
                    None => break,
                },
                received = session_rx.recv() => match received {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%connection_id, lagged_count = n, "Client lagged, skipping {} messages", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(%connection_id, "Session channel closed");
                        break;
                    }
                },
            };

            let closing = matches!(&msg, ServerMsg::Error { code, .. } if code == SESSION_CLOSED);
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(%connection_id, error = %e, "WebSocket send failed");
                break;
            }
            if closing {
                let _ = ws_sink.send(Message::Close(None)).await;
                break;
            }
        }
    });

    // Reader loop: WebSocket -> session
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(%connection_id, "Rate limited input message");
                    continue;
                }

                let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!(%connection_id, error = %e, "Failed to parse client message");
                        continue;
                    }
                };

                if let Err(e) = dispatch(state, handle, gamer_name, client_msg).await {
                    if e.is_internal() {
                        warn!(code = %handle.code, %connection_id, "Session event failed");
                        state.directory.fail_all(&e).await;
                        break;
                    }
                    debug!(%connection_id, error = %e, "Client event rejected");
                    if direct_tx.send(error_notice(&e)).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(%connection_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(%connection_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(%connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Apply one client event to the session
async fn dispatch(
    state: &AppState,
    handle: &SessionHandle,
    gamer_name: &str,
    msg: ClientMsg,
) -> Result<(), DirectoryError> {
    match msg {
        ClientMsg::Introduce { .. } => return Err(SessionError::AlreadyConnected.into()),
        ClientMsg::VehicleUpdate {
            position,
            heading,
            turret_heading,
            ultimate_active,
        } => {
            let intent = VehicleIntent {
                position,
                heading,
                turret_heading,
                ultimate_active,
            };
            handle.lock().await.apply_intent(gamer_name, intent);
        }
        ClientMsg::FireBullet {
            id,
            position,
            heading,
            demolition,
        } => {
            let request = FireRequest {
                id,
                position,
                heading,
                demolition,
            };
            if !handle.lock().await.fire(gamer_name, request, unix_millis()) {
                debug!(code = %handle.code, gamer_name = %gamer_name, "Shot dropped");
            }
        }
        ClientMsg::ExpireBullet { id } => {
            handle.lock().await.expire_projectile(gamer_name, &id);
        }
        ClientMsg::LobbyUpdate { vehicle_type } => {
            handle.lock().await.change_vehicle(gamer_name, vehicle_type)?;
        }
        ClientMsg::Chat { text } => handle.lock().await.chat(gamer_name, text),
        ClientMsg::PlayAudio { cue } => handle.lock().await.relay_audio(cue),
        ClientMsg::StartRound => {
            if !handle.lock().await.is_admin(gamer_name) {
                return Err(SessionError::NotAdmin.into());
            }
            state.directory.start_round(&handle.code).await?;
        }
    }
    Ok(())
}

fn error_notice(err: &DirectoryError) -> ServerMsg {
    ServerMsg::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
