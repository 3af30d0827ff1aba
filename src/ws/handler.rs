//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{MatchInput, SeatClaim};
use crate::http::routes::AppError;
use crate::matchmaking::{JoinRequest, Session};
use crate::replication::Outbound;
use crate::util::rate_limit::InputRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

const MAX_NAME_LEN: usize = 32;

type WsSink = SplitSink<WebSocket, Message>;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Display name shown to the opponent
    #[serde(default)]
    pub name: Option<String>,
    /// Join a specific match instead of any open one
    #[serde(default)]
    pub match_id: Option<Uuid>,
    /// Take back a seat held before a disconnect, together with `rejoin_token`
    #[serde(default)]
    pub player_id: Option<Uuid>,
    #[serde(default)]
    pub rejoin_token: Option<Uuid>,
}

impl WsQuery {
    fn claim(&self) -> Result<Option<SeatClaim>, AppError> {
        match (self.player_id, self.rejoin_token) {
            (Some(player_id), Some(rejoin_token)) => Ok(Some(SeatClaim {
                player_id,
                rejoin_token,
            })),
            (None, None) => Ok(None),
            _ => Err(AppError::BadRequest(
                "player_id and rejoin_token must be given together".to_string(),
            )),
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let request = match join_request(&query) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "WebSocket upgrade refused");
            return e.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, request, state))
}

fn join_request(query: &WsQuery) -> Result<JoinRequest, AppError> {
    Ok(JoinRequest {
        display_name: display_name(query.name.as_deref())?,
        match_id: query.match_id,
        claim: query.claim()?,
    })
}

fn display_name(raw: Option<&str>) -> Result<String, AppError> {
    let name = raw.map(str::trim).unwrap_or_default();
    if name.chars().count() > MAX_NAME_LEN {
        return Err(AppError::BadRequest(format!(
            "name longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    if name.is_empty() {
        return Ok(format!("Player_{}", &Uuid::new_v4().simple().to_string()[..8]));
    }
    Ok(name.to_string())
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, request: JoinRequest, state: AppState) {
    let (mut ws_sink, ws_stream) = socket.split();

    let session = match state.matchmaking.join(request).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Could not seat player");
            let msg = ServerMsg::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            };
            // Not part of any match yet, so no sequence number
            let _ = send_msg(&mut ws_sink, &Outbound { seq: 0, to: None, msg }).await;
            let _ = ws_sink.close().await;
            return;
        }
    };

    let player_id = session.player.player_id;
    info!(
        player_id = %player_id,
        match_id = %session.match_id,
        name = %session.player.display_name,
        "New WebSocket connection"
    );

    let welcome = Outbound {
        seq: 0,
        to: Some(player_id),
        msg: ServerMsg::Welcome {
            player_id,
            rejoin_token: session.rejoin_token,
            server_time: unix_millis(),
        },
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(player_id = %player_id, error = %e, "Failed to send welcome");
        state.matchmaking.leave(player_id, &session.input_tx).await;
        return;
    }

    let input_tx = session.input_tx.clone();
    run_session(player_id, session, ws_sink, ws_stream).await;

    state.matchmaking.leave(player_id, &input_tx).await;
    info!(player_id = %player_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(player_id: Uuid, session: Session, ws_sink: WsSink, mut ws_stream: SplitStream<WebSocket>) {
    let Session {
        input_tx,
        outbound_rx,
        ..
    } = session;
    let mut rate_limiter = InputRateLimiter::default();

    // Writer task: match replication -> WebSocket
    let mut writer = tokio::spawn(write_loop(player_id, outbound_rx, ws_sink));

    // Reader loop: WebSocket -> match task
    loop {
        let frame = tokio::select! {
            _ = &mut writer => {
                debug!(player_id = %player_id, "Writer finished, ending session");
                return;
            }
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if !rate_limiter.check() {
                    warn!(
                        player_id = %player_id,
                        dropped = rate_limiter.dropped(),
                        "Rate limited input message"
                    );
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => {
                        let input = MatchInput::Client {
                            player_id,
                            msg,
                            received_at: unix_millis(),
                        };
                        if input_tx.send(input).await.is_err() {
                            debug!(player_id = %player_id, "Input channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(player_id = %player_id, error = %e, "Failed to parse client message");
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                warn!(player_id = %player_id, "Received binary message, ignoring");
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                info!(player_id = %player_id, "Client initiated close");
                break;
            }
            Some(Err(e)) => {
                error!(player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer.abort();
}

/// Forward this participant's view of the match until the session closes
async fn write_loop(player_id: Uuid, mut outbound_rx: broadcast::Receiver<Outbound>, mut ws_sink: WsSink) {
    loop {
        let out = match outbound_rx.recv().await {
            Ok(out) => out,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // Continue - the client catches up from later values
                warn!(player_id = %player_id, lagged_count = n, "Client lagged behind replication");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(player_id = %player_id, "Replication channel closed");
                break;
            }
        };

        let (out, closing) = match delivery(player_id, &out) {
            Delivery::Skip => continue,
            Delivery::Send(out) => (out, false),
            Delivery::SendAndClose(out) => (out, true),
        };

        if let Err(e) = send_msg(&mut ws_sink, &out).await {
            debug!(player_id = %player_id, error = %e, "WebSocket send failed");
            return;
        }
        if closing {
            break;
        }
    }

    if ws_sink.send(close_frame()).await.is_err() {
        debug!(player_id = %player_id, "Close frame not delivered");
    }
}

/// What the writer does with one replicated message
#[derive(Debug)]
enum Delivery {
    /// Addressed to someone else
    Skip,
    Send(Outbound),
    /// Last message of the session; the socket closes after it
    SendAndClose(Outbound),
}

fn delivery(viewer: Uuid, out: &Outbound) -> Delivery {
    match out.for_viewer(viewer) {
        None => Delivery::Skip,
        Some(out) if matches!(out.msg, ServerMsg::SessionClosed) => Delivery::SendAndClose(out),
        Some(out) => Delivery::Send(out),
    }
}

fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "session closed".into(),
    }))
}

/// Send a message over WebSocket
async fn send_msg<T: Serialize>(sink: &mut WsSink, msg: &T) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
