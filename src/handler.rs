//! WebSocket connection handler
//!
//! Handles individual connections: WebSocket handshake, outbound writer task,
//! and the inbound read loop that turns transport events into routed chains.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

use crate::connection::{Connection, CLOSE_NORMAL};
use crate::error::AppError;
use crate::message::{parse_frame, Outbound};
use crate::server::Dispatcher;
use crate::types::{ConnectionId, Event};

/// Request target captured during the handshake
#[derive(Debug, Clone, Default)]
struct RequestTarget {
    path: String,
    query: Option<String>,
    headers: Map<String, Value>,
}

impl RequestTarget {
    fn from_request(req: &Request) -> Self {
        let headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), Value::String(value.to_string())))
            })
            .collect();
        Self {
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            headers,
        }
    }

    fn into_context(self, peer_addr: &str) -> Value {
        json!({
            "path": self.path,
            "query": self.query,
            "headers": self.headers,
            "peer_addr": peer_addr,
        })
    }
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, raises `connection`, then one `message`
/// per inbound text frame, and finally `close` (preceded by `error` when the
/// transport failed).
pub async fn handle_connection(stream: TcpStream, dispatcher: Dispatcher) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let mut target = RequestTarget::default();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            target = RequestTarget::from_request(req);
            Ok(resp)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id = ConnectionId::new();
    let path = target.path.clone();
    info!("Connection {} opened on {} from {}", conn_id, path, peer_addr);

    // Channel for server -> client frames
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(dispatcher.outbound_buffer());
    let conn = Connection::new(conn_id, path, out_tx);

    // Spawn write task (Outbound -> WebSocket)
    let write_task = tokio::spawn(async move {
        while let Some(item) = out_rx.recv().await {
            match item {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            debug!("WebSocket send failed, ending write task");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to serialize frame: {}", e);
                    }
                },
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        debug!("Write task ended for {}", conn_id);

        let _ = ws_sender.close().await;
    });

    let result = drive(&dispatcher, &conn, &mut ws_receiver, target.into_context(&peer_addr)).await;
    let close_context = match &result {
        Ok(context) => context.clone(),
        Err(e) => json!({ "code": Value::Null, "reason": e.to_string() }),
    };

    // Close chains run even after a fatal error so ledger resources are released
    let closed = dispatcher.dispatch(&conn, Event::Close, close_context).await;

    let _ = conn.close(CLOSE_NORMAL, "").await;
    drop(conn);
    let _ = write_task.await;

    info!("Connection {} closed", conn_id);

    result?;
    closed?;
    Ok(())
}

/// Run the connection and message chains until the connection ends
///
/// Returns the context for the `close` event.
async fn drive(
    dispatcher: &Dispatcher,
    conn: &Connection,
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    request: Value,
) -> Result<Value, AppError> {
    dispatcher.dispatch(conn, Event::Connection, request).await?;

    loop {
        // Chains are never interrupted; closure is only noticed between frames
        let frame = tokio::select! {
            frame = ws_receiver.next() => frame,
            _ = conn.closed() => {
                debug!("Writer for {} closed, ending read loop", conn.id);
                return Ok(json!({ "code": Value::Null, "reason": "closed by server" }));
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                Ok(payload) => {
                    dispatcher.dispatch(conn, Event::Message, payload).await?;
                }
                Err(e) => {
                    debug!("Invalid JSON from {}: {}", conn.id, e);
                    dispatcher.report(conn, e).await;
                }
            },
            Some(Ok(Message::Binary(_))) => {
                dispatcher.report(conn, AppError::UnsupportedFrame).await;
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("Connection {} sent close frame", conn.id);
                let (code, reason) = frame
                    .map(|f| (Value::from(u16::from(f.code)), f.reason.to_string()))
                    .unwrap_or((Value::Null, String::new()));
                return Ok(json!({ "code": code, "reason": reason }));
            }
            Some(Ok(Message::Ping(_))) => {
                // Pong is handled automatically by tungstenite
                debug!("Ping from {}", conn.id);
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Pong from {}", conn.id);
            }
            Some(Ok(_)) => {
                // Raw frames - ignore
            }
            Some(Err(e)) => {
                error!("WebSocket error for {}: {}", conn.id, e);
                let reason = e.to_string();
                dispatcher
                    .dispatch(conn, Event::Error, json!({ "error": reason }))
                    .await?;
                return Ok(json!({ "code": Value::Null, "reason": reason }));
            }
            None => {
                return Ok(json!({ "code": Value::Null, "reason": "" }));
            }
        }
    }
}
