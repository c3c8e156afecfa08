//! WebSocket endpoint for conversation requests.
//!
//! Each connection gets its own task. Every request runs as a separate
//! conversation under a child cancellation token of the connection, so a
//! `cancel` frame or a disconnect stops only that connection's work.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::errors::BridgeError;
use super::protocol::{derive_task_id, parse_inbound, InboundMessage, OutboundMessage};
use crate::agent_core::{ConversationRequest, Orchestrator};

/// Running conversations of one connection, by request id.
type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Accepts bridge clients and hands their requests to the orchestrator.
pub struct BridgeServer {
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
}

impl BridgeServer {
    pub fn new(orchestrator: Arc<Orchestrator>, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator,
            shutdown,
        }
    }

    /// Bind the listen address. Port 0 picks a free port.
    pub async fn bind(addr: &str) -> Result<TcpListener, BridgeError> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            })
    }

    /// Accept connections until the shutdown token fires.
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "bridge listening");
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let orchestrator = self.orchestrator.clone();
                        let token = self.shutdown.child_token();
                        tokio::spawn(handle_connection(orchestrator, stream, peer, token));
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
                },
            }
        }
        tracing::info!("bridge stopped accepting connections");
    }
}

async fn handle_connection(
    orchestrator: Arc<Orchestrator>,
    stream: TcpStream,
    peer: SocketAddr,
    token: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    tracing::info!(peer = %peer, "client connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let outbound = tokio::spawn(async move {
        while let Some(reply) = send_rx.recv().await {
            let json = match reply.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping reply");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let in_flight: InFlight = Arc::default();

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    let _ = send_tx.send(OutboundMessage::error(None, "binary frame is not UTF-8"));
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "websocket read failed");
                break;
            }
        };

        match parse_inbound(&text) {
            Ok(InboundMessage::Request {
                request_id,
                prompt,
                task_id,
            }) => {
                let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let request = ConversationRequest {
                    task_id: derive_task_id(task_id.as_deref(), &prompt, &request_id),
                    request_id,
                    prompt,
                };
                start_conversation(&orchestrator, request, &token, &in_flight, &send_tx);
            }
            Ok(InboundMessage::Cancel { request_id }) => {
                let running = lock(&in_flight).get(&request_id).cloned();
                match running {
                    Some(cancel) => {
                        tracing::info!(request_id = %request_id, "cancel requested");
                        cancel.cancel();
                    }
                    None => {
                        let _ = send_tx.send(OutboundMessage::error(
                            Some(&request_id),
                            "no running request with this id",
                        ));
                    }
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "rejected client frame");
                let _ = send_tx.send(OutboundMessage::error(None, e.to_string()));
            }
        }
    }

    // Stops this connection's conversations, not other clients'
    token.cancel();
    drop(send_tx);
    let _ = outbound.await;
    tracing::info!(peer = %peer, "client disconnected");
}

fn start_conversation(
    orchestrator: &Arc<Orchestrator>,
    request: ConversationRequest,
    connection: &CancellationToken,
    in_flight: &InFlight,
    send_tx: &mpsc::UnboundedSender<OutboundMessage>,
) {
    let cancel = connection.child_token();
    {
        let mut running = lock(in_flight);
        if running.contains_key(&request.request_id) {
            let _ = send_tx.send(OutboundMessage::error(
                Some(&request.request_id),
                "a request with this id is already running",
            ));
            return;
        }
        running.insert(request.request_id.clone(), cancel.clone());
    }

    let orchestrator = orchestrator.clone();
    let in_flight = in_flight.clone();
    let send_tx = send_tx.clone();
    tokio::spawn(async move {
        let reply = match orchestrator.run(&request, &cancel).await {
            Ok(outcome) => OutboundMessage::response(&request.request_id, &outcome),
            Err(e) => OutboundMessage::error(Some(&request.request_id), e.to_string()),
        };
        lock(&in_flight).remove(&request.request_id);
        let _ = send_tx.send(reply);
    });
}

fn lock(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    in_flight.lock().unwrap_or_else(|p| p.into_inner())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
