//! WebSocket handler and broadcasters
//!
//! Each connection runs a read loop (parsing the tagged JSON envelope) and
//! a writer task draining a per-connection outbound channel. Three
//! broadcaster tasks fan the Manager's event channels out to every client;
//! one client's dead socket never stalls the others.

use crate::manager::{AutoAnswerEvent, ManagerChannels};
use crate::server::ServerState;
use crate::trace::{logger, TraceContext};
use crate::types::AudioSource;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

/// Client → server envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Chat {
        message: String,
        #[serde(default)]
        trace_id: Option<String>,
    },
    Ping,
}

/// Server → client envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Start {
        role: &'static str,
    },
    Chunk {
        content: String,
    },
    Done,
    Transcript {
        text: String,
        source: AudioSource,
        speaker: String,
    },
    AutoStart {
        question: String,
    },
    AutoChunk {
        content: String,
    },
    AutoDone,
    Vad {
        probability: f32,
        is_speech: bool,
        source: AudioSource,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Live connection registry: id → outbound sender.
#[derive(Default)]
pub struct Connections {
    inner: RwLock<HashMap<u64, mpsc::UnboundedSender<ServerMessage>>>,
    next_id: AtomicU64,
}

impl Connections {
    pub fn add(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.write().unwrap().insert(id, tx);
        id
    }

    pub fn remove(&self, id: u64) {
        self.inner.write().unwrap().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// Queue a message to every client. A closed channel just means that
    /// connection is on its way out; its entry is removed by its own task.
    pub fn broadcast(&self, message: &ServerMessage) {
        let inner = self.inner.read().unwrap();
        for tx in inner.values() {
            let _ = tx.send(message.clone());
        }
    }
}

/// `GET /ws` upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<ServerState>,
) -> Response {
    let ip = client_ip(&headers, addr);
    ws.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

/// Leftmost `X-Forwarded-For` entry when present, else the peer address.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| addr.ip())
}

async fn handle_socket(socket: WebSocket, state: ServerState, ip: IpAddr) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let id = state.connections.add(tx.clone());
    info!(%ip, id, clients = state.connections.count(), "websocket connected");

    // Writer task: sole owner of the sink half.
    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(incoming) = stream.next().await {
        let Ok(incoming) = incoming else { break };
        match incoming {
            Message::Text(text) => {
                let parsed: ClientMessage = match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!(error = %err, "unparseable websocket message");
                        let _ = tx.send(ServerMessage::Error {
                            message: "invalid message".to_string(),
                        });
                        continue;
                    }
                };
                match parsed {
                    ClientMessage::Ping => {
                        let _ = tx.send(ServerMessage::Pong);
                    }
                    ClientMessage::Chat { message, trace_id } => {
                        if !state.rate_limiter.allow(ip) {
                            let _ = tx.send(ServerMessage::Error {
                                message: "rate limit exceeded".to_string(),
                            });
                            continue;
                        }
                        handle_chat(&state, &tx, &message, trace_id.as_deref()).await;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.connections.remove(id);
    writer.abort();
    info!(%ip, id, "websocket disconnected");
}

/// One chat exchange: `start`, buffered chunks, `done`. Errors surface as a
/// final chunk prefixed "Error:" so the UI always sees a complete exchange.
async fn handle_chat(
    state: &ServerState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    message: &str,
    trace_id: Option<&str>,
) {
    let ctx = match trace_id {
        Some(id) => TraceContext::with_trace_id(id),
        None => TraceContext::new(),
    };
    let span = logger(&ctx);

    async {
        let _ = tx.send(ServerMessage::Start { role: "assistant" });
        match state.manager.chat(&ctx, message).await {
            Ok(chunks) => {
                for content in chunks {
                    let _ = tx.send(ServerMessage::Chunk { content });
                }
            }
            Err(err) => {
                debug!(error = %err, "chat analysis failed");
                let _ = tx.send(ServerMessage::Chunk {
                    content: format!("Error: {err}"),
                });
            }
        }
        let _ = tx.send(ServerMessage::Done);
    }
    .instrument(span)
    .await
}

/// Fan the Manager's event channels out to every connected client.
pub fn spawn_broadcasters(
    connections: Arc<Connections>,
    channels: ManagerChannels,
) -> Vec<JoinHandle<()>> {
    let ManagerChannels {
        mut transcripts,
        mut auto_answers,
        mut vad,
    } = channels;

    let transcript_conns = connections.clone();
    let transcript_task = tokio::spawn(async move {
        while let Some(event) = transcripts.recv().await {
            transcript_conns.broadcast(&ServerMessage::Transcript {
                text: event.text,
                source: event.source,
                speaker: event.speaker,
            });
        }
    });

    let auto_conns = connections.clone();
    let auto_task = tokio::spawn(async move {
        while let Some(event) = auto_answers.recv().await {
            let message = match event {
                AutoAnswerEvent::Start { question } => ServerMessage::AutoStart { question },
                AutoAnswerEvent::Chunk { content } => ServerMessage::AutoChunk { content },
                AutoAnswerEvent::Done => ServerMessage::AutoDone,
            };
            auto_conns.broadcast(&message);
        }
    });

    let vad_task = tokio::spawn(async move {
        while let Some(event) = vad.recv().await {
            connections.broadcast(&ServerMessage::Vad {
                probability: event.probability,
                is_speech: event.is_speech,
                source: event.source,
            });
        }
    });

    vec![transcript_task, auto_task, vad_task]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_tags() {
        let json = serde_json::to_string(&ServerMessage::AutoStart {
            question: "why?".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"auto_start\""));

        let json = serde_json::to_string(&ServerMessage::Vad {
            probability: 0.5,
            is_speech: true,
            source: AudioSource::System,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"vad\""));
        assert!(json.contains("\"source\":\"system\""));

        let json = serde_json::to_string(&ServerMessage::Done).unwrap();
        assert_eq!(json, "{\"type\":\"done\"}");
    }

    #[test]
    fn test_inbound_chat_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"chat","message":"hi","trace_id":"abc"}"#).unwrap();
        match msg {
            ClientMessage::Chat { message, trace_id } => {
                assert_eq!(message, "hi");
                assert_eq!(trace_id.as_deref(), Some("abc"));
            }
            _ => panic!("expected chat"),
        }
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let addr: SocketAddr = "10.0.0.9:1234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(
            client_ip(&headers, addr),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
        assert_eq!(client_ip(&HeaderMap::new(), addr), addr.ip());
    }
}
