//! Consumer (client-facing) server
//!
//! Fans tag and status events out to every connected WebSocket client and
//! funnels write requests back over the bridge. Session admission happens
//! before the upgrade: wrong secret is 401, a second socket under the
//! first-connection-wins policy is 409.
//!
//! Lock order: session state → client set → nothing else. No lock is held
//! across socket I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use super::session::{SessionError, SessionGate};
use super::{HttpServer, PeerAddr, ServeError};
use crate::bridge::Bridge;
use crate::protocol::{
    self, DeviceStatusPayload, Envelope, ErrorCode, TagInputRequest, TagInputResponse, TagPayload,
    WriteRequestPayload, kind,
};
use crate::tag::{Card, NfcData, Tag, uid};

pub struct ConsumerConfig {
    pub addr: SocketAddr,
    pub api_secret: Option<String>,
    /// Expose `POST /api/v1/tag` for synthetic scans.
    pub allow_injection: bool,
    pub tls: Option<tokio_rustls::TlsAcceptor>,
}

pub struct ConsumerState {
    bridge: Arc<Bridge>,
    sessions: SessionGate,
    clients: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Message>>>,
    last_card: RwLock<Option<Card>>,
    reader_connected: RwLock<bool>,
    allow_injection: bool,
}

impl ConsumerState {
    fn new(bridge: Arc<Bridge>, api_secret: Option<String>, allow_injection: bool) -> Self {
        Self {
            bridge,
            sessions: SessionGate::new(api_secret),
            clients: RwLock::new(HashMap::new()),
            last_card: RwLock::new(None),
            reader_connected: RwLock::new(false),
            allow_injection,
        }
    }

    /// Handle one inbound client frame and produce the reply frame.
    async fn handle_frame(&self, client_id: Uuid, text: &str) -> Envelope {
        let env = match Envelope::parse(text) {
            Ok(env) => env,
            Err(err) => {
                return Envelope::error(
                    None,
                    format!("invalid frame: {err}"),
                    ErrorCode::ParseError,
                );
            }
        };
        match env.kind.as_str() {
            kind::WRITE_REQUEST => {
                let payload: WriteRequestPayload = match env.payload_as() {
                    Ok(payload) => payload,
                    Err(_) => {
                        return Envelope::error(
                            env.id,
                            "writeRequest payload is invalid",
                            ErrorCode::InvalidPayload,
                        );
                    }
                };
                if payload.records.is_empty() {
                    return Envelope::error(
                        env.id,
                        "writeRequest needs at least one record",
                        ErrorCode::InvalidWriteRequest,
                    );
                }
                match self
                    .bridge
                    .send_write_request(env.id.clone(), client_id, payload.records)
                    .await
                {
                    Ok(outcome) if outcome.success => Envelope::write_response(env.id),
                    Ok(outcome) => Envelope::error(
                        env.id,
                        outcome.error.unwrap_or_else(|| "write failed".into()),
                        ErrorCode::WriteFailed,
                    ),
                    Err(_) => Envelope::error(env.id, "bridge closed", ErrorCode::WriteFailed),
                }
            }
            other => Envelope::error(
                env.id.clone(),
                format!("Unknown message type: {other}"),
                ErrorCode::UnknownType,
            ),
        }
    }

    /// Serialize a frame and push it to every client, dropping dead sockets.
    async fn broadcast_frame(&self, frame: Envelope) {
        let text = frame.to_json();
        let mut dead = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, tx) in clients.iter() {
                if tx.send(Message::Text(text.clone().into())).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in dead {
                clients.remove(&id);
            }
        }
    }

    async fn broadcast_tag(&self, data: NfcData) {
        let payload = match (&data.card, &data.err) {
            (Some(card), _) => {
                *self.last_card.write().await = Some(card.clone());
                TagPayload::from_card(card)
            }
            (None, Some(err)) => TagPayload::from_error(err.clone()),
            (None, None) => return,
        };
        self.broadcast_frame(Envelope::event(kind::TAG_DATA, &payload)).await;
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

pub fn router(state: Arc<ConsumerState>) -> Router {
    let mut api = Router::new().route("/api/v1/health", get(api_health));
    if state.allow_injection {
        api = api.route("/api/v1/tag", post(inject_tag));
    }
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .merge(api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> &'static str {
    "nfc-agent consumer endpoint"
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn api_health(State(state): State<Arc<ConsumerState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "readerConnected": *state.reader_connected.read().await,
        "clients": state.client_count().await,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ConsumerState>>,
    Extension(PeerAddr(peer)): Extension<PeerAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let token = match state.sessions.acquire(
        params.get("secret").map(String::as_str),
        origin.as_deref(),
        peer,
    ) {
        Ok(token) => token,
        Err(SessionError::Unauthorized) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(SessionError::Conflict) => return StatusCode::CONFLICT.into_response(),
    };
    ws.on_upgrade(move |socket| handle_client(socket, state, token, origin, peer))
}

async fn handle_client(
    socket: WebSocket,
    state: Arc<ConsumerState>,
    token: String,
    origin: Option<String>,
    peer: SocketAddr,
) {
    let client_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    state.clients.write().await.insert(client_id, out_tx.clone());
    info!(%client_id, %peer, "client connected");

    // Late joiners get the most recent card immediately.
    if let Some(card) = state.last_card.read().await.clone() {
        let frame = Envelope::event(kind::TAG_DATA, &TagPayload::from_card(&card));
        let _ = out_tx.send(Message::Text(frame.to_json().into()));
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.sessions.touch(&token, origin.as_deref(), peer);
                let reply = state.handle_frame(client_id, text.as_str()).await;
                if out_tx.send(Message::Text(reply.to_json().into())).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%client_id, error = %err, "socket read error");
                break;
            }
        }
    }

    writer.abort();
    state.clients.write().await.remove(&client_id);
    state.sessions.release(&token);
    info!(%client_id, "client disconnected");
}

/// `POST /api/v1/tag` — inject a synthetic tag as if it had been scanned.
async fn inject_tag(
    State(state): State<Arc<ConsumerState>>,
    Json(req): Json<TagInputRequest>,
) -> Result<Json<TagInputResponse>, (StatusCode, String)> {
    let normalized =
        uid::normalize(&req.uid).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let mut tag = Tag::injected(
        normalized.clone(),
        req.tag_type.unwrap_or_else(|| "Injected".into()),
        req.technology.unwrap_or_else(|| "ISO14443A".into()),
    );
    if let Some(records) = req.records.filter(|r| !r.is_empty()) {
        tag = tag.with_message(protocol::build_write_message(&records));
    } else if let Some(text) = req.text.filter(|t| !t.is_empty()) {
        tag = tag.with_message(crate::ndef::NdefMessage::new(vec![
            crate::ndef::NdefRecord::text(&text, "en"),
        ]));
    }

    if !state.bridge.send_tag_data(NfcData::card(Card::new(tag))) {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "event queue is full or closed".into(),
        ));
    }
    Ok(Json(TagInputResponse {
        status: "ok".into(),
        uid: normalized,
    }))
}

/// Drain bridge events into the client set until the bridge closes.
async fn fanout_loop(
    state: Arc<ConsumerState>,
    mut tag_rx: mpsc::Receiver<NfcData>,
    mut status_rx: mpsc::Receiver<crate::tag::DeviceStatus>,
) {
    loop {
        tokio::select! {
            tag = tag_rx.recv() => match tag {
                Some(data) => state.broadcast_tag(data).await,
                None => break,
            },
            status = status_rx.recv() => match status {
                Some(status) => {
                    *state.reader_connected.write().await = status.connected;
                    let payload = DeviceStatusPayload::from(&status);
                    state.broadcast_frame(Envelope::event(kind::DEVICE_STATUS, &payload)).await;
                }
                None => break,
            },
        }
    }
    state.clients.write().await.clear();
    debug!("consumer fanout stopped");
}

pub struct ConsumerServer {
    state: Arc<ConsumerState>,
    http: HttpServer,
    fanout: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerServer {
    /// Build the state, wire the fanout to the bridge and start listening.
    pub async fn start(config: ConsumerConfig, bridge: Arc<Bridge>) -> Result<Self, ServeError> {
        let state = Arc::new(ConsumerState::new(
            bridge.clone(),
            config.api_secret,
            config.allow_injection,
        ));

        let tag_rx = bridge.take_tag_rx().expect("bridge tag receiver already taken");
        let status_rx = bridge
            .take_status_rx()
            .expect("bridge status receiver already taken");
        let fanout = tokio::spawn(fanout_loop(state.clone(), tag_rx, status_rx));

        let http = HttpServer::spawn("consumer", config.addr, router(state.clone()), config.tls)
            .await?;
        Ok(Self {
            state,
            http,
            fanout: std::sync::Mutex::new(Some(fanout)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub async fn stop(&self) {
        self.http.stop().await;
        let fanout = self.fanout.lock().expect("fanout lock poisoned").take();
        if let Some(fanout) = fanout {
            fanout.abort();
            let _ = fanout.await;
        }
        self.state.clients.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::WriteOutcome;
    use crate::ndef::{NdefMessage, NdefRecord};

    fn state_with_bridge() -> (Arc<ConsumerState>, Arc<Bridge>) {
        let bridge = Arc::new(Bridge::new());
        let state = Arc::new(ConsumerState::new(bridge.clone(), None, true));
        (state, bridge)
    }

    fn sample_card(text: &str) -> Card {
        let msg = NdefMessage::new(vec![NdefRecord::text(text, "en")]);
        Card::new(
            Tag::injected("04:AB:CD:EF".into(), "NTAG215".into(), "ISO14443A".into())
                .with_message(msg),
        )
    }

    #[tokio::test]
    async fn write_request_round_trip() {
        let (state, bridge) = state_with_bridge();
        let mut write_rx = bridge.take_write_rx().unwrap();
        tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                assert_eq!(msg.records.len(), 1);
                let _ = msg.reply.send(WriteOutcome::ok());
            }
        });

        let reply = state
            .handle_frame(
                Uuid::new_v4(),
                r#"{"id":"r1","type":"writeRequest","payload":{"records":[{"type":"text","content":"Hello","language":"en"}]}}"#,
            )
            .await;
        assert_eq!(reply.kind, kind::WRITE_RESPONSE);
        assert_eq!(reply.id.as_deref(), Some("r1"));
        assert_eq!(reply.success, Some(true));
    }

    #[tokio::test]
    async fn failed_write_maps_to_write_failed() {
        let (state, bridge) = state_with_bridge();
        let mut write_rx = bridge.take_write_rx().unwrap();
        tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                let _ = msg.reply.send(WriteOutcome::failed("No NFC reader available"));
            }
        });

        let reply = state
            .handle_frame(
                Uuid::new_v4(),
                r#"{"id":"r2","type":"writeRequest","payload":{"records":[{"type":"text","content":"x"}]}}"#,
            )
            .await;
        assert_eq!(reply.kind, kind::ERROR);
        assert_eq!(reply.error.as_deref(), Some("No NFC reader available"));
        let code: crate::protocol::ErrorPayload =
            serde_json::from_value(reply.payload.unwrap()).unwrap();
        assert_eq!(code.code, ErrorCode::WriteFailed);
    }

    #[tokio::test]
    async fn unknown_type_and_bad_payloads() {
        let (state, _bridge) = state_with_bridge();
        let client = Uuid::new_v4();

        let reply = state
            .handle_frame(client, r#"{"type":"bogus"}"#)
            .await;
        assert_eq!(reply.kind, kind::ERROR);
        assert_eq!(reply.error.as_deref(), Some("Unknown message type: bogus"));

        let reply = state.handle_frame(client, "not json").await;
        let code: crate::protocol::ErrorPayload =
            serde_json::from_value(reply.payload.unwrap()).unwrap();
        assert_eq!(code.code, ErrorCode::ParseError);

        let reply = state
            .handle_frame(client, r#"{"type":"writeRequest","payload":{"records":[]}}"#)
            .await;
        let code: crate::protocol::ErrorPayload =
            serde_json::from_value(reply.payload.unwrap()).unwrap();
        assert_eq!(code.code, ErrorCode::InvalidWriteRequest);

        let reply = state
            .handle_frame(client, r#"{"type":"writeRequest","payload":{"records":"x"}}"#)
            .await;
        let code: crate::protocol::ErrorPayload =
            serde_json::from_value(reply.payload.unwrap()).unwrap();
        assert_eq!(code.code, ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn fanout_broadcasts_and_caches_last_card() {
        let (state, bridge) = state_with_bridge();
        let tag_rx = bridge.take_tag_rx().unwrap();
        let status_rx = bridge.take_status_rx().unwrap();
        tokio::spawn(fanout_loop(state.clone(), tag_rx, status_rx));

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        state.clients.write().await.insert(Uuid::new_v4(), client_tx);

        assert!(bridge.send_tag_data(NfcData::card(sample_card("Hello"))));
        let frame = tokio::time::timeout(std::time::Duration::from_millis(300), client_rx.recv())
            .await
            .expect("fanout must deliver")
            .unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let json: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(json["type"], "tagData");
        assert_eq!(json["payload"]["uid"], "04:AB:CD:EF");
        assert_eq!(json["payload"]["text"], "Hello");
        assert_eq!(json["payload"]["err"], Value::Null);

        let cached = state.last_card.read().await.clone().unwrap();
        assert_eq!(cached.tag.uid, "04:AB:CD:EF");
    }

    #[tokio::test]
    async fn fanout_broadcasts_filter_rejections() {
        let (state, bridge) = state_with_bridge();
        let tag_rx = bridge.take_tag_rx().unwrap();
        let status_rx = bridge.take_status_rx().unwrap();
        tokio::spawn(fanout_loop(state.clone(), tag_rx, status_rx));

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        state.clients.write().await.insert(Uuid::new_v4(), client_tx);

        bridge.send_tag_data(NfcData::error(
            "card type 'MIFARE Classic 1K' not allowed by filter",
        ));
        let frame = tokio::time::timeout(std::time::Duration::from_millis(300), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let json: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(json["payload"]["uid"], "");
        assert_eq!(
            json["payload"]["err"],
            "card type 'MIFARE Classic 1K' not allowed by filter"
        );
    }
}
