//! Producer (device-facing) server
//!
//! Remote devices connect here over the reverse WebSocket: registration
//! first, then `tagScanned`/`tagRemoved`/`deviceHeartbeat` frames. Every
//! registered device is opened through the multi-manager like any reader
//! and its inbox pumped onto the bridge. The producer also owns the write
//! executor draining `Bridge.WriteRequest` onto the physical reader.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HttpServer, ServeError};
use crate::bridge::{Bridge, WriteOutcome, WriteRequestMessage};
use crate::manager::MultiManager;
use crate::protocol::{
    self, Envelope, ErrorCode, RegisterDevice, RegisterDeviceResponse, ServerInfo, TagData, kind,
};
use crate::reader::{DeviceManager, Reader, TagDevice};
use crate::remote::{self, RemoteDeviceManager};
use crate::tag::{Card, DeviceStatus, NfcData};

/// NFC technologies advertised to registering devices.
const SUPPORTED_NFC: [&str; 3] = ["ISO14443A", "MIFARE", "NTAG"];

pub struct ProducerConfig {
    pub addr: SocketAddr,
    pub tls: Option<tokio_rustls::TlsAcceptor>,
}

pub struct ProducerState {
    remote: Arc<RemoteDeviceManager>,
    multi: Arc<MultiManager>,
    bridge: Arc<Bridge>,
}

impl ProducerState {
    fn server_info() -> ServerInfo {
        ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            supported_nfc: SUPPORTED_NFC.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Validate a registration, create the device and start pumping its
    /// inbox onto the bridge. Returns the response frame.
    async fn register_device(&self, reg: RegisterDevice) -> Result<(Uuid, Envelope), Envelope> {
        let device_name = reg.device_name.clone();
        let id = self.remote.register(reg).await.map_err(|err| {
            Envelope::error(None, err.to_string(), ErrorCode::InvalidRegistration)
        })?;

        match self
            .multi
            .open_device(&format!("{}:{id}", remote::MANAGER_NAME))
            .await
        {
            Ok(device) => {
                tokio::spawn(pump_device_tags(device, self.bridge.clone(), device_name));
            }
            Err(err) => {
                // Should not happen right after registration; drop the
                // device rather than serve a half-wired session.
                self.remote.unregister(id).await;
                return Err(Envelope::error(
                    None,
                    err.to_string(),
                    ErrorCode::InvalidRegistration,
                ));
            }
        }

        let response = Envelope::reply(
            None,
            kind::REGISTER_DEVICE_RESPONSE,
            &RegisterDeviceResponse {
                device_id: id,
                server_info: Self::server_info(),
            },
        );
        Ok((id, response))
    }
}

/// Per-socket session after successful registration.
struct DeviceSession {
    id: Uuid,
    name: String,
    state: Arc<ProducerState>,
}

impl DeviceSession {
    /// Handle one post-registration frame; `Some` is a reply to send back.
    async fn handle_frame(&self, text: &str) -> Option<Envelope> {
        let env = match Envelope::parse(text) {
            Ok(env) => env,
            Err(err) => {
                return Some(Envelope::error(
                    None,
                    format!("invalid frame: {err}"),
                    ErrorCode::ParseError,
                ));
            }
        };
        match env.kind.as_str() {
            kind::TAG_SCANNED => self.handle_tag_scanned(env).await,
            kind::TAG_REMOVED => {
                self.state.remote.tag_removed(self.id).await;
                self.state.bridge.send_device_status(
                    DeviceStatus::connected(format!("Remote device {} idle", self.name))
                        .with_card_present(false),
                );
                None
            }
            kind::DEVICE_HEARTBEAT => {
                self.state.remote.heartbeat(self.id).await;
                None
            }
            other => Some(Envelope::error(
                env.id.clone(),
                format!("Unknown message type: {other}"),
                ErrorCode::UnknownType,
            )),
        }
    }

    async fn handle_tag_scanned(&self, env: Envelope) -> Option<Envelope> {
        let data: TagData = match env.payload_as() {
            Ok(data) => data,
            Err(_) => {
                return Some(Envelope::error(
                    env.id,
                    "tagScanned payload is invalid",
                    ErrorCode::InvalidPayload,
                ));
            }
        };
        if data.device_id != self.id {
            return Some(Envelope::error(
                env.id,
                "deviceID does not match this session",
                ErrorCode::InvalidPayload,
            ));
        }
        let tag = match data.into_tag() {
            Ok(tag) => tag,
            Err(err) => {
                return Some(Envelope::error(
                    env.id,
                    format!("invalid tag UID: {err}"),
                    ErrorCode::InvalidPayload,
                ));
            }
        };

        match self.state.remote.push_tags(self.id, vec![tag]).await {
            Ok(queued) => {
                if !queued {
                    debug!(device_id = %self.id, "scan dropped, inbox full");
                }
                self.state.bridge.send_device_status(
                    DeviceStatus::connected(format!("Remote device {} scanning", self.name))
                        .with_card_present(true),
                );
                None
            }
            Err(err) => Some(Envelope::error(env.id, err.to_string(), ErrorCode::InvalidPayload)),
        }
    }
}

/// Drain a device's inbox onto the bridge until the device closes.
async fn pump_device_tags(
    mut device: Box<dyn TagDevice>,
    bridge: Arc<Bridge>,
    device_name: String,
) {
    loop {
        match device.get_tags().await {
            Ok(tags) => {
                for tag in tags {
                    if !bridge.send_tag_data(NfcData::card(Card::new(tag))) && bridge.is_closed() {
                        return;
                    }
                }
            }
            Err(_) => break,
        }
        if bridge.is_closed() {
            return;
        }
    }
    debug!(device = %device_name, "remote tag pump stopped");
}

/// Execute write requests against the physical reader. Replies always go
/// out on the request's private channel, never dropped.
async fn write_executor(
    mut write_rx: mpsc::Receiver<WriteRequestMessage>,
    reader: Option<Arc<Reader>>,
) {
    while let Some(request) = write_rx.recv().await {
        let outcome = match &reader {
            None => WriteOutcome::failed("No NFC reader available"),
            Some(reader) => {
                let message = protocol::build_write_message(&request.records);
                match reader.write_message(message).await {
                    Ok(()) => WriteOutcome::ok(),
                    Err(err) => WriteOutcome::failed(err.to_string()),
                }
            }
        };
        if request.reply.send(outcome).is_err() {
            warn!("write requester went away before the reply");
        }
    }
    debug!("write executor stopped");
}

/// Forward reader events onto the bridge until either side closes.
async fn pump_reader(reader: Arc<Reader>, bridge: Arc<Bridge>) {
    let mut tags = reader.subscribe_tags();
    let mut statuses = reader.subscribe_status();
    loop {
        tokio::select! {
            tag = tags.recv() => match tag {
                Ok(data) => {
                    if !bridge.send_tag_data(data) && bridge.is_closed() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(missed = n, "reader tag stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
            status = statuses.recv() => match status {
                Ok(status) => {
                    if !bridge.send_device_status(status) && bridge.is_closed() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(missed = n, "reader status stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

pub fn router(state: Arc<ProducerState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ProducerState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let device_mode = headers
        .get("x-device-mode")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        || params.get("mode").is_some_and(|m| m == "device");
    if !device_mode {
        return (
            StatusCode::BAD_REQUEST,
            "this endpoint accepts device connections only",
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_device(socket, state))
}

async fn handle_device(socket: WebSocket, state: Arc<ProducerState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let send = |frame: Envelope| {
        let out_tx = out_tx.clone();
        async move {
            out_tx.send(Message::Text(frame.to_json().into())).is_ok()
        }
    };

    // First frame must be the registration.
    let session = loop {
        let Some(frame) = ws_rx.next().await else {
            writer.abort();
            return;
        };
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => {
                writer.abort();
                return;
            }
            Ok(_) => continue,
        };

        let failure = |message: String| {
            Envelope::error(None, message, ErrorCode::InvalidRegistration)
        };
        let env = match Envelope::parse(text.as_str()) {
            Ok(env) if env.kind == kind::REGISTER_DEVICE => env,
            Ok(env) => {
                send(failure(format!(
                    "expected registerDevice, got {}",
                    env.kind
                )))
                .await;
                writer.abort();
                return;
            }
            Err(err) => {
                send(failure(format!("invalid frame: {err}"))).await;
                writer.abort();
                return;
            }
        };
        let reg: RegisterDevice = match env.payload_as() {
            Ok(reg) => reg,
            Err(_) => {
                send(failure("registerDevice payload is invalid".into())).await;
                writer.abort();
                return;
            }
        };

        match state.register_device(reg).await {
            Ok((id, response)) => {
                let name = state
                    .remote
                    .get(id)
                    .await
                    .map(|d| d.name)
                    .unwrap_or_default();
                if !send(response).await {
                    state.remote.unregister(id).await;
                    writer.abort();
                    return;
                }
                break DeviceSession {
                    id,
                    name,
                    state: state.clone(),
                };
            }
            Err(error_frame) => {
                send(error_frame).await;
                writer.abort();
                return;
            }
        }
    };

    info!(device_id = %session.id, device = %session.name, "device session started");

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some(reply) = session.handle_frame(text.as_str()).await {
                    if !send(reply).await {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(device_id = %session.id, error = %err, "device socket error");
                break;
            }
        }
    }

    writer.abort();
    state.remote.unregister(session.id).await;
    info!(device_id = %session.id, "device session ended");
}

pub struct ProducerServer {
    http: HttpServer,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ProducerServer {
    /// Start listening and wire the write executor and reader pumps to the
    /// bridge.
    pub async fn start(
        config: ProducerConfig,
        bridge: Arc<Bridge>,
        remote: Arc<RemoteDeviceManager>,
        multi: Arc<MultiManager>,
        reader: Option<Arc<Reader>>,
    ) -> Result<Self, ServeError> {
        let state = Arc::new(ProducerState {
            remote,
            multi,
            bridge: bridge.clone(),
        });

        let mut tasks = Vec::new();
        let write_rx = bridge
            .take_write_rx()
            .expect("bridge write receiver already taken");
        tasks.push(tokio::spawn(write_executor(write_rx, reader.clone())));
        if let Some(reader) = reader {
            tasks.push(tokio::spawn(pump_reader(reader, bridge)));
        }

        let http =
            HttpServer::spawn("producer", config.addr, router(state.clone()), config.tls).await?;
        Ok(Self {
            http,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub async fn stop(&self) {
        self.http.stop().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task lock poisoned"));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteCapabilities;
    use crate::remote::DEFAULT_INACTIVITY_TIMEOUT;
    use std::time::Duration;

    fn test_state() -> (Arc<ProducerState>, Arc<Bridge>) {
        let bridge = Arc::new(Bridge::new());
        let remote = Arc::new(RemoteDeviceManager::new(DEFAULT_INACTIVITY_TIMEOUT));
        let multi = MultiManager::new(vec![remote.clone() as Arc<dyn DeviceManager>]);
        let state = Arc::new(ProducerState {
            remote,
            multi,
            bridge: bridge.clone(),
        });
        (state, bridge)
    }

    fn registration() -> RegisterDevice {
        RegisterDevice {
            device_name: "Pixel".into(),
            platform: "android".into(),
            app_version: "1".into(),
            capabilities: RemoteCapabilities::default(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn registration_yields_device_id_and_server_info() {
        let (state, _bridge) = test_state();
        let (id, response) = state.register_device(registration()).await.unwrap();
        assert_eq!(response.kind, kind::REGISTER_DEVICE_RESPONSE);
        let payload: RegisterDeviceResponse = response.payload_as().unwrap();
        assert_eq!(payload.device_id, id);
        assert!(!payload.server_info.supported_nfc.is_empty());
    }

    #[tokio::test]
    async fn rejected_registration_maps_to_error_frame() {
        let (state, _bridge) = test_state();
        let mut reg = registration();
        reg.platform = "windows".into();
        let err = state.register_device(reg).await.unwrap_err();
        assert_eq!(err.kind, kind::ERROR);
        let payload: crate::protocol::ErrorPayload = err.payload_as().unwrap();
        assert_eq!(payload.code, ErrorCode::InvalidRegistration);
    }

    #[tokio::test]
    async fn scanned_tag_reaches_the_bridge_normalized() {
        let (state, bridge) = test_state();
        let mut tag_rx = bridge.take_tag_rx().unwrap();
        let (id, _) = state.register_device(registration()).await.unwrap();
        let session = DeviceSession {
            id,
            name: "Pixel".into(),
            state: state.clone(),
        };

        let frame = format!(
            r#"{{"type":"tagScanned","payload":{{"deviceID":"{id}","uid":"04 AB CD EF","technology":"ISO14443A","type":"NTAG215","scannedAt":"2025-01-01T00:00:00Z"}}}}"#
        );
        assert!(session.handle_frame(&frame).await.is_none());

        let data = tokio::time::timeout(Duration::from_millis(800), tag_rx.recv())
            .await
            .expect("pump must forward the scan")
            .unwrap();
        let card = data.card.unwrap();
        assert_eq!(card.tag.uid, "04:AB:CD:EF");
        assert_eq!(card.tag.tag_type, "NTAG215");
        assert_eq!(card.tag.technology, "ISO14443A");
    }

    #[tokio::test]
    async fn device_id_mismatch_is_rejected() {
        let (state, _bridge) = test_state();
        let (id, _) = state.register_device(registration()).await.unwrap();
        let session = DeviceSession {
            id,
            name: "Pixel".into(),
            state: state.clone(),
        };
        let other = Uuid::new_v4();
        let frame = format!(
            r#"{{"type":"tagScanned","payload":{{"deviceID":"{other}","uid":"04ABCDEF","scannedAt":"2025-01-01T00:00:00Z"}}}}"#
        );
        let reply = session.handle_frame(&frame).await.unwrap();
        assert_eq!(reply.kind, kind::ERROR);
        assert_eq!(
            reply.error.as_deref(),
            Some("deviceID does not match this session")
        );
    }

    #[tokio::test]
    async fn unknown_type_keeps_the_session() {
        let (state, _bridge) = test_state();
        let (id, _) = state.register_device(registration()).await.unwrap();
        let session = DeviceSession {
            id,
            name: "Pixel".into(),
            state: state.clone(),
        };
        let reply = session.handle_frame(r#"{"type":"selfDestruct"}"#).await.unwrap();
        assert_eq!(reply.kind, kind::ERROR);
        let payload: crate::protocol::ErrorPayload = reply.payload_as().unwrap();
        assert_eq!(payload.code, ErrorCode::UnknownType);
        // The manager still knows the device.
        assert!(state.remote.get(id).await.is_some());
    }

    #[tokio::test]
    async fn write_executor_without_reader_fails_cleanly() {
        let bridge = Arc::new(Bridge::new());
        let write_rx = bridge.take_write_rx().unwrap();
        tokio::spawn(write_executor(write_rx, None));

        let outcome = bridge
            .send_write_request(Some("r1".into()), Uuid::new_v4(), vec![])
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("No NFC reader available"));
    }

    #[tokio::test]
    async fn heartbeat_refreshes_last_seen() {
        let (state, _bridge) = test_state();
        let (id, _) = state.register_device(registration()).await.unwrap();
        let session = DeviceSession {
            id,
            name: "Pixel".into(),
            state: state.clone(),
        };
        let before = state.remote.get(id).await.unwrap().last_seen;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            session
                .handle_frame(r#"{"type":"deviceHeartbeat"}"#)
                .await
                .is_none()
        );
        let after = state.remote.get(id).await.unwrap().last_seen;
        assert!(after > before);
    }
}
