//! Shared fixtures: an in-process WebSocket server and a recording host bridge.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use trigger::{
    ConnectionManager, ConnectionState, DecodedMessage, HostBridge, MemoryStaticData,
    StaticDataStore, TriggerError,
};

pub const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// One accepted WebSocket connection, driven by the test.
pub struct ServerConn {
    pub peer: SocketAddr,
    pub accepted_at: Instant,
    pub authorization: Option<String>,
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .expect("server send failed");
    }

    pub async fn send_binary(&mut self, data: &[u8]) {
        self.ws
            .send(Message::Binary(data.to_vec().into()))
            .await
            .expect("server send failed");
    }

    /// Next text frame from the client.
    pub async fn recv_text(&mut self) -> String {
        loop {
            let next = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame");
            match next {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("unexpected client frame: {other:?}"),
            }
        }
    }

    /// Close from the server side (an abnormal close for the client).
    /// Returns when the close handshake is over.
    pub async fn close(mut self) -> Instant {
        let _ = self.ws.close(None).await;
        while let Ok(Some(Ok(_))) = timeout(WAIT, self.ws.next()).await {}
        Instant::now()
    }

    /// `true` once the client has closed the connection.
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match timeout(WAIT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

/// Accepts connections on `127.0.0.1` and hands each one to the test.
pub struct TestServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let accepted_at = Instant::now();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut authorization = None;
                    let callback = |req: &Request, resp: Response| {
                        authorization = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        Ok(resp)
                    };
                    if let Ok(ws) = accept_hdr_async(stream, callback).await {
                        let _ = tx.send(ServerConn {
                            peer,
                            accepted_at,
                            authorization,
                            ws,
                        });
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}"),
            connections,
        }
    }

    pub async fn next_connection(&mut self) -> ServerConn {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }

    /// `true` if nobody connects within `window`.
    pub async fn quiet_for(&mut self, window: Duration) -> bool {
        timeout(window, self.connections.recv()).await.is_err()
    }
}

/// A `ws://` URL nothing listens on.
pub async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}")
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// One `emit` call as the host saw it.
#[derive(Debug, Clone)]
pub struct Emitted {
    pub value: Value,
    /// Workflow static data at the moment of emission.
    pub static_data: Value,
}

/// `HostBridge` double recording everything the trigger hands over.
pub struct RecordingBridge {
    parameters: Value,
    store: MemoryStaticData,
    emit_delay: Option<Duration>,
    events_tx: mpsc::UnboundedSender<Emitted>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Emitted>>,
    errors: Mutex<Vec<(&'static str, String)>>,
    /// When set, events carrying an `ask` field are answered over this manager.
    manager: OnceLock<Weak<ConnectionManager>>,
}

impl RecordingBridge {
    pub fn new(parameters: Value) -> Arc<Self> {
        Self::build(parameters, None)
    }

    /// A host that takes `delay` to absorb each event.
    pub fn slow(parameters: Value, delay: Duration) -> Arc<Self> {
        Self::build(parameters, Some(delay))
    }

    fn build(parameters: Value, emit_delay: Option<Duration>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            parameters,
            store: MemoryStaticData::new(),
            emit_delay,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            errors: Mutex::new(Vec::new()),
            manager: OnceLock::new(),
        })
    }

    /// Let `emit` talk back on `manager`: for an event `{"ask": q, ..}` it
    /// sends `q`, awaits the reply and records the event with a `reply` field.
    pub fn attach(&self, manager: &Arc<ConnectionManager>) {
        let _ = self.manager.set(Arc::downgrade(manager));
    }

    async fn converse(&self, value: &mut Value) {
        let Some(question) = value.get("ask").cloned() else {
            return;
        };
        let Some(manager) = self.manager.get().and_then(Weak::upgrade) else {
            return;
        };
        let reply = match manager.send(question, true).await {
            Ok(Some(message)) => message.into_value(),
            Ok(None) => Value::Null,
            Err(err) => json!({ "error": err.to_string() }),
        };
        value["reply"] = reply;
    }

    pub fn store(&self) -> &MemoryStaticData {
        &self.store
    }

    pub async fn next_emitted(&self) -> Emitted {
        timeout(WAIT, self.events_rx.lock().await.recv())
            .await
            .expect("timed out waiting for an emitted event")
            .expect("event channel closed")
    }

    pub async fn next_event(&self) -> Value {
        self.next_emitted().await.value
    }

    /// `true` if nothing is emitted within `window`.
    pub async fn quiet_for(&self, window: Duration) -> bool {
        timeout(window, self.events_rx.lock().await.recv()).await.is_err()
    }

    pub fn errors(&self) -> Vec<(&'static str, String)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn error_kinds(&self) -> Vec<&'static str> {
        self.errors().into_iter().map(|(kind, _)| kind).collect()
    }

    /// Poll until an error of `kind` has been reported.
    pub async fn wait_for_error(&self, kind: &str) -> String {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some((_, message)) = self.errors().into_iter().find(|(k, _)| *k == kind) {
                return message;
            }
            assert!(Instant::now() < deadline, "no '{kind}' error reported");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn kind(error: &TriggerError) -> &'static str {
    match error {
        TriggerError::Config(_) => "config",
        TriggerError::Connect { .. } => "connect",
        TriggerError::Transport(_) => "transport",
        TriggerError::Closed { .. } => "closed",
        TriggerError::NotOpen => "not_open",
        TriggerError::Script(_) => "script",
        TriggerError::AlreadyActive => "already_active",
        TriggerError::Deactivated => "deactivated",
    }
}

#[async_trait]
impl HostBridge for RecordingBridge {
    async fn emit(&self, message: DecodedMessage) {
        if let Some(delay) = self.emit_delay {
            tokio::time::sleep(delay).await;
        }
        let mut value = message.into_value();
        self.converse(&mut value).await;
        let _ = self.events_tx.send(Emitted {
            value,
            static_data: self.store.snapshot(),
        });
    }

    fn emit_error(&self, error: TriggerError) {
        self.errors
            .lock()
            .unwrap()
            .push((kind(&error), error.to_string()));
    }

    fn parameter(&self, name: &str) -> Option<Value> {
        self.parameters.get(name).cloned()
    }

    fn static_data(&self) -> Arc<dyn StaticDataStore> {
        Arc::new(self.store.clone())
    }
}

pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let mut rx = manager.subscribe_state();
    timeout(WAIT, rx.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .expect("state channel closed");
}
