//! Connection manager: the socket state machine.
//!
//! ```text
//!  Disconnected ──activate──▶ Connecting ──open──▶ Open
//!        ▲                        ▲                  │ close
//!        │ deactivate             │ delay elapsed    ▼
//!        └────────────────────────┴────────── Reconnecting
//! ```
//!
//! One supervisor task per active trigger owns the physical socket. Every
//! (re)connect builds a fresh socket; the old one is dropped, never reused.
//! On each open the open-script runs once; inbound frames that arrive while
//! it runs are held back and handed to the host, in order, as soon as it
//! finishes. Frames reach the host through a separate dispatcher task, so
//! the host can write to the connection while it handles one. All writes,
//! from the script, the host or [`ConnectionManager::send`], go through the
//! supervisor, so there is exactly one writer on the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{error::SendError, OwnedPermit};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::codec::{self, DecodedMessage, InboundFrame};
use crate::sandbox::{MessageChannel, ParameterSource, SandboxContext, SandboxExecutor, SandboxLimits};
use crate::{AuthContext, AuthProvider, HostBridge, SandboxError, TriggerConfig, TriggerError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle state of the trigger's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
}

/// Requests from script or host to the supervisor owning the socket.
enum Command {
    Send {
        frame: String,
        reply: Option<oneshot::Sender<DecodedMessage>>,
        written: oneshot::Sender<Result<(), TriggerError>>,
    },
    Await {
        reply: oneshot::Sender<DecodedMessage>,
    },
}

/// Capability bound to one physical connection. Dead once that socket closes.
#[derive(Clone)]
struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl MessageChannel for SessionHandle {
    async fn send(
        &self,
        payload: Value,
        await_response: bool,
    ) -> Result<Option<DecodedMessage>, TriggerError> {
        let (written_tx, written_rx) = oneshot::channel();
        let (reply, response) = if await_response {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.commands
            .send(Command::Send {
                frame: codec::encode(&payload),
                reply,
                written: written_tx,
            })
            .map_err(|_| TriggerError::NotOpen)?;
        written_rx.await.map_err(|_| TriggerError::NotOpen)??;

        match response {
            Some(rx) => rx.await.map(Some).map_err(|_| TriggerError::NotOpen),
            None => Ok(None),
        }
    }

    async fn next_message(&self) -> Result<DecodedMessage, TriggerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Await { reply })
            .map_err(|_| TriggerError::NotOpen)?;
        response.await.map_err(|_| TriggerError::NotOpen)
    }
}

/// Node configuration as seen by the open-script.
struct BridgeParameters(Arc<dyn HostBridge>);

impl ParameterSource for BridgeParameters {
    fn parameter(&self, name: &str) -> Option<Value> {
        self.0.parameter(name)
    }
}

/// State shared between the manager and its supervisor task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    manual_close: AtomicBool,
    shutdown: CancellationToken,
    attempts: AtomicU32,
    session: Mutex<Option<SessionHandle>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "connection state changed");
        }
    }

    fn session(&self) -> Option<SessionHandle> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install_session(&self, handle: Option<SessionHandle>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }
}

/// Owns the trigger's connection: connect, open-script, dispatch, reconnect.
pub struct ConnectionManager {
    config: TriggerConfig,
    bridge: Arc<dyn HostBridge>,
    auth_provider: Option<Arc<dyn AuthProvider>>,
    sandbox: SandboxExecutor,
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: TriggerConfig, bridge: Arc<dyn HostBridge>) -> Self {
        let sandbox = SandboxExecutor::new(SandboxLimits::from(&config));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            bridge,
            auth_provider: None,
            sandbox,
            shared: Arc::new(Shared {
                state,
                manual_close: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                attempts: AtomicU32::new(0),
                session: Mutex::new(None),
            }),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Connect attempts made so far, the first one included.
    pub fn connect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Connect attempts made after the first one.
    pub fn retry_count(&self) -> u32 {
        self.connect_attempts().saturating_sub(1)
    }

    /// Fetch credentials, open the connection and start the supervisor.
    ///
    /// Returns once the first connection is open. If that first attempt
    /// fails the error is returned and nothing is scheduled; failures after
    /// a successful open are retried indefinitely in the background.
    ///
    /// # Errors
    /// [`TriggerError::Config`] for an unusable URI, [`TriggerError::Connect`]
    /// when the first attempt fails, [`TriggerError::AlreadyActive`] and
    /// [`TriggerError::Deactivated`] on misuse.
    #[instrument(skip(self), fields(uri = %self.config.uri))]
    pub async fn activate(&self) -> Result<(), TriggerError> {
        let mut supervisor = self.supervisor.lock().await;
        if self.shared.manual_close.load(Ordering::SeqCst) {
            return Err(TriggerError::Deactivated);
        }
        if supervisor.is_some() {
            return Err(TriggerError::AlreadyActive);
        }

        let target = self.config.target()?;
        let auth = AuthContext::resolve(self.auth_provider.as_deref()).await;

        let worker = Supervisor {
            config: self.config.clone(),
            target,
            auth,
            bridge: Arc::clone(&self.bridge),
            sandbox: self.sandbox.clone(),
            shared: Arc::clone(&self.shared),
        };

        let first = tokio::select! {
            _ = self.shared.shutdown.cancelled() => Err(TriggerError::Deactivated),
            connected = worker.connect() => connected,
        };
        let stream = match first {
            Ok(stream) => stream,
            Err(err) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!("first connect attempt failed: {err}");
                return Err(err);
            }
        };

        *supervisor = Some(tokio::spawn(worker.run(stream)));
        Ok(())
    }

    /// Close the connection for good.
    ///
    /// Sets the manual-close flag, cancels any pending connect or reconnect
    /// delay, closes the socket and waits for the supervisor to stop. Safe to
    /// call in any state, and more than once.
    pub async fn deactivate(&self) {
        let first_call = !self.shared.manual_close.swap(true, Ordering::SeqCst);
        self.shared.shutdown.cancel();

        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("connection supervisor ended abnormally: {err}");
            }
        }

        self.shared.install_session(None);
        self.shared.set_state(ConnectionState::Disconnected);
        if first_call {
            info!(uri = %self.config.uri, "trigger deactivated");
        }
    }

    /// Write `payload` to the open connection.
    ///
    /// Strings go out verbatim; other values as JSON. With `await_response`
    /// the call resolves with the next inbound frame. Frames are not
    /// correlated: concurrent awaiting callers are served in call order.
    ///
    /// # Errors
    /// [`TriggerError::NotOpen`] unless a connection is open, or if it closes
    /// before the write (or the awaited frame) completes.
    pub async fn send(
        &self,
        payload: Value,
        await_response: bool,
    ) -> Result<Option<DecodedMessage>, TriggerError> {
        let session = self.open_session()?;
        session.send(payload, await_response).await
    }

    /// Resolve with the next inbound frame on the open connection.
    pub async fn next_message(&self) -> Result<DecodedMessage, TriggerError> {
        let session = self.open_session()?;
        session.next_message().await
    }

    fn open_session(&self) -> Result<SessionHandle, TriggerError> {
        if self.state() != ConnectionState::Open {
            return Err(TriggerError::NotOpen);
        }
        self.shared.session().ok_or(TriggerError::NotOpen)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.manual_close.store(true, Ordering::SeqCst);
        self.shared.shutdown.cancel();
    }
}

/// How one physical connection ended.
enum SessionEnd {
    Manual,
    Closed { code: Option<u16>, reason: String },
    Failed(String),
}

/// Runs in the background for as long as the trigger is active.
struct Supervisor {
    config: TriggerConfig,
    target: Url,
    auth: AuthContext,
    bridge: Arc<dyn HostBridge>,
    sandbox: SandboxExecutor,
    shared: Arc<Shared>,
}

impl Supervisor {
    #[instrument(skip_all, fields(uri = %self.config.uri))]
    async fn run(self, first: WsStream) {
        let mut ready = Some(first);

        loop {
            let stream = match ready.take() {
                Some(stream) => stream,
                None => {
                    let connected = tokio::select! {
                        _ = self.shared.shutdown.cancelled() => break,
                        connected = self.connect() => connected,
                    };
                    match connected {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!("reconnect failed: {err}");
                            self.bridge.emit_error(err);
                            if self.wait_before_retry().await {
                                continue;
                            }
                            break;
                        }
                    }
                }
            };

            match self.run_session(stream).await {
                SessionEnd::Manual => break,
                SessionEnd::Closed { code, reason } => {
                    info!(?code, %reason, "connection closed");
                    self.bridge.emit_error(TriggerError::Closed { code, reason });
                }
                SessionEnd::Failed(message) => {
                    warn!("connection failed: {message}");
                    self.bridge.emit_error(TriggerError::Transport(message));
                }
            }

            if !self.wait_before_retry().await {
                break;
            }
        }

        self.shared.install_session(None);
        self.shared.set_state(ConnectionState::Disconnected);
        info!("connection supervisor stopped");
    }

    /// Sleep out the reconnect delay. `false` when shut down meanwhile.
    async fn wait_before_retry(&self) -> bool {
        if self.shared.manual_close.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.set_state(ConnectionState::Reconnecting);
        let delay = self.config.reconnect_delay();
        info!(?delay, "reconnect scheduled");

        tokio::select! {
            _ = self.shared.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => !self.shared.manual_close.load(Ordering::SeqCst),
        }
    }

    /// One connect attempt on a brand new socket.
    async fn connect(&self) -> Result<WsStream, TriggerError> {
        let attempt = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_state(ConnectionState::Connecting);
        info!(attempt, "connecting");

        let connect_error = |message: String| TriggerError::Connect {
            uri: self.config.uri.clone(),
            message,
        };

        let mut request = self
            .target
            .as_str()
            .into_client_request()
            .map_err(|err| connect_error(err.to_string()))?;
        if self.config.bearer_auth {
            if let Some(token) = self.auth.access_token() {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| connect_error(format!("invalid access token: {err}")))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }

        let connect_timeout = self.config.connect_timeout();
        let (stream, _response) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| connect_error(format!("timed out after {connect_timeout:?}")))?
            .map_err(|err| connect_error(err.to_string()))?;
        Ok(stream)
    }

    /// Drive one open connection until it closes.
    async fn run_session(&self, stream: WsStream) -> SessionEnd {
        let (mut sink, mut source) = stream.split();
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: commands_tx,
        };
        self.shared.install_session(Some(handle.clone()));
        self.shared.set_state(ConnectionState::Open);
        info!("connection open");

        let ctx = SandboxContext::new(
            Arc::new(handle),
            self.auth.clone(),
            Arc::new(BridgeParameters(Arc::clone(&self.bridge))),
            self.bridge.static_data(),
        );
        let mut open_script = Box::pin(self.sandbox.run(&self.config.open_script, ctx));
        let mut script_done = false;

        // Started once the open-script is done. Until then frames stay in `pending`.
        let mut dispatcher: Option<Dispatcher> = None;
        // Decoded frames not yet handed to the dispatcher, in arrival order.
        let mut pending: VecDeque<DecodedMessage> = VecDeque::new();
        // Callers waiting for the next frame, first come first served.
        let mut waiters: VecDeque<oneshot::Sender<DecodedMessage>> = VecDeque::new();

        let end = loop {
            // Stop reading while the host lags behind, unless someone awaits a frame.
            let can_read = pending.len() < PENDING_LIMIT || !waiters.is_empty();

            tokio::select! {
                biased;

                _ = self.shared.shutdown.cancelled() => {
                    if let Err(err) = sink.send(Message::Close(None)).await {
                        debug!("close frame not delivered: {err}");
                    }
                    break SessionEnd::Manual;
                }

                outcome = &mut open_script, if !script_done => {
                    script_done = true;
                    self.report_open_script(outcome);
                    if !pending.is_empty() {
                        debug!(count = pending.len(), "releasing frames held during open script");
                    }
                    dispatcher = Some(self.spawn_dispatcher());
                }

                Some(command) = commands_rx.recv() => match command {
                    Command::Send { frame, reply, written } => {
                        // Register before writing so a fast reply is not missed.
                        if let Some(reply) = reply {
                            waiters.push_back(reply);
                        }
                        let result = sink
                            .send(Message::Text(frame.into()))
                            .await
                            .map_err(|err| TriggerError::Transport(err.to_string()));
                        let failed = result.as_ref().err().map(ToString::to_string);
                        let _ = written.send(result);
                        if let Some(message) = failed {
                            break SessionEnd::Failed(message);
                        }
                    }
                    Command::Await { reply } => waiters.push_back(reply),
                },

                slot = reserve_slot(dispatcher.as_ref()), if dispatcher.is_some() && !pending.is_empty() => {
                    match slot {
                        Ok(slot) => {
                            if let Some(message) = pending.pop_front() {
                                slot.send(message);
                            }
                        }
                        Err(_) => break SessionEnd::Failed(String::from("frame dispatcher stopped")),
                    }
                }

                frame = source.next(), if can_read => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let message = codec::decode(&InboundFrame::from(text.as_str()));
                        hand_to_waiter(&message, &mut waiters);
                        pending.push_back(message);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let message = codec::decode(&InboundFrame::from(data));
                        hand_to_waiter(&message, &mut waiters);
                        pending.push_back(message);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::from("closed without a close frame")),
                        };
                        break SessionEnd::Closed { code, reason };
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(err)) => break SessionEnd::Failed(err.to_string()),
                    None => break SessionEnd::Closed {
                        code: None,
                        reason: String::from("stream ended"),
                    },
                },
            }
        };

        // Kill the capability first so a script or host blocked on this socket fails fast.
        drop(commands_rx);
        drop(waiters);
        self.shared.install_session(None);

        if matches!(end, SessionEnd::Manual) {
            if let Some(dispatcher) = dispatcher {
                dispatcher.finish().await;
            }
            return end;
        }

        if !script_done {
            let outcome = tokio::select! {
                _ = self.shared.shutdown.cancelled() => None,
                outcome = &mut open_script => Some(outcome),
            };
            match outcome {
                Some(outcome) => self.report_open_script(outcome),
                None => return SessionEnd::Manual,
            }
        }

        let dispatcher = match dispatcher {
            Some(dispatcher) => dispatcher,
            None => self.spawn_dispatcher(),
        };
        for message in pending {
            if dispatcher.frames.send(message).await.is_err() {
                break;
            }
        }
        dispatcher.finish().await;

        end
    }

    fn report_open_script(&self, outcome: Result<(), SandboxError>) {
        match outcome {
            Ok(()) => debug!("open script completed"),
            Err(err) => {
                warn!("open script failed, continuing: {err}");
                self.bridge.emit_error(TriggerError::Script(err));
            }
        }
    }

    /// Start the task that hands frames to the host, one at a time, in order.
    ///
    /// It runs apart from the session loop so the host may write to (and
    /// await frames from) the connection while handling an event.
    fn spawn_dispatcher(&self) -> Dispatcher {
        let (frames, mut inbox) = mpsc::channel::<DecodedMessage>(DISPATCH_QUEUE);
        let bridge = Arc::clone(&self.bridge);
        let shutdown = self.shared.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    next = inbox.recv() => next,
                };
                match next {
                    Some(message) => bridge.emit(message).await,
                    None => break,
                }
            }
        });

        Dispatcher { frames, task }
    }
}

/// Bound on frames buffered ahead of the host before reading pauses.
const PENDING_LIMIT: usize = 256;

/// Capacity of the channel feeding the dispatcher task.
const DISPATCH_QUEUE: usize = 32;

/// Handle on a running dispatcher task.
struct Dispatcher {
    frames: mpsc::Sender<DecodedMessage>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Let the task drain what it was given, then wait for it.
    async fn finish(self) {
        drop(self.frames);
        if let Err(err) = self.task.await {
            warn!("frame dispatcher ended abnormally: {err}");
        }
    }
}

/// Resolves once the dispatcher has room for one more frame.
async fn reserve_slot(
    dispatcher: Option<&Dispatcher>,
) -> Result<OwnedPermit<DecodedMessage>, SendError<()>> {
    match dispatcher {
        Some(dispatcher) => dispatcher.frames.clone().reserve_owned().await,
        None => std::future::pending().await,
    }
}

/// Give a copy of `message` to the first caller still waiting for one.
fn hand_to_waiter(message: &DecodedMessage, waiters: &mut VecDeque<oneshot::Sender<DecodedMessage>>) {
    while let Some(waiter) = waiters.pop_front() {
        if waiter.send(message.clone()).is_ok() {
            break;
        }
    }
}
