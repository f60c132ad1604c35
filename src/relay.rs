//! Single relay connection management.
//!
//! One `RelayConnection` owns one WebSocket to one relay. After `connect`,
//! a background reader task routes incoming frames: EVENT/EOSE/CLOSED to the
//! channel of the matching subscription, OK to the pending-ack waiter for
//! that event id, and AUTH challenges into a watch slot the capability
//! negotiator picks up.

use crate::error::{EngineError, Result};
use crate::event::Event;
use crate::message::{ClientMessage, Filter, RelayMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

type SubscriptionSender = mpsc::UnboundedSender<SubscriptionUpdate>;
type AckSender = oneshot::Sender<CommandAck>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Dial in progress
    Connecting,
    /// Connected and ready
    Open,
}

/// Update delivered on a subscription channel.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    /// An event matching the subscription filters
    Event(Event),
    /// The relay finished replaying stored events
    EndOfStored,
    /// The subscription ended (relay CLOSED it or the connection dropped)
    Closed(String),
}

/// Relay response to a submitted EVENT or AUTH.
#[derive(Debug, Clone)]
pub struct CommandAck {
    /// Id of the event the ack refers to
    pub event_id: String,
    /// Whether the relay accepted it
    pub accepted: bool,
    /// Relay message (empty on acceptance)
    pub message: String,
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Dial timeout for the WebSocket handshake
    pub dial_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Generate a short unique subscription id.
pub fn new_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// A connection to a single relay.
pub struct RelayConnection {
    url: Url,
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionSender>>>,
    pending_acks: Arc<Mutex<HashMap<String, AckSender>>>,
    challenge_tx: watch::Sender<Option<String>>,
    authenticated: Arc<AtomicBool>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayConnection {
    /// Create a new connection object (does not dial yet).
    pub fn new(url: &str, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(EngineError::InvalidUrl(format!(
                "relay URL must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        let (challenge_tx, _) = watch::channel(None);
        Ok(Self {
            url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            sink: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            challenge_tx,
            authenticated: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        })
    }

    /// Relay URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Check if the connection is open.
    pub async fn is_open(&self) -> bool {
        *self.state.read().await == ConnectionState::Open
    }

    /// Dial the relay, bounded by the configured dial timeout.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(EngineError::Connection(format!(
                        "dial already in progress for {}",
                        self.url
                    )))
                }
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
        }

        // Stale session state must not satisfy a new handshake.
        self.challenge_tx.send_replace(None);
        self.authenticated.store(false, Ordering::Release);

        debug!("connecting to relay {}", self.url);
        let ws = match timeout(self.config.dial_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(EngineError::Connection(format!(
                    "dial {} failed: {}",
                    self.url, e
                )));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(EngineError::Connection(format!(
                    "dial {} timed out after {:?}",
                    self.url, self.config.dial_timeout
                )));
            }
        };

        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.state.write().await = ConnectionState::Open;
        info!("connected to relay {}", self.url);

        let handle = tokio::spawn(Self::read_loop(
            self.url.to_string(),
            source,
            Arc::clone(&self.sink),
            Arc::clone(&self.state),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.pending_acks),
            self.challenge_tx.clone(),
            Arc::clone(&self.authenticated),
        ));
        *self.reader.lock().await = Some(handle);
        Ok(())
    }

    /// Close the socket and fail all in-flight waiters.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        for (_, tx) in self.subscriptions.lock().await.drain() {
            let _ = tx.send(SubscriptionUpdate::Closed("disconnected".to_string()));
        }
        self.pending_acks.lock().await.clear();
        self.challenge_tx.send_replace(None);
        self.authenticated.store(false, Ordering::Release);
        debug!("disconnected from relay {}", self.url);
    }

    /// Send a client message over the socket.
    pub async fn send(&self, msg: &ClientMessage) -> Result<()> {
        let text = msg.to_json()?;
        debug!("-> {}: {}", self.url, text);
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(s) => s
                .send(Message::Text(text))
                .await
                .map_err(|e| EngineError::Connection(e.to_string())),
            None => Err(EngineError::NotConnected),
        }
    }

    /// Open a subscription and return its id plus the update channel.
    pub async fn subscribe(
        &self,
        filters: &[Filter],
    ) -> Result<(String, mpsc::UnboundedReceiver<SubscriptionUpdate>)> {
        let subscription_id = new_subscription_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .await
            .insert(subscription_id.clone(), tx);

        let req = ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filters: filters.to_vec(),
        };
        if let Err(e) = self.send(&req).await {
            self.subscriptions.lock().await.remove(&subscription_id);
            return Err(e);
        }
        Ok((subscription_id, rx))
    }

    /// Close a subscription, releasing relay-side resources.
    ///
    /// Other subscriptions on the same connection are unaffected.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.subscriptions.lock().await.remove(subscription_id);
        self.send(&ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        })
        .await
    }

    /// Submit an event and wait for the relay's OK.
    pub async fn publish(&self, event: &Event, wait: Duration) -> Result<CommandAck> {
        self.request_ack(ClientMessage::Event(event.clone()), &event.id, wait)
            .await
    }

    /// Submit a signed NIP-42 auth event and wait for the relay's OK.
    pub async fn authenticate(&self, event: &Event, wait: Duration) -> Result<CommandAck> {
        self.request_ack(ClientMessage::Auth(event.clone()), &event.id, wait)
            .await
    }

    async fn request_ack(
        &self,
        msg: ClientMessage,
        event_id: &str,
        wait: Duration,
    ) -> Result<CommandAck> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .await
            .insert(event_id.to_string(), tx);

        if let Err(e) = self.send(&msg).await {
            self.pending_acks.lock().await.remove(event_id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(EngineError::Connection(
                "connection closed while waiting for ack".to_string(),
            )),
            Err(_) => {
                self.pending_acks.lock().await.remove(event_id);
                Err(EngineError::RelayTimeout(format!(
                    "no ack from {} within {:?}",
                    self.url, wait
                )))
            }
        }
    }

    /// Challenge the relay has issued for this session, if any.
    pub fn challenge(&self) -> Option<String> {
        self.challenge_tx.borrow().clone()
    }

    /// Whether this session already completed the auth handshake.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Record a completed auth handshake. Cleared on disconnect and on every
    /// redial.
    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    /// Wait for the relay to issue an auth challenge.
    pub async fn await_challenge(&self, wait: Duration) -> Result<String> {
        let mut rx = self.challenge_tx.subscribe();
        // wait_for yields a read guard borrowing rx; take an owned copy
        // before matching so the guard is released first.
        let waited = timeout(wait, rx.wait_for(|c| c.is_some()))
            .await
            .map(|res| res.map(|value| value.clone()));
        match waited {
            Ok(Ok(value)) => value
                .ok_or_else(|| EngineError::AuthTimeout(format!("no challenge from {}", self.url))),
            Ok(Err(_)) => Err(EngineError::Connection(
                "connection closed while waiting for auth challenge".to_string(),
            )),
            Err(_) => Err(EngineError::AuthTimeout(format!(
                "no challenge from {} within {:?}",
                self.url, wait
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_loop(
        url: String,
        mut source: WsSource,
        sink: Arc<Mutex<Option<WsSink>>>,
        state: Arc<RwLock<ConnectionState>>,
        subscriptions: Arc<Mutex<HashMap<String, SubscriptionSender>>>,
        pending_acks: Arc<Mutex<HashMap<String, AckSender>>>,
        challenge_tx: watch::Sender<Option<String>>,
        authenticated: Arc<AtomicBool>,
    ) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    debug!("<- {}: {}", url, text);
                    match RelayMessage::from_json(&text) {
                        Ok(Some(msg)) => {
                            Self::dispatch(&url, msg, &subscriptions, &pending_acks, &challenge_tx)
                                .await
                        }
                        Ok(None) => {}
                        Err(e) => warn!("unparseable frame from {}: {}", url, e),
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let mut guard = sink.lock().await;
                    if let Some(s) = guard.as_mut() {
                        let _ = s.send(Message::Pong(payload)).await;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("relay {} closed the connection", url);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("websocket error from {}: {}", url, e);
                    break;
                }
            }
        }

        *state.write().await = ConnectionState::Disconnected;
        *sink.lock().await = None;
        for (_, tx) in subscriptions.lock().await.drain() {
            let _ = tx.send(SubscriptionUpdate::Closed("connection lost".to_string()));
        }
        pending_acks.lock().await.clear();
        challenge_tx.send_replace(None);
        authenticated.store(false, Ordering::Release);
    }

    async fn dispatch(
        url: &str,
        msg: RelayMessage,
        subscriptions: &Arc<Mutex<HashMap<String, SubscriptionSender>>>,
        pending_acks: &Arc<Mutex<HashMap<String, AckSender>>>,
        challenge_tx: &watch::Sender<Option<String>>,
    ) {
        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let mut subs = subscriptions.lock().await;
                if let Some(tx) = subs.get(&subscription_id) {
                    if tx.send(SubscriptionUpdate::Event(event)).is_err() {
                        debug!("subscription {} abandoned, dropping", subscription_id);
                        subs.remove(&subscription_id);
                    }
                }
            }
            RelayMessage::Eose { subscription_id } => {
                let subs = subscriptions.lock().await;
                if let Some(tx) = subs.get(&subscription_id) {
                    let _ = tx.send(SubscriptionUpdate::EndOfStored);
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if let Some(tx) = subscriptions.lock().await.remove(&subscription_id) {
                    let _ = tx.send(SubscriptionUpdate::Closed(message));
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if let Some(tx) = pending_acks.lock().await.remove(&event_id) {
                    let _ = tx.send(CommandAck {
                        event_id,
                        accepted,
                        message,
                    });
                }
            }
            RelayMessage::Auth { challenge } => {
                debug!("auth challenge from {}", url);
                // send_replace stores the value even with no receiver alive;
                // a plain send would drop a challenge that arrives before
                // anyone waits for it.
                challenge_tx.send_replace(Some(challenge));
            }
            RelayMessage::Notice { message } => {
                debug!("notice from {}: {}", url, message);
            }
        }
    }
}
