use crate::error::AppError;
use crate::feed::codec::{
    decode_frame, encode_connect, encode_disconnect, encode_event, encode_pong, EnginePacket,
    SocketEvent, SocketPacket,
};
use crate::feed::payload::{normalize_event, InboundEvent};
use crate::feed::types::{ConnectionHealth, ConnectionQuality, FeedSyncConfig};
use crate::feed::{
    now_unix_ms, HEARTBEAT_EVENT, PING_EVENT, PONG_EVENT, SUBSCRIBE_ALL_TOKEN_ACTIVITY_EVENT,
    SUBSCRIBE_KOL_MINDMAP_EVENT, SUBSCRIBE_KOL_TRADES_EVENT, SUBSCRIBE_MINDMAP_EVENT,
    UNSUBSCRIBE_KOL_MINDMAP_EVENT,
};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_MISSED_HEARTBEATS: u32 = 3;
const MAX_PENDING_PINGS: usize = 8;

/// Something the transport hands back to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Event(SocketEvent),
    Closed(Option<String>),
}

/// One live socket session. Dropping `outbound` closes the session.
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<SocketEvent>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

pub trait SocketTransport: Send + Sync {
    fn open(
        &self,
        url: String,
        auth_token: Option<String>,
    ) -> BoxFuture<'_, Result<SocketLink, AppError>>;
}

/// Socket.IO over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteTransport;

impl SocketTransport for TungsteniteTransport {
    fn open(
        &self,
        url: String,
        auth_token: Option<String>,
    ) -> BoxFuture<'_, Result<SocketLink, AppError>> {
        Box::pin(async move {
            let (websocket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
            let (mut sink, mut stream) = websocket.split();

            let mut namespace_requested = false;
            loop {
                let Some(frame) = stream.next().await else {
                    return Err(AppError::ConnectionClosed);
                };
                let text = match frame? {
                    Message::Text(text) => text,
                    Message::Close(_) => return Err(AppError::ConnectionClosed),
                    _ => continue,
                };
                match decode_frame(&text)? {
                    EnginePacket::Open(handshake) => {
                        debug!(sid = %handshake.sid, ping_interval = handshake.ping_interval, "engine handshake");
                        sink.send(Message::Text(encode_connect(auth_token.as_deref())?))
                            .await?;
                        namespace_requested = true;
                    }
                    EnginePacket::Ping => {
                        sink.send(Message::Text(encode_pong().to_string())).await?;
                    }
                    EnginePacket::Message(SocketPacket::Connect(_)) if namespace_requested => break,
                    EnginePacket::Message(SocketPacket::ConnectError(detail)) => {
                        let message = detail
                            .get("message")
                            .and_then(|value| value.as_str())
                            .unwrap_or("connection refused")
                            .to_string();
                        return Err(AppError::Api { message });
                    }
                    EnginePacket::Close | EnginePacket::Message(SocketPacket::Disconnect) => {
                        return Err(AppError::ConnectionClosed);
                    }
                    _ => {}
                }
            }

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SocketEvent>();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

            tokio::spawn(async move {
                let reason = loop {
                    tokio::select! {
                        outbound = outbound_rx.recv() => {
                            let Some(event) = outbound else {
                                let _ = sink.send(Message::Text(encode_disconnect().to_string())).await;
                                let _ = sink.close().await;
                                break None;
                            };
                            match encode_event(&event) {
                                Ok(frame) => {
                                    if let Err(error) = sink.send(Message::Text(frame)).await {
                                        break Some(format!("socket send failed: {error}"));
                                    }
                                }
                                Err(error) => warn!(event = %event.name, %error, "dropping unencodable event"),
                            }
                        }
                        frame = stream.next() => {
                            let text = match frame {
                                Some(Ok(Message::Text(text))) => text,
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = sink.send(Message::Pong(payload)).await;
                                    continue;
                                }
                                Some(Ok(Message::Close(_))) | None => break Some("socket closed".to_string()),
                                Some(Ok(_)) => continue,
                                Some(Err(error)) => break Some(format!("socket read failed: {error}")),
                            };
                            match decode_frame(&text) {
                                Ok(EnginePacket::Ping) => {
                                    if let Err(error) = sink.send(Message::Text(encode_pong().to_string())).await {
                                        break Some(format!("socket send failed: {error}"));
                                    }
                                }
                                Ok(EnginePacket::Message(SocketPacket::Event(event))) => {
                                    if inbound_tx.send(TransportEvent::Event(event)).is_err() {
                                        break None;
                                    }
                                }
                                Ok(EnginePacket::Close) | Ok(EnginePacket::Message(SocketPacket::Disconnect)) => {
                                    break Some("server closed the session".to_string());
                                }
                                Ok(_) => {}
                                Err(error) => warn!(%error, "dropping malformed socket frame"),
                            }
                        }
                    }
                };
                let _ = inbound_tx.send(TransportEvent::Closed(reason));
            });

            Ok(SocketLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

/// A server-side stream the client has asked for. Tracked so reconnects replay them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    KolTrades,
    AllTokenActivity,
    Mindmap { token_mint: String },
    KolMindmap { kol_wallet: String },
}

impl Channel {
    pub fn mindmap(token_mint: impl Into<String>) -> Self {
        Self::Mindmap {
            token_mint: token_mint.into(),
        }
    }

    pub fn kol_mindmap(kol_wallet: impl Into<String>) -> Self {
        Self::KolMindmap {
            kol_wallet: kol_wallet.into(),
        }
    }

    pub fn subscribe_event(&self) -> SocketEvent {
        match self {
            Self::KolTrades => SocketEvent::bare(SUBSCRIBE_KOL_TRADES_EVENT),
            Self::AllTokenActivity => SocketEvent::bare(SUBSCRIBE_ALL_TOKEN_ACTIVITY_EVENT),
            Self::Mindmap { token_mint } => {
                SocketEvent::new(SUBSCRIBE_MINDMAP_EVENT, json!({ "tokenMint": token_mint }))
            }
            Self::KolMindmap { kol_wallet } => {
                SocketEvent::new(SUBSCRIBE_KOL_MINDMAP_EVENT, json!({ "kolWallet": kol_wallet }))
            }
        }
    }

    /// Only KOL mindmaps have a server-side unsubscribe.
    pub fn unsubscribe_event(&self) -> Option<SocketEvent> {
        match self {
            Self::KolMindmap { kol_wallet } => Some(SocketEvent::new(
                UNSUBSCRIBE_KOL_MINDMAP_EVENT,
                json!({ "kolWallet": kol_wallet }),
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect_attempts: u32,
    pub max_reconnect_delay: Duration,
}

impl ConnectionConfig {
    pub fn from_feed(config: &FeedSyncConfig, url: String) -> Self {
        Self {
            url,
            auth_token: config.auth_token.clone(),
            heartbeat_interval: config.heartbeat_interval,
            connect_timeout: config.connect_timeout,
            reconnect_attempts: config.reconnect_attempts,
            max_reconnect_delay: config.max_reconnect_delay,
        }
    }
}

struct SessionHandle {
    id: u64,
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

#[derive(Default)]
struct ConnectionInner {
    auth_token: Option<String>,
    channels: BTreeSet<Channel>,
    outbound: Option<mpsc::UnboundedSender<SocketEvent>>,
    session: Option<SessionHandle>,
    next_session_id: u64,
    pending_pings: HashMap<String, Instant>,
    ping_seq: u64,
}

/// Owns the single feed socket: lifecycle, heartbeat, health and channel replay.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn SocketTransport>,
    inner: Mutex<ConnectionInner>,
    health: watch::Sender<ConnectionHealth>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl ConnectionManager {
    /// Returns the manager and the stream of application events it receives.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn SocketTransport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (health_tx, _) = watch::channel(ConnectionHealth::disconnected());
        let mut channels = BTreeSet::new();
        channels.insert(Channel::KolTrades);
        channels.insert(Channel::AllTokenActivity);

        let manager = Arc::new(Self {
            inner: Mutex::new(ConnectionInner {
                auth_token: config.auth_token.clone(),
                channels,
                ..ConnectionInner::default()
            }),
            config,
            transport,
            health: health_tx,
            events: events_tx,
        });
        (manager, events_rx)
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.borrow().clone()
    }

    pub fn health_receiver(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.subscribe()
    }

    /// True while a session task is connecting, connected or retrying.
    pub fn has_session(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    pub fn set_polling_mode(&self, polling: bool) {
        self.health.send_if_modified(|health| {
            let changed = health.is_polling_mode != polling;
            health.is_polling_mode = polling;
            changed
        });
    }

    /// Starts a session unless one is already running. Returns whether a new one started.
    pub fn connect(self: &Arc<Self>, auth_token: Option<&str>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(token) = auth_token {
            inner.auth_token = Some(token.to_string());
        }
        if inner.session.is_some() {
            return false;
        }

        inner.next_session_id += 1;
        let id = inner.next_session_id;
        self.health.send_modify(|health| health.is_connecting = true);
        let cancel_token = CancellationToken::new();
        let manager = Arc::clone(self);
        let session_cancel = cancel_token.clone();
        let join_handle = tokio::spawn(async move {
            manager.run_session(id, session_cancel).await;
        });
        inner.session = Some(SessionHandle {
            id,
            cancel_token,
            join_handle,
        });
        true
    }

    /// Tears down the session if any. Always safe.
    pub fn disconnect(&self) {
        let session = {
            let mut inner = self.inner.lock();
            inner.outbound = None;
            inner.pending_pings.clear();
            inner.session.take()
        };
        if let Some(session) = session {
            session.cancel_token.cancel();
            debug!(session = session.id, "feed socket disconnect requested");
            drop(session.join_handle);
        }
        self.reset_health();
    }

    /// Tracks channels and emits the ones that are new while connected.
    pub fn subscribe(&self, channels: impl IntoIterator<Item = Channel>) {
        let mut inner = self.inner.lock();
        let added: Vec<Channel> = channels
            .into_iter()
            .filter(|channel| inner.channels.insert(channel.clone()))
            .collect();
        if let Some(outbound) = inner.outbound.as_ref() {
            for channel in added {
                let _ = outbound.send(channel.subscribe_event());
            }
        }
    }

    pub fn unsubscribe(&self, channels: impl IntoIterator<Item = Channel>) {
        let mut inner = self.inner.lock();
        let removed: Vec<Channel> = channels
            .into_iter()
            .filter(|channel| inner.channels.remove(channel))
            .collect();
        if let Some(outbound) = inner.outbound.as_ref() {
            for event in removed.iter().filter_map(Channel::unsubscribe_event) {
                let _ = outbound.send(event);
            }
        }
    }

    pub fn tracked_channels(&self) -> Vec<Channel> {
        self.inner.lock().channels.iter().cloned().collect()
    }

    /// Emits one event. Returns false when there is no live socket; nothing is queued.
    pub fn send(&self, event: SocketEvent) -> bool {
        let inner = self.inner.lock();
        match inner.outbound.as_ref() {
            Some(outbound) => outbound.send(event).is_ok(),
            None => false,
        }
    }

    fn reset_health(&self) {
        self.health.send_modify(|health| {
            let polling = health.is_polling_mode;
            *health = ConnectionHealth::disconnected();
            health.is_polling_mode = polling;
        });
    }

    async fn run_session(self: Arc<Self>, id: u64, cancel_token: CancellationToken) {
        let mut attempt = 0_u32;

        loop {
            if cancel_token.is_cancelled() {
                break;
            }
            self.health.send_modify(|health| health.is_connecting = true);
            let auth_token = self.inner.lock().auth_token.clone();
            let open = self.transport.open(self.config.url.clone(), auth_token);

            let opened = tokio::select! {
                _ = cancel_token.cancelled() => break,
                result = tokio::time::timeout(self.config.connect_timeout, open) => result,
            };

            match opened {
                Ok(Ok(link)) => {
                    attempt = 0;
                    info!(session = id, "feed socket connected");
                    let reason = self.drive_link(link, &cancel_token).await;
                    if cancel_token.is_cancelled() {
                        break;
                    }
                    warn!(session = id, reason = %reason, "feed socket dropped");
                }
                Ok(Err(error)) => {
                    warn!(session = id, attempt, %error, "feed socket connect failed");
                    self.health.send_modify(|health| health.is_connecting = false);
                }
                Err(_) => {
                    warn!(session = id, attempt, timeout = ?self.config.connect_timeout, "feed socket connect timed out");
                    self.health.send_modify(|health| {
                        health.is_connecting = false;
                        health.connection_quality = health.connection_quality.degrade();
                    });
                }
            }

            attempt = attempt.saturating_add(1);
            if attempt > self.config.reconnect_attempts {
                warn!(session = id, "feed socket reconnect attempts exhausted");
                break;
            }

            let delay = reconnect_delay(attempt, self.config.max_reconnect_delay);
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let owns_slot = {
            let mut inner = self.inner.lock();
            let owns_slot = inner
                .session
                .as_ref()
                .map(|session| session.id == id)
                .unwrap_or(false);
            if owns_slot {
                inner.session = None;
                inner.outbound = None;
                inner.pending_pings.clear();
            }
            owns_slot
        };
        if owns_slot {
            self.reset_health();
        }
    }

    async fn drive_link(&self, link: SocketLink, cancel_token: &CancellationToken) -> String {
        let SocketLink {
            outbound,
            mut inbound,
        } = link;

        {
            let mut inner = self.inner.lock();
            inner.pending_pings.clear();
            for channel in inner.channels.iter() {
                let _ = outbound.send(channel.subscribe_event());
            }
            inner.outbound = Some(outbound);
        }
        self.health.send_modify(|health| {
            health.is_connected = true;
            health.is_connecting = false;
            health.connection_quality = ConnectionQuality::Good;
            health.missed_heartbeats = 0;
            health.latency_ms = None;
        });

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break "cancelled".to_string(),
                _ = heartbeat.tick() => self.beat(),
                event = inbound.recv() => match event {
                    Some(TransportEvent::Event(event)) => self.handle_inbound(event),
                    Some(TransportEvent::Closed(reason)) => {
                        break reason.unwrap_or_else(|| "closed".to_string());
                    }
                    None => break "transport dropped".to_string(),
                },
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.outbound = None;
            inner.pending_pings.clear();
        }
        self.health.send_modify(|health| {
            health.is_connected = false;
            health.connection_quality = health.connection_quality.degrade();
        });
        reason
    }

    fn beat(&self) {
        let missed = {
            let mut inner = self.inner.lock();
            let missed = !inner.pending_pings.is_empty();
            inner.ping_seq += 1;
            let id = format!("ping-{}", inner.ping_seq);
            if inner.pending_pings.len() >= MAX_PENDING_PINGS {
                let oldest = inner
                    .pending_pings
                    .iter()
                    .min_by_key(|(_, sent_at)| **sent_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    inner.pending_pings.remove(&oldest);
                }
            }
            inner.pending_pings.insert(id.clone(), Instant::now());
            if let Some(outbound) = inner.outbound.as_ref() {
                let _ = outbound.send(SocketEvent::new(
                    PING_EVENT,
                    json!({ "id": id, "timestamp": now_unix_ms() }),
                ));
                let _ = outbound.send(SocketEvent::bare(HEARTBEAT_EVENT));
            }
            missed
        };

        if missed {
            self.health.send_modify(|health| {
                health.missed_heartbeats = health.missed_heartbeats.saturating_add(1);
                health.connection_quality = if health.missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                    ConnectionQuality::Critical
                } else {
                    health.connection_quality.degrade()
                };
            });
        }
    }

    fn handle_inbound(&self, event: SocketEvent) {
        if event.name != PONG_EVENT {
            let _ = self.events.send(event);
            return;
        }

        let id = match normalize_event(&event.name, event.data) {
            Ok(InboundEvent::Pong { id, .. }) => id,
            Ok(_) => return,
            Err(error) => {
                debug!(%error, "ignoring malformed pong");
                return;
            }
        };
        let sent_at = {
            let mut inner = self.inner.lock();
            let Some(sent_at) = inner.pending_pings.remove(&id) else {
                return;
            };
            inner.pending_pings.retain(|_, pending| *pending > sent_at);
            sent_at
        };

        let latency_ms = Instant::now()
            .duration_since(sent_at)
            .as_millis()
            .min(u64::MAX as u128) as u64;
        self.health.send_modify(|health| {
            health.latency_ms = Some(latency_ms);
            health.connection_quality = ConnectionQuality::from_latency_ms(latency_ms);
            health.missed_heartbeats = 0;
            health.last_heartbeat_ts = Some(now_unix_ms());
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.inner.get_mut().session.take() {
            session.cancel_token.cancel();
        }
    }
}

pub(crate) fn reconnect_delay(attempt: u32, max_delay: Duration) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = rand::thread_rng().gen_range(0..250_u64);
    Duration::from_millis(base_ms + jitter_ms).min(max_delay)
}


#[cfg(test)]
mod tests {
    use super::fake::{FakePeer, FakeTransport};
    use super::*;
    use std::sync::atomic::Ordering;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://localhost:5000/api/socket.io/?EIO=4&transport=websocket".to_string(),
            auth_token: Some("tok".to_string()),
            heartbeat_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            reconnect_attempts: 5,
            max_reconnect_delay: Duration::from_secs(5),
        }
    }

    async fn drain(peer: &mut FakePeer) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), peer.sent.recv()).await
        {
            events.push(event);
        }
        events
    }

    fn mindmap_subscriptions(events: &[SocketEvent], mint: &str) -> usize {
        events
            .iter()
            .filter(|event| event.name == SUBSCRIBE_MINDMAP_EVENT && event.data["tokenMint"] == mint)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_emits_default_channels() {
        let (transport, mut peers) = FakeTransport::new();
        let (manager, _events) = ConnectionManager::new(config(), transport);
        assert!(manager.connect(None));

        let mut peer = peers.recv().await.expect("session opened");
        let sent = drain(&mut peer).await;
        let names: Vec<&str> = sent.iter().map(|event| event.name.as_str()).collect();
        assert!(names.contains(&SUBSCRIBE_KOL_TRADES_EVENT));
        assert!(names.contains(&SUBSCRIBE_ALL_TOKEN_ACTIVITY_EVENT));
        assert!(manager.health().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (transport, mut peers) = FakeTransport::new();
        let (manager, _events) = ConnectionManager::new(config(), Arc::clone(&transport) as Arc<dyn SocketTransport>);
        assert!(manager.connect(None));
        assert!(!manager.connect(None));
        let _peer = peers.recv().await.expect("session opened");
        assert!(!manager.connect(None));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_tracked_subscriptions_once() {
        let (transport, mut peers) = FakeTransport::new();
        let (manager, _events) = ConnectionManager::new(config(), transport);
        manager.connect(None);

        let mut first = peers.recv().await.expect("first session");
        manager
            .health_receiver()
            .wait_for(|health| health.is_connected)
            .await
            .expect("health channel open");
        manager.subscribe([Channel::mindmap("X"), Channel::mindmap("Y")]);
        let first_sent = drain(&mut first).await;
        assert_eq!(mindmap_subscriptions(&first_sent, "X"), 1);

        drop(first);
        let mut second = peers.recv().await.expect("reconnected session");
        let replayed = drain(&mut second).await;
        assert_eq!(mindmap_subscriptions(&replayed, "X"), 1);
        assert_eq!(mindmap_subscriptions(&replayed, "Y"), 1);
        assert!(manager.health().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_made_offline_are_sent_on_connect() {
        let (transport, mut peers) = FakeTransport::new();
        let (manager, _events) = ConnectionManager::new(config(), transport);
        manager.subscribe([Channel::kol_mindmap("W9")]);
        assert!(!manager.send(SocketEvent::bare("anything")));

        manager.connect(None);
        let mut peer = peers.recv().await.expect("session opened");
        let sent = drain(&mut peer).await;
        assert!(sent
            .iter()
            .any(|event| event.name == SUBSCRIBE_KOL_MINDMAP_EVENT && event.data["kolWallet"] == "W9"));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_escalate_to_critical() {
        let (transport, mut peers) = FakeTransport::new();
        let (manager, _events) = ConnectionManager::new(config(), transport);
        manager.connect(None);
        let _peer = peers.recv().await.expect("session opened");

        tokio::time::sleep(Duration::from_millis(21_000)).await;
        let health = manager.health();
        assert!(health.is_connected);
        assert!(health.missed_heartbeats >= MAX_MISSED_HEARTBEATS);
        assert_eq!(health.connection_quality, ConnectionQuality::Critical);
        assert!(!health.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_sets_latency_and_quality() {
        let (transport, mut peers) = FakeTransport::new();
        let (manager, _events) = ConnectionManager::new(config(), transport);
        manager.connect(None);
        let mut peer = peers.recv().await.expect("session opened");

        let ping = loop {
            let event = peer.sent.recv().await.expect("socket stays open");
            if event.name == PING_EVENT {
                break event;
            }
        };
        peer.push
            .send(TransportEvent::Event(SocketEvent::new(
                PONG_EVENT,
                json!({ "id": ping.data["id"], "timestamp": 1 }),
            )))
            .expect("peer inbound open");

        let health = manager
            .health_receiver()
            .wait_for(|health| health.latency_ms.is_some())
            .await
            .expect("health channel open")
            .clone();
        assert_eq!(health.connection_quality, ConnectionQuality::Excellent);
        assert_eq!(health.missed_heartbeats, 0);
        assert!(health.last_heartbeat_ts.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn application_events_are_forwarded() {
        let (transport, mut peers) = FakeTransport::new();
        let (manager, mut events) = ConnectionManager::new(config(), transport);
        manager.connect(None);
        let peer = peers.recv().await.expect("session opened");
        peer.push
            .send(TransportEvent::Event(SocketEvent::new(
                "stats_update",
                json!({ "totalTrades": 1 }),
            )))
            .expect("peer inbound open");

        let event = events.recv().await.expect("event forwarded");
        assert_eq!(event.name, "stats_update");
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_disconnect_are_safe_without_socket() {
        let transport = FakeTransport::failing();
        let (manager, _events) = ConnectionManager::new(config(), transport);
        manager.disconnect();
        manager.disconnect();
        assert!(!manager.send(SocketEvent::bare(HEARTBEAT_EVENT)));
        assert!(!manager.health().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let transport = FakeTransport::failing();
        let (manager, _events) = ConnectionManager::new(
            ConnectionConfig {
                reconnect_attempts: 2,
                ..config()
            },
            Arc::clone(&transport) as Arc<dyn SocketTransport>,
        );
        manager.connect(None);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
        assert!(!manager.has_session());
        let health = manager.health();
        assert!(!health.is_connected && !health.is_connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_degrades_instead_of_failing() {
        let (transport, mut peers) = FakeTransport::new();
        let (manager, _events) = ConnectionManager::new(
            config(),
            Arc::clone(&transport) as Arc<dyn SocketTransport>,
        );
        assert!(manager.connect(None));
        let peer = peers.recv().await.expect("session opened");
        manager
            .health_receiver()
            .wait_for(|health| health.is_connected)
            .await
            .expect("health channel open");

        transport.hang.store(true, Ordering::SeqCst);
        peer.push
            .send(TransportEvent::Closed(None))
            .expect("link open");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let dropped = manager.health();
        assert!(!dropped.is_connected);
        assert_eq!(dropped.connection_quality, ConnectionQuality::Poor);

        // Second open hangs; the timeout lands before the next backoff ends.
        tokio::time::sleep(Duration::from_millis(15_900)).await;
        let health = manager.health();
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
        assert!(!health.is_connected);
        assert!(!health.is_connecting);
        assert_eq!(health.connection_quality, ConnectionQuality::Critical);
        assert!(manager.has_session());
    }

    #[test]
    fn reconnect_delay_respects_cap() {
        for attempt in 0..10 {
            assert!(reconnect_delay(attempt, Duration::from_secs(5)) <= Duration::from_secs(5));
        }
        assert!(reconnect_delay(1, Duration::from_secs(5)) >= Duration::from_millis(400));
    }

    #[test]
    fn kol_mindmap_channel_has_unsubscribe_event() {
        let channel = Channel::kol_mindmap("W1");
        let event = channel.unsubscribe_event().expect("kol mindmap unsubscribes");
        assert_eq!(event.name, UNSUBSCRIBE_KOL_MINDMAP_EVENT);
        assert!(Channel::KolTrades.unsubscribe_event().is_none());
    }
}
