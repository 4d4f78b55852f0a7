// =============================================================================
// Stream Connection — socket lifecycle, ack tracking and reconnect backoff
// =============================================================================
//
// State machine:
//
//   DISCONNECTED --start--> CONNECTING --ok--> CONNECTED
//        ^                      |                 |
//        |                    fail          socket lost
//    disconnect                 v                 v
//        +------------------ RECONNECTING <-------+
//
// Every transition into CONNECTED fires the reconnect callback exactly once.
// The acknowledged set is cleared on every disconnect. Control frames issued
// while not CONNECTED (before `start` included) are queued and flushed on the
// next CONNECTED; their callers keep waiting until the ack timeout.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use super::codec::{self, ControlOp, Inbound};
use super::{StreamControl, SubscriptionStatusProvider};
use crate::error::{MirrorError, MirrorResult};
use crate::events::ReconnectNotification;
use crate::market_data::MarketDataCache;
use crate::runtime_config::RuntimeConfig;
use crate::types::{now_ms, ChannelClass, ConnectionState, Subscription};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Invoked once per transition into CONNECTED.
pub type ReconnectCallback = Arc<dyn Fn(ReconnectNotification) + Send + Sync>;

/// Largest shift applied to the reconnect base delay.
const MAX_BACKOFF_SHIFT: u32 = 16;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub class: ChannelClass,
    pub url: String,
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub failure_limit: u32,
    pub ping_interval: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &RuntimeConfig, class: ChannelClass) -> Self {
        let url = match class {
            ChannelClass::Public => config.public_ws_url.clone(),
            ChannelClass::Private => config.private_ws_url.clone(),
        };
        Self {
            class,
            url,
            ack_timeout: config.ack_timeout(),
            connect_timeout: config.request_timeout(),
            reconnect_base: Duration::from_millis(config.reconnect_base_delay_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_delay_ms),
            failure_limit: config.reconnect_failure_limit.max(1),
            ping_interval: Duration::from_millis(config.ping_interval_ms.max(1)),
        }
    }
}

/// Exponential backoff with equal jitter: a uniform pick from `[d/2, d]`
/// where `d = min(base * 2^attempt, max)`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
    let ceiling = base.saturating_mul(factor).min(max);
    let ceiling_ms = ceiling.as_millis() as u64;
    if ceiling_ms < 2 {
        return ceiling;
    }
    let ms = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
    Duration::from_millis(ms)
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct PendingAck {
    subscription: Subscription,
    op: ControlOp,
    /// Written to the socket (as opposed to still queued).
    sent: bool,
    tx: oneshot::Sender<MirrorResult<()>>,
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

struct Shared {
    settings: StreamSettings,
    cache: Arc<MarketDataCache>,
    state: RwLock<ConnectionState>,
    acked: RwLock<HashSet<Subscription>>,
    pending: Mutex<HashMap<String, PendingAck>>,
    /// Present only while CONNECTED.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Control frames waiting for the next CONNECTED: (id, frame).
    queued: Mutex<Vec<(String, String)>>,
    next_id: AtomicU64,
    consecutive_failures: AtomicU32,
    sessions: AtomicU64,
    fatal_alerts: AtomicU64,
    on_reconnect: RwLock<Option<ReconnectCallback>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            debug!(class = %self.settings.class, from = %prev, to = %next, "stream state change");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Register a pending ack and hand its frame to the socket, or queue it
    /// until the next CONNECTED.
    fn enqueue(&self, op: ControlOp, sub: &Subscription) -> (String, oneshot::Receiver<MirrorResult<()>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = codec::control_frame(&id, op, sub);
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            id.clone(),
            PendingAck {
                subscription: sub.clone(),
                op,
                sent: false,
                tx,
            },
        );

        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(sender) if sender.send(Message::Text(frame.clone())).is_ok() => {
                if let Some(p) = self.pending.lock().get_mut(&id) {
                    p.sent = true;
                }
            }
            _ => {
                debug!(id = %id, op = %op, subscription = %sub, "stream not connected — control frame queued");
                self.queued.lock().push((id.clone(), frame));
            }
        }

        (id, rx)
    }

    fn forget(&self, id: &str) {
        self.pending.lock().remove(id);
        self.queued.lock().retain(|(qid, _)| qid != id);
    }

    /// Install a fresh outbound channel, flush queued control frames and
    /// enter CONNECTED.
    fn go_live(&self, sender: mpsc::UnboundedSender<Message>) {
        let mut outbound = self.outbound.lock();
        let queued: Vec<(String, String)> = std::mem::take(&mut *self.queued.lock());
        let flushed = queued.len();
        {
            let mut pending = self.pending.lock();
            for (id, frame) in queued {
                if sender.send(Message::Text(frame)).is_ok() {
                    if let Some(p) = pending.get_mut(&id) {
                        p.sent = true;
                    }
                }
            }
        }
        *outbound = Some(sender);
        drop(outbound);

        self.set_state(ConnectionState::Connected);
        if flushed > 0 {
            info!(class = %self.settings.class, flushed, "queued control frames flushed");
        }
    }

    fn notify_reconnect(&self) {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        info!(class = %self.settings.class, session, "stream connected");
        let callback = self.on_reconnect.read().clone();
        if let Some(cb) = callback {
            cb(ReconnectNotification {
                class: self.settings.class,
                at: now_ms(),
            });
        }
    }

    /// Socket lost: nothing stays acknowledged and every request already on
    /// the dead socket fails as transient. Queued requests keep waiting.
    fn on_socket_lost(&self) {
        *self.outbound.lock() = None;
        let dropped = {
            let mut acked = self.acked.write();
            let n = acked.len();
            acked.clear();
            n
        };

        let mut pending = self.pending.lock();
        let in_flight: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.sent)
            .map(|(id, _)| id.clone())
            .collect();
        for id in in_flight {
            if let Some(p) = pending.remove(&id) {
                let _ = p.tx.send(Err(MirrorError::Transport("socket closed before ack".into())));
            }
        }
        debug!(class = %self.settings.class, dropped, "acknowledged set cleared");
    }

    /// Final teardown after `disconnect`.
    fn fail_all(&self) {
        self.queued.lock().clear();
        for (_, p) in self.pending.lock().drain() {
            let _ = p.tx.send(Err(MirrorError::NotConnected));
        }
    }

    fn apply_ack(&self, op: ControlOp, sub: &Subscription) {
        let mut acked = self.acked.write();
        match op {
            ControlOp::Subscribe => {
                acked.insert(sub.clone());
            }
            ControlOp::Unsubscribe => {
                acked.remove(sub);
            }
        }
    }

    /// Handle one decoded text frame. Returns true for a pong.
    fn handle_text(&self, text: &str) -> bool {
        let inbound = match codec::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(class = %self.settings.class, error = %e, "undecodable stream frame");
                return false;
            }
        };

        match inbound {
            Inbound::Ack { id, op, subscription } => {
                let pending = {
                    let mut map = self.pending.lock();
                    match id.as_deref() {
                        Some(id) => map.remove(id),
                        None => {
                            let key = map
                                .iter()
                                .find(|(_, p)| p.op == op && Some(&p.subscription) == subscription.as_ref())
                                .map(|(k, _)| k.clone());
                            key.and_then(|k| map.remove(&k))
                        }
                    }
                };
                match pending {
                    Some(p) => {
                        self.apply_ack(p.op, &p.subscription);
                        debug!(op = %p.op, subscription = %p.subscription, "control ack");
                        let _ = p.tx.send(Ok(()));
                    }
                    None => {
                        if let Some(sub) = subscription {
                            debug!(op = %op, subscription = %sub, "late or unsolicited ack");
                            self.apply_ack(op, &sub);
                        }
                    }
                }
            }
            Inbound::Error { id, error } => {
                let pending = id.as_deref().and_then(|id| self.pending.lock().remove(id));
                match pending {
                    Some(p) => {
                        let _ = p.tx.send(Err(error));
                    }
                    None => warn!(class = %self.settings.class, error = %error, "stream error frame"),
                }
            }
            Inbound::Tickers(tickers) => {
                for t in tickers {
                    self.cache.upsert_ticker(t);
                }
            }
            Inbound::Candles(candles) => {
                for c in candles {
                    self.cache.append_candle(c);
                }
            }
            Inbound::Pong => return true,
            Inbound::Notice(msg) => {
                warn!(class = %self.settings.class, notice = %msg, "exchange notice");
            }
            Inbound::Other => {}
        }
        false
    }
}

// ---------------------------------------------------------------------------
// StreamConnection
// ---------------------------------------------------------------------------

pub struct StreamConnection {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConnection {
    pub fn new(settings: StreamSettings, cache: Arc<MarketDataCache>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                settings,
                cache,
                state: RwLock::new(ConnectionState::Disconnected),
                acked: RwLock::new(HashSet::new()),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                queued: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                consecutive_failures: AtomicU32::new(0),
                sessions: AtomicU64::new(0),
                fatal_alerts: AtomicU64::new(0),
                on_reconnect: RwLock::new(None),
                shutdown,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn class(&self) -> ChannelClass {
        self.shared.settings.class
    }

    /// Install the reconnect callback. Replaces any previous one.
    pub fn on_reconnect(&self, callback: ReconnectCallback) {
        *self.shared.on_reconnect.write() = Some(callback);
    }

    /// Spawn the connection task. A second call while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!(class = %self.class(), "stream already running");
            return;
        }
        self.shared.shutdown.send_replace(false);
        self.shared.set_state(ConnectionState::Connecting);
        *task = Some(tokio::spawn(run(self.shared.clone())));
        info!(class = %self.class(), url = %self.shared.settings.url, "stream connection started");
    }

    /// Stop the connection task and fail every waiting request.
    pub async fn disconnect(&self) {
        self.shared.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(class = %self.class(), error = %e, "stream task join failed");
            }
        }
        self.shared.on_socket_lost();
        self.shared.fail_all();
        self.shared.set_state(ConnectionState::Disconnected);
        info!(class = %self.class(), "stream disconnected");
    }

    /// Sessions established since creation.
    pub fn sessions(&self) -> u64 {
        self.shared.sessions.load(Ordering::Relaxed)
    }

    pub fn fatal_alerts(&self) -> u64 {
        self.shared.fatal_alerts.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Relaxed)
    }

    #[instrument(skip(self), fields(class = %self.class()))]
    async fn control(&self, op: ControlOp, sub: &Subscription) -> MirrorResult<()> {
        let (id, rx) = self.shared.enqueue(op, sub);
        let timeout = self.shared.settings.ack_timeout;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MirrorError::NotConnected),
            Err(_) => {
                self.shared.forget(&id);
                debug!(id = %id, op = %op, "control ack timed out");
                Err(MirrorError::Timeout(timeout.as_millis() as u64))
            }
        }
    }
}

impl SubscriptionStatusProvider for StreamConnection {
    fn is_subscribed(&self, sub: &Subscription) -> bool {
        self.shared.acked.read().contains(sub)
    }
}

#[async_trait]
impl StreamControl for StreamConnection {
    async fn subscribe(&self, sub: &Subscription) -> MirrorResult<()> {
        self.control(ControlOp::Subscribe, sub).await
    }

    async fn unsubscribe(&self, sub: &Subscription) -> MirrorResult<()> {
        self.control(ControlOp::Unsubscribe, sub).await
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("class", &self.shared.settings.class)
            .field("state", &self.shared.state())
            .field("acked", &self.shared.acked.read().len())
            .field("pending", &self.shared.pending.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn run(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let settings = shared.settings.clone();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match open_socket(&settings).await {
            Ok(ws) => {
                attempt = 0;
                shared.consecutive_failures.store(0, Ordering::Relaxed);

                let end = session(&shared, ws, &mut shutdown).await;
                shared.on_socket_lost();
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Dropped(reason) => {
                        warn!(class = %settings.class, reason = %reason, "stream session lost — reconnecting");
                    }
                }
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let failures = shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures % settings.failure_limit.max(1) == 0 {
                    shared.fatal_alerts.fetch_add(1, Ordering::Relaxed);
                    error!(
                        fatal = true,
                        class = %settings.class,
                        failures,
                        error = %e,
                        "stream connectivity exhausted — still retrying at backoff ceiling"
                    );
                } else {
                    warn!(class = %settings.class, failures, error = %e, "stream connect failed");
                }
            }
        }

        shared.set_state(ConnectionState::Reconnecting);
        let delay = backoff_delay(attempt, settings.reconnect_base, settings.reconnect_max);
        debug!(class = %settings.class, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!(class = %settings.class, "stream task exiting");
}

async fn open_socket(settings: &StreamSettings) -> MirrorResult<WsStream> {
    let connect = connect_async(settings.url.as_str());
    match tokio::time::timeout(settings.connect_timeout, connect).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(MirrorError::Timeout(settings.connect_timeout.as_millis() as u64)),
    }
}

async fn session(shared: &Shared, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    shared.go_live(tx);
    shared.notify_reconnect();

    let mut ping = tokio::time::interval(shared.settings.ping_interval);
    ping.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            Some(msg) = rx.recv() => {
                if let Err(e) = write.send(msg).await {
                    return SessionEnd::Dropped(format!("send failed: {e}"));
                }
            }

            // ── Keep-alive: a ping left unanswered for a full period drops the socket ──
            _ = ping.tick() => {
                if awaiting_pong {
                    return SessionEnd::Dropped("pong not received".into());
                }
                awaiting_pong = true;
                if let Err(e) = write.send(Message::Text(codec::PING_FRAME.to_string())).await {
                    return SessionEnd::Dropped(format!("ping failed: {e}"));
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if shared.handle_text(&text) {
                            awaiting_pong = false;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return SessionEnd::Dropped(format!("pong failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Dropped(format!("close frame: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return SessionEnd::Dropped(format!("read error: {e}"));
                    }
                    None => {
                        return SessionEnd::Dropped("stream ended".into());
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
