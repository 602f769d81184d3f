#![allow(dead_code)]

use async_trait::async_trait;
use sayonara_lib::config::ChatConfig;
use sayonara_lib::media::{
    CaptureBackend, LocalMediaStream, MediaConstraints, MediaKind, RemoteTrack, StaticTrackBackend,
};
use sayonara_lib::pairing::{ChatClient, ChatHandle, ChatView};
use sayonara_lib::peer::{
    IceCandidate, PeerConnectionState, PeerEventSink, PeerFactory, PeerHandle, SdpKind,
    SessionDescription,
};
use sayonara_lib::signaling::{LinkFrame, RelayConnector, RelayLink};
use sayonara_lib::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

pub const WAIT: Duration = Duration::from_secs(5);

/// Запись в журнале relay
#[derive(Debug, Clone)]
pub enum Logged {
    FromClient(String, Value),
    ToClient(String, Value),
}

impl Logged {
    pub fn kind(&self) -> &str {
        let frame = match self {
            Logged::FromClient(_, f) | Logged::ToClient(_, f) => f,
        };
        frame
            .get("type")
            .or_else(|| frame.get("event"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

/// Словарь relay: `{"type": ...}` или `{"event": ...}` с именами `paired`,
/// `partner-left`, `webrtc-*`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    #[default]
    Typed,
    Evented,
}

fn to_evented(frame: Value) -> Value {
    let kind = frame.get("type").and_then(Value::as_str).unwrap_or("");
    let data = frame.get("data").cloned().unwrap_or_else(|| json!({}));
    match kind {
        "partnerFound" => json!({
            "event": "paired",
            "data": {"message": "Connected with a stranger!", "initiator": frame["is_initiator"]}
        }),
        "offer" => json!({"event": "webrtc-offer", "data": data}),
        "answer" => json!({"event": "webrtc-answer", "data": data}),
        "ice-candidate" => json!({"event": "webrtc-ice", "data": data}),
        "partnerSkipped" | "partnerDisconnected" => json!({
            "event": "partner-left",
            "data": {"message": "Stranger disconnected. Finding new partner..."}
        }),
        "searching" => json!({
            "event": "system",
            "data": {"message": "Searching for a new partner..."}
        }),
        other => json!({"event": other, "data": data}),
    }
}

fn from_evented(kind: &str) -> &str {
    match kind {
        "webrtc-offer" => "offer",
        "webrtc-answer" => "answer",
        "webrtc-ice" => "ice-candidate",
        other => other,
    }
}

#[derive(Default)]
struct RelayState {
    clients: HashMap<String, (u64, mpsc::UnboundedSender<LinkFrame>)>,
    next_conn: u64,
    pairs: HashMap<String, String>,
    queue: Vec<String>,
    log: Vec<Logged>,
    refuse: bool,
    dialect: Dialect,
    connects: usize,
}

impl RelayState {
    fn deliver(&mut self, to: &str, frame: Value) {
        let frame = match self.dialect {
            Dialect::Typed => frame,
            Dialect::Evented => to_evented(frame),
        };
        self.log.push(Logged::ToClient(to.to_string(), frame.clone()));
        if let Some((_, client)) = self.clients.get(to) {
            let _ = client.send(LinkFrame::Text(frame.to_string()));
        }
    }

    fn enqueue(&mut self, who: &str) {
        if !self.queue.iter().any(|w| w == who) && !self.pairs.contains_key(who) {
            self.queue.push(who.to_string());
        }
    }

    fn pair_waiting(&mut self) {
        while self.queue.len() >= 2 {
            let u1 = self.queue.remove(0);
            let u2 = self.queue.remove(0);
            if !self.clients.contains_key(&u1) || !self.clients.contains_key(&u2) {
                continue;
            }
            self.pairs.insert(u1.clone(), u2.clone());
            self.pairs.insert(u2.clone(), u1.clone());
            self.deliver(
                &u1,
                json!({"type": "partnerFound", "from_user": u2, "is_initiator": true}),
            );
            self.deliver(
                &u2,
                json!({"type": "partnerFound", "from_user": u1, "is_initiator": false}),
            );
        }
    }

    /// true, если клиент попросил закрыть соединение
    fn handle(&mut self, me: &str, text: &str) -> bool {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return false;
        };
        self.log.push(Logged::FromClient(me.to_string(), frame.clone()));
        let tag = match self.dialect {
            Dialect::Typed => "type",
            Dialect::Evented => "event",
        };
        let kind = from_evented(frame.get(tag).and_then(Value::as_str).unwrap_or("")).to_string();
        let partner = self.pairs.get(me).cloned();

        match kind.as_str() {
            "offer" | "answer" | "ice-candidate" => {
                if let Some(partner) = partner {
                    let data = frame.get("data").cloned().unwrap_or(Value::Null);
                    self.deliver(
                        &partner,
                        json!({"type": kind, "from_user": me, "data": data}),
                    );
                }
            }
            "next" => {
                if let Some(old) = self.pairs.remove(me) {
                    self.pairs.remove(&old);
                    self.deliver(&old, json!({"type": "partnerSkipped"}));
                    // evented relay сам возвращает брошенного партнёра в очередь
                    if self.dialect == Dialect::Evented {
                        self.enqueue(&old);
                    }
                }
                self.deliver(me, json!({"type": "searching"}));
                self.enqueue(me);
                self.pair_waiting();
            }
            "disconnect" => return true,
            _ => {}
        }
        false
    }

    /// Уход конкретного соединения; более новое соединение с тем же именем не трогаем
    fn leave_conn(&mut self, me: &str, conn: u64) {
        if self.clients.get(me).is_some_and(|(id, _)| *id == conn) {
            self.leave(me);
        }
    }

    fn leave(&mut self, me: &str) {
        if let Some((_, client)) = self.clients.remove(me) {
            let _ = client.send(LinkFrame::Closed(None));
        }
        self.queue.retain(|w| w != me);
        if let Some(partner) = self.pairs.remove(me) {
            self.pairs.remove(&partner);
            self.deliver(&partner, json!({"type": "partnerDisconnected"}));
            self.enqueue(&partner);
            self.pair_waiting();
        }
    }
}

/// Relay в памяти: та же очередь и пересылка, что у настоящего
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evented() -> Self {
        let relay = Self::default();
        relay.state.lock().unwrap().dialect = Dialect::Evented;
        relay
    }

    /// Сколько раз клиенты пытались подключиться, включая отказы
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn log(&self) -> Vec<Logged> {
        self.state.lock().unwrap().log.clone()
    }

    /// Типы сообщений, которые прислал клиент
    pub fn sent_by(&self, who: &str) -> Vec<String> {
        self.log()
            .iter()
            .filter(|l| matches!(l, Logged::FromClient(w, _) if w == who))
            .map(|l| l.kind().to_string())
            .collect()
    }

    /// Типы сообщений, доставленных клиенту
    pub fn delivered_to(&self, who: &str) -> Vec<String> {
        self.log()
            .iter()
            .filter(|l| matches!(l, Logged::ToClient(w, _) if w == who))
            .map(|l| l.kind().to_string())
            .collect()
    }

    pub fn is_connected(&self, who: &str) -> bool {
        self.state.lock().unwrap().clients.contains_key(who)
    }

    pub fn partner_of(&self, who: &str) -> Option<String> {
        self.state.lock().unwrap().pairs.get(who).cloned()
    }

    /// Кадр как есть, мимо кодека
    pub fn send_raw(&self, to: &str, text: &str) {
        let state = self.state.lock().unwrap();
        if let Some((_, client)) = state.clients.get(to) {
            let _ = client.send(LinkFrame::Text(text.to_string()));
        }
    }

    /// Обрыв транспорта со стороны relay
    pub fn drop_client(&self, who: &str) {
        self.state.lock().unwrap().leave(who);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, identity: &str) -> Result<RelayLink> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkFrame>();
        let conn = {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            if state.refuse {
                return Err(Error::Channel("connection refused".into()));
            }
            state.next_conn += 1;
            let conn = state.next_conn;
            state.clients.insert(identity.to_string(), (conn, in_tx));
            state.enqueue(identity);
            state.pair_waiting();
            if !state.pairs.contains_key(identity) {
                state.deliver(identity, json!({"type": "waiting"}));
            }
            conn
        };

        let state = Arc::clone(&self.state);
        let me = identity.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let close = state.lock().unwrap().handle(&me, &text);
                if close {
                    break;
                }
            }
            state.lock().unwrap().leave_conn(&me, conn);
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Peer connection без сети: записывает вызовы и сообщает `connected`,
/// когда есть оба описания и хотя бы один удалённый кандидат.
pub struct FakePeer {
    pub generation: u64,
    sink: PeerEventSink,
    stall: Option<&'static str>,
    calls: Mutex<Vec<String>>,
    candidates: Mutex<Vec<String>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    async fn maybe_stall(&self, op: &str) {
        if self.stall == Some(op) {
            std::future::pending::<()>().await;
        }
    }

    fn maybe_connect(&self) {
        let ready = self.local.lock().unwrap().is_some()
            && self.remote.lock().unwrap().is_some()
            && !self.candidates.lock().unwrap().is_empty();
        if ready && !self.connected.swap(true, Ordering::SeqCst) {
            self.sink.state_changed(PeerConnectionState::Connecting);
            self.sink.state_changed(PeerConnectionState::Connected);
            self.sink.track(RemoteTrack {
                id: format!("remote-video-{}", self.generation),
                stream_id: format!("remote-{}", self.generation),
                kind: MediaKind::Video,
                rtp: None,
            });
        }
    }
}

#[async_trait]
impl PeerHandle for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer");
        self.maybe_stall("create_offer").await;
        Ok(SessionDescription::offer(format!(
            "fake-offer-{}",
            self.generation
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer");
        if self.remote.lock().unwrap().is_none() {
            return Err(Error::negotiation("answer without remote offer"));
        }
        Ok(SessionDescription::answer(format!(
            "fake-answer-{}",
            self.generation
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(match desc.kind {
            SdpKind::Offer => "set_local_offer",
            _ => "set_local_answer",
        });
        *self.local.lock().unwrap() = Some(desc);
        let g = self.generation;
        self.sink.local_candidate(IceCandidate::new(format!(
            "candidate:{g}1 1 udp 2122260223 192.168.1.{g} 50000 typ host"
        )));
        self.sink.local_candidate(IceCandidate::new(format!(
            "candidate:{g}2 1 udp 1686052607 203.0.113.{g} 50001 typ srflx raddr 0.0.0.0 rport 0"
        )));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.maybe_stall("set_remote_description").await;
        self.record(match desc.kind {
            SdpKind::Offer => "set_remote_offer",
            _ => "set_remote_answer",
        });
        *self.remote.lock().unwrap() = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().unwrap().is_none() {
            return Err(Error::negotiation("remote description is not set"));
        }
        if candidate.candidate.contains("bogus") {
            return Err(Error::negotiation("malformed candidate"));
        }
        self.record("add_ice_candidate");
        self.candidates.lock().unwrap().push(candidate.candidate);
        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        if !self.closed.swap(true, Ordering::SeqCst) {
            // как у настоящего peer connection: после close приходит `closed`
            self.sink.state_changed(PeerConnectionState::Closed);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    stall: Option<&'static str>,
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Операция `op` у созданных peer никогда не завершается
    pub fn stalling(op: &'static str) -> Arc<Self> {
        Arc::new(Self {
            stall: Some(op),
            ..Self::default()
        })
    }

    pub fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.created().last().cloned().expect("no peer created")
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _local: &Arc<LocalMediaStream>,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerHandle>> {
        let peer = Arc::new(FakePeer {
            generation: events.generation(),
            sink: events,
            stall: self.stall,
            calls: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

pub struct DeniedBackend;

#[async_trait]
impl CaptureBackend for DeniedBackend {
    async fn open(&self, _constraints: &MediaConstraints) -> Result<LocalMediaStream> {
        Err(Error::MediaAccess("NotAllowedError: Permission denied".into()))
    }
}

pub fn test_config() -> ChatConfig {
    ChatConfig {
        relay_url: "ws://memory.test/ws-video".into(),
        negotiation_timeout_secs: Some(5),
        step_timeout_secs: 2,
        ..ChatConfig::default()
    }
}

pub async fn start_client(
    relay: &MemoryRelay,
    factory: &Arc<FakePeerFactory>,
    name: &str,
    config: ChatConfig,
) -> ChatHandle {
    ChatClient::start(
        name,
        config,
        Arc::new(relay.clone()),
        factory.clone(),
        Arc::new(StaticTrackBackend),
    )
    .await
    .expect("chat should start")
}

pub async fn wait_view(
    view: &mut watch::Receiver<ChatView>,
    what: &str,
    pred: impl FnMut(&ChatView) -> bool,
) -> ChatView {
    let res = tokio::time::timeout(WAIT, view.wait_for(pred)).await;
    match res {
        Ok(Ok(v)) => v.clone(),
        Ok(Err(_)) => panic!("chat finished while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
