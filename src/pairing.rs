//! Контроллер пар: единственный владелец сессии.
//!
//! Всё, что меняет сессию (события relay, колбэки peer connection, таймеры,
//! команды пользователя), приходит в одну задачу и разбирается по одному.
//! Колбэки и таймеры помечены поколением сессии; чужие поколения
//! отбрасываются. `skip` и `stop` не ждут зависший шаг согласования:
//! шаг бросается, сессия закрывается.

use crate::config::ChatConfig;
use crate::error::{Error, Result};
use crate::media::{CaptureBackend, LocalMediaStream, MediaSourceManager, RemoteStream};
use crate::peer::engine::{NegotiationEngine, TransportOutcome};
use crate::peer::handle::{PeerEvent, PeerEventKind, PeerEventSink, PeerFactory};
use crate::peer::state::{NegotiationState, PeerConnectionState, Role};
use crate::session::{Session, SessionSummary};
use crate::signaling::protocol::{RelayEvent, Signal, SignalCodec};
use crate::signaling::{RelayConnector, SignalingChannel, TaggedCodec};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Короткий статус для пользователя
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatStatus {
    Connecting,
    Waiting,
    Paired(Option<String>),
    /// Состояние peer connection как есть
    Peer(PeerConnectionState),
    PartnerLeft,
    Searching,
    /// Текст от relay
    System(String),
    Disconnected,
    MediaUnavailable,
    Exited,
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatStatus::Connecting => f.write_str("Connecting…"),
            ChatStatus::Waiting => f.write_str("Waiting for partner…"),
            ChatStatus::Paired(Some(name)) => write!(f, "Connected with {name}"),
            ChatStatus::Paired(None) => f.write_str("Connected with a stranger"),
            ChatStatus::Peer(state) => write!(f, "{state}"),
            ChatStatus::PartnerLeft => f.write_str("Partner left. Searching for a new one…"),
            ChatStatus::Searching => f.write_str("Searching for next…"),
            ChatStatus::System(message) => f.write_str(message),
            ChatStatus::Disconnected => f.write_str("Disconnected"),
            ChatStatus::MediaUnavailable => f.write_str("Camera/Mic permission is required."),
            ChatStatus::Exited => f.write_str("Chat ended"),
        }
    }
}

/// То, что видит слой представления
#[derive(Debug, Clone)]
pub struct ChatView {
    pub status: ChatStatus,
    pub session: Option<SessionSummary>,
    pub remote_stream: Option<RemoteStream>,
}

impl ChatView {
    fn initial() -> Self {
        Self {
            status: ChatStatus::Connecting,
            session: None,
            remote_stream: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    /// Следующий собеседник
    Skip,
    /// Выход из чата
    Stop,
    /// Переподключиться к relay после потери канала
    Reconnect,
}

enum Input {
    Command(ChatCommand),
    Work(Work),
}

/// Вход, обработка которого может ждать peer connection или relay
enum Work {
    Peer(PeerEvent),
    Timer(TimerEvent),
    Relay(Result<RelayEvent>),
}

impl Work {
    /// Потеря канала и переподключение; `Skip` их не прерывает
    fn touches_relay_link(&self) -> bool {
        matches!(
            self,
            Work::Timer(TimerEvent::Reconnect) | Work::Relay(Err(Error::Channel(_)))
        )
    }
}

#[derive(Debug)]
enum TimerEvent {
    NegotiationTimeout(u64),
    GraceExpired(u64),
    Reconnect,
}

pub struct PairingController {
    identity: String,
    config: ChatConfig,
    connector: Arc<dyn RelayConnector>,
    factory: Arc<dyn PeerFactory>,
    codec: Arc<dyn SignalCodec>,
    media: MediaSourceManager,
    local: Arc<LocalMediaStream>,

    channel: Option<SignalingChannel>,
    session: Option<Session>,
    generation: u64,
    status: ChatStatus,
    view: watch::Sender<ChatView>,

    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,

    negotiation_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_attempt: u32,
}

async fn next_relay_event(channel: &mut Option<SignalingChannel>) -> Result<RelayEvent> {
    match channel {
        Some(channel) => channel.next_event().await,
        None => std::future::pending().await,
    }
}

/// Ждёт команду, ради которой текущий шаг бросается; остальные откладываются.
async fn interrupting(
    commands: &mut mpsc::UnboundedReceiver<ChatCommand>,
    deferred: &mut VecDeque<ChatCommand>,
    skip_interrupts: bool,
) -> ChatCommand {
    loop {
        match commands.recv().await {
            Some(ChatCommand::Stop) | None => return ChatCommand::Stop,
            Some(ChatCommand::Skip) if skip_interrupts => return ChatCommand::Skip,
            Some(command) => deferred.push_back(command),
        }
    }
}

fn cancel(timer: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = timer.take() {
        handle.abort();
    }
}

impl PairingController {
    fn new(
        identity: String,
        config: ChatConfig,
        connector: Arc<dyn RelayConnector>,
        factory: Arc<dyn PeerFactory>,
        media: MediaSourceManager,
        local: Arc<LocalMediaStream>,
        view: watch::Sender<ChatView>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            codec: TaggedCodec::for_variant(config.protocol),
            config,
            connector,
            factory,
            media,
            local,
            channel: None,
            session: None,
            generation: 0,
            status: ChatStatus::Connecting,
            view,
            peer_tx,
            peer_rx,
            timer_tx,
            timer_rx,
            negotiation_timer: None,
            grace_timer: None,
            reconnect_timer: None,
            reconnect_attempt: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ChatCommand>) {
        self.open_channel().await;
        self.publish();

        let mut deferred = VecDeque::new();
        loop {
            let input = match deferred.pop_front() {
                Some(command) => Input::Command(command),
                None => tokio::select! {
                    cmd = commands.recv() => Input::Command(cmd.unwrap_or(ChatCommand::Stop)),
                    Some(event) = self.peer_rx.recv() => Input::Work(Work::Peer(event)),
                    Some(timer) = self.timer_rx.recv() => Input::Work(Work::Timer(timer)),
                    event = next_relay_event(&mut self.channel) => Input::Work(Work::Relay(event)),
                },
            };

            let command = match input {
                Input::Command(command) => Some(command),
                Input::Work(work) => {
                    let skip_interrupts = !work.touches_relay_link();
                    tokio::select! {
                        biased;
                        command = interrupting(&mut commands, &mut deferred, skip_interrupts) => {
                            debug!(?command, "Current step abandoned");
                            Some(command)
                        }
                        () = self.dispatch(work) => None,
                    }
                }
            };

            if let Some(command) = command {
                if !self.on_command(command).await {
                    self.publish();
                    break;
                }
            }
            self.publish();
        }
        info!("Chat for {} finished", self.identity);
    }

    async fn dispatch(&mut self, work: Work) {
        match work {
            Work::Peer(event) => self.on_peer_event(event).await,
            Work::Timer(timer) => self.on_timer(timer).await,
            Work::Relay(event) => self.on_relay_event(event).await,
        }
    }

    /// false после `Stop`
    async fn on_command(&mut self, command: ChatCommand) -> bool {
        match command {
            ChatCommand::Skip => self.skip().await,
            ChatCommand::Reconnect => {
                self.reconnect_attempt = 0;
                self.reconnect().await;
            }
            ChatCommand::Stop => {
                self.stop().await;
                return false;
            }
        }
        true
    }

    fn publish(&self) {
        let session = self.session.as_ref();
        self.view.send_replace(ChatView {
            status: self.status.clone(),
            session: session.map(Session::summary),
            remote_stream: session.and_then(|s| s.engine.remote_stream().cloned()),
        });
    }

    fn set_status(&mut self, status: ChatStatus) {
        if self.status != status {
            info!("Status: {status}");
            self.status = status;
        }
    }

    fn send(&self, signal: &Signal) {
        match &self.channel {
            Some(channel) => channel.send(signal),
            None => debug!("No relay channel, {} not sent", signal.kind()),
        }
    }

    async fn on_relay_event(&mut self, event: Result<RelayEvent>) {
        let event = match event {
            Ok(event) => event,
            Err(Error::Channel(reason)) => return self.channel_lost(reason).await,
            Err(e) => {
                // битый или неизвестный кадр ничего не меняет
                warn!(class = e.class(), "Ignoring relay frame: {e}");
                return;
            }
        };

        match event {
            RelayEvent::PartnerFound {
                partner,
                is_initiator,
            } => self.paired(partner, is_initiator).await,
            RelayEvent::Offer(offer) => {
                let Some(session) = self.session.as_mut() else {
                    debug!("Offer without a session, ignored");
                    return;
                };
                match session.engine.handle_offer(offer).await {
                    Ok(Some(answer)) => self.send(&answer),
                    Ok(None) => {}
                    Err(e) => self.fail_session(e).await,
                }
            }
            RelayEvent::Answer(answer) => {
                let Some(session) = self.session.as_mut() else {
                    debug!("Answer without a session, ignored");
                    return;
                };
                if let Err(e) = session.engine.handle_answer(answer).await {
                    self.fail_session(e).await;
                }
            }
            RelayEvent::IceCandidate(candidate) => match self.session.as_mut() {
                Some(session) => session.engine.handle_remote_candidate(candidate).await,
                None => debug!("Candidate without a session, dropped"),
            },
            RelayEvent::PartnerSkipped | RelayEvent::PartnerDisconnected => {
                self.partner_left(true).await
            }
            RelayEvent::PartnerLeft => self.partner_left(false).await,
            RelayEvent::System(message) => {
                info!("Relay: {message}");
                self.set_status(ChatStatus::System(message));
            }
            RelayEvent::Waiting => self.set_status(ChatStatus::Waiting),
            RelayEvent::Searching => self.set_status(ChatStatus::Searching),
        }
    }

    /// Новая пара. Предыдущая сессия закрывается до создания нового handle.
    async fn paired(&mut self, partner: Option<String>, is_initiator: bool) {
        if let Some(session) = self.session.as_ref() {
            warn!(
                generation = session.generation(),
                "Paired while a session is live, tearing it down"
            );
            self.close_session().await;
        }

        self.generation += 1;
        let generation = self.generation;
        let role = Role::from_flag(is_initiator);
        info!(generation, partner = ?partner, ?role, "Partner found");

        let engine = NegotiationEngine::new(
            generation,
            role,
            Arc::clone(&self.factory),
            self.config.step_timeout(),
        )
        .with_disconnect_grace(self.config.disconnect_grace().is_some());
        self.set_status(ChatStatus::Paired(partner.clone()));

        // сессия видна close_session ещё до start
        let session = self.session.insert(Session::new(partner, Arc::clone(&self.local), engine));
        let sink = PeerEventSink::new(generation, self.peer_tx.clone());
        let started = session.engine.start(&session.local, sink).await;
        match started {
            Ok(offer) => {
                if let Some(offer) = offer {
                    self.send(&offer);
                }
                self.arm_negotiation_timer(generation);
            }
            Err(e) => self.fail_session(e).await,
        }
    }

    /// `requeue`: relay сам в очередь не возвращает, нужен `next`
    async fn partner_left(&mut self, requeue: bool) {
        info!(requeue, "Partner left");
        self.close_session().await;
        if requeue {
            self.send(&Signal::Next);
        }
        self.set_status(ChatStatus::PartnerLeft);
    }

    async fn skip(&mut self) {
        info!("Skipping to next partner");
        self.close_session().await;
        self.send(&Signal::Next);
        self.set_status(ChatStatus::Searching);
    }

    async fn stop(&mut self) {
        info!("Leaving chat");
        self.send(&Signal::Disconnect);
        self.close_session().await;
        cancel(&mut self.reconnect_timer);
        self.media.release(&self.local);
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.set_status(ChatStatus::Exited);
    }

    /// Ошибка согласования: сессия закрывается, ищем следующего
    async fn fail_session(&mut self, e: Error) {
        let generation = self.session.as_ref().map(Session::generation);
        warn!(generation = ?generation, class = e.class(), "Session failed: {e}");
        self.close_session().await;
        self.send(&Signal::Next);
        self.set_status(ChatStatus::Searching);
    }

    async fn close_session(&mut self) {
        cancel(&mut self.negotiation_timer);
        cancel(&mut self.grace_timer);
        if let Some(mut session) = self.session.take() {
            session.engine.teardown().await;
            debug!(
                generation = session.generation(),
                id = %session.id,
                "Session {} closed",
                session.id
            );
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(session) = self.session.as_mut() else {
            debug!(generation = event.generation, "Peer event without a session, dropped");
            return;
        };
        if session.generation() != event.generation {
            debug!(
                generation = event.generation,
                current = session.generation(),
                "Stale peer event discarded"
            );
            return;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if let Some(signal) = session.engine.local_candidate(candidate) {
                    self.send(&signal);
                }
            }
            PeerEventKind::Track(track) => {
                session.engine.add_remote_track(track);
            }
            PeerEventKind::StateChanged(state) => {
                let outcome = session.engine.handle_connection_state(state).await;
                self.set_status(ChatStatus::Peer(state));
                match outcome {
                    TransportOutcome::Connected => cancel(&mut self.negotiation_timer),
                    TransportOutcome::Recovered => cancel(&mut self.grace_timer),
                    TransportOutcome::Interrupted => self.arm_grace_timer(event.generation),
                    TransportOutcome::Lost => self.session_lost().await,
                    TransportOutcome::Unchanged => {}
                }
            }
        }
    }

    /// Транспорт упал: движок уже закрыт, контроллер ищет следующего
    async fn session_lost(&mut self) {
        self.close_session().await;
        self.send(&Signal::Next);
        self.set_status(ChatStatus::Searching);
    }

    async fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::NegotiationTimeout(generation) => {
                let expired = self.session.as_ref().is_some_and(|s| {
                    s.generation() == generation && s.state() == NegotiationState::Negotiating
                });
                if expired {
                    self.fail_session(Error::negotiation("negotiation timed out"))
                        .await;
                }
            }
            TimerEvent::GraceExpired(generation) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.generation() == generation && session.engine.grace_expired().await {
                    self.session_lost().await;
                }
            }
            TimerEvent::Reconnect => {
                self.reconnect_timer = None;
                self.reconnect().await;
            }
        }
    }

    fn arm_negotiation_timer(&mut self, generation: u64) {
        cancel(&mut self.negotiation_timer);
        let Some(limit) = self.config.negotiation_timeout() else {
            return;
        };
        let tx = self.timer_tx.clone();
        self.negotiation_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let _ = tx.send(TimerEvent::NegotiationTimeout(generation));
        }));
    }

    fn arm_grace_timer(&mut self, generation: u64) {
        cancel(&mut self.grace_timer);
        let Some(grace) = self.config.disconnect_grace() else {
            return;
        };
        debug!(generation, "Waiting {:?} for the connection to recover", grace);
        let tx = self.timer_tx.clone();
        self.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(TimerEvent::GraceExpired(generation));
        }));
    }

    async fn open_channel(&mut self) {
        self.set_status(ChatStatus::Connecting);
        match SignalingChannel::connect(
            self.connector.as_ref(),
            &self.identity,
            Arc::clone(&self.codec),
        )
        .await
        {
            Ok(channel) => {
                self.channel = Some(channel);
                self.reconnect_attempt = 0;
                self.set_status(ChatStatus::Waiting);
            }
            Err(e) => {
                error!(class = e.class(), "Failed to connect to relay: {e}");
                self.set_status(ChatStatus::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    async fn channel_lost(&mut self, reason: String) {
        warn!(class = "channel", "Relay connection lost: {reason}");
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.set_status(ChatStatus::Disconnected);
        self.reconnect_attempt = 0;
        self.schedule_reconnect();
        self.close_session().await;
    }

    async fn reconnect(&mut self) {
        if self.channel.as_ref().is_some_and(SignalingChannel::is_open) {
            debug!("Relay channel is open, reconnect ignored");
            return;
        }
        cancel(&mut self.reconnect_timer);
        info!(attempt = self.reconnect_attempt, "Reconnecting to relay");
        self.open_channel().await;
    }

    /// Автоматическое переподключение только если политика его разрешает.
    /// `reconnect_attempt` считает уже назначенные попытки.
    fn schedule_reconnect(&mut self) {
        let policy = &self.config.reconnect;
        if !policy.automatic {
            return;
        }
        if self.reconnect_attempt >= policy.max_attempts {
            warn!(
                attempts = self.reconnect_attempt,
                "Giving up on relay, waiting for manual reconnect"
            );
            return;
        }
        let delay = policy.delay(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        debug!(attempt = self.reconnect_attempt, "Next relay connect in {:?}", delay);
        cancel(&mut self.reconnect_timer);
        let tx = self.timer_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerEvent::Reconnect);
        }));
    }
}

/// Точка входа для слоя представления
pub struct ChatClient;

impl ChatClient {
    /// Захватывает камеру/микрофон, подключается к relay и запускает контроллер.
    ///
    /// Без доступа к медиа чат не стартует: возвращается `Error::MediaAccess`,
    /// повторной попытки нет.
    pub async fn start(
        identity: &str,
        config: ChatConfig,
        connector: Arc<dyn RelayConnector>,
        factory: Arc<dyn PeerFactory>,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<ChatHandle> {
        config.validate()?;

        let mut media = MediaSourceManager::new(backend);
        let local = match media.acquire(&config.media).await {
            Ok(local) => local,
            Err(e) => {
                error!(class = e.class(), "{}", ChatStatus::MediaUnavailable);
                return Err(e);
            }
        };

        let (view_tx, view_rx) = watch::channel(ChatView::initial());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let controller = PairingController::new(
            identity.to_string(),
            config,
            connector,
            factory,
            media,
            Arc::clone(&local),
            view_tx,
        );
        let task = tokio::spawn(controller.run(commands_rx));

        Ok(ChatHandle {
            commands,
            view: view_rx,
            local,
            task,
        })
    }
}

/// Управление запущенным чатом. Drop эквивалентен `stop()`.
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<ChatCommand>,
    view: watch::Receiver<ChatView>,
    local: Arc<LocalMediaStream>,
    task: JoinHandle<()>,
}

impl ChatHandle {
    pub fn skip(&self) {
        self.command(ChatCommand::Skip);
    }

    pub fn stop(&self) {
        self.command(ChatCommand::Stop);
    }

    pub fn reconnect(&self) {
        self.command(ChatCommand::Reconnect);
    }

    pub fn command(&self, command: ChatCommand) {
        if self.commands.send(command).is_err() {
            debug!("Chat already finished, {command:?} ignored");
        }
    }

    pub fn view(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    pub fn status(&self) -> ChatStatus {
        self.view.borrow().status.clone()
    }

    pub fn local_stream(&self) -> &Arc<LocalMediaStream> {
        &self.local
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ждёт завершения контроллера
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Chat task failed: {e}");
        }
    }
}
