//! Offer/answer и обмен кандидатами для одной сессии.
//!
//! Движок ничего не отправляет сам: каждый шаг возвращает сигнал, который
//! контроллер кладёт в канал. Handle живёт внутри фазы и уходит вместе с ней.

use crate::error::{Error, Result};
use crate::media::{LocalMediaStream, RemoteStream, RemoteTrack};
use crate::peer::handle::{PeerEventSink, PeerFactory, PeerHandle};
use crate::peer::ice::{apply_candidate, apply_pending_candidates, PendingCandidates};
use crate::peer::state::{NegotiationState, PeerConnectionState, Role};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::signaling::protocol::Signal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

enum Phase {
    Idle,
    Negotiating {
        peer: Arc<dyn PeerHandle>,
        remote_described: bool,
    },
    Connected {
        peer: Arc<dyn PeerHandle>,
        /// транспорт сообщил `disconnected`, идёт grace period
        interrupted: bool,
    },
    Closed,
}

/// Что изменилось после смены состояния транспорта
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOutcome {
    /// Сессия перешла в Connected
    Connected,
    /// Связь восстановилась в течение grace period
    Recovered,
    /// `disconnected` при включённом grace period; сессия ещё жива
    Interrupted,
    /// Сессия закрыта, handle освобождён
    Lost,
    Unchanged,
}

pub struct NegotiationEngine {
    generation: u64,
    role: Role,
    phase: Phase,
    pending: PendingCandidates,
    remote_stream: Option<RemoteStream>,
    factory: Arc<dyn PeerFactory>,
    step_timeout: Duration,
    disconnect_grace: bool,
}

/// Шаг с ограничением по времени; истечение считается ошибкой согласования
async fn step<T>(limit: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::negotiation(format!("{what} timed out after {limit:?}"))),
    }
}

impl NegotiationEngine {
    pub fn new(
        generation: u64,
        role: Role,
        factory: Arc<dyn PeerFactory>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            generation,
            role,
            phase: Phase::Idle,
            pending: PendingCandidates::new(),
            remote_stream: None,
            factory,
            step_timeout,
            disconnect_grace: false,
        }
    }

    /// `disconnected` не закрывает сессию сразу, решение за таймером контроллера
    pub fn with_disconnect_grace(mut self, enabled: bool) -> Self {
        self.disconnect_grace = enabled;
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        match self.phase {
            Phase::Idle => NegotiationState::Idle,
            Phase::Negotiating { .. } => NegotiationState::Negotiating,
            Phase::Connected { .. } => NegotiationState::Connected,
            Phase::Closed => NegotiationState::Closed,
        }
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Создаёт handle с локальными треками. Инициатор сразу возвращает offer,
    /// отвечающий ждёт.
    pub async fn start(
        &mut self,
        local: &Arc<LocalMediaStream>,
        events: PeerEventSink,
    ) -> Result<Option<Signal>> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(Error::negotiation(format!(
                "session {} already started",
                self.generation
            )));
        }

        let peer = step(
            self.step_timeout,
            "create peer connection",
            self.factory.create(local, events),
        )
        .await?;
        self.phase = Phase::Negotiating {
            peer: Arc::clone(&peer),
            remote_described: false,
        };

        match self.role {
            Role::Responder => {
                debug!(generation = self.generation, "Waiting for remote offer");
                Ok(None)
            }
            Role::Initiator => {
                let offer = step(self.step_timeout, "create offer", peer.create_offer()).await?;
                step(
                    self.step_timeout,
                    "set local offer",
                    peer.set_local_description(offer.clone()),
                )
                .await?;
                info!(generation = self.generation, "Offer created");
                Ok(Some(Signal::Offer(offer)))
            }
        }
    }

    /// Отвечающий: remote offer → очередь кандидатов → answer
    pub async fn handle_offer(&mut self, offer: SessionDescription) -> Result<Option<Signal>> {
        let peer = match &self.phase {
            Phase::Negotiating {
                peer,
                remote_described: false,
            } if self.role == Role::Responder => Arc::clone(peer),
            Phase::Idle | Phase::Closed => {
                debug!(generation = self.generation, "No live session, offer dropped");
                return Ok(None);
            }
            _ => {
                warn!(
                    generation = self.generation,
                    role = ?self.role,
                    "Unexpected offer ignored"
                );
                return Ok(None);
            }
        };

        step(
            self.step_timeout,
            "set remote offer",
            peer.set_remote_description(offer),
        )
        .await?;
        self.mark_remote_described();
        apply_pending_candidates(peer.as_ref(), &mut self.pending).await;

        let answer = step(self.step_timeout, "create answer", peer.create_answer()).await?;
        step(
            self.step_timeout,
            "set local answer",
            peer.set_local_description(answer.clone()),
        )
        .await?;
        info!(generation = self.generation, "Answer created");
        Ok(Some(Signal::Answer(answer)))
    }

    /// Инициатор: remote answer → очередь кандидатов.
    /// Connected наступает только по сообщению транспорта.
    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<()> {
        let peer = match &self.phase {
            Phase::Negotiating {
                peer,
                remote_described: false,
            } if self.role == Role::Initiator => Arc::clone(peer),
            Phase::Idle | Phase::Closed => {
                debug!(generation = self.generation, "No live session, answer dropped");
                return Ok(());
            }
            _ => {
                warn!(
                    generation = self.generation,
                    role = ?self.role,
                    "Unexpected answer ignored"
                );
                return Ok(());
            }
        };

        step(
            self.step_timeout,
            "set remote answer",
            peer.set_remote_description(answer),
        )
        .await?;
        self.mark_remote_described();
        apply_pending_candidates(peer.as_ref(), &mut self.pending).await;
        Ok(())
    }

    /// До remote description кандидат ставится в очередь, после применяется сразу
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        match &self.phase {
            Phase::Negotiating {
                peer,
                remote_described: true,
            }
            | Phase::Connected { peer, .. } => {
                let peer = Arc::clone(peer);
                apply_candidate(peer.as_ref(), candidate).await;
            }
            Phase::Idle | Phase::Negotiating { .. } => {
                self.pending.push(candidate);
                debug!(
                    generation = self.generation,
                    pending = self.pending.len(),
                    "Remote candidate queued"
                );
            }
            Phase::Closed => {
                debug!(generation = self.generation, "Session closed, candidate dropped");
            }
        }
    }

    /// Каждый локальный кандидат уходит отдельным сигналом
    pub fn local_candidate(&self, candidate: IceCandidate) -> Option<Signal> {
        match self.phase {
            Phase::Negotiating { .. } | Phase::Connected { .. } => {
                Some(Signal::IceCandidate(candidate))
            }
            Phase::Idle | Phase::Closed => None,
        }
    }

    pub async fn handle_connection_state(&mut self, state: PeerConnectionState) -> TransportOutcome {
        match (state, &mut self.phase) {
            (_, Phase::Idle | Phase::Closed) => TransportOutcome::Unchanged,
            (PeerConnectionState::Disconnected, Phase::Connected { interrupted, .. })
                if self.disconnect_grace =>
            {
                if *interrupted {
                    return TransportOutcome::Unchanged;
                }
                *interrupted = true;
                warn!(generation = self.generation, "Connection interrupted");
                TransportOutcome::Interrupted
            }
            (state, _) if state.is_terminal() => {
                warn!(generation = self.generation, %state, "Session lost");
                self.teardown().await;
                TransportOutcome::Lost
            }
            (PeerConnectionState::Connected, Phase::Negotiating { peer, .. }) => {
                let peer = Arc::clone(peer);
                self.phase = Phase::Connected {
                    peer,
                    interrupted: false,
                };
                info!(generation = self.generation, "Session connected");
                TransportOutcome::Connected
            }
            (PeerConnectionState::Connected, Phase::Connected { interrupted, .. }) => {
                if std::mem::replace(interrupted, false) {
                    info!(generation = self.generation, "Connection recovered");
                    TransportOutcome::Recovered
                } else {
                    TransportOutcome::Unchanged
                }
            }
            // new / connecting
            _ => TransportOutcome::Unchanged,
        }
    }

    /// Grace period истёк. true, если сессия закрыта из-за этого
    pub async fn grace_expired(&mut self) -> bool {
        if matches!(self.phase, Phase::Connected { interrupted: true, .. }) {
            warn!(generation = self.generation, "Connection did not recover");
            self.teardown().await;
            true
        } else {
            false
        }
    }

    /// Добавляет входящий трек к удалённому потоку. false для закрытой сессии.
    pub fn add_remote_track(&mut self, track: RemoteTrack) -> bool {
        match self.phase {
            Phase::Negotiating { .. } | Phase::Connected { .. } => {}
            Phase::Idle | Phase::Closed => return false,
        }
        debug!(
            generation = self.generation,
            "Remote {:?} track {} attached",
            track.kind,
            track.id
        );
        match self.remote_stream.as_mut() {
            Some(stream) => stream.attach(track),
            None => self.remote_stream = Some(RemoteStream::new(track)),
        }
        true
    }

    /// Закрывает handle, чистит очередь и удалённый поток. Повторный вызов ничего не делает.
    pub async fn teardown(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Closed);
        self.pending.clear();
        self.remote_stream = None;

        match phase {
            Phase::Negotiating { peer, .. } | Phase::Connected { peer, .. } => {
                // close доводится до конца, даже если вызывающий шаг брошен
                let limit = self.step_timeout;
                let closing = tokio::spawn(async move {
                    step(limit, "close peer connection", peer.close()).await
                });
                match closing.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        generation = self.generation,
                        class = e.class(),
                        "Error closing peer connection: {e}"
                    ),
                    Err(e) => warn!(generation = self.generation, "Close task failed: {e}"),
                }
                info!(generation = self.generation, "Session torn down");
            }
            Phase::Idle => debug!(generation = self.generation, "Session closed before start"),
            Phase::Closed => {}
        }
    }

    fn mark_remote_described(&mut self) {
        if let Phase::Negotiating {
            remote_described, ..
        } = &mut self.phase
        {
            *remote_described = true;
        }
    }
}
