//! Граница между движком согласования и конкретной реализацией peer connection.

use crate::error::Result;
use crate::media::{LocalMediaStream, RemoteTrack};
use crate::peer::state::PeerConnectionState;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Один peer connection на одну сессию. Повторно не используется.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Создаёт новый handle с уже подключёнными локальными треками
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        local: &Arc<LocalMediaStream>,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerHandle>>;
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    Track(RemoteTrack),
}

/// Событие от транспорта, помеченное поколением сессии
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Куда колбэки peer connection складывают события.
///
/// Колбэки сами ничего не меняют: контроллер разбирает события по одному
/// и отбрасывает те, чьё поколение уже не текущее.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEventKind::LocalCandidate(candidate));
    }

    pub fn state_changed(&self, state: PeerConnectionState) {
        self.emit(PeerEventKind::StateChanged(state));
    }

    pub fn track(&self, track: RemoteTrack) {
        self.emit(PeerEventKind::Track(track));
    }

    fn emit(&self, kind: PeerEventKind) {
        // receiver уходит только вместе с контроллером
        let _ = self.tx.send(PeerEvent {
            generation: self.generation,
            kind,
        });
    }
}
