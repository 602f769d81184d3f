//! Локальный захват и удалённые треки.
//!
//! Локальный поток берётся один раз на весь чат и раздаётся всем сессиям по
//! `Arc`; остановить его может только [`MediaSourceManager`].

use crate::error::{Error, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }
}

/// Что просим у устройства (аналог `getUserMedia({video, audio})`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Один исходящий трек
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
}

/// Локальный поток захвата
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
    live: AtomicBool,
}

impl LocalMediaStream {
    pub fn new(id: String, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id,
            tracks,
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Пишет кадр в трек нужного типа. После остановки потока кадры
    /// молча отбрасываются.
    pub async fn write_sample(&self, kind: MediaKind, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        let Some(local) = self.tracks.iter().find(|t| t.kind == kind) else {
            return Err(Error::MediaAccess(format!("stream {} has no {kind:?} track", self.id)));
        };
        local
            .track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// true только для первого вызова
    fn stop(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.iter().map(|t| t.kind).collect::<Vec<_>>())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Источник захвата (камера, файл, генератор)
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream>;
}

/// Публикует Opus + VP8 треки, которые наполняет внешний продюсер через
/// [`LocalMediaStream::write_sample`].
#[derive(Debug, Default)]
pub struct StaticTrackBackend;

#[async_trait]
impl CaptureBackend for StaticTrackBackend {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaAccess("neither audio nor video requested".into()));
        }

        let stream_id = format!("local-{}", random_id());
        let mut tracks = Vec::new();

        if constraints.audio {
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        ..Default::default()
                    },
                    "audio".to_owned(),
                    stream_id.clone(),
                )),
            });
        }
        if constraints.video {
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    "video".to_owned(),
                    stream_id.clone(),
                )),
            });
        }

        Ok(LocalMediaStream::new(stream_id, tracks))
    }
}

/// Владеет локальным потоком на протяжении всего чата
pub struct MediaSourceManager {
    backend: Arc<dyn CaptureBackend>,
    stream: Option<Arc<LocalMediaStream>>,
}

impl MediaSourceManager {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            stream: None,
        }
    }

    /// Возвращает уже захваченный поток или захватывает новый.
    /// Отказ в доступе не повторяется автоматически.
    pub async fn acquire(&mut self, constraints: &MediaConstraints) -> Result<Arc<LocalMediaStream>> {
        if let Some(stream) = self.stream.as_ref().filter(|s| s.is_live()) {
            return Ok(Arc::clone(stream));
        }

        let stream = match self.backend.open(constraints).await {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                let e = match e {
                    Error::MediaAccess(_) => e,
                    other => Error::MediaAccess(other.to_string()),
                };
                warn!(class = e.class(), "getUserMedia error: {e}");
                return Err(e);
            }
        };
        info!(
            "Local media acquired: stream={} tracks={}",
            stream.id(),
            stream.tracks().len()
        );
        self.stream = Some(Arc::clone(&stream));
        Ok(stream)
    }

    /// Останавливает все треки. Повторный вызов ничего не делает.
    pub fn release(&mut self, stream: &LocalMediaStream) {
        if stream.stop() {
            info!("Local media released: stream={}", stream.id());
        } else {
            debug!("Local media {} already released", stream.id());
        }
        if self.stream.as_ref().is_some_and(|s| s.id() == stream.id()) {
            self.stream = None;
        }
    }

    pub fn current(&self) -> Option<&Arc<LocalMediaStream>> {
        self.stream.as_ref()
    }
}

/// Входящий трек собеседника
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// RTP источник; у треков без RTP (например, синтетических) отсутствует
    pub rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: track.kind().into(),
            rtp: Some(track),
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Поток собеседника, собранный из входящих треков
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn new(first: RemoteTrack) -> Self {
        Self {
            id: first.stream_id.clone(),
            tracks: vec![first],
        }
    }

    /// Добавляет трек; повторный трек с тем же id заменяет старый
    pub fn attach(&mut self, track: RemoteTrack) {
        match self.tracks.iter_mut().find(|t| t.id == track.id) {
            Some(existing) => *existing = track,
            None => self.tracks.push(track),
        }
    }
}
