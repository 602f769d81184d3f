use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalMediaStream, RemoteTrack};
use crate::peer::handle::{PeerEventSink, PeerFactory, PeerHandle};
use crate::peer::types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};
use crate::utils::ice_url;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Создаёт peer connection на webrtc-rs
pub struct RtcPeerFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

/// Вешает локальные треки. При ошибке peer connection закрывается сразу,
/// иначе его ICE/DTLS задачи остаются висеть.
async fn attach_tracks(
    pc: &RTCPeerConnection,
    local: &LocalMediaStream,
    generation: u64,
) -> Result<()> {
    for local_track in local.tracks() {
        let sender = match pc
            .add_track(Arc::clone(&local_track.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                warn!(generation, "add_track failed, closing peer connection: {e}");
                if let Err(close_err) = pc.close().await {
                    warn!(generation, "Error closing peer connection: {close_err}");
                }
                return Err(e.into());
            }
        };

        // RTCP нужно вычитывать, иначе не работают interceptors
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }
    Ok(())
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    /// создаём Peer и сразу вешаем локальные треки
    async fn create(
        &self,
        local: &Arc<LocalMediaStream>,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerHandle>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&self.ice_servers)).await?);
        let generation = events.generation();
        info!(generation, "Peer connection created");

        attach_tracks(&pc, local, generation).await?;

        // Каждый локальный кандидат отправляется сразу, без накопления
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        dump_candidate("LOCAL", &candidate);
                        sink.local_candidate(candidate);
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {e}"),
                },
                // cand == None означает конец сбора
                None => debug!("ICE candidate gathering completed (null candidate received)"),
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(generation, "ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        // делаем копию для обработчика состояний
        let pc_state = Arc::downgrade(&pc);
        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(generation, "Peer connection state changed to: {:?}", st);
            if st == RTCPeerConnectionState::Failed {
                if let Some(pc) = pc_state.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            sink.state_changed(st.into());
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                info!(
                    generation,
                    "Remote track: kind={} id={} stream={}",
                    track.kind(),
                    track.id(),
                    track.stream_id()
                );
                sink.track(RemoteTrack::from_rtc(track));
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(RtcPeer { pc }))
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// ServerConfig → RTCIceServer
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![ice_url(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => {
            return Err(Error::negotiation("rollback descriptions are not supported"))
        }
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::negotiation("description without type"))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerHandle for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
