//! WebRTC peer-connection engine.
//!
//! Backs [`PeerEngine`] with webrtc-rs. Every observer callback the
//! connection registers is forwarded to the coordinator through the
//! connection's [`EngineEventSink`].

use std::collections::HashMap;
use std::sync::Arc;

use protocol::{IceCandidateData, SdpType, SessionDescription};
use tokio::sync::RwLock;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::engine::{
    ConnectionState, EngineConnection, EngineError, EngineEvent, EngineEventSink, IceConfig,
    IceServer, PeerEngine,
};
use super::BoxFuture;
use crate::media::{MediaTrack, RemoteTrack, TrackKind};

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

fn to_rtc_configuration(ice: IceConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice.ice_servers.into_iter().map(Into::into).collect(),
        ..Default::default()
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    };
    parsed.map_err(|e| EngineError::new(format!("malformed SDP: {}", e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(EngineError::new("engine produced an untyped description"))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidateData {
    IceCandidateData {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidateData) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
    match kind {
        RTPCodecType::Audio => TrackKind::Audio,
        _ => TrackKind::Video,
    }
}

/// Peer-connection engine backed by webrtc-rs.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    /// Builds the WebRTC API with the default codecs and interceptors.
    pub fn new() -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::new(format!("failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::new(format!("failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

impl PeerEngine for WebRtcEngine {
    type Connection = WebRtcConnection;

    fn create_connection(
        &self,
        ice: IceConfig,
        sink: EngineEventSink,
    ) -> BoxFuture<'_, Result<WebRtcConnection, EngineError>> {
        Box::pin(async move {
            let peer_connection = self
                .api
                .new_peer_connection(to_rtc_configuration(ice))
                .await
                .map_err(|e| {
                    EngineError::new(format!("failed to create peer connection: {}", e))
                })?;

            let connection = WebRtcConnection {
                peer_connection: Arc::new(peer_connection),
                sink,
                local_tracks: RwLock::new(HashMap::new()),
            };
            connection.register_observers();
            Ok(connection)
        })
    }
}

/// A single webrtc-rs peer connection.
pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    sink: EngineEventSink,
    /// Local tracks by track id, for feeding encoded samples.
    local_tracks: RwLock<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcConnection {
    fn register_observers(&self) {
        let sink = self.sink.clone();
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.emit(EngineEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind: track_kind(track.kind()),
                    }));
                })
            },
        ));

        let sink = self.sink.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    // None marks the end of gathering.
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            sink.emit(EngineEvent::LocalCandidate(from_candidate_init(init)))
                        }
                        Err(e) => tracing::warn!("failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let sink = self.sink.clone();
        self.peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    tracing::debug!("peer connection state changed: {:?}", state);
                    sink.emit(EngineEvent::StateChanged(state.into()));
                })
            },
        ));

        // Channels opened by the remote side.
        let sink = self.sink.clone();
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                Box::pin(async move {
                    tracing::debug!("remote opened data channel '{}'", channel.label());
                    observe_data_channel(&channel, sink);
                })
            }));
    }

    /// Returns the local track with the given id, if one was added.
    pub async fn local_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.read().await.get(id).cloned()
    }
}

fn observe_data_channel(channel: &Arc<RTCDataChannel>, sink: EngineEventSink) {
    let label = channel.label().to_string();

    let open_sink = sink.clone();
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            open_sink.emit(EngineEvent::DataChannelOpen { label: open_label });
        })
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink.clone();
        let label = label.clone();
        Box::pin(async move {
            sink.emit(EngineEvent::DataChannelMessage {
                label,
                data: msg.data.to_vec(),
            });
        })
    }));
}

impl EngineConnection for WebRtcConnection {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, EngineError>> {
        Box::pin(async move {
            let offer = self
                .peer_connection
                .create_offer(None)
                .await
                .map_err(|e| EngineError::new(format!("failed to create offer: {}", e)))?;
            from_rtc_description(offer)
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, EngineError>> {
        Box::pin(async move {
            let answer = self
                .peer_connection
                .create_answer(None)
                .await
                .map_err(|e| EngineError::new(format!("failed to create answer: {}", e)))?;
            from_rtc_description(answer)
        })
    }

    fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let desc = to_rtc_description(desc)?;
            self.peer_connection
                .set_local_description(desc)
                .await
                .map_err(|e| EngineError::new(format!("failed to set local description: {}", e)))
        })
    }

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let desc = to_rtc_description(desc)?;
            self.peer_connection
                .set_remote_description(desc)
                .await
                .map_err(|e| {
                    EngineError::new(format!("failed to set remote description: {}", e))
                })
        })
    }

    fn add_ice_candidate(
        &self,
        candidate: IceCandidateData,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.peer_connection
                .add_ice_candidate(to_candidate_init(candidate))
                .await
                .map_err(|e| EngineError::new(format!("failed to add ICE candidate: {}", e)))
        })
    }

    fn add_track(&self, track: MediaTrack) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let mime_type = match track.kind {
                TrackKind::Video => MIME_TYPE_VP8,
                TrackKind::Audio => MIME_TYPE_OPUS,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                track.stream_id.clone(),
            ));

            self.peer_connection
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| EngineError::new(format!("failed to add track: {}", e)))?;

            self.local_tracks.write().await.insert(track.id, local);
            Ok(())
        })
    }

    fn create_data_channel(&self, label: String) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let channel = self
                .peer_connection
                .create_data_channel(&label, None)
                .await
                .map_err(|e| {
                    EngineError::new(format!("failed to create data channel '{}': {}", label, e))
                })?;
            observe_data_channel(&channel, self.sink.clone());
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.peer_connection
                .close()
                .await
                .map_err(|e| EngineError::new(format!("failed to close connection: {}", e)))
        })
    }
}
