use std::sync::Arc;

use async_trait::async_trait;
use bridge_proto::IceCandidate;
use bridge_session::{
    Connectivity, DataChannel, EngineError, EngineEvent, EngineEvents, EngineFactory,
    NegotiationEngine, SdpKind, SessionDescription,
};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::candidate::{candidate_from_init, candidate_to_init};
use crate::{RtcConfig, WebRtcError};

pub struct WebRtcEngineFactory {
    api: Arc<API>,
    config: RtcConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: RtcConfig) -> Result<Self, WebRtcError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api: Arc::new(api),
            config,
        })
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(&self, events: EngineEvents) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        let peer = self
            .api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(setup_error)?;
        let peer = Arc::new(peer);

        for (wanted, kind) in [
            (self.config.receive_audio, RTPCodecType::Audio),
            (self.config.receive_video, RTPCodecType::Video),
        ] {
            if !wanted {
                continue;
            }
            peer.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(setup_error)?;
        }

        register_peer_handlers(&peer, &events);
        debug!(engine = events.engine_id(), "peer connection created");
        Ok(Box::new(WebRtcEngine {
            peer,
            events,
            channel_init: RTCDataChannelInit {
                ordered: Some(self.config.ordered),
                max_retransmits: self.config.max_retransmits,
                ..Default::default()
            },
        }))
    }
}

fn setup_error(err: webrtc::Error) -> EngineError {
    EngineError::Setup(err.to_string())
}

fn description_error(err: webrtc::Error) -> EngineError {
    EngineError::Description(err.to_string())
}

fn register_peer_handlers(peer: &Arc<RTCPeerConnection>, events: &EngineEvents) {
    let on_candidate = events.clone();
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = on_candidate.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(err) => {
                    warn!(error = %err, "local candidate not serializable");
                    return;
                }
            };
            match candidate_from_init(&init) {
                Ok(candidate) => {
                    events.emit(EngineEvent::LocalCandidate(candidate));
                }
                Err(err) => warn!(error = %err, candidate = %init.candidate, "local candidate skipped"),
            }
        })
    }));

    let on_state = events.clone();
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = on_state.clone();
        Box::pin(async move {
            let connectivity = match state {
                RTCPeerConnectionState::New => Connectivity::New,
                RTCPeerConnectionState::Connecting => Connectivity::Connecting,
                RTCPeerConnectionState::Connected => Connectivity::Connected,
                RTCPeerConnectionState::Disconnected => Connectivity::Disconnected,
                RTCPeerConnectionState::Failed => Connectivity::Failed,
                RTCPeerConnectionState::Closed => Connectivity::Closed,
                RTCPeerConnectionState::Unspecified => return,
            };
            events.emit(EngineEvent::Connectivity(connectivity));
        })
    }));

    let on_channel = events.clone();
    peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let events = on_channel.clone();
        Box::pin(async move {
            info!(label = channel.label(), "remote data channel announced");
            wire_channel(&channel, &events);
        })
    }));

    peer.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            Box::pin(async move {
                info!(
                    kind = ?track.kind(),
                    id = %track.id(),
                    stream = %track.stream_id(),
                    "remote track"
                );
            })
        },
    ));
}

/// Forwards a channel's lifecycle and inbound text to the session.
fn wire_channel(channel: &Arc<RTCDataChannel>, events: &EngineEvents) {
    let opened = channel.clone();
    let on_open = events.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            on_open.emit(EngineEvent::ChannelOpen(Arc::new(WebRtcDataChannel::new(opened))));
        })
    }));

    let on_message = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = on_message.clone();
        Box::pin(async move {
            let text = String::from_utf8_lossy(&message.data).into_owned();
            events.emit(EngineEvent::ChannelMessage(text));
        })
    }));

    let on_close = events.clone();
    channel.on_close(Box::new(move || {
        let events = on_close.clone();
        Box::pin(async move {
            events.emit(EngineEvent::ChannelClosed);
        })
    }));
}

struct WebRtcEngine {
    peer: Arc<RTCPeerConnection>,
    events: EngineEvents,
    channel_init: RTCDataChannelInit,
}

impl WebRtcEngine {
    async fn local_description(&self, kind: SdpKind) -> Result<SessionDescription, EngineError> {
        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| EngineError::Description("no local description".into()))?;
        Ok(SessionDescription {
            kind,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(description_error)?;
        self.peer
            .set_local_description(offer)
            .await
            .map_err(description_error)?;
        self.local_description(SdpKind::Offer).await
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .peer
            .create_answer(None)
            .await
            .map_err(description_error)?;
        self.peer
            .set_local_description(answer)
            .await
            .map_err(description_error)?;
        self.local_description(SdpKind::Answer).await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(description_error)?;
        self.peer
            .set_remote_description(remote)
            .await
            .map_err(description_error)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        self.peer
            .add_ice_candidate(candidate_to_init(candidate))
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let channel = self
            .peer
            .create_data_channel(label, Some(self.channel_init.clone()))
            .await
            .map_err(|err| EngineError::Channel(err.to_string()))?;
        wire_channel(&channel, &self.events);
        Ok(Arc::new(WebRtcDataChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.peer
            .close()
            .await
            .map_err(|err| EngineError::Setup(err.to_string()))
    }
}

pub struct WebRtcDataChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    pub fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self {
            label: inner.label().to_string(),
            inner,
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), EngineError> {
        self.inner
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| EngineError::Channel(err.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.inner
            .close()
            .await
            .map_err(|err| EngineError::Channel(err.to_string()))
    }
}
