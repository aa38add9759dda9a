//! webrtc-rs implementation of [`PeerBackend`].

use super::{BackendConnectionState, BackendEvent, PeerBackend, PeerBackendFactory, TrackId};
use crate::audio::{PCMU_SAMPLE_RATE, create_resampler, downmix_to_mono, encode_mulaw};
use crate::capture::CaptureStream;
use crate::{RealtimeError, Result};
use async_trait::async_trait;
use newme_realtime_types::{IceCandidate, SdpKind, SessionDescription};
use rubato::{FastFixedIn, Resampler};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Resampler input block, in samples.
const RESAMPLER_CHUNK: usize = 480;

fn rtc_error(context: &str) -> impl Fn(webrtc::Error) -> RealtimeError + '_ {
    move |e| RealtimeError::Negotiation(format!("{}: {}", context, e))
}

/// Builds webrtc-rs peer connections sharing one API instance.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(rtc_error("register codecs"))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(rtc_error("register interceptors"))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerBackendFactory for WebRtcFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Arc<dyn PeerBackend>> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(rtc_error("create peer connection"))?,
        );

        let tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(BackendEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialise local candidate"),
                }
            })
        }));

        let tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let next = match state {
                    RTCPeerConnectionState::Connecting => BackendConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => BackendConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => BackendConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => BackendConnectionState::Failed,
                    RTCPeerConnectionState::Closed => BackendConnectionState::Closed,
                    _ => BackendConnectionState::New,
                };
                let _ = tx.send(BackendEvent::ConnectionState(next));
                Box::pin(async {})
            },
        ));

        let backend = Arc::new(WebRtcBackend {
            peer_connection,
            events,
            data_channel: Arc::new(parking_lot::Mutex::new(None)),
            tracks: tokio::sync::Mutex::new(HashMap::new()),
            next_track: parking_lot::Mutex::new(0),
        });

        // The answering side learns about the channel from the remote offer.
        let slot = backend.data_channel.clone();
        let tx = backend.events.clone();
        backend
            .peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    debug!(label = channel.label(), "Remote data channel announced");
                    wire_data_channel(&channel, tx);
                    *slot.lock() = Some(channel);
                })
            }));

        Ok(backend)
    }
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<BackendEvent>) {
    let tx = events.clone();
    channel.on_open(Box::new(move || {
        let _ = tx.send(BackendEvent::DataChannelOpen);
        Box::pin(async {})
    }));
    let tx = events.clone();
    channel.on_close(Box::new(move || {
        let _ = tx.send(BackendEvent::DataChannelClosed);
        Box::pin(async {})
    }));
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        match String::from_utf8(message.data.to_vec()) {
            Ok(text) => {
                let _ = events.send(BackendEvent::DataMessage(text));
            }
            Err(_) => warn!("Dropping binary data-channel message"),
        }
        Box::pin(async {})
    }));
}

struct OutboundTrack {
    sender: Arc<RTCRtpSender>,
    feeder: JoinHandle<()>,
}

pub struct WebRtcBackend {
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<BackendEvent>,
    data_channel: Arc<parking_lot::Mutex<Option<Arc<RTCDataChannel>>>>,
    tracks: tokio::sync::Mutex<HashMap<TrackId, OutboundTrack>>,
    next_track: parking_lot::Mutex<TrackId>,
}

impl WebRtcBackend {
    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpKind::Rollback => {
                return Err(RealtimeError::Negotiation(
                    "rollback is not supported".to_string(),
                ));
            }
        };
        parsed.map_err(rtc_error("parse session description"))
    }

    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.data_channel.lock().clone()
    }
}

#[async_trait]
impl PeerBackend for WebRtcBackend {
    async fn create_data_channel(&self, label: &str) -> Result<()> {
        let channel = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .map_err(rtc_error("create data channel"))?;
        wire_data_channel(&channel, self.events.clone());
        *self.data_channel.lock() = Some(channel);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(rtc_error("create offer"))?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error("set local description"))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(rtc_error("create answer"))?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error("set local description"))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = Self::to_rtc(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(rtc_error("set remote description"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(rtc_error("add candidate"))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let channel = self
            .channel()
            .ok_or_else(|| RealtimeError::Transport("no data channel".to_string()))?;
        channel
            .send_text(text)
            .await
            .map(drop)
            .map_err(|e| RealtimeError::Transport(e.to_string()))
    }

    fn data_channel_open(&self) -> bool {
        self.channel()
            .is_some_and(|c| c.ready_state() == RTCDataChannelState::Open)
    }

    async fn add_audio_track(&self, capture: CaptureStream) -> Result<TrackId> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_SAMPLE_RATE as u32,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "newme-voice".to_owned(),
        ));
        let sender = self
            .peer_connection
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error("add track"))?;

        let id = {
            let mut next = self.next_track.lock();
            *next += 1;
            *next
        };
        let feeder = tokio::spawn(feed_track(capture, track));
        self.tracks
            .lock()
            .await
            .insert(id, OutboundTrack { sender, feeder });
        info!(track = id, "Outbound audio track added");
        Ok(id)
    }

    async fn remove_audio_track(&self, track: TrackId) -> Result<()> {
        let outbound = self
            .tracks
            .lock()
            .await
            .remove(&track)
            .ok_or_else(|| RealtimeError::Negotiation(format!("unknown track {}", track)))?;
        // Aborting drops the capture stream, which releases the device.
        outbound.feeder.abort();
        self.peer_connection
            .remove_track(&outbound.sender)
            .await
            .map_err(rtc_error("remove track"))
    }

    async fn close(&self) -> Result<()> {
        for (_, outbound) in self.tracks.lock().await.drain() {
            outbound.feeder.abort();
        }
        self.data_channel.lock().take();
        self.peer_connection
            .close()
            .await
            .map_err(rtc_error("close peer connection"))
    }
}

/// Resamples capture frames to 8 kHz mono and writes them as PCMU samples.
async fn feed_track(mut capture: CaptureStream, track: Arc<TrackLocalStaticSample>) {
    let mut resampler: Option<FastFixedIn<f32>> = None;
    let mut pending: Vec<f32> = Vec::new();
    let mut resampled: Vec<f32> = Vec::new();

    while let Some(frame) = capture.next_frame().await {
        if resampler.is_none() {
            match create_resampler(frame.sample_rate as f64, PCMU_SAMPLE_RATE, RESAMPLER_CHUNK) {
                Ok(created) => resampler = Some(created),
                Err(e) => {
                    warn!(error = %e, "Cannot resample capture for the audio track");
                    return;
                }
            }
        }
        let Some(resampler) = resampler.as_mut() else {
            return;
        };

        pending.extend(downmix_to_mono(&frame.samples, frame.channels));
        resampled.clear();
        while pending.len() >= resampler.input_frames_next() {
            let chunk: Vec<f32> = pending.drain(..resampler.input_frames_next()).collect();
            match resampler.process(&[chunk], None) {
                Ok(out) => resampled.extend_from_slice(&out[0]),
                Err(e) => warn!(error = %e, "Resampling failed"),
            }
        }
        if resampled.is_empty() {
            continue;
        }

        let duration = Duration::from_secs_f64(resampled.len() as f64 / PCMU_SAMPLE_RATE);
        let sample = Sample {
            data: encode_mulaw(&resampled),
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!(error = %e, "Audio track write failed");
        }
    }
    debug!("Capture ended, audio track feeder stopping");
}
