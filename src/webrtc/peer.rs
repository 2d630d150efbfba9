//! WebRTC transport engine backed by webrtc-rs

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::engine::{ConnectionState, EngineEvent, EngineFactory, EventSink, TransportEngine};
use super::mdns::{default_mdns_host_name, mdns_mode, mdns_mode_label};
use super::track::VideoTrack;
use crate::error::{AppError, Result};
use crate::video::{CaptureConfig, CaptureSource};

/// Capture source waiting for the connection to come up
///
/// Once closed the slot never hands its source to the track again.
struct SourceSlot {
    source: Option<Box<dyn CaptureSource>>,
    closed: bool,
}

type PendingSource = Arc<Mutex<SourceSlot>>;

fn park_source(source: Box<dyn CaptureSource>) -> PendingSource {
    Arc::new(Mutex::new(SourceSlot {
        source: Some(source),
        closed: false,
    }))
}

/// Hand the parked source to the track unless teardown got there first
///
/// The sender is started under the slot lock so a concurrent close either
/// sees it running or finds the source still parked.
fn start_pending(pending: &PendingSource, track: &VideoTrack, sink: &EventSink) -> bool {
    let mut slot = pending.lock();
    if slot.closed {
        return false;
    }
    match slot.source.take() {
        Some(source) => {
            track.start_sending(source, Some(sink.clone()));
            true
        }
        None => false,
    }
}

/// Close the slot and take back a source that never started sending
fn close_pending(pending: &PendingSource) -> Option<Box<dyn CaptureSource>> {
    let mut slot = pending.lock();
    slot.closed = true;
    slot.source.take()
}

/// One live peer connection and its outgoing track
struct Connection {
    pc: Arc<RTCPeerConnection>,
    track: Arc<VideoTrack>,
    pending_source: PendingSource,
    sink: EventSink,
}

/// Send-only WebRTC engine
///
/// One engine serves one session. Frames start flowing once the peer
/// connection reports `connected`.
pub struct WebRtcEngine {
    engine_id: String,
    config: WebRtcConfig,
    api: Mutex<Option<Arc<API>>>,
    connection: AsyncMutex<Option<Connection>>,
}

impl WebRtcEngine {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            engine_id: uuid::Uuid::new_v4().to_string(),
            config,
            api: Mutex::new(None),
            connection: AsyncMutex::new(None),
        }
    }

    fn build_api(&self) -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::EngineFailure(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::EngineFailure(format!("Failed to register interceptors: {}", e))
        })?;

        let mut setting_engine = SettingEngine::default();
        let mode = mdns_mode();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(default_mdns_host_name(&self.engine_id));
        }
        if self.config.ipv4_only {
            setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
        }
        info!(
            "WebRTC engine {} mDNS mode: {} (ipv4_only: {})",
            self.engine_id,
            mdns_mode_label(mode),
            self.config.ipv4_only
        );

        Ok(APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }

    async fn connection_parts(&self) -> Result<(Arc<RTCPeerConnection>, EventSink)> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(conn) => Ok((conn.pc.clone(), conn.sink.clone())),
            None => Err(AppError::EngineFailure("no peer connection".to_string())),
        }
    }

    fn register_state_handler(
        pc: &RTCPeerConnection,
        track: Arc<VideoTrack>,
        pending_source: PendingSource,
        sink: EventSink,
    ) {
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let track = track.clone();
            let pending_source = pending_source.clone();
            let sink = sink.clone();

            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };

                info!("Session {} peer connection state: {}", sink.session_id(), state);

                if state == ConnectionState::Connected
                    && !start_pending(&pending_source, &track, &sink)
                {
                    debug!("Session {} connected without a parked source", sink.session_id());
                }

                sink.send(EngineEvent::ConnectionStateChanged(state)).await;
            })
        }));
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn initialize(&self) -> Result<()> {
        if self.api.lock().is_some() {
            return Ok(());
        }
        let api = Arc::new(self.build_api()?);
        *self.api.lock() = Some(api);
        debug!("WebRTC engine {} initialized", self.engine_id);
        Ok(())
    }

    async fn create_connection(
        &self,
        config: CaptureConfig,
        mut source: Box<dyn CaptureSource>,
        sink: EventSink,
    ) -> Result<()> {
        let api = self.api.lock().clone();
        let Some(api) = api else {
            source.release().await;
            return Err(AppError::EngineFailure("engine not initialized".to_string()));
        };

        if let Err(e) = source.configure(config).await {
            source.release().await;
            return Err(AppError::EngineFailure(format!(
                "Failed to configure capture source {}: {}",
                source.name(),
                e
            )));
        }

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };
        let pc = match api.new_peer_connection(rtc_config).await {
            Ok(pc) => Arc::new(pc),
            Err(e) => {
                source.release().await;
                return Err(AppError::EngineFailure(format!(
                    "Failed to create peer connection: {}",
                    e
                )));
            }
        };

        let track = Arc::new(VideoTrack::new(
            source.codec(),
            &self.config.track_id,
            &self.config.stream_id,
        ));
        let rtp_track: Arc<dyn TrackLocal + Send + Sync> = track.sample_track();
        let rtp_sender = match pc.add_track(rtp_track).await {
            Ok(sender) => sender,
            Err(e) => {
                source.release().await;
                let _ = pc.close().await;
                return Err(AppError::EngineFailure(format!(
                    "Failed to add video track: {}",
                    e
                )));
            }
        };

        // Drain RTCP so interceptors (NACK, reports) keep running
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        info!(
            "Session {} connection created ({}, {} source {})",
            sink.session_id(),
            config,
            source.codec(),
            source.name()
        );

        let pending_source = park_source(source);
        Self::register_state_handler(&pc, track.clone(), pending_source.clone(), sink.clone());

        let previous = self.connection.lock().await.replace(Connection {
            pc,
            track,
            pending_source,
            sink,
        });
        if let Some(previous) = previous {
            warn!("Replacing existing connection on engine {}", self.engine_id);
            close_connection(previous).await;
        }

        Ok(())
    }

    async fn create_offer(&self) -> Result<()> {
        let (pc, sink) = self.connection_parts().await?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::EngineFailure(format!("Failed to create offer: {}", e)))?;

        let mut gather_complete = pc.gathering_complete_promise().await;

        pc.set_local_description(offer)
            .await
            .map_err(|e| AppError::EngineFailure(format!("Failed to set local description: {}", e)))?;

        let timeout = self.config.gathering_timeout();
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, gather_complete.recv()).await.is_err() {
                warn!(
                    "Session {} candidate gathering timed out after {:?}, publishing partial offer",
                    sink.session_id(),
                    timeout
                );
            }

            match pc.local_description().await {
                Some(desc) => {
                    debug!("Session {} gathering complete", sink.session_id());
                    sink.send(EngineEvent::GatheringComplete(desc.sdp)).await;
                }
                None => {
                    sink.send(EngineEvent::Failure(
                        "local description missing after gathering".to_string(),
                    ))
                    .await;
                }
            }
        });

        Ok(())
    }

    async fn current_local_description(&self) -> Option<String> {
        let pc = self.connection.lock().await.as_ref()?.pc.clone();
        pc.local_description().await.map(|desc| desc.sdp)
    }

    async fn apply_remote_answer(&self, sdp: String) -> Result<()> {
        let (pc, _) = self.connection_parts().await?;

        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| AppError::EngineFailure(format!("Invalid SDP answer: {}", e)))?;

        pc.set_remote_description(answer).await.map_err(|e| {
            AppError::EngineFailure(format!("Failed to set remote description: {}", e))
        })?;

        Ok(())
    }

    async fn teardown(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            close_connection(connection).await;
            info!("WebRTC engine {} torn down", self.engine_id);
        }
    }
}

async fn close_connection(connection: Connection) {
    let pending = close_pending(&connection.pending_source);
    connection.track.stop().await;
    if let Some(mut source) = pending {
        source.release().await;
    }
    debug!(
        "Session {} sent {} frames",
        connection.sink.session_id(),
        connection.track.frames_sent()
    );

    if let Err(e) = connection.pc.close().await {
        warn!(
            "Failed to close peer connection for session {}: {}",
            connection.sink.session_id(),
            e
        );
    }
}

/// Builds a [`WebRtcEngine`] per session from a shared config
#[derive(Debug, Clone, Default)]
pub struct WebRtcEngineFactory {
    config: WebRtcConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for WebRtcEngineFactory {
    fn create_engine(&self) -> Arc<dyn TransportEngine> {
        Arc::new(WebRtcEngine::new(self.config.clone()))
    }
}
