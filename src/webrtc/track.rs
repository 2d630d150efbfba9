//! Outgoing video track fed by a capture source

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::engine::{EngineEvent, EventSink};
use crate::video::{CaptureSource, VideoCodec, VideoFrame};

/// Create RTP codec capability for video
pub fn video_codec_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: 90000,
        ..Default::default()
    }
}

/// Video track for WebRTC streaming
pub struct VideoTrack {
    codec: VideoCodec,
    /// Sample track; RTP packetization is done by the track
    track: Arc<TrackLocalStaticSample>,
    /// Running flag
    running: Arc<watch::Sender<bool>>,
    /// Frame pump task
    sender: Mutex<Option<JoinHandle<()>>>,
    frames_sent: Arc<AtomicU64>,
}

impl VideoTrack {
    /// Create a new video track
    pub fn new(codec: VideoCodec, track_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            video_codec_capability(codec),
            track_id.to_string(),
            stream_id.to_string(),
        ));

        let (running_tx, _) = watch::channel(false);

        Self {
            codec,
            track,
            running: Arc::new(running_tx),
            sender: Mutex::new(None),
            frames_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Get the underlying sample track
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Number of frames written to the track
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Start pulling frames from `source` and writing them to the track
    ///
    /// The source is released when sending stops. A capture error is
    /// reported through `sink` as an engine failure.
    pub fn start_sending(&self, mut source: Box<dyn CaptureSource>, sink: Option<EventSink>) {
        let _ = self.running.send(true);
        let track = self.track.clone();
        let frames_sent = self.frames_sent.clone();
        let mut running_rx = self.running.subscribe();

        info!("Starting video track sender ({}, source {})", self.codec, source.name());

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = source.next_frame() => {
                        match result {
                            Ok(Some(frame)) if frame.is_empty() => {
                                debug!("Skipping empty frame {}", frame.sequence);
                            }
                            Ok(Some(frame)) => {
                                if let Err(e) = Self::send_frame(&track, &frame).await {
                                    debug!(
                                        "Failed to send frame {} ({} bytes): {}",
                                        frame.sequence,
                                        frame.len(),
                                        e
                                    );
                                } else {
                                    frames_sent.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            Ok(None) => {
                                info!("Capture source {} ended", source.name());
                                break;
                            }
                            Err(e) => {
                                warn!("Capture source {} failed: {}", source.name(), e);
                                if let Some(ref sink) = sink {
                                    sink.send(EngineEvent::Failure(format!("capture failed: {}", e)))
                                        .await;
                                }
                                break;
                            }
                        }
                    }
                    changed = running_rx.changed() => {
                        if changed.is_err() || !*running_rx.borrow() {
                            debug!("Video track stopped");
                            break;
                        }
                    }
                }
            }

            source.release().await;
            info!("Video track sender stopped");
        });

        *self.sender.lock() = Some(handle);
    }

    /// Stop sending and wait until the capture source is released
    pub async fn stop(&self) {
        let _ = self.running.send(false);
        let handle = self.sender.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Video track sender task failed: {}", e);
            }
        }
    }

    async fn send_frame(track: &TrackLocalStaticSample, frame: &VideoFrame) -> webrtc::error::Result<()> {
        let sample = Sample {
            data: frame.data_bytes(),
            duration: frame.duration,
            ..Default::default()
        };
        track.write_sample(&sample).await
    }
}
