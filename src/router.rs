use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use webrtc::{
    rtcp::sender_report::SenderReport,
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, RTCPFeedback},
    rtp_transceiver::rtp_codec::RTPCodecType,
};

use crate::{
    audio_observer::AudioObserver,
    buffer::{Buffer, BufferOptions, RtcpPackets},
    config::RouterConfig,
    down_track::DownTrack,
    error::{Error, SubscriberErrorKind},
    helpers,
    receiver::{Receiver, UpTrack},
    subscriber::Subscriber,
};

pub type RtcpWriterFn = Box<
    dyn Fn(RtcpPackets) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync,
>;

const RTCP_CHANNEL_SIZE: usize = 10;

/// Routes one publisher's inbound tracks: owns the receiver registry, creates
/// down tracks on demand for subscribers, and pumps aggregated RTCP feedback
/// back to the publisher's transport.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Router {
    id: String,
    config: RouterConfig,
    audio_observer: Arc<AudioObserver>,
    receivers: Mutex<HashMap<String, Arc<Receiver>>>,
    rtcp_sender: mpsc::Sender<RtcpPackets>,
    rtcp_receiver: std::sync::Mutex<Option<mpsc::Receiver<RtcpPackets>>>,
    stop_sender: mpsc::UnboundedSender<()>,
    stop_receiver: std::sync::Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl Router {
    pub fn new(id: String, config: RouterConfig, audio_observer: Arc<AudioObserver>) -> Arc<Self> {
        let (rtcp_sender, rtcp_receiver) = mpsc::channel(RTCP_CHANNEL_SIZE);
        let (stop_sender, stop_receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            config,
            audio_observer,
            receivers: Mutex::new(HashMap::new()),
            rtcp_sender,
            rtcp_receiver: std::sync::Mutex::new(Some(rtcp_receiver)),
            stop_sender,
            stop_receiver: std::sync::Mutex::new(Some(stop_receiver)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registers the inbound track, creating its receiver on first sight.
    /// The boolean reports whether this call published a new track, which the
    /// session uses to fan the receiver out to the other peers.
    pub async fn add_receiver(self: &Arc<Self>, track: UpTrack) -> (Arc<Receiver>, bool) {
        let mut receivers = self.receivers.lock().await;
        if let Some(receiver) = receivers.get(&track.id) {
            return (receiver.clone(), false);
        }

        let buffer = Arc::new(Buffer::new(track.ssrc, self.config.max_packet_track));

        let rtcp_sender = self.rtcp_sender.clone();
        buffer.on_feedback(Box::new(move |packets| {
            if let Err(err) = rtcp_sender.try_send(packets) {
                tracing::warn!("rtcp channel is full, dropping feedback: {}", err);
            }
        }));

        let is_audio = track.kind == RTPCodecType::Audio;
        if is_audio {
            let observer = self.audio_observer.clone();
            let stream_id = track.stream_id.clone();
            buffer.on_audio_level(Box::new(move |level| {
                observer.observe(&stream_id, level);
            }));
            self.audio_observer.add_stream(&track.stream_id);
        }

        buffer.bind(
            track.header_extensions.clone(),
            track.codec.capability.clone(),
            BufferOptions {
                max_bitrate: self.config.max_bandwidth,
            },
        );

        let receiver = Receiver::new(track.clone(), self.id.clone());
        receiver.set_rtcp_channel(self.rtcp_sender.clone());

        let router = Arc::downgrade(self);
        let track_id = track.id.clone();
        let stream_id = track.stream_id.clone();
        receiver.on_close_handler(Box::new(move || {
            let Some(router) = router.upgrade() else {
                return;
            };
            if is_audio {
                router.audio_observer.remove_stream(&stream_id);
            }
            let track_id = track_id.clone();
            tokio::spawn(async move {
                router.delete_receiver(&track_id).await;
            });
        }));

        receiver.add_up_track(buffer);
        receivers.insert(track.id.clone(), receiver.clone());
        tracing::debug!("Router {} published track {}", self.id, track.id);

        (receiver, true)
    }

    /// Creates (or returns the existing) down track delivering `receiver` to
    /// `subscriber`: intersects codec capabilities, attaches the track to the
    /// subscriber's transport and registers it on both sides.
    pub async fn add_down_track(
        &self,
        subscriber: &Arc<Subscriber>,
        receiver: &Arc<Receiver>,
    ) -> Result<Arc<DownTrack>, Error> {
        for dt in subscriber.get_down_tracks(receiver.stream_id()) {
            if dt.id() == receiver.track_id() {
                return Ok(dt);
            }
        }

        let codec = helpers::codec_parameters_fuzzy_search(
            receiver.codec(),
            &subscriber.codecs(receiver.kind()),
        )
        .ok_or_else(|| {
            Error::new_subscriber(
                format!(
                    "no negotiable codec for {}",
                    receiver.codec().capability.mime_type
                ),
                SubscriberErrorKind::CodecNotNegotiatedError,
            )
        })?;

        let capability = RTCRtpCodecCapability {
            mime_type: codec.capability.mime_type.clone(),
            clock_rate: codec.capability.clock_rate,
            channels: codec.capability.channels,
            sdp_fmtp_line: codec.capability.sdp_fmtp_line.clone(),
            rtcp_feedback: vec![
                RTCPFeedback {
                    typ: "goog-remb".to_owned(),
                    parameter: "".to_owned(),
                },
                RTCPFeedback {
                    typ: "nack".to_owned(),
                    parameter: "".to_owned(),
                },
                RTCPFeedback {
                    typ: "nack".to_owned(),
                    parameter: "pli".to_owned(),
                },
            ],
        };

        let down_track = DownTrack::new(
            receiver.track_id().to_owned(),
            receiver.stream_id().to_owned(),
            capability,
            receiver,
            subscriber.id.clone(),
            codec.payload_type,
            self.config.max_packet_track,
        );

        subscriber.attach(down_track.clone()).await?;

        let sub = subscriber.clone();
        let weak_dt = Arc::downgrade(&down_track);
        let stream_id = receiver.stream_id().to_owned();
        down_track.on_close_handler(Box::new(move || {
            if sub.is_transport_closed() {
                return;
            }
            let Some(dt) = weak_dt.upgrade() else {
                return;
            };
            tokio::spawn(enc!((sub, stream_id) async move {
                if let Err(err) = sub.detach(dt.clone()).await {
                    tracing::error!("Error closing down track: {}", err);
                    return;
                }
                sub.remove_down_track(&stream_id, &dt);
                sub.negotiate();
            }));
        }));

        subscriber.add_down_track(receiver.stream_id(), down_track.clone());
        receiver.add_down_track(down_track.clone());

        Ok(down_track)
    }

    /// Subscribes `subscriber` to one receiver (fresh publish) or, given
    /// `None`, to every known receiver (a newly joined peer), renegotiating
    /// once at the end. A no-op for subscribers that opted out of automatic
    /// subscription.
    pub async fn add_down_tracks(
        &self,
        subscriber: &Arc<Subscriber>,
        receiver: Option<Arc<Receiver>>,
    ) -> Result<(), Error> {
        if subscriber.no_auto_subscribe() {
            tracing::info!("peer turns off automatic subscription, skip tracks add");
            return Ok(());
        }

        if let Some(receiver) = receiver {
            self.add_down_track(subscriber, &receiver).await?;
            subscriber.negotiate();
            return Ok(());
        }

        let receivers: Vec<Arc<Receiver>> =
            self.receivers.lock().await.values().cloned().collect();
        if receivers.is_empty() {
            return Ok(());
        }
        for receiver in &receivers {
            self.add_down_track(subscriber, receiver).await?;
        }
        subscriber.negotiate();
        Ok(())
    }

    /// Starts the RTCP pump: feedback queued by receivers and buffers is
    /// drained and handed to the writer. Write failures are logged and the
    /// pump keeps running.
    pub fn set_rtcp_writer(&self, write_rtcp: RtcpWriterFn) {
        let rtcp_receiver = { self.rtcp_receiver.lock().unwrap().take() };
        let stop_receiver = { self.stop_receiver.lock().unwrap().take() };
        let (Some(mut rtcp_receiver), Some(mut stop_receiver)) = (rtcp_receiver, stop_receiver)
        else {
            tracing::warn!("Router {} rtcp writer is already running", self.id);
            return;
        };

        let id = self.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    packets = rtcp_receiver.recv() => {
                        match packets {
                            Some(packets) => {
                                if let Err(err) = (write_rtcp)(packets).await {
                                    tracing::error!("Write rtcp to peer {} err: {}", id, err);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = stop_receiver.recv() => break,
                }
            }
            tracing::debug!("Router {} rtcp writer loop finished", id);
        });
    }

    /// Stops the RTCP pump.
    pub fn stop(&self) {
        let _ = self.stop_sender.send(());
    }

    pub async fn receivers(&self) -> Vec<Arc<Receiver>> {
        self.receivers.lock().await.values().cloned().collect()
    }

    pub async fn get_receiver(&self, track_id: &str) -> Option<Arc<Receiver>> {
        self.receivers.lock().await.get(track_id).cloned()
    }

    /// Applies publisher-side RTCP to the matching receiver's buffer.
    pub async fn handle_publisher_rtcp(&self, packets: &RtcpPackets) {
        for packet in packets {
            if let Some(sr) = packet.as_any().downcast_ref::<SenderReport>() {
                let receivers = self.receivers.lock().await;
                if let Some(receiver) = receivers.values().find(|r| r.ssrc() == sr.ssrc) {
                    receiver.set_sender_report(sr.rtp_time, sr.ntp_time);
                }
            }
        }
    }

    async fn delete_receiver(&self, track_id: &str) {
        self.receivers.lock().await.remove(track_id);
        tracing::debug!("Router {} removed track {}", self.id, track_id);
    }
}
