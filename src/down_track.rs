use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, Weak,
    },
};

use async_trait::async_trait;
use derivative::Derivative;
use webrtc::{
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate,
    rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack,
    rtp::packet::Packet,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
};

use crate::{
    buffer::RtcpPackets,
    error::Error,
    receiver::Receiver,
    sequencer::Sequencer,
};

/// Write seam between a down track and the subscriber's transport. The
/// production implementation wraps the negotiated local track; tests provide
/// in-memory sinks.
#[async_trait]
pub trait RtpWriter: fmt::Debug + Send + Sync {
    async fn write_rtp(&self, packet: &Packet) -> Result<usize, Error>;
}

pub type OnCloseFn = Box<dyn Fn() + Send + Sync>;
pub type OnBindFn = Box<dyn Fn() + Send + Sync>;
pub type OnLayerSwitchFn = Box<dyn Fn(u8) + Send + Sync>;

/// Forwarding engine for one outbound, per-subscriber copy of a track.
///
/// Rewrites sequence numbers, timestamps, SSRC and payload type on every
/// forwarded packet and records the mapping in its [`Sequencer`] so NACKed
/// packets can be correlated back to the source stream.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DownTrack {
    id: String,
    stream_id: String,
    subscriber_id: String,
    ssrc: u32,
    payload_type: AtomicU8,
    codec: RTCRtpCodecCapability,
    bound: AtomicBool,
    closed: AtomicBool,
    current_layer: AtomicU8,
    pending_layer: Mutex<Option<u8>>,
    rewrite: Mutex<RewriteState>,
    sequencer: Mutex<Sequencer>,
    #[derivative(Debug = "ignore")]
    write_stream: Mutex<Option<Arc<dyn RtpWriter>>>,
    receiver: Mutex<Weak<Receiver>>,
    #[derivative(Debug = "ignore")]
    on_close_fn: Mutex<Option<OnCloseFn>>,
    #[derivative(Debug = "ignore")]
    on_bind_fn: Mutex<Option<OnBindFn>>,
    #[derivative(Debug = "ignore")]
    on_layer_switch_fn: Mutex<Option<OnLayerSwitchFn>>,
}

#[derive(Debug, Default)]
struct RewriteState {
    inited: bool,
    last_ssrc: u32,
    sn_offset: u16,
    ts_offset: u32,
    last_sn: u16,
    last_ts: u32,
}

impl DownTrack {
    pub(crate) fn new(
        id: String,
        stream_id: String,
        codec: RTCRtpCodecCapability,
        receiver: &Arc<Receiver>,
        subscriber_id: String,
        payload_type: u8,
        max_track: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            stream_id,
            subscriber_id,
            ssrc: rand::random::<u32>(),
            payload_type: AtomicU8::new(payload_type),
            codec,
            bound: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            current_layer: AtomicU8::new(0),
            pending_layer: Mutex::new(None),
            rewrite: Mutex::new(RewriteState::default()),
            sequencer: Mutex::new(Sequencer::new(max_track)),
            write_stream: Mutex::new(None),
            receiver: Mutex::new(Arc::downgrade(receiver)),
            on_close_fn: Mutex::new(None),
            on_bind_fn: Mutex::new(None),
            on_layer_switch_fn: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type.load(Ordering::Relaxed)
    }

    pub fn codec(&self) -> RTCRtpCodecCapability {
        self.codec.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn current_layer(&self) -> u8 {
        self.current_layer.load(Ordering::Relaxed)
    }

    pub fn pending_layer(&self) -> Option<u8> {
        *self.pending_layer.lock().unwrap()
    }

    /// Attaches the transport write stream. The down track starts forwarding
    /// once bound and stops again when closed.
    pub fn bind(&self, write_stream: Arc<dyn RtpWriter>, payload_type: u8) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut stream = self.write_stream.lock().unwrap();
            *stream = Some(write_stream);
        }
        self.payload_type.store(payload_type, Ordering::Relaxed);
        self.bound.store(true, Ordering::Release);

        let callback = self.on_bind_fn.lock().unwrap();
        if let Some(f) = callback.as_ref() {
            (f)();
        }
    }

    pub fn on_close_handler(&self, f: OnCloseFn) {
        let mut callback = self.on_close_fn.lock().unwrap();
        *callback = Some(f);
    }

    pub fn on_bind(&self, f: OnBindFn) {
        let mut callback = self.on_bind_fn.lock().unwrap();
        *callback = Some(f);
    }

    pub fn on_layer_switched(&self, f: OnLayerSwitchFn) {
        let mut callback = self.on_layer_switch_fn.lock().unwrap();
        *callback = Some(f);
    }

    /// Forwards one packet, rewriting transport-level metadata to this
    /// track's values. A no-op before bind and after close.
    pub async fn write_rtp(&self, packet: &Packet) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) || !self.bound.load(Ordering::Acquire) {
            return Ok(());
        }

        let (sn, ts) = {
            let mut st = self.rewrite.lock().unwrap();
            if !st.inited {
                st.inited = true;
                st.last_ssrc = packet.header.ssrc;
            } else if st.last_ssrc != packet.header.ssrc {
                // Layer switch: keep the outbound sequence space contiguous.
                st.sn_offset = packet
                    .header
                    .sequence_number
                    .wrapping_sub(st.last_sn)
                    .wrapping_sub(1);
                st.ts_offset = packet
                    .header
                    .timestamp
                    .wrapping_sub(st.last_ts)
                    .wrapping_sub(1);
                st.last_ssrc = packet.header.ssrc;
            }
            let sn = packet.header.sequence_number.wrapping_sub(st.sn_offset);
            let ts = packet.header.timestamp.wrapping_sub(st.ts_offset);
            st.last_sn = sn;
            st.last_ts = ts;
            (sn, ts)
        };

        self.sequencer
            .lock()
            .unwrap()
            .push(packet.header.sequence_number, sn, ts);

        let mut outbound = packet.clone();
        outbound.header.sequence_number = sn;
        outbound.header.timestamp = ts;
        outbound.header.ssrc = self.ssrc;
        outbound.header.payload_type = self.payload_type.load(Ordering::Relaxed);

        let stream = { self.write_stream.lock().unwrap().clone() };
        match stream {
            Some(stream) => stream.write_rtp(&outbound).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Writes an already rewritten retransmission packet on the track's stream.
    pub(crate) async fn write_retransmit(&self, packet: &Packet) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = { self.write_stream.lock().unwrap().clone() };
        match stream {
            Some(stream) => stream.write_rtp(packet).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Handles RTCP arriving from this track's subscriber: NACKs are resolved
    /// through the sequencer and queued for retransmission, picture loss and
    /// bitrate estimates are forwarded upstream.
    pub async fn handle_rtcp(self: &Arc<Self>, packets: RtcpPackets) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(receiver) = self.receiver.lock().unwrap().upgrade() else {
            return;
        };

        for packet in &packets {
            if let Some(pli) = packet
                .as_any()
                .downcast_ref::<PictureLossIndication>()
            {
                let mut pli = pli.clone();
                pli.sender_ssrc = self.ssrc;
                pli.media_ssrc = receiver.ssrc();
                receiver.send_rtcp(vec![Box::new(pli)]);
            } else if let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() {
                let mut lost = Vec::new();
                for pair in &nack.nacks {
                    lost.extend(pair.packet_list());
                }
                let metas = self.sequencer.lock().unwrap().get_seq_no_pairs(&lost);
                if metas.is_empty() {
                    continue;
                }
                if let Err(err) = receiver.retransmit_packets(self.clone(), metas) {
                    tracing::error!("failed to queue retransmission: {}", err);
                }
            } else if let Some(remb) = packet
                .as_any()
                .downcast_ref::<ReceiverEstimatedMaximumBitrate>()
            {
                receiver.send_rtcp(vec![Box::new(remb.clone())]);
            }
        }
    }

    /// Requests a move to another layer's receiver. The switch happens on the
    /// next keyframe observed on the target stream.
    pub fn request_layer_switch(self: &Arc<Self>, target: &Arc<Receiver>, layer: u8) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut pending = self.pending_layer.lock().unwrap();
            *pending = Some(layer);
        }
        let from = self.receiver.lock().unwrap().upgrade();
        target.enqueue_layer_switch(self.clone(), from, layer);
    }

    pub(crate) fn complete_layer_switch(&self, layer: u8, receiver: &Arc<Receiver>) {
        {
            let mut current = self.receiver.lock().unwrap();
            *current = Arc::downgrade(receiver);
        }
        self.current_layer.store(layer, Ordering::Relaxed);
        {
            let mut pending = self.pending_layer.lock().unwrap();
            *pending = None;
        }
        let callback = self.on_layer_switch_fn.lock().unwrap();
        if let Some(f) = callback.as_ref() {
            (f)(layer);
        }
    }

    /// Terminal. Detaches the write stream and fires the close handler
    /// exactly once; later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bound.store(false, Ordering::Release);
        {
            let mut stream = self.write_stream.lock().unwrap();
            *stream = None;
        }
        let callback = { self.on_close_fn.lock().unwrap().take() };
        if let Some(f) = callback {
            (f)();
        }
        tracing::debug!("DownTrack {} for {} is closed", self.id, self.subscriber_id);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use webrtc::rtp::header::Header;

    use super::*;
    use crate::error::DownTrackErrorKind;
    use crate::receiver::UpTrack;
    use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

    #[derive(Debug, Default)]
    struct MockWriter {
        packets: Mutex<Vec<Packet>>,
        fail_closed: AtomicBool,
    }

    #[async_trait]
    impl RtpWriter for MockWriter {
        async fn write_rtp(&self, packet: &Packet) -> Result<usize, Error> {
            if self.fail_closed.load(Ordering::Relaxed) {
                return Err(Error::new_down_track(
                    "write on closed transport".to_owned(),
                    DownTrackErrorKind::ClosedPipeError,
                ));
            }
            self.packets.lock().unwrap().push(packet.clone());
            Ok(packet.payload.len())
        }
    }

    fn video_receiver() -> Arc<Receiver> {
        Receiver::new(
            UpTrack {
                id: "track0".to_owned(),
                stream_id: "stream0".to_owned(),
                ssrc: 5555,
                codec: RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: "video/VP8".to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: "".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 96,
                    ..Default::default()
                },
                kind: RTPCodecType::Video,
                header_extensions: vec![],
            },
            "peer0".to_owned(),
        )
    }

    fn down_track(receiver: &Arc<Receiver>) -> Arc<DownTrack> {
        DownTrack::new(
            "track0".to_owned(),
            "stream0".to_owned(),
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: vec![],
            },
            receiver,
            "sub0".to_owned(),
            96,
            100,
        )
    }

    fn packet(sn: u16, ts: u32, ssrc: u32) -> Packet {
        Packet {
            header: Header {
                sequence_number: sn,
                timestamp: ts,
                ssrc,
                payload_type: 111,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x10, 0x00]),
        }
    }

    #[tokio::test]
    async fn write_rtp_rewrites_header_fields() {
        let receiver = video_receiver();
        let dt = down_track(&receiver);
        let writer = Arc::new(MockWriter::default());
        dt.bind(writer.clone(), 96);

        dt.write_rtp(&packet(100, 1000, 5555)).await.unwrap();

        let sent = writer.packets.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.sequence_number, 100);
        assert_eq!(sent[0].header.timestamp, 1000);
        assert_eq!(sent[0].header.ssrc, dt.ssrc());
        assert_eq!(sent[0].header.payload_type, 96);
    }

    #[tokio::test]
    async fn ssrc_change_keeps_sequence_contiguous() {
        let receiver = video_receiver();
        let dt = down_track(&receiver);
        let writer = Arc::new(MockWriter::default());
        dt.bind(writer.clone(), 96);

        dt.write_rtp(&packet(100, 1000, 5555)).await.unwrap();
        dt.write_rtp(&packet(101, 2000, 5555)).await.unwrap();
        // New source stream with an unrelated sequence space.
        dt.write_rtp(&packet(9000, 700_000, 6666)).await.unwrap();

        let sent = writer.packets.lock().unwrap();
        assert_eq!(sent[1].header.sequence_number, 101);
        assert_eq!(sent[2].header.sequence_number, 102);
        assert_eq!(sent[2].header.timestamp, 2001);
    }

    #[tokio::test]
    async fn sequencer_records_target_to_source_mapping() {
        let receiver = video_receiver();
        let dt = down_track(&receiver);
        let writer = Arc::new(MockWriter::default());
        dt.bind(writer.clone(), 96);

        dt.write_rtp(&packet(100, 1000, 5555)).await.unwrap();
        dt.write_rtp(&packet(9000, 700_000, 6666)).await.unwrap();

        let metas = dt.sequencer.lock().unwrap().get_seq_no_pairs(&[101]);
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].source_seq_no, 9000);
        assert_eq!(metas[0].target_seq_no, 101);
    }

    #[tokio::test]
    async fn write_rtp_is_a_no_op_when_unbound_or_closed() {
        let receiver = video_receiver();
        let dt = down_track(&receiver);

        // Unbound: dropped silently.
        dt.write_rtp(&packet(1, 1, 5555)).await.unwrap();

        let writer = Arc::new(MockWriter::default());
        dt.bind(writer.clone(), 96);
        dt.close();
        dt.write_rtp(&packet(2, 2, 5555)).await.unwrap();

        assert!(writer.packets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_fires_handler_exactly_once() {
        let receiver = video_receiver();
        let dt = down_track(&receiver);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dt.on_close_handler(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        dt.close();
        dt.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dt.is_closed());
    }
}
