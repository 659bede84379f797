use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use arc_swap::ArcSwap;
use derivative::Derivative;
use tokio::{
    sync::mpsc,
    time::{Duration, Instant},
};
use webrtc::{
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    rtp_transceiver::rtp_codec::{
        RTCRtpCodecParameters, RTCRtpHeaderExtensionParameters, RTPCodecType,
    },
};

use crate::{
    buffer::{Buffer, RtcpPackets, SenderReportData},
    down_track::DownTrack,
    error::{Error, ReceiverErrorKind},
    helpers,
    sequencer::PacketMeta,
};

/// Metadata of the inbound track a receiver forwards.
#[derive(Clone, Debug)]
pub struct UpTrack {
    pub id: String,
    pub stream_id: String,
    pub ssrc: u32,
    pub codec: RTCRtpCodecParameters,
    pub kind: RTPCodecType,
    pub header_extensions: Vec<RTCRtpHeaderExtensionParameters>,
}

pub type OnCloseFn = Box<dyn Fn() + Send + Sync>;

struct RetransmitRequest {
    down_track: Arc<DownTrack>,
    packets: Vec<PacketMeta>,
}

struct PendingLayerSwitch {
    down_track: Arc<DownTrack>,
    from: Option<Arc<Receiver>>,
    layer: u8,
}

const PLI_INTERVAL: Duration = Duration::from_millis(500);

/// Forwarding engine for one inbound track.
///
/// Owns the track's [`Buffer`], reads the ordered packet stream from it and
/// fans every packet out to the current snapshot of down tracks. The snapshot
/// is replaced wholesale on add and remove, so the forwarding loop never
/// takes a lock per packet. A single-worker queue serializes retransmissions
/// so they cannot starve the forwarding loop.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Receiver {
    peer_id: String,
    track: UpTrack,
    buffer: Mutex<Option<Arc<Buffer>>>,
    down_tracks: ArcSwap<Vec<Arc<DownTrack>>>,
    #[derivative(Debug = "ignore")]
    pending_switches: Mutex<Vec<PendingLayerSwitch>>,
    closed: AtomicBool,
    last_pli: Mutex<Option<Instant>>,
    rtcp_sender: Mutex<Option<mpsc::Sender<RtcpPackets>>>,
    retransmit_sender: Mutex<Option<mpsc::UnboundedSender<RetransmitRequest>>>,
    #[derivative(Debug = "ignore")]
    on_close_fn: Mutex<Option<OnCloseFn>>,
}

impl Receiver {
    pub(crate) fn new(track: UpTrack, peer_id: String) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            track,
            buffer: Mutex::new(None),
            down_tracks: ArcSwap::from_pointee(Vec::new()),
            pending_switches: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            last_pli: Mutex::new(None),
            rtcp_sender: Mutex::new(None),
            retransmit_sender: Mutex::new(None),
            on_close_fn: Mutex::new(None),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn track_id(&self) -> &str {
        &self.track.id
    }

    pub fn stream_id(&self) -> &str {
        &self.track.stream_id
    }

    pub fn ssrc(&self) -> u32 {
        self.track.ssrc
    }

    pub fn codec(&self) -> &RTCRtpCodecParameters {
        &self.track.codec
    }

    pub fn kind(&self) -> RTPCodecType {
        self.track.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn on_close_handler(&self, f: OnCloseFn) {
        let mut callback = self.on_close_fn.lock().unwrap();
        *callback = Some(f);
    }

    pub(crate) fn set_rtcp_channel(&self, sender: mpsc::Sender<RtcpPackets>) {
        let mut rtcp_sender = self.rtcp_sender.lock().unwrap();
        *rtcp_sender = Some(sender);
    }

    pub(crate) fn buffer(&self) -> Option<Arc<Buffer>> {
        self.buffer.lock().unwrap().clone()
    }

    /// Binds the inbound track buffer once and starts the forwarding loop
    /// plus the retransmission worker. A no-op on a closed receiver.
    pub fn add_up_track(self: &Arc<Self>, buffer: Arc<Buffer>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut slot = self.buffer.lock().unwrap();
            if slot.is_some() {
                return;
            }
            *slot = Some(buffer.clone());
        }
        self.down_tracks.store(Arc::new(Vec::new()));

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut sender = self.retransmit_sender.lock().unwrap();
            *sender = Some(tx);
        }
        tokio::spawn(Self::retransmit_loop(buffer.clone(), rx));

        let receiver = self.clone();
        tokio::spawn(async move {
            receiver.write_rtp_loop(buffer).await;
        });
    }

    /// Registers a down track with the fan-out snapshot. Idempotent.
    pub fn add_down_track(&self, down_track: Arc<DownTrack>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.down_tracks.rcu(|current| {
            if current.iter().any(|dt| Arc::ptr_eq(dt, &down_track)) {
                return current.as_ref().clone();
            }
            let mut next = current.as_ref().clone();
            next.push(down_track.clone());
            next
        });
    }

    /// Removes the subscriber's down track from the fan-out snapshot.
    pub fn delete_down_track(&self, subscriber_id: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.down_tracks.rcu(|current| {
            current
                .iter()
                .filter(|dt| dt.subscriber_id() != subscriber_id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub fn down_tracks(&self) -> Vec<Arc<DownTrack>> {
        self.down_tracks.load().as_ref().clone()
    }

    /// Forwards feedback to the router's RTCP channel. Picture loss
    /// indications are limited to one per 500ms; surplus requests are
    /// dropped. Producers never block: when the channel is full the
    /// feedback is discarded.
    pub fn send_rtcp(&self, packets: RtcpPackets) {
        let is_pli = packets
            .first()
            .map(|p| p.as_any().downcast_ref::<PictureLossIndication>().is_some())
            .unwrap_or(false);
        if is_pli {
            let mut last_pli = self.last_pli.lock().unwrap();
            if let Some(last) = *last_pli {
                if last.elapsed() < PLI_INTERVAL {
                    return;
                }
            }
            *last_pli = Some(Instant::now());
        }

        let sender = { self.rtcp_sender.lock().unwrap().clone() };
        if let Some(sender) = sender {
            if let Err(err) = sender.try_send(packets) {
                tracing::warn!("rtcp channel is full, dropping feedback: {}", err);
            }
        }
    }

    /// Queues a retransmission batch on the single worker. Missing history
    /// entries are skipped there, not reported as errors.
    pub fn retransmit_packets(
        &self,
        down_track: Arc<DownTrack>,
        packets: Vec<PacketMeta>,
    ) -> Result<(), Error> {
        let sender = { self.retransmit_sender.lock().unwrap().clone() };
        let Some(sender) = sender else {
            return Err(Error::new_receiver(
                "receiver is closed".to_owned(),
                ReceiverErrorKind::ClosedError,
            ));
        };
        sender
            .send(RetransmitRequest {
                down_track,
                packets,
            })
            .map_err(|_| {
                Error::new_receiver(
                    "retransmission worker is released".to_owned(),
                    ReceiverErrorKind::ClosedError,
                )
            })
    }

    pub(crate) fn enqueue_layer_switch(
        &self,
        down_track: Arc<DownTrack>,
        from: Option<Arc<Receiver>>,
        layer: u8,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut pending = self.pending_switches.lock().unwrap();
        pending.push(PendingLayerSwitch {
            down_track,
            from,
            layer,
        });
    }

    pub fn bitrate(&self) -> u64 {
        self.buffer().map(|b| b.bitrate()).unwrap_or(0)
    }

    pub fn max_temporal_layer(&self) -> i32 {
        self.buffer().map(|b| b.max_temporal_layer()).unwrap_or(0)
    }

    pub fn get_sender_report_time(&self) -> Option<SenderReportData> {
        self.buffer().and_then(|b| b.get_sender_report_data())
    }

    pub(crate) fn set_sender_report(&self, rtp_time: u32, ntp_time: u64) {
        if let Some(buffer) = self.buffer() {
            buffer.set_sender_report(rtp_time, ntp_time);
        }
    }

    /// Closes the upstream buffer; the forwarding loop drains and tears the
    /// receiver down. Safe to call repeatedly.
    pub fn close(&self) {
        let buffer = self.buffer();
        match buffer {
            Some(buffer) => buffer.close(),
            None => self.close_tracks(),
        }
    }

    async fn write_rtp_loop(self: Arc<Self>, buffer: Arc<Buffer>) {
        tracing::debug!("Receiver {} forwarding loop has started", self.track.id);

        while let Some(packet) = buffer.read_extended().await {
            if self.track.kind == RTPCodecType::Video
                && helpers::is_keyframe(&self.track.codec.capability.mime_type, &packet.payload)
            {
                self.promote_pending_switches();
            }

            let down_tracks = self.down_tracks.load_full();
            for down_track in down_tracks.iter() {
                if let Err(err) = down_track.write_rtp(&packet).await {
                    if err.is_closed_pipe() {
                        self.delete_down_track(down_track.subscriber_id());
                    }
                    tracing::error!(
                        "Error writing to down track {} for {}: {}",
                        down_track.id(),
                        down_track.subscriber_id(),
                        err
                    );
                }
            }
        }

        self.close_tracks();
        tracing::debug!("Receiver {} forwarding loop has finished", self.track.id);
    }

    /// Moves every down track waiting on this layer into the fan-out
    /// snapshot. Called on keyframe boundaries only, so subscribers never
    /// see a mid-GOP switch.
    fn promote_pending_switches(self: &Arc<Self>) {
        let pending: Vec<PendingLayerSwitch> = {
            let mut switches = self.pending_switches.lock().unwrap();
            switches.drain(..).collect()
        };
        for switch in pending {
            if switch.down_track.is_closed() {
                continue;
            }
            if let Some(from) = &switch.from {
                from.delete_down_track(switch.down_track.subscriber_id());
            }
            self.add_down_track(switch.down_track.clone());
            switch.down_track.complete_layer_switch(switch.layer, self);
            tracing::debug!(
                "DownTrack for {} switched to layer {} on {}",
                switch.down_track.subscriber_id(),
                switch.layer,
                self.track.id
            );
        }
    }

    /// Runs the teardown exactly once: closes every bound down track,
    /// releases the retransmission worker and fires the close handler.
    fn close_tracks(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for down_track in self.down_tracks.load_full().iter() {
            down_track.close();
        }
        self.down_tracks.store(Arc::new(Vec::new()));
        {
            let mut switches = self.pending_switches.lock().unwrap();
            switches.clear();
        }
        {
            let mut sender = self.retransmit_sender.lock().unwrap();
            *sender = None;
        }
        let callback = { self.on_close_fn.lock().unwrap().take() };
        if let Some(f) = callback {
            (f)();
        }
    }

    async fn retransmit_loop(
        buffer: Arc<Buffer>,
        mut requests: mpsc::UnboundedReceiver<RetransmitRequest>,
    ) {
        while let Some(request) = requests.recv().await {
            for meta in request.packets {
                let Some(mut packet) = buffer.get_packet(meta.source_seq_no) else {
                    // Already evicted from history, nothing to resend.
                    continue;
                };
                packet.header.sequence_number = meta.target_seq_no;
                packet.header.timestamp = meta.timestamp;
                packet.header.ssrc = request.down_track.ssrc();
                packet.header.payload_type = request.down_track.payload_type();

                if let Err(err) = request.down_track.write_retransmit(&packet).await {
                    tracing::error!(
                        "Error writing rtx packet to down track {}: {}",
                        request.down_track.subscriber_id(),
                        err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;
    use webrtc::rtp::{header::Header, packet::Packet};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    use super::*;
    use crate::down_track::RtpWriter;
    use crate::error::DownTrackErrorKind;

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

    fn vp8_codec() -> RTCRtpCodecParameters {
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        }
    }

    fn video_receiver(track_id: &str, ssrc: u32) -> (Arc<Receiver>, Arc<Buffer>) {
        let receiver = Receiver::new(
            UpTrack {
                id: track_id.to_owned(),
                stream_id: "stream0".to_owned(),
                ssrc,
                codec: vp8_codec(),
                kind: RTPCodecType::Video,
                header_extensions: vec![],
            },
            "peer0".to_owned(),
        );
        let buffer = Arc::new(Buffer::new(ssrc, 100));
        receiver.add_up_track(buffer.clone());
        (receiver, buffer)
    }

    fn down_track(receiver: &Arc<Receiver>, subscriber_id: &str) -> Arc<DownTrack> {
        DownTrack::new(
            receiver.track_id().to_owned(),
            receiver.stream_id().to_owned(),
            receiver.codec().capability.clone(),
            receiver,
            subscriber_id.to_owned(),
            96,
            100,
        )
    }

    // Interframe: S bit set, P bit set.
    fn packet(sn: u16, ts: u32) -> Packet {
        Packet {
            header: Header {
                sequence_number: sn,
                timestamp: ts,
                ssrc: 5555,
                payload_type: 96,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x10, 0x01]),
        }
    }

    fn keyframe_packet(sn: u16, ts: u32) -> Packet {
        Packet {
            header: Header {
                sequence_number: sn,
                timestamp: ts,
                ssrc: 5555,
                payload_type: 96,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x10, 0x00]),
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition was not reached in time");
    }

    #[tokio::test]
    async fn fans_every_packet_out_to_all_down_tracks_in_order() {
        let (receiver, buffer) = video_receiver("track0", 5555);

        let writer_a = Arc::new(MockWriter::default());
        let writer_b = Arc::new(MockWriter::default());
        let dt_a = down_track(&receiver, "sub-a");
        let dt_b = down_track(&receiver, "sub-b");
        dt_a.bind(writer_a.clone(), 96);
        dt_b.bind(writer_b.clone(), 96);
        receiver.add_down_track(dt_a.clone());
        receiver.add_down_track(dt_a.clone());
        receiver.add_down_track(dt_b.clone());
        assert_eq!(receiver.down_tracks().len(), 2);

        for sn in 1..=3u16 {
            buffer.write(packet(sn, sn as u32 * 3000));
        }

        wait_for(|| writer_b.packets.lock().unwrap().len() == 3).await;
        let sent_a = writer_a.packets.lock().unwrap();
        let sent_b = writer_b.packets.lock().unwrap();
        assert_eq!(
            sent_a.iter().map(|p| p.header.sequence_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            sent_b.iter().map(|p| p.header.sequence_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn failed_down_track_is_removed_and_others_keep_flowing() {
        let (receiver, buffer) = video_receiver("track0", 5555);

        let writer_a = Arc::new(MockWriter::default());
        let writer_b = Arc::new(MockWriter::default());
        let dt_a = down_track(&receiver, "sub-a");
        let dt_b = down_track(&receiver, "sub-b");
        dt_a.bind(writer_a.clone(), 96);
        dt_b.bind(writer_b.clone(), 96);
        receiver.add_down_track(dt_a.clone());
        receiver.add_down_track(dt_b.clone());

        buffer.write(packet(1, 3000));
        wait_for(|| writer_b.packets.lock().unwrap().len() == 1).await;

        writer_b.fail_closed.store(true, Ordering::Relaxed);
        buffer.write(packet(2, 6000));
        wait_for(|| writer_a.packets.lock().unwrap().len() == 2).await;
        wait_for(|| receiver.down_tracks().len() == 1).await;

        buffer.write(packet(3, 9000));
        wait_for(|| writer_a.packets.lock().unwrap().len() == 3).await;
        assert_eq!(writer_b.packets.lock().unwrap().len(), 1);
        assert_eq!(receiver.down_tracks()[0].subscriber_id(), "sub-a");
    }

    #[tokio::test(start_paused = true)]
    async fn pli_feedback_is_rate_limited() {
        let (receiver, _buffer) = video_receiver("track0", 5555);
        let (tx, mut rx) = mpsc::channel(10);
        receiver.set_rtcp_channel(tx);

        let pli = || -> RtcpPackets {
            vec![Box::new(PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: 5555,
            })]
        };

        receiver.send_rtcp(pli());
        tokio::time::advance(Duration::from_millis(100)).await;
        receiver.send_rtcp(pli());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(600)).await;
        receiver.send_rtcp(pli());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn retransmits_historical_packets_with_target_values() {
        let (receiver, buffer) = video_receiver("track0", 5555);
        for sn in 10..=14u16 {
            buffer.write(packet(sn, sn as u32 * 3000));
        }

        let writer = Arc::new(MockWriter::default());
        let dt = down_track(&receiver, "sub-a");
        dt.bind(writer.clone(), 96);

        receiver
            .retransmit_packets(
                dt.clone(),
                vec![
                    PacketMeta {
                        source_seq_no: 12,
                        target_seq_no: 112,
                        timestamp: 424242,
                    },
                    // Never buffered: skipped without an error.
                    PacketMeta {
                        source_seq_no: 999,
                        target_seq_no: 113,
                        timestamp: 515151,
                    },
                ],
            )
            .unwrap();

        wait_for(|| writer.packets.lock().unwrap().len() == 1).await;
        let sent = writer.packets.lock().unwrap();
        assert_eq!(sent[0].header.sequence_number, 112);
        assert_eq!(sent[0].header.timestamp, 424242);
        assert_eq!(sent[0].header.ssrc, dt.ssrc());
        assert_eq!(sent[0].header.payload_type, 96);
    }

    #[tokio::test]
    async fn close_side_effects_fire_exactly_once() {
        let (receiver, _buffer) = video_receiver("track0", 5555);
        let dt = down_track(&receiver, "sub-a");
        receiver.add_down_track(dt.clone());

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        receiver.on_close_handler(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        receiver.close();
        wait_for(|| receiver.is_closed()).await;
        receiver.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(dt.is_closed());
        assert!(receiver
            .retransmit_packets(dt.clone(), vec![])
            .is_err());
    }

    #[tokio::test]
    async fn layer_switch_waits_for_a_keyframe_on_the_target() {
        let (receiver_low, buffer_low) = video_receiver("track-low", 5555);
        let (receiver_high, buffer_high) = video_receiver("track-high", 6666);

        let writer = Arc::new(MockWriter::default());
        let dt = down_track(&receiver_low, "sub-a");
        dt.bind(writer.clone(), 96);
        receiver_low.add_down_track(dt.clone());

        let switched = Arc::new(Mutex::new(None));
        let seen = switched.clone();
        dt.on_layer_switched(Box::new(move |layer| {
            *seen.lock().unwrap() = Some(layer);
        }));

        dt.request_layer_switch(&receiver_high, 1);
        assert_eq!(dt.pending_layer(), Some(1));

        // Interframes do not trigger the move.
        buffer_high.write(packet(1, 3000));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(receiver_high.down_tracks().len(), 0);

        buffer_high.write(keyframe_packet(2, 6000));
        wait_for(|| receiver_high.down_tracks().len() == 1).await;
        wait_for(|| receiver_low.down_tracks().is_empty()).await;
        assert_eq!(dt.current_layer(), 1);
        assert_eq!(dt.pending_layer(), None);
        assert_eq!(*switched.lock().unwrap(), Some(1));

        buffer_low.close();
        buffer_high.close();
    }
}
