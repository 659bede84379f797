use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use derivative::Derivative;
use tokio::{sync::Notify, time::Instant};
use webrtc::{
    rtcp,
    rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack},
    rtp::packet::Packet,
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpHeaderExtensionParameters},
    sdp::extmap,
};
use webrtc_util::MarshalSize;

use crate::helpers;

pub type RtcpPackets = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

pub type OnFeedbackFn = Box<dyn Fn(RtcpPackets) + Send + Sync>;
pub type OnAudioLevelFn = Box<dyn Fn(u8) + Send + Sync>;

const BITRATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct BufferOptions {
    pub max_bitrate: u64,
}

/// Timing pair extracted from the most recent RTCP sender report.
#[derive(Clone, Copy, Debug)]
pub struct SenderReportData {
    pub rtp_time: u32,
    pub ntp_time: u64,
    pub received_at: DateTime<Utc>,
}

/// Jitter-ordering and packet-history ring for one inbound track.
///
/// Writers push packets as they arrive from the transport; the owning
/// receiver drains them in sequence order with [`Buffer::read_extended`].
/// A bounded window of emitted packets is retained for retransmission
/// lookups, and loss or audio-level observations are surfaced through the
/// registered callbacks.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Buffer {
    media_ssrc: u32,
    inner: Mutex<BufferInner>,
    notify: Notify,
    #[derivative(Debug = "ignore")]
    on_feedback_fn: Mutex<Option<OnFeedbackFn>>,
    #[derivative(Debug = "ignore")]
    on_audio_level_fn: Mutex<Option<OnAudioLevelFn>>,
}

#[derive(Debug)]
struct BufferInner {
    mime_type: String,
    audio_level_ext_id: Option<u8>,
    max_bitrate: u64,
    max_packets: usize,
    pending: VecDeque<Packet>,
    history: VecDeque<Packet>,
    last_emitted: Option<u16>,
    max_seq: Option<u16>,
    byte_window: VecDeque<(Instant, usize)>,
    sender_report: Option<SenderReportData>,
    max_temporal_layer: i32,
    closed: bool,
}

impl Buffer {
    pub fn new(media_ssrc: u32, max_packets: usize) -> Self {
        Self {
            media_ssrc,
            inner: Mutex::new(BufferInner {
                mime_type: String::new(),
                audio_level_ext_id: None,
                max_bitrate: 0,
                max_packets: max_packets.max(1),
                pending: VecDeque::new(),
                history: VecDeque::new(),
                last_emitted: None,
                max_seq: None,
                byte_window: VecDeque::new(),
                sender_report: None,
                max_temporal_layer: 0,
                closed: false,
            }),
            notify: Notify::new(),
            on_feedback_fn: Mutex::new(None),
            on_audio_level_fn: Mutex::new(None),
        }
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    /// Binds the negotiated codec and header extensions, enabling audio-level
    /// extraction and bitrate accounting.
    pub fn bind(
        &self,
        header_extensions: Vec<RTCRtpHeaderExtensionParameters>,
        codec: RTCRtpCodecCapability,
        options: BufferOptions,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.mime_type = codec.mime_type;
        inner.max_bitrate = options.max_bitrate;
        inner.audio_level_ext_id = header_extensions
            .iter()
            .find(|ext| ext.uri == extmap::AUDIO_LEVEL_URI)
            .and_then(|ext| u8::try_from(ext.id).ok());
    }

    pub fn on_feedback(&self, f: OnFeedbackFn) {
        let mut callback = self.on_feedback_fn.lock().unwrap();
        *callback = Some(f);
    }

    pub fn on_audio_level(&self, f: OnAudioLevelFn) {
        let mut callback = self.on_audio_level_fn.lock().unwrap();
        *callback = Some(f);
    }

    /// Accepts one packet from the upstream track.
    pub fn write(&self, packet: Packet) {
        let mut nack: Option<TransportLayerNack> = None;
        let mut audio_level: Option<u8> = None;

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }

            let sn = packet.header.sequence_number;
            let now = Instant::now();
            let size = packet.marshal_size();
            inner.byte_window.push_back((now, size));
            while inner
                .byte_window
                .front()
                .map(|(at, _)| now.duration_since(*at) > BITRATE_WINDOW)
                .unwrap_or(false)
            {
                inner.byte_window.pop_front();
            }

            if inner.mime_type.to_lowercase().contains("vp8") {
                if let Some(tid) = helpers::vp8_temporal_id(&packet.payload) {
                    inner.max_temporal_layer = inner.max_temporal_layer.max(tid as i32);
                }
            }

            match inner.max_seq {
                None => inner.max_seq = Some(sn),
                Some(max) => {
                    if helpers::seq_newer(sn, max) {
                        let expected = max.wrapping_add(1);
                        if sn != expected {
                            nack = Some(self.build_nack(expected, sn));
                        }
                        inner.max_seq = Some(sn);
                    }
                }
            }

            if let Some(ext_id) = inner.audio_level_ext_id {
                if let Some(ext) = packet.header.get_extension(ext_id) {
                    if let Some(b) = ext.first() {
                        audio_level = Some(b & 0x7F);
                    }
                }
            }

            inner.history.push_back(packet.clone());
            while inner.history.len() > inner.max_packets {
                inner.history.pop_front();
            }

            Self::insert_pending(&mut inner, packet);
        }

        self.notify.notify_one();

        if let Some(nack) = nack {
            let callback = self.on_feedback_fn.lock().unwrap();
            if let Some(f) = callback.as_ref() {
                (f)(vec![Box::new(nack)]);
            }
        }
        if let Some(level) = audio_level {
            let callback = self.on_audio_level_fn.lock().unwrap();
            if let Some(f) = callback.as_ref() {
                (f)(level);
            }
        }
    }

    fn build_nack(&self, from: u16, to: u16) -> TransportLayerNack {
        let mut nacks = Vec::new();
        let mut sn = from;
        while sn != to && nacks.len() < 16 {
            nacks.push(NackPair {
                packet_id: sn,
                lost_packets: 0,
            });
            sn = sn.wrapping_add(1);
        }
        TransportLayerNack {
            sender_ssrc: 0,
            media_ssrc: self.media_ssrc,
            nacks,
        }
    }

    fn insert_pending(inner: &mut BufferInner, packet: Packet) {
        let sn = packet.header.sequence_number;
        if let Some(last) = inner.last_emitted {
            if !helpers::seq_newer(sn, last) {
                return;
            }
        }
        if inner
            .pending
            .iter()
            .any(|p| p.header.sequence_number == sn)
        {
            return;
        }
        match inner.pending.back() {
            Some(back) if !helpers::seq_newer(sn, back.header.sequence_number) => {
                let at = inner
                    .pending
                    .iter()
                    .position(|p| helpers::seq_newer(p.header.sequence_number, sn))
                    .unwrap_or(inner.pending.len());
                inner.pending.insert(at, packet);
            }
            _ => inner.pending.push_back(packet),
        }
    }

    /// Yields the next packet in sequence order, waiting for arrivals.
    /// Returns `None` once the buffer is closed and drained.
    pub async fn read_extended(&self) -> Option<Packet> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(packet) = inner.pending.pop_front() {
                    inner.last_emitted = Some(packet.header.sequence_number);
                    return Some(packet);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Looks up a historical packet by its source sequence number.
    /// Evicted packets report `None`, which callers treat as a skip.
    pub fn get_packet(&self, source_seq_no: u16) -> Option<Packet> {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .iter()
            .rev()
            .find(|p| p.header.sequence_number == source_seq_no)
            .cloned()
    }

    /// Inbound bitrate over the last second, in bits per second.
    pub fn bitrate(&self) -> u64 {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        inner
            .byte_window
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= BITRATE_WINDOW)
            .map(|(_, size)| *size as u64)
            .sum::<u64>()
            * 8
    }

    pub fn max_bitrate(&self) -> u64 {
        self.inner.lock().unwrap().max_bitrate
    }

    pub fn max_temporal_layer(&self) -> i32 {
        self.inner.lock().unwrap().max_temporal_layer
    }

    pub fn set_sender_report(&self, rtp_time: u32, ntp_time: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.sender_report = Some(SenderReportData {
            rtp_time,
            ntp_time,
            received_at: Utc::now(),
        });
    }

    pub fn get_sender_report_data(&self) -> Option<SenderReportData> {
        self.inner.lock().unwrap().sender_report
    }

    /// Marks the upstream track as finished. Pending packets still drain;
    /// afterwards `read_extended` reports end of stream.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use webrtc::rtp::header::Header;

    use super::*;

    fn packet(sn: u16, ts: u32) -> Packet {
        Packet {
            header: Header {
                sequence_number: sn,
                timestamp: ts,
                ssrc: 1234,
                payload_type: 96,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x10, 0x00, 0x9d, 0x01]),
        }
    }

    #[tokio::test]
    async fn packets_are_emitted_in_sequence_order() {
        let buffer = Buffer::new(1234, 10);
        buffer.write(packet(3, 3000));
        buffer.write(packet(1, 1000));
        buffer.write(packet(2, 2000));

        assert_eq!(
            buffer.read_extended().await.unwrap().header.sequence_number,
            1
        );
        assert_eq!(
            buffer.read_extended().await.unwrap().header.sequence_number,
            2
        );
        assert_eq!(
            buffer.read_extended().await.unwrap().header.sequence_number,
            3
        );
    }

    #[tokio::test]
    async fn close_drains_then_reports_end_of_stream() {
        let buffer = Buffer::new(1234, 10);
        buffer.write(packet(7, 7000));
        buffer.close();
        buffer.close();

        assert_eq!(
            buffer.read_extended().await.unwrap().header.sequence_number,
            7
        );
        assert!(buffer.read_extended().await.is_none());
        // Writes after close are discarded.
        buffer.write(packet(8, 8000));
        assert!(buffer.read_extended().await.is_none());
    }

    #[test]
    fn sequence_gap_raises_nack_feedback() {
        let buffer = Buffer::new(1234, 10);
        let collected: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        buffer.on_feedback(Box::new(move |packets| {
            for p in &packets {
                if let Some(nack) = p.as_any().downcast_ref::<TransportLayerNack>() {
                    let mut lost = Vec::new();
                    for pair in &nack.nacks {
                        lost.extend(pair.packet_list());
                    }
                    sink.lock().unwrap().extend(lost);
                }
            }
        }));

        buffer.write(packet(10, 1000));
        buffer.write(packet(13, 4000));

        assert_eq!(*collected.lock().unwrap(), vec![11, 12]);
    }

    #[test]
    fn history_window_is_bounded() {
        let buffer = Buffer::new(1234, 3);
        for sn in 0..6u16 {
            buffer.write(packet(sn, sn as u32 * 1000));
        }

        assert!(buffer.get_packet(5).is_some());
        assert!(buffer.get_packet(3).is_some());
        assert!(buffer.get_packet(2).is_none());
        assert!(buffer.get_packet(0).is_none());
    }

    #[test]
    fn audio_level_extension_is_reported() {
        let buffer = Buffer::new(1234, 10);
        buffer.bind(
            vec![RTCRtpHeaderExtensionParameters {
                uri: extmap::AUDIO_LEVEL_URI.to_owned(),
                id: 1,
            }],
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: vec![],
            },
            BufferOptions {
                max_bitrate: 1_500_000,
            },
        );

        let levels: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = levels.clone();
        buffer.on_audio_level(Box::new(move |level| {
            sink.lock().unwrap().push(level);
        }));

        let mut p = packet(1, 960);
        p.header.extension = true;
        p.header.extension_profile = 0xBEDE;
        // V bit set, level 37 dBov.
        p.header
            .set_extension(1, Bytes::from_static(&[0x80 | 37]))
            .unwrap();
        buffer.write(p);

        assert_eq!(*levels.lock().unwrap(), vec![37]);
    }

    #[test]
    fn sender_report_data_is_retained() {
        let buffer = Buffer::new(1234, 10);
        assert!(buffer.get_sender_report_data().is_none());

        buffer.set_sender_report(90000, 0xdead_beef_0000_0000);
        let sr = buffer.get_sender_report_data().unwrap();
        assert_eq!(sr.rtp_time, 90000);
        assert_eq!(sr.ntp_time, 0xdead_beef_0000_0000);
    }
}
