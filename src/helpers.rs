use chrono::{DateTime, TimeZone, Utc};
use webrtc::{
    api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8},
    rtp_transceiver::rtp_codec::RTCRtpCodecParameters,
};

/// Fuzzy find for a codec in a capability list: first match on MimeType plus
/// fmtp line, then fall back to MimeType alone.
pub(crate) fn codec_parameters_fuzzy_search(
    needle: &RTCRtpCodecParameters,
    haystack: &[RTCRtpCodecParameters],
) -> Option<RTCRtpCodecParameters> {
    haystack
        .iter()
        .find(|c| {
            c.capability
                .mime_type
                .eq_ignore_ascii_case(&needle.capability.mime_type)
                && c.capability.sdp_fmtp_line == needle.capability.sdp_fmtp_line
        })
        .or_else(|| {
            haystack.iter().find(|c| {
                c.capability
                    .mime_type
                    .eq_ignore_ascii_case(&needle.capability.mime_type)
            })
        })
        .cloned()
}

/// True when `a` is a more recent RTP sequence number than `b`, accounting for wraparound.
pub(crate) fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

fn ntp_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap()
}

/// 64-bit NTP timestamp: seconds since 1900-01-01 in the upper half, fraction in the lower.
pub(crate) fn to_ntp_time(t: DateTime<Utc>) -> u64 {
    let nsec = (t - ntp_epoch()).num_nanoseconds().unwrap_or(0) as u64;
    let sec = nsec / 1_000_000_000;
    let rem = (nsec - sec * 1_000_000_000) << 32;
    let mut frac = rem / 1_000_000_000;
    if rem % 1_000_000_000 >= 500_000_000 {
        frac += 1;
    }
    (sec << 32) | frac
}

pub(crate) fn ntp_to_time(ntp: u64) -> DateTime<Utc> {
    let sec = ntp >> 32;
    let frac = ntp & 0xffff_ffff;
    let mut nsec = (frac * 1_000_000_000) >> 32;
    if (frac * 1_000_000_000) as u32 >= 0x8000_0000 {
        nsec += 1;
    }
    ntp_epoch() + chrono::Duration::nanoseconds((sec * 1_000_000_000 + nsec) as i64)
}

/// Detects whether an RTP payload starts a keyframe, for the codecs we forward.
/// Unknown codecs report false so layer switches simply wait for a known marker.
pub(crate) fn is_keyframe(mime_type: &str, payload: &[u8]) -> bool {
    if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
        vp8_keyframe(payload)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
        h264_keyframe(payload)
    } else {
        false
    }
}

fn vp8_keyframe(payload: &[u8]) -> bool {
    let Some(&b0) = payload.first() else {
        return false;
    };
    // S bit: this packet starts a new VP8 partition.
    if b0 & 0x10 == 0 {
        return false;
    }
    let mut i = 1;
    if b0 & 0x80 != 0 {
        let Some(&b1) = payload.get(i) else {
            return false;
        };
        i += 1;
        if b1 & 0x80 != 0 {
            let Some(&pid) = payload.get(i) else {
                return false;
            };
            i += 1;
            if pid & 0x80 != 0 {
                i += 1;
            }
        }
        if b1 & 0x40 != 0 {
            i += 1;
        }
        if b1 & 0x30 != 0 {
            i += 1;
        }
    }
    // P bit of the frame header is zero for keyframes.
    matches!(payload.get(i), Some(b) if b & 0x01 == 0)
}

/// Temporal layer id from the VP8 payload descriptor, when present.
pub(crate) fn vp8_temporal_id(payload: &[u8]) -> Option<u8> {
    let &b0 = payload.first()?;
    if b0 & 0x80 == 0 {
        return None;
    }
    let mut i = 1;
    let &b1 = payload.get(i)?;
    i += 1;
    if b1 & 0x80 != 0 {
        let &pid = payload.get(i)?;
        i += 1;
        if pid & 0x80 != 0 {
            i += 1;
        }
    }
    if b1 & 0x40 != 0 {
        i += 1;
    }
    if b1 & 0x20 != 0 || b1 & 0x10 != 0 {
        return payload.get(i).map(|b| (b >> 6) & 0x03);
    }
    None
}

fn h264_keyframe(payload: &[u8]) -> bool {
    let Some(&b0) = payload.first() else {
        return false;
    };
    match b0 & 0x1F {
        5 | 7 => true,
        // STAP-A: scan the aggregated NAL units.
        24 => {
            let mut i = 1;
            while i + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[i], payload[i + 1]]) as usize;
                match payload[i + 2] & 0x1F {
                    5 | 7 => return true,
                    _ => i += 2 + size,
                }
            }
            false
        }
        // FU-A: only the fragment that starts an IDR slice counts.
        28 => matches!(payload.get(1), Some(b) if b & 0x80 != 0 && b & 0x1F == 5),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn codec(mime: &str, fmtp: &str, payload_type: u8) -> RTCRtpCodecParameters {
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: fmtp.to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type,
            ..Default::default()
        }
    }

    #[test]
    fn fuzzy_search_prefers_exact_fmtp_match() {
        let needle = codec(MIME_TYPE_VP8, "max-fr=30", 96);
        let haystack = vec![codec(MIME_TYPE_VP8, "", 98), codec(MIME_TYPE_VP8, "max-fr=30", 96)];

        let found = codec_parameters_fuzzy_search(&needle, &haystack).unwrap();
        assert_eq!(found.payload_type, 96);
    }

    #[test]
    fn fuzzy_search_falls_back_to_mime_type() {
        let needle = codec(MIME_TYPE_VP8, "max-fr=30", 96);
        let haystack = vec![codec(MIME_TYPE_OPUS, "", 111), codec(MIME_TYPE_VP8, "", 98)];

        let found = codec_parameters_fuzzy_search(&needle, &haystack).unwrap();
        assert_eq!(found.payload_type, 98);

        let missing = codec_parameters_fuzzy_search(&codec("video/AV1", "", 45), &haystack);
        assert!(missing.is_none());
    }

    #[test]
    fn seq_newer_handles_wraparound() {
        assert!(seq_newer(10, 5));
        assert!(!seq_newer(5, 10));
        assert!(seq_newer(2, 65530));
        assert!(!seq_newer(65530, 2));
        assert!(!seq_newer(7, 7));
    }

    #[test]
    fn ntp_time_round_trip() {
        let t = Utc.with_ymd_and_hms(2023, 4, 1, 12, 30, 45).unwrap();
        let ntp = to_ntp_time(t);
        let back = ntp_to_time(ntp);
        assert!((back - t).num_milliseconds().abs() < 1);
    }

    #[test]
    fn vp8_keyframe_detection() {
        // S bit set, no extensions, P bit clear.
        assert!(is_keyframe(MIME_TYPE_VP8, &[0x10, 0x00]));
        // P bit set marks an interframe.
        assert!(!is_keyframe(MIME_TYPE_VP8, &[0x10, 0x01]));
        // Not the start of a partition.
        assert!(!is_keyframe(MIME_TYPE_VP8, &[0x00, 0x00]));
        assert!(!is_keyframe(MIME_TYPE_OPUS, &[0x10, 0x00]));
    }

    #[test]
    fn h264_keyframe_detection() {
        assert!(is_keyframe(MIME_TYPE_H264, &[0x65, 0x88]));
        assert!(!is_keyframe(MIME_TYPE_H264, &[0x61, 0x88]));
        // FU-A start fragment of an IDR slice.
        assert!(is_keyframe(MIME_TYPE_H264, &[0x7C, 0x85]));
        assert!(!is_keyframe(MIME_TYPE_H264, &[0x7C, 0x05]));
    }
}
