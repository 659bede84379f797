use webrtc::{
    api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8},
    error::Result,
    rtp_transceiver::{
        rtp_codec::{
            RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability,
            RTPCodecType,
        },
        RTCPFeedback,
    },
    sdp::extmap,
};

use crate::config::MediaConfig;

pub(crate) fn default_audio_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        payload_type: 111,
        ..Default::default()
    }]
}

pub(crate) fn default_video_codecs() -> Vec<RTCRtpCodecParameters> {
    let video_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];

    vec![
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: video_feedback.clone(),
            },
            payload_type: 96,
            ..Default::default()
        },
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"
                        .to_owned(),
                rtcp_feedback: video_feedback,
            },
            payload_type: 102,
            ..Default::default()
        },
    ]
}

/// Registers the configured codecs, falling back to the defaults when a list is empty.
pub fn register_codecs(me: &mut MediaEngine, config: &MediaConfig) -> Result<()> {
    let audio = if config.codec.audio.is_empty() {
        default_audio_codecs()
    } else {
        config.codec.audio.clone()
    };
    for codec in audio {
        me.register_codec(codec, RTPCodecType::Audio)?;
    }

    let video = if config.codec.video.is_empty() {
        default_video_codecs()
    } else {
        config.codec.video.clone()
    };
    for codec in video {
        me.register_codec(codec, RTPCodecType::Video)?;
    }

    register_extensions(me)?;

    Ok(())
}

fn register_extensions(me: &mut MediaEngine) -> Result<()> {
    for uri in [
        extmap::AUDIO_LEVEL_URI,
        extmap::SDES_MID_URI,
        extmap::ABS_SEND_TIME_URI,
    ] {
        me.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: uri.to_owned(),
            },
            RTPCodecType::Audio,
            None,
        )?;
    }

    for uri in [
        extmap::SDES_MID_URI,
        extmap::SDES_RTP_STREAM_ID_URI,
        extmap::ABS_SEND_TIME_URI,
    ] {
        me.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: uri.to_owned(),
            },
            RTPCodecType::Video,
            None,
        )?;
    }

    Ok(())
}
