use std::{net::IpAddr, sync::Arc, time::Duration};

use derivative::Derivative;
use webrtc::{
    api::setting_engine::SettingEngine, peer_connection::configuration::RTCConfiguration,
    rtp_transceiver::rtp_codec::RTCRtpCodecParameters,
};
use webrtc_ice::network_type::NetworkType;

use crate::media_engine;

/// Top level configuration consumed by [`crate::sfu::SFU`] and [`crate::peer::PeerLocal`].
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub router: RouterConfig,
    pub media: MediaConfig,
    pub transport: WebRTCTransportConfig,
    pub turn: TurnConfig,
}

/// Configuration for [`crate::router::Router`] and the audio observer owned by each session.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Max bitrate advertised to publishers, in bits per second.
    pub max_bandwidth: u64,
    /// How many packets each buffer and sequencer retains for retransmission.
    pub max_packet_track: usize,
    /// Audio observer reporting interval in milliseconds.
    pub audio_level_interval: u64,
    /// dBov threshold below which a sample counts as voice activity.
    pub audio_level_threshold: u8,
    /// Percentage of voiced samples required for a stream to count as active.
    pub audio_level_filter: i32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_bandwidth: 1_500_000,
            max_packet_track: 500,
            audio_level_interval: 1000,
            audio_level_threshold: 40,
            audio_level_filter: 20,
        }
    }
}

/// TURN relay settings, passed through to the transport layer unmodified.
#[derive(Clone, Debug, Default)]
pub struct TurnConfig {
    pub enabled: bool,
    pub realm: String,
    pub address: String,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub port_range: Option<(u16, u16)>,
}

/// Configuration for the publisher and subscriber peer connections owned by
/// [`crate::peer::PeerLocal`].
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
    pub announced_ips: Vec<IpAddr>,
    pub ice_disconnected_timeout: Option<Duration>,
    pub ice_failed_timeout: Option<Duration>,
    pub ice_keep_alive_interval: Option<Duration>,
    pub network_types: Vec<NetworkType>,
    pub ice_username_fragment: Option<String>,
    pub ice_password: Option<String>,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration {
                ..Default::default()
            },
            announced_ips: vec![],
            ice_disconnected_timeout: None,
            ice_failed_timeout: None,
            ice_keep_alive_interval: None,
            network_types: vec![],
            ice_username_fragment: None,
            ice_password: None,
        }
    }
}

impl WebRTCTransportConfig {
    pub fn configuration(&self) -> RTCConfiguration {
        self.configuration.clone()
    }

    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut setting_engine = SettingEngine::default();

        if self.ice_disconnected_timeout.is_some()
            || self.ice_failed_timeout.is_some()
            || self.ice_keep_alive_interval.is_some()
        {
            setting_engine.set_ice_timeouts(
                self.ice_disconnected_timeout,
                self.ice_failed_timeout,
                self.ice_keep_alive_interval,
            );
        }

        if self.announced_ips.len() > 0 {
            let announced_ips = Arc::new(self.announced_ips.clone());
            setting_engine.set_ip_filter(Box::new({
                let announced_ips = Arc::clone(&announced_ips);
                move |ip| announced_ips.contains(&ip)
            }));
        }

        if self.network_types.len() > 0 {
            setting_engine.set_network_types(self.network_types.clone());
        }

        if self.ice_username_fragment.is_some() || self.ice_password.is_some() {
            let username = self.ice_username_fragment.clone().unwrap_or("".to_string());
            let password = self.ice_password.clone().unwrap_or("".to_string());
            setting_engine.set_ice_credentials(username, password);
        }

        setting_engine
    }
}

/// Media codec configuration for [`crate::subscriber::Subscriber`] and the media engine.
#[derive(Clone, Debug)]
pub struct MediaConfig {
    pub codec: CodecConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            codec: Default::default(),
        }
    }
}

/// Codec capabilities advertised for audio and video.
#[derive(Clone, Debug)]
pub struct CodecConfig {
    pub audio: Vec<RTCRtpCodecParameters>,
    pub video: Vec<RTCRtpCodecParameters>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            audio: media_engine::default_audio_codecs(),
            video: media_engine::default_video_codecs(),
        }
    }
}
