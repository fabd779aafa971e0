#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, transports and the audio level observer

use mediasoup::audio_level_observer::AudioLevelObserverOptions;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU16, NonZeroU32, NonZeroU8};

const OPUS_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(48_000) {
    Some(rate) => rate,
    None => panic!("clock rate must be non-zero"),
};

const OPUS_CHANNELS: NonZeroU8 = match NonZeroU8::new(2) {
    Some(channels) => channels,
    None => panic!("channel count must be non-zero"),
};

const OBSERVER_MAX_ENTRIES: NonZeroU16 = match NonZeroU16::new(100) {
    Some(entries) => entries,
    None => panic!("max entries must be non-zero"),
};

/// Main media server configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
    pub observer_config: ObserverConfig,
}

impl MediaConfig {
    /// Builds the media configuration from the process settings
    pub fn from_app(app: &crate::config::AppConfig) -> Self {
        let worker_config = WorkerConfig {
            num_workers: app.num_workers,
            rtc_min_port: app.rtc_min_port,
            rtc_max_port: app.rtc_max_port,
            ..WorkerConfig::default()
        };
        Self {
            worker_config,
            webrtc_transport_config: WebRtcTransportConfig::default().with_public_ip(app.announce_ip),
            ..Self::default()
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Srtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Voice only: Opus, 48 kHz, stereo
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: OPUS_CLOCK_RATE,
            channels: OPUS_CHANNELS,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        }]
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: Some(1_500_000),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }

    /// Converts to WebRtcTransportOptions, UDP first then TCP
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let first = if self.enable_udp { Protocol::Udp } else { Protocol::Tcp };
        let mut listen_infos = WebRtcTransportListenInfos::new(self.listen_info(first));
        if self.enable_udp && self.enable_tcp {
            listen_infos = listen_infos.insert(self.listen_info(Protocol::Tcp));
        }

        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.enable_udp = self.enable_udp;
        options.enable_tcp = self.enable_tcp;
        options.prefer_udp = self.prefer_udp;
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}

/// Audio level observer settings, one observer per room
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub max_entries: NonZeroU16,
    /// dBov; quieter producers are ignored
    pub threshold: i8,
    /// Reporting interval in milliseconds
    pub interval: u16,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            max_entries: OBSERVER_MAX_ENTRIES,
            threshold: -90,
            interval: 500,
        }
    }
}

impl ObserverConfig {
    pub fn to_observer_options(&self) -> AudioLevelObserverOptions {
        let mut options = AudioLevelObserverOptions::default();
        options.max_entries = self.max_entries;
        options.threshold = self.threshold;
        options.interval = self.interval;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codecs_are_opus_only() {
        let codecs = RouterConfig::default_codecs();
        assert_eq!(codecs.len(), 1);
        match &codecs[0] {
            RtpCodecCapability::Audio { mime_type, clock_rate, channels, .. } => {
                assert_eq!(*mime_type, MimeTypeAudio::Opus);
                assert_eq!(clock_rate.get(), 48000);
                assert_eq!(channels.get(), 2);
            }
            other => panic!("unexpected codec {other:?}"),
        }
    }

    #[test]
    fn observer_defaults() {
        let config = ObserverConfig::default();
        assert_eq!(config.max_entries.get(), 100);
        assert_eq!(config.threshold, -90);
        assert_eq!(config.interval, 500);
    }

    #[test]
    fn transport_defaults() {
        let config = WebRtcTransportConfig::default().with_public_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.announced_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.initial_available_outgoing_bitrate, 1_000_000);
        assert_eq!(config.max_incoming_bitrate, Some(1_500_000));
        assert!(config.prefer_udp);
    }
}
