use bridge_session::{IceServer, SessionConfig};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Peer connection settings for [`WebRtcEngineFactory`](crate::WebRtcEngineFactory).
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
    /// Whether locally created data channels deliver in order.
    pub ordered: bool,
    /// Retransmit limit for locally created channels; `None` is reliable.
    pub max_retransmits: Option<u16>,
    /// Add a receive-only audio transceiver to every peer connection.
    pub receive_audio: bool,
    /// Add a receive-only video transceiver to every peer connection.
    pub receive_video: bool,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self::from_session(&SessionConfig::default())
    }
}

impl RtcConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            ordered: true,
            max_retransmits: None,
            receive_audio: false,
            receive_video: false,
        }
    }

    /// Loopback-only operation: no STUN or TURN.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        }
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn turn_credentials_are_carried_over() {
        let config = RtcConfig {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer {
                    urls: vec!["turn:turn.example.net:3478".into()],
                    username: Some("bridge".into()),
                    credential: Some("hunter2".into()),
                },
            ],
            ..RtcConfig::localhost()
        };

        let rtc = config.rtc_configuration();

        assert_eq!(rtc.ice_servers.len(), 2);
        assert!(rtc.ice_servers[0].username.is_empty());
        assert_eq!(rtc.ice_servers[1].urls, vec!["turn:turn.example.net:3478"]);
        assert_eq!(rtc.ice_servers[1].username, "bridge");
        assert_eq!(rtc.ice_servers[1].credential, "hunter2");
    }

    #[test_timeout::timeout]
    fn default_uses_public_stun() {
        let config = RtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
        assert!(RtcConfig::localhost().ice_servers.is_empty());
    }
}
