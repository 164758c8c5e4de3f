use std::env;
use std::time::Duration;

use bridge_proto::PeerClass;
use url::Url;

use crate::error::SessionError;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:5011/ws";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint without the identification query.
    pub signaling_url: String,
    pub class: PeerClass,
    pub uid: String,
    pub token: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub channel_label: String,
    /// `None` disables the ping loop; inbound pings are still answered.
    pub keepalive_interval: Option<Duration>,
    /// Fail the session when an offer stays unanswered this long.
    pub answer_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            class: PeerClass::Web,
            uid: "1".to_string(),
            token: None,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            keepalive_interval: Some(DEFAULT_KEEPALIVE),
            answer_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Reads `BRIDGE_*` and `TURN_SERVER*` variables on top of the defaults.
    ///
    /// Callers that want `.env` support load it before calling this.
    pub fn from_env() -> Result<Self, SessionError> {
        let mut config = Self::default();
        if let Some(url) = var("BRIDGE_SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(class) = var("BRIDGE_PEER_CLASS") {
            config.class = PeerClass::from_param(Some(&class));
        }
        if let Some(uid) = var("BRIDGE_PEER_UID") {
            config.uid = uid;
        }
        config.token = var("BRIDGE_PEER_TOKEN");
        if let Some(label) = var("BRIDGE_CHANNEL_LABEL") {
            config.channel_label = label;
        }
        if let Some(turn) = var("TURN_SERVER") {
            config.ice_servers.push(IceServer {
                urls: vec![turn],
                username: var("TURN_SERVER_USERNAME"),
                credential: var("TURN_SERVER_CREDENTIAL"),
            });
        }
        if let Some(millis) = var("BRIDGE_KEEPALIVE_MS") {
            let millis = parse_number("BRIDGE_KEEPALIVE_MS", &millis)?;
            config.keepalive_interval = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(secs) = var("BRIDGE_ANSWER_TIMEOUT_SECS") {
            let secs = parse_number("BRIDGE_ANSWER_TIMEOUT_SECS", &secs)?;
            config.answer_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(config)
    }

    /// Full link URI: the relay URL plus the `type`, `uid` and `token` query.
    pub fn signaling_uri(&self) -> Result<String, SessionError> {
        let mut url = Url::parse(&self.signaling_url)
            .map_err(|err| SessionError::Config(format!("signaling url: {err}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SessionError::Config(format!(
                    "signaling url must be ws or wss, got {other}"
                )))
            }
        }
        {
            let mut query = url.query_pairs_mut();
            if let Some(class) = self.class.as_param() {
                query.append_pair("type", class);
            }
            query.append_pair("uid", &self.uid);
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        Ok(url.into())
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number(key: &str, value: &str) -> Result<u64, SessionError> {
    value
        .trim()
        .parse()
        .map_err(|_| SessionError::Config(format!("{key} must be a whole number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn uri_carries_identification_query() {
        let config = SessionConfig {
            signaling_url: "ws://relay.local:5011/ws".into(),
            class: PeerClass::Native,
            uid: "7".into(),
            token: Some("secret".into()),
            ..SessionConfig::default()
        };
        assert_eq!(
            config.signaling_uri().unwrap(),
            "ws://relay.local:5011/ws?type=u&uid=7&token=secret"
        );
    }

    #[test_timeout::timeout]
    fn token_is_optional() {
        let config = SessionConfig::default();
        assert_eq!(
            config.signaling_uri().unwrap(),
            "ws://127.0.0.1:5011/ws?type=w&uid=1"
        );
    }

    #[test_timeout::timeout]
    fn rejects_non_websocket_scheme() {
        let config = SessionConfig {
            signaling_url: "http://relay.local/ws".into(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.signaling_uri(),
            Err(SessionError::Config(_))
        ));
    }

    #[test_timeout::timeout]
    fn secure_relay_url_is_accepted() {
        let config = SessionConfig {
            signaling_url: "wss://relay.example.com/wsbridge".into(),
            class: PeerClass::Native,
            ..SessionConfig::default()
        };
        assert_eq!(
            config.signaling_uri().unwrap(),
            "wss://relay.example.com/wsbridge?type=u&uid=1"
        );
    }

    // the only test in this crate that touches the process environment
    #[test_timeout::timeout]
    fn environment_overrides_defaults() {
        const KEYS: [&str; 9] = [
            "BRIDGE_SIGNALING_URL",
            "BRIDGE_PEER_CLASS",
            "BRIDGE_PEER_UID",
            "BRIDGE_PEER_TOKEN",
            "TURN_SERVER",
            "TURN_SERVER_USERNAME",
            "TURN_SERVER_CREDENTIAL",
            "BRIDGE_KEEPALIVE_MS",
            "BRIDGE_ANSWER_TIMEOUT_SECS",
        ];
        let values = [
            "wss://relay.example.com/ws",
            "u",
            "12",
            "tok",
            "turn:turn.example.com:3478",
            "alice",
            "pw",
            "0",
            "15",
        ];
        for (key, value) in KEYS.iter().zip(values) {
            env::set_var(key, value);
        }

        let config = SessionConfig::from_env();
        env::set_var("BRIDGE_KEEPALIVE_MS", "soon");
        let invalid = SessionConfig::from_env();
        for key in KEYS {
            env::remove_var(key);
        }

        let config = config.unwrap();
        assert_eq!(config.signaling_url, "wss://relay.example.com/ws");
        assert_eq!(config.class, PeerClass::Native);
        assert_eq!(config.uid, "12");
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert_eq!(config.keepalive_interval, None);
        assert_eq!(config.answer_timeout, Some(Duration::from_secs(15)));
        assert_eq!(
            config.ice_servers.last(),
            Some(&IceServer {
                urls: vec!["turn:turn.example.com:3478".into()],
                username: Some("alice".into()),
                credential: Some("pw".into()),
            })
        );
        assert!(matches!(invalid, Err(SessionError::Config(_))));
    }
}
