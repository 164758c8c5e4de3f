use std::fmt;
use std::str::FromStr;

use crate::ParseError;

/// Data channel keepalive frame: `ping <micros>` or `pong <micros>`, where
/// the number is microseconds since the sender's session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Ping(u64),
    Pong(u64),
}

impl Heartbeat {
    /// `None` when the text is not a keepalive frame at all.
    pub fn recognize(text: &str) -> Option<Result<Self, ParseError>> {
        match text.split_once(' ') {
            Some(("ping" | "pong", _)) => Some(text.parse()),
            _ => None,
        }
    }

    /// The reply a peer owes for this frame.
    pub fn reply(&self) -> Option<Heartbeat> {
        match self {
            Heartbeat::Ping(micros) => Some(Heartbeat::Pong(*micros)),
            Heartbeat::Pong(_) => None,
        }
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Heartbeat::Ping(micros) => write!(f, "ping {micros}"),
            Heartbeat::Pong(micros) => write!(f, "pong {micros}"),
        }
    }
}

impl FromStr for Heartbeat {
    type Err = ParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let Some((kind, value)) = text.split_once(' ') else {
            return Err(ParseError::UnknownKind(text.to_string()));
        };
        let frame: fn(u64) -> Heartbeat = match kind {
            "ping" => Heartbeat::Ping,
            "pong" => Heartbeat::Pong,
            other => return Err(ParseError::UnknownKind(other.to_string())),
        };
        let micros = value.trim();
        micros
            .parse()
            .map(frame)
            .map_err(|_| ParseError::InvalidField {
                field: "heartbeat timestamp",
                value: micros.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_and_formats_frames() {
        assert_eq!("ping 0".parse::<Heartbeat>(), Ok(Heartbeat::Ping(0)));
        assert_eq!("pong 50000".parse::<Heartbeat>(), Ok(Heartbeat::Pong(50_000)));
        assert_eq!(Heartbeat::Ping(1_000_000).to_string(), "ping 1000000");
    }

    #[test_timeout::timeout]
    fn ping_reply_echoes_timestamp() {
        assert_eq!(Heartbeat::Ping(42).reply(), Some(Heartbeat::Pong(42)));
        assert_eq!(Heartbeat::Pong(42).reply(), None);
    }

    #[test_timeout::timeout]
    fn recognize_ignores_chat_text() {
        assert!(Heartbeat::recognize("hello there").is_none());
        assert!(Heartbeat::recognize("pinguins 3").is_none());
        assert!(matches!(Heartbeat::recognize("ping soon"), Some(Err(_))));
        assert_eq!(Heartbeat::recognize("pong 7"), Some(Ok(Heartbeat::Pong(7))));
    }

    #[test_timeout::timeout]
    fn kind_and_timestamp_need_a_space() {
        assert_eq!(
            "ping5".parse::<Heartbeat>(),
            Err(ParseError::UnknownKind("ping5".into()))
        );
        assert_eq!(
            "pings 5".parse::<Heartbeat>(),
            Err(ParseError::UnknownKind("pings".into()))
        );
        assert!(Heartbeat::recognize("ping5").is_none());
    }
}
