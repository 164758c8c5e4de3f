use std::fmt;
use std::str::FromStr;

use crate::ParseError;

const SIGNIFICANT_TOKENS: usize = 8;
const CANDIDATE_PREFIX: &str = "candidate:";

/// ICE candidate type as carried after the `typ` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::Srflx => "srflx",
            CandidateKind::Prflx => "prflx",
            CandidateKind::Relay => "relay",
        }
    }
}

impl FromStr for CandidateKind {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "host" => Ok(CandidateKind::Host),
            "srflx" => Ok(CandidateKind::Srflx),
            "prflx" => Ok(CandidateKind::Prflx),
            "relay" => Ok(CandidateKind::Relay),
            other => Err(ParseError::InvalidField {
                field: "candidate type",
                value: other.to_string(),
            }),
        }
    }
}

/// The significant part of an ICE candidate line:
/// `<foundation> <component> <protocol> <priority> <address> <port> typ <type>`.
///
/// Anything after the eighth token (`raddr`, `rport`, `generation`, ...) is
/// dropped on parse. Values are only built through [`parse`](Self::parse)
/// or [`new`](Self::new), so every attribute formats back to a line that
/// parses to the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidateAttribute {
    foundation: String,
    component: u16,
    protocol: String,
    priority: u32,
    address: String,
    port: u16,
    kind: CandidateKind,
}

impl IceCandidateAttribute {
    /// Builds an attribute from its fields. A `candidate:` prefix on the
    /// foundation is stripped; fields containing whitespace are rejected.
    pub fn new(
        foundation: &str,
        component: u16,
        protocol: &str,
        priority: u32,
        address: &str,
        port: u16,
        kind: CandidateKind,
    ) -> Result<Self, ParseError> {
        let foundation = foundation.strip_prefix(CANDIDATE_PREFIX).unwrap_or(foundation);
        Ok(Self {
            foundation: single_token("foundation", foundation)?,
            component,
            protocol: single_token("protocol", protocol)?,
            priority,
            address: single_token("address", address)?,
            port,
            kind,
        })
    }

    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().take(SIGNIFICANT_TOKENS).collect();
        if tokens.len() < SIGNIFICANT_TOKENS {
            return Err(ParseError::ShortCandidate(tokens.len()));
        }
        if tokens[6] != "typ" {
            return Err(ParseError::InvalidField {
                field: "typ keyword",
                value: tokens[6].to_string(),
            });
        }

        Self::new(
            tokens[0],
            parse_number("component", tokens[1])?,
            tokens[2],
            parse_number("priority", tokens[3])?,
            tokens[4],
            parse_number("port", tokens[5])?,
            tokens[7].parse()?,
        )
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    /// Transport as written on the line (`udp`, `UDP`, `tcp`, ...).
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn is_udp(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("udp")
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    /// Candidate line in the form negotiation engines accept (`candidate:` prefixed).
    pub fn to_sdp_attribute(&self) -> String {
        format!("{CANDIDATE_PREFIX}{self}")
    }
}

impl fmt::Display for IceCandidateAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.kind.as_str()
        )
    }
}

impl FromStr for IceCandidateAttribute {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Self::parse(line)
    }
}

fn single_token(field: &'static str, value: &str) -> Result<String, ParseError> {
    if value.is_empty() || value.contains(char::is_whitespace) {
        return Err(ParseError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_browser_candidate_and_ignores_trailing_tokens() {
        let line = "candidate:842163049 1 udp 1677729535 203.0.113.7 54321 typ srflx raddr 10.0.0.2 rport 54321 generation 0";
        let attr = IceCandidateAttribute::parse(line).expect("valid candidate");
        assert_eq!(attr.foundation(), "842163049");
        assert_eq!(attr.component(), 1);
        assert_eq!(attr.protocol(), "udp");
        assert_eq!(attr.priority(), 1677729535);
        assert_eq!(attr.address(), "203.0.113.7");
        assert_eq!(attr.port(), 54321);
        assert_eq!(attr.kind(), CandidateKind::Srflx);
        assert_eq!(
            attr.to_string(),
            "842163049 1 udp 1677729535 203.0.113.7 54321 typ srflx"
        );
    }

    #[test_timeout::timeout]
    fn rejects_short_lines() {
        let err = IceCandidateAttribute::parse("1 1 udp 2130706431 10.0.0.2 9").unwrap_err();
        assert_eq!(err, ParseError::ShortCandidate(6));
    }

    #[test_timeout::timeout]
    fn rejects_bad_numbers_and_keywords() {
        let err = IceCandidateAttribute::parse("1 one udp 1 10.0.0.2 9 typ host").unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "component", .. }));

        let err = IceCandidateAttribute::parse("1 1 udp 1 10.0.0.2 9 type host").unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "typ keyword", .. }));

        let err = IceCandidateAttribute::parse("1 1 udp 1 10.0.0.2 9 typ mystery").unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "candidate type", .. }));
    }

    #[test_timeout::timeout]
    fn sdp_attribute_carries_prefix() {
        let attr = IceCandidateAttribute::parse("4 1 tcp 1518280447 192.168.1.4 9 typ host").unwrap();
        assert_eq!(
            attr.to_sdp_attribute(),
            "candidate:4 1 tcp 1518280447 192.168.1.4 9 typ host"
        );
    }

    #[test_timeout::timeout]
    fn protocol_case_survives_formatting() {
        let attr = IceCandidateAttribute::parse("1 1 UDP 1 10.0.0.1 9 typ host").unwrap();
        assert_eq!(attr.protocol(), "UDP");
        assert!(attr.is_udp());
        assert_eq!(attr.to_string(), "1 1 UDP 1 10.0.0.1 9 typ host");
        assert_eq!(IceCandidateAttribute::parse(&attr.to_string()), Ok(attr));
    }

    #[test_timeout::timeout]
    fn constructor_normalizes_and_validates() {
        let attr = IceCandidateAttribute::new(
            "candidate:7",
            1,
            "TCP",
            1518280447,
            "192.168.1.4",
            9,
            CandidateKind::Host,
        )
        .unwrap();
        assert_eq!(attr.foundation(), "7");
        assert_eq!(IceCandidateAttribute::parse(&attr.to_string()), Ok(attr));

        let err = IceCandidateAttribute::new("7", 1, "udp", 1, "10.0.0.1 x", 9, CandidateKind::Host)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "address", .. }));
        let err = IceCandidateAttribute::new("candidate:", 1, "udp", 1, "10.0.0.1", 9, CandidateKind::Host)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "foundation", .. }));
    }
}
