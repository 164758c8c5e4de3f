use std::fmt;
use std::str::FromStr;

use crate::{IceCandidateAttribute, ParseError};

pub const DELIMITER: char = '~';

const OFFER: &str = "offer";
const ANSWER: &str = "answer";
const CANDIDATE: &str = "candidate";
const PEER_NULL: &str = "pcnull";

/// ICE candidate as exchanged over signaling: attribute line plus the
/// media stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub attribute: IceCandidateAttribute,
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
}

/// One signaling frame. Encoded as tilde-delimited text:
///
/// ```text
/// offer~<sdp>
/// answer~<sdp>
/// candidate~<candidate-attr-line>~<mid>~<mLineIndex>
/// pcnull~
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    /// The remote endpoint's engine no longer exists.
    PeerNull,
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Offer { .. } => OFFER,
            Envelope::Answer { .. } => ANSWER,
            Envelope::Candidate(_) => CANDIDATE,
            Envelope::PeerNull => PEER_NULL,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Envelope::Offer { sdp } => format!("{OFFER}{DELIMITER}{sdp}"),
            Envelope::Answer { sdp } => format!("{ANSWER}{DELIMITER}{sdp}"),
            Envelope::Candidate(candidate) => format!(
                "{CANDIDATE}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
                candidate.attribute, candidate.sdp_mid, candidate.sdp_mline_index
            ),
            Envelope::PeerNull => format!("{PEER_NULL}{DELIMITER}"),
        }
    }

    pub fn decode(frame: &str) -> Result<Self, ParseError> {
        if frame.is_empty() {
            return Err(ParseError::Empty);
        }

        let (kind, rest) = match frame.split_once(DELIMITER) {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (frame, None),
        };

        match kind {
            OFFER => Ok(Envelope::Offer {
                sdp: require_body(OFFER, rest)?.to_string(),
            }),
            ANSWER => Ok(Envelope::Answer {
                sdp: require_body(ANSWER, rest)?.to_string(),
            }),
            CANDIDATE => decode_candidate(require_body(CANDIDATE, rest)?).map(Envelope::Candidate),
            PEER_NULL => Ok(Envelope::PeerNull),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

fn require_body<'a>(kind: &'static str, rest: Option<&'a str>) -> Result<&'a str, ParseError> {
    rest.ok_or(ParseError::MissingFields {
        kind,
        expected: 2,
        actual: 1,
    })
}

fn decode_candidate(body: &str) -> Result<IceCandidate, ParseError> {
    let fields: Vec<&str> = body.split(DELIMITER).collect();
    if fields.len() < 3 {
        return Err(ParseError::MissingFields {
            kind: CANDIDATE,
            expected: 4,
            actual: fields.len() + 1,
        });
    }
    if fields.len() > 3 {
        return Err(ParseError::TrailingFields {
            kind: CANDIDATE,
            expected: 4,
            actual: fields.len() + 1,
        });
    }

    let attribute = IceCandidateAttribute::parse(fields[0])?;
    let index = fields[2].trim();
    let sdp_mline_index = index.parse().map_err(|_| ParseError::InvalidField {
        field: "mLineIndex",
        value: index.to_string(),
    })?;

    Ok(IceCandidate {
        attribute,
        sdp_mid: fields[1].to_string(),
        sdp_mline_index,
    })
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Envelope {
    type Err = ParseError;

    fn from_str(frame: &str) -> Result<Self, Self::Err> {
        Self::decode(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CandidateKind;

    fn candidate(foundation: &str, protocol: &str) -> IceCandidate {
        IceCandidate {
            attribute: IceCandidateAttribute::new(
                foundation,
                1,
                protocol,
                2130706431,
                "192.168.1.20",
                50000,
                CandidateKind::Host,
            )
            .unwrap(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        }
    }

    fn sample_candidate() -> IceCandidate {
        candidate("2130706431", "udp")
    }

    #[test_timeout::timeout]
    fn encodes_fixed_scheme() {
        assert_eq!(
            Envelope::Offer { sdp: "v=0\r\no=- 1 2 IN IP4 127.0.0.1".into() }.encode(),
            "offer~v=0\r\no=- 1 2 IN IP4 127.0.0.1"
        );
        assert_eq!(Envelope::Answer { sdp: "v=0".into() }.encode(), "answer~v=0");
        assert_eq!(
            Envelope::Candidate(sample_candidate()).encode(),
            "candidate~2130706431 1 udp 2130706431 192.168.1.20 50000 typ host~0~0"
        );
        assert_eq!(Envelope::PeerNull.encode(), "pcnull~");
    }

    #[test_timeout::timeout]
    fn decode_inverts_encode() {
        let envelopes = [
            Envelope::Offer { sdp: "v=0\r\ns=-\r\nt=0 0\r\n".into() },
            Envelope::Answer { sdp: "v=0\r\na=setup:active\r\n".into() },
            Envelope::Candidate(sample_candidate()),
            Envelope::Candidate(candidate("candidate:4", "UDP")),
            Envelope::Candidate(candidate("9", "Tcp")),
            Envelope::PeerNull,
        ];
        for envelope in envelopes {
            let decoded = Envelope::decode(&envelope.encode()).expect("decodes");
            assert_eq!(decoded, envelope);
        }
    }

    #[test_timeout::timeout]
    fn candidate_from_native_client_keeps_first_eight_tokens() {
        let frame = "candidate~candidate:1 1 UDP 2122260223 10.0.0.5 61000 typ host generation 0 ufrag abcd~audio~1";
        let Envelope::Candidate(candidate) = Envelope::decode(frame).unwrap() else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.attribute.foundation(), "1");
        assert_eq!(candidate.attribute.protocol(), "UDP");
        assert_eq!(candidate.sdp_mid, "audio");
        assert_eq!(candidate.sdp_mline_index, 1);
    }

    #[test_timeout::timeout]
    fn short_frames_are_parse_failures() {
        assert_eq!(Envelope::decode(""), Err(ParseError::Empty));
        assert!(matches!(
            Envelope::decode("offer"),
            Err(ParseError::MissingFields { kind: "offer", .. })
        ));
        assert!(matches!(
            Envelope::decode("candidate~1 1 udp 1 10.0.0.1 9 typ host~0"),
            Err(ParseError::MissingFields { kind: "candidate", expected: 4, actual: 3 })
        ));
        assert_eq!(
            Envelope::decode("candidate~1 1 udp 1 10.0.0.1 9 typ host~0~0~junk"),
            Err(ParseError::TrailingFields { kind: "candidate", expected: 4, actual: 5 })
        );
        assert!(matches!(
            Envelope::decode("candidate~1 1 udp~0~0"),
            Err(ParseError::ShortCandidate(3))
        ));
        assert!(matches!(
            Envelope::decode("candidate~1 1 udp 1 10.0.0.1 9 typ host~0~first"),
            Err(ParseError::InvalidField { field: "mLineIndex", .. })
        ));
        assert_eq!(
            Envelope::decode("hello~world"),
            Err(ParseError::UnknownKind("hello".into()))
        );
    }

    #[test_timeout::timeout]
    fn peer_null_tolerates_missing_delimiter() {
        assert_eq!(Envelope::decode("pcnull"), Ok(Envelope::PeerNull));
        assert_eq!(Envelope::decode("pcnull~"), Ok(Envelope::PeerNull));
    }
}
