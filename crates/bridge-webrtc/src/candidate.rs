use bridge_proto::{IceCandidate, IceCandidateAttribute, ParseError};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

pub fn candidate_from_init(init: &RTCIceCandidateInit) -> Result<IceCandidate, ParseError> {
    Ok(IceCandidate {
        attribute: IceCandidateAttribute::parse(&init.candidate)?,
        sdp_mid: init.sdp_mid.clone().unwrap_or_else(|| "0".to_string()),
        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
    })
}

pub fn candidate_to_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.attribute.to_sdp_attribute(),
        sdp_mid: Some(candidate.sdp_mid.clone()),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        username_fragment: None,
    }
}
