use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-side classification of a connection, declared by the `type`
/// query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerClass {
    /// `type=u`
    Native,
    /// `type=w`
    Web,
    /// Any other value. Registered but never a fan-out target.
    Unclassified,
}

impl PeerClass {
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("u") => PeerClass::Native,
            Some("w") => PeerClass::Web,
            _ => PeerClass::Unclassified,
        }
    }

    /// Query parameter value for this class; `None` for unclassified.
    pub fn as_param(&self) -> Option<&'static str> {
        match self {
            PeerClass::Native => Some("u"),
            PeerClass::Web => Some("w"),
            PeerClass::Unclassified => None,
        }
    }

    /// Class whose connections receive frames sent by this class.
    ///
    /// Unclassified senders are treated like the web side, so their frames
    /// reach native connections.
    pub fn fan_out_target(&self) -> PeerClass {
        match self {
            PeerClass::Native => PeerClass::Web,
            PeerClass::Web | PeerClass::Unclassified => PeerClass::Native,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PeerClass::Native => "native",
            PeerClass::Web => "web",
            PeerClass::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for PeerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn classifies_type_parameter() {
        assert_eq!(PeerClass::from_param(Some("u")), PeerClass::Native);
        assert_eq!(PeerClass::from_param(Some("w")), PeerClass::Web);
        assert_eq!(PeerClass::from_param(Some("x")), PeerClass::Unclassified);
        assert_eq!(PeerClass::from_param(Some("")), PeerClass::Unclassified);
        assert_eq!(PeerClass::from_param(None), PeerClass::Unclassified);
    }

    #[test_timeout::timeout]
    fn fan_out_never_targets_unclassified() {
        for class in [PeerClass::Native, PeerClass::Web, PeerClass::Unclassified] {
            assert_ne!(class.fan_out_target(), PeerClass::Unclassified);
            assert_ne!(class.fan_out_target(), class);
        }
    }

    #[test_timeout::timeout]
    fn serializes_as_label() {
        let value = serde_json::to_value(PeerClass::Native).unwrap();
        assert_eq!(value, serde_json::json!("native"));
    }
}
