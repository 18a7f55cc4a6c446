use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Authenticated identity of a connected peer, taken from the credential subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the identity is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether a peer publishes media (producer) or receives it (consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    /// Accepts the role names as well as the legacy numeric form used by
    /// older browser clients ("1" = producer, "0" = consumer).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "producer" | "sender" | "1" => Ok(Role::Producer),
            "consumer" | "receiver" | "0" => Ok(Role::Consumer),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Kinds of signaling messages the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

/// SDP carried by offers and answers. Browsers put it under the `offer` key
/// for both kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SignalKind>,
    #[serde(default)]
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Addressing block. `sender` is always rewritten by the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Identity>,
}

/// A single offer/answer/candidate message as exchanged over the socket.
///
/// Unknown fields (such as the `token` browsers echo back) are accepted on
/// input and never forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(rename = "offer", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub user_message: Routing,
}

impl SignalingEnvelope {
    /// Target named by the client, if any. Blank targets count as absent.
    pub fn requested_target(&self) -> Option<&Identity> {
        self.user_message
            .target
            .as_ref()
            .filter(|target| !target.is_blank())
    }

    /// Rewrites addressing with server-side values before forwarding.
    pub fn stamp(&mut self, sender: Identity, target: Identity) {
        self.user_message.sender = Some(sender);
        self.user_message.target = Some(target);
        if let Some(description) = self.description.as_mut() {
            description.kind = Some(self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn role_parses_names_and_legacy_digits() {
        assert_eq!("producer".parse::<Role>(), Ok(Role::Producer));
        assert_eq!("1".parse::<Role>(), Ok(Role::Producer));
        assert_eq!("Consumer".parse::<Role>(), Ok(Role::Consumer));
        assert_eq!("0".parse::<Role>(), Ok(Role::Consumer));
        assert!("admin".parse::<Role>().is_err());
    }

    #[test_timeout::timeout]
    fn parses_browser_candidate_and_drops_token() {
        let raw = r#"{
            "type": "candidate",
            "token": "secret",
            "candidate": {
                "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            },
            "userMessage": {"target": "42", "sender": "spoofed"}
        }"#;
        let envelope: SignalingEnvelope = serde_json::from_str(raw).expect("parse");
        assert_eq!(envelope.kind, SignalKind::Candidate);
        assert_eq!(envelope.requested_target(), Some(&Identity::from("42")));
        let candidate = envelope.candidate.as_ref().expect("candidate");
        assert_eq!(candidate.sdp_mline_index, Some(0));

        let encoded = serde_json::to_value(&envelope).expect("encode");
        assert!(encoded.get("token").is_none());
        assert_eq!(encoded["candidate"]["sdpMid"], "0");
    }

    #[test_timeout::timeout]
    fn stamp_overwrites_sender_and_types_description() {
        let raw = r#"{
            "type": "answer",
            "offer": {"sdp": "v=0"},
            "userMessage": {"target": "a", "sender": "mallory"}
        }"#;
        let mut envelope: SignalingEnvelope = serde_json::from_str(raw).expect("parse");
        envelope.stamp(Identity::from("b"), Identity::from("a"));

        let encoded = serde_json::to_value(&envelope).expect("encode");
        assert_eq!(encoded["userMessage"]["sender"], "b");
        assert_eq!(encoded["userMessage"]["target"], "a");
        assert_eq!(encoded["offer"]["type"], "answer");
        assert_eq!(encoded["offer"]["sdp"], "v=0");
    }

    #[test_timeout::timeout]
    fn blank_target_is_treated_as_missing() {
        let raw = r#"{"type":"answer","userMessage":{"target":"  "}}"#;
        let envelope: SignalingEnvelope = serde_json::from_str(raw).expect("parse");
        assert!(envelope.requested_target().is_none());
    }

    #[test_timeout::timeout]
    fn blank_identities() {
        assert!(Identity::from("").is_blank());
        assert!(Identity::from(" \t\n").is_blank());
        assert!(!Identity::from(" 42 ").is_blank());
        assert_eq!(Identity::from(" 42 ").as_str(), " 42 ");
    }

    #[test_timeout::timeout]
    fn rejects_unknown_type() {
        let raw = r#"{"type":"renegotiate"}"#;
        assert!(serde_json::from_str::<SignalingEnvelope>(raw).is_err());
    }
}
