//! Signalling messages exchanged out of band during negotiation.
//!
//! Messages are JSON, carried by whatever side channel the embedder has
//! (the loopback tests wire two connections' signal queues directly into
//! each other).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::socks::Endpoint;

/// Kinds of signalling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Offer,
    Answer,
    Candidate,
    NoMoreCandidates,
}

/// One side's proposed session: an identifier chosen at random plus the
/// address it intends to receive on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub session_id: u64,
    pub endpoint: Endpoint,
}

/// A candidate address the peer may be reachable at. Higher priority wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub endpoint: Endpoint,
    pub priority: u32,
}

/// A signalling message. `description` is set iff the type is OFFER or
/// ANSWER; `candidate` iff the type is CANDIDATE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
}

impl SignalMessage {
    pub fn offer(description: SessionDescription) -> Self {
        SignalMessage {
            signal_type: SignalType::Offer,
            description: Some(description),
            candidate: None,
        }
    }

    pub fn answer(description: SessionDescription) -> Self {
        SignalMessage {
            signal_type: SignalType::Answer,
            description: Some(description),
            candidate: None,
        }
    }

    pub fn candidate(candidate: Candidate) -> Self {
        SignalMessage {
            signal_type: SignalType::Candidate,
            description: None,
            candidate: Some(candidate),
        }
    }

    pub fn no_more_candidates() -> Self {
        SignalMessage {
            signal_type: SignalType::NoMoreCandidates,
            description: None,
            candidate: None,
        }
    }

    /// Check the type/payload pairing rules.
    pub fn validate(&self) -> Result<()> {
        let ok = match self.signal_type {
            SignalType::Offer | SignalType::Answer => {
                self.description.is_some() && self.candidate.is_none()
            }
            SignalType::Candidate => self.description.is_none() && self.candidate.is_some(),
            SignalType::NoMoreCandidates => {
                self.description.is_none() && self.candidate.is_none()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "signal payload does not match type {:?}",
                self.signal_type
            )))
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::protocol(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::malformed(e.to_string()))
    }
}

/// djb2, used to break simultaneous-offer ties by comparing serialized
/// descriptions.
pub(crate) fn string_hash(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> SessionDescription {
        SessionDescription {
            session_id: 7,
            endpoint: Endpoint::new("10.0.0.1", 9000),
        }
    }

    #[test]
    fn test_signal_json_shape() {
        let offer = SignalMessage::offer(description());
        let json = offer.to_json().unwrap();
        assert!(json.contains("\"type\":\"OFFER\""));
        assert!(!json.contains("candidate"));
        assert_eq!(SignalMessage::from_json(&json).unwrap(), offer);
    }

    #[test]
    fn test_signal_round_trip_all_types() {
        let messages = [
            SignalMessage::offer(description()),
            SignalMessage::answer(description()),
            SignalMessage::candidate(Candidate {
                endpoint: Endpoint::new("192.0.2.1", 3478),
                priority: 100,
            }),
            SignalMessage::no_more_candidates(),
        ];
        for message in &messages {
            message.validate().unwrap();
            let json = message.to_json().unwrap();
            assert_eq!(&SignalMessage::from_json(&json).unwrap(), message);
        }
    }

    #[test]
    fn test_signal_validate_rejects_mismatched_payload() {
        let mut bad = SignalMessage::no_more_candidates();
        bad.description = Some(description());
        assert!(bad.validate().is_err());

        let bad = SignalMessage {
            signal_type: SignalType::Candidate,
            description: None,
            candidate: None,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_string_hash_djb2() {
        // djb2 of the empty string is its seed.
        assert_eq!(string_hash(""), 5381);
        assert_ne!(string_hash("a"), string_hash("b"));
        assert_eq!(string_hash("abc"), string_hash("abc"));
    }
}
