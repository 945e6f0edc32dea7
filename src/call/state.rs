//! Call roles and signaling states

use serde::{Deserialize, Serialize};

use crate::store::Subcollection;

/// Local role in a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Created the call and publishes the offer
    Initiator,
    /// Joined the call and publishes the answer
    Responder,
}

impl Role {
    /// Subcollection this role appends its own candidates to
    pub fn local_collection(&self) -> Subcollection {
        match self {
            Role::Initiator => Subcollection::OfferCandidates,
            Role::Responder => Subcollection::AnswerCandidates,
        }
    }

    /// Subcollection this role reads the peer's candidates from
    pub fn remote_collection(&self) -> Subcollection {
        match self {
            Role::Initiator => Subcollection::AnswerCandidates,
            Role::Responder => Subcollection::OfferCandidates,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Signaling state of the current call attempt
///
/// ```text
/// Idle -> AcquiringMedia -> ConnectionCreated
///   (initiator) -> OfferPublished -> AwaitingAnswer -> Connected -> Closed
///   (responder) -> OfferConsumed -> AnswerPublished -> Connected -> Closed
/// any state -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    AcquiringMedia,
    ConnectionCreated,
    OfferPublished,
    AwaitingAnswer,
    OfferConsumed,
    AnswerPublished,
    Connected,
    Closed,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::AcquiringMedia => "acquiring_media",
            CallState::ConnectionCreated => "connection_created",
            CallState::OfferPublished => "offer_published",
            CallState::AwaitingAnswer => "awaiting_answer",
            CallState::OfferConsumed => "offer_consumed",
            CallState::AnswerPublished => "answer_published",
            CallState::Connected => "connected",
            CallState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_collections_are_disjoint() {
        for role in [Role::Initiator, Role::Responder] {
            assert_ne!(role.local_collection(), role.remote_collection());
        }
        assert_eq!(
            Role::Initiator.local_collection(),
            Role::Responder.remote_collection()
        );
        assert_eq!(
            Role::Responder.local_collection(),
            Role::Initiator.remote_collection()
        );
    }

    #[test]
    fn test_state_display_matches_serde() {
        let state = CallState::AwaitingAnswer;
        assert_eq!(
            serde_json::to_value(state).unwrap(),
            serde_json::Value::String(state.to_string())
        );
    }
}
