//! Session store used as the signaling relay
//!
//! A call is one document (`offer`, `answer`) with two append-only
//! subcollections of ICE candidate records. Both peers only ever see each
//! other through this store until the peer connection is up.
//!
//! Subscriptions deliver asynchronously and start with the current state:
//! a document subscription fires once with the current snapshot, a
//! collection subscription reports every existing record as added.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::webrtc::SessionDescription;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// Length of generated call identifiers
const CALL_ID_LEN: usize = 20;

/// Opaque call identifier generated by the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CALL_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Candidate subcollections of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subcollection {
    /// Written by the initiator, read by the responder
    OfferCandidates,
    /// Written by the responder, read by the initiator
    AnswerCandidates,
}

impl Subcollection {
    pub const ALL: [Subcollection; 2] = [
        Subcollection::AnswerCandidates,
        Subcollection::OfferCandidates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subcollection::OfferCandidates => "offerCandidates",
            Subcollection::AnswerCandidates => "answerCandidates",
        }
    }
}

impl std::fmt::Display for Subcollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call document contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

/// Single-field patch applied to a call document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallField {
    Offer(SessionDescription),
    Answer(SessionDescription),
}

impl CallField {
    pub fn name(&self) -> &'static str {
        match self {
            CallField::Offer(_) => "offer",
            CallField::Answer(_) => "answer",
        }
    }

    pub fn description(&self) -> &SessionDescription {
        match self {
            CallField::Offer(d) | CallField::Answer(d) => d,
        }
    }

    pub fn apply(self, document: &mut CallDocument) {
        match self {
            CallField::Offer(d) => document.offer = Some(d),
            CallField::Answer(d) => document.answer = Some(d),
        }
    }
}

/// How `set_field` treats a missing document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create the document if it does not exist
    Upsert,
    /// Fail with `SignalingWrite` if the document does not exist
    Update,
}

/// Reference to a stored candidate record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub call_id: CallId,
    pub collection: Subcollection,
    pub id: String,
}

/// Candidate record as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub reference: RecordRef,
    pub data: Value,
}

/// Receives document snapshots; `None` means the document does not exist
pub type SnapshotHandler = Box<dyn Fn(Option<CallDocument>) + Send + Sync>;
/// Receives records added to a subcollection
pub type RecordHandler = Box<dyn Fn(StoredRecord) + Send + Sync>;

/// Live subscription; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stop delivering events to the handler
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Document store relaying signaling messages between the two peers
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Allocate an identifier for a new call document
    ///
    /// Nothing is written: the document comes into existence on the first
    /// `set_field` with `WriteMode::Upsert`.
    async fn create_call_document(&self) -> Result<CallId>;

    /// Read a call document once
    async fn get_call_document(&self, call_id: &CallId) -> Result<Option<CallDocument>>;

    /// Set one field of a call document
    async fn set_field(&self, call_id: &CallId, field: CallField, mode: WriteMode) -> Result<()>;

    /// Subscribe to snapshots of a call document
    async fn subscribe_document(
        &self,
        call_id: &CallId,
        on_snapshot: SnapshotHandler,
    ) -> Result<Subscription>;

    /// Subscribe to records added to a subcollection
    async fn subscribe_collection_adds(
        &self,
        call_id: &CallId,
        collection: Subcollection,
        on_added: RecordHandler,
    ) -> Result<Subscription>;

    /// Append a record to a subcollection
    async fn append_record(
        &self,
        call_id: &CallId,
        collection: Subcollection,
        data: Value,
    ) -> Result<RecordRef>;

    /// List the records of a subcollection in insertion order
    async fn list_records(
        &self,
        call_id: &CallId,
        collection: Subcollection,
    ) -> Result<Vec<StoredRecord>>;

    /// Delete one record; deleting a missing record succeeds
    async fn delete_record(&self, reference: &RecordRef) -> Result<()>;

    /// Delete the call document; deleting a missing document succeeds
    async fn delete_document(&self, call_id: &CallId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_call_ids() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_eq!(a.as_str().len(), CALL_ID_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_subcollection_names() {
        assert_eq!(Subcollection::OfferCandidates.as_str(), "offerCandidates");
        assert_eq!(
            serde_json::to_value(Subcollection::AnswerCandidates).unwrap(),
            serde_json::Value::String(Subcollection::AnswerCandidates.to_string())
        );
    }

    #[test]
    fn test_call_field_apply() {
        let mut doc = CallDocument::default();
        CallField::Offer(SessionDescription::offer("v=0")).apply(&mut doc);
        assert_eq!(doc.offer, Some(SessionDescription::offer("v=0")));
        assert!(doc.answer.is_none());

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json, serde_json::json!({ "offer": { "type": "offer", "sdp": "v=0" } }));
    }

    #[test]
    fn test_subscription_drop_cancels() {
        let token = CancellationToken::new();
        let sub = Subscription::new(token.clone());
        assert!(!token.is_cancelled());
        drop(sub);
        assert!(token.is_cancelled());
    }
}
