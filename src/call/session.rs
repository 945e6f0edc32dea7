//! Per-call session state
//!
//! A `CallSession` owns everything one call attempt allocated: the peer
//! connection, the local media, the store subscriptions and the negotiation
//! bookkeeping. Remote candidates are only handed to the engine once the
//! remote description has been applied; anything that arrives earlier is
//! buffered and flushed in arrival order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::Role;
use crate::error::{AppError, Result};
use crate::store::{CallDocument, CallId, Subcollection, Subscription};
use crate::webrtc::{
    ConnectionState, IceCandidate, LocalMedia, PeerConnection, RemoteTrack, SessionDescription,
};

/// Inputs processed by the session driver, one at a time
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Call document snapshot from the store
    Snapshot(Option<CallDocument>),
    /// Candidate record added by the remote peer
    RemoteCandidate { record_id: String, data: serde_json::Value },
    /// Candidate gathered by the local engine
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
}

/// What happened to an incoming remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateOutcome {
    Applied,
    Buffered,
    Duplicate,
}

#[derive(Default)]
struct Negotiation {
    remote_applied: bool,
    pending: Vec<IceCandidate>,
    seen: HashSet<String>,
}

pub(crate) struct CallSession {
    pub session_id: String,
    pub role: Role,
    pub call_id: CallId,
    pub connection: Arc<dyn PeerConnection>,
    pub media: LocalMedia,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    subscriptions: Mutex<Vec<Subscription>>,
    remote_tracks: Mutex<Vec<RemoteTrack>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    local_committed: AtomicBool,
    published: AtomicBool,
}

impl CallSession {
    pub fn new(
        session_id: String,
        role: Role,
        call_id: CallId,
        connection: Arc<dyn PeerConnection>,
        media: LocalMedia,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            session_id,
            role,
            call_id,
            connection,
            media,
            events_tx,
            negotiation: tokio::sync::Mutex::new(Negotiation::default()),
            subscriptions: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            local_committed: AtomicBool::new(false),
            published: AtomicBool::new(false),
        }
    }

    /// Subcollection local candidates are appended to
    pub fn local_collection(&self) -> Subcollection {
        self.role.local_collection()
    }

    /// Subcollection the peer's candidates are read from
    pub fn remote_collection(&self) -> Subcollection {
        self.role.remote_collection()
    }

    /// Sender feeding the session driver
    pub fn sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Apply the remote description, then flush buffered candidates
    ///
    /// Returns `Ok(false)` if a remote description was already applied;
    /// the engine is not touched in that case.
    pub async fn apply_remote_description(&self, description: SessionDescription) -> Result<bool> {
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.remote_applied {
            return Ok(false);
        }

        self.connection.set_remote_description(description).await?;
        negotiation.remote_applied = true;

        let pending = std::mem::take(&mut negotiation.pending);
        if !pending.is_empty() {
            debug!(
                "Session {} flushing {} buffered candidates",
                self.session_id,
                pending.len()
            );
        }
        for candidate in pending {
            if let Err(e) = self.connection.add_remote_candidate(candidate).await {
                warn!("Session {} rejected buffered candidate: {}", self.session_id, e);
            }
        }

        Ok(true)
    }

    /// Hand a remote candidate to the engine, buffering it if needed
    ///
    /// Records are deduplicated by store record id so a replayed add is
    /// never applied twice.
    pub async fn on_remote_candidate(
        &self,
        record_id: &str,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome> {
        let mut negotiation = self.negotiation.lock().await;
        if !negotiation.seen.insert(record_id.to_string()) {
            return Ok(CandidateOutcome::Duplicate);
        }

        if !negotiation.remote_applied {
            negotiation.pending.push(candidate);
            return Ok(CandidateOutcome::Buffered);
        }

        self.connection.add_remote_candidate(candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    /// Keep a subscription alive for the lifetime of the session
    ///
    /// A subscription added after the session closed is cancelled at once.
    pub fn add_subscription(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions.lock();
        if self.is_closed() {
            subscription.unsubscribe();
            return;
        }
        subscriptions.push(subscription);
    }

    pub fn add_remote_track(&self, track: RemoteTrack) {
        self.remote_tracks.lock().push(track);
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.remote_tracks.lock().clone()
    }

    /// Mark the local description as committed to the engine
    pub fn mark_local_committed(&self) {
        self.local_committed.store(true, Ordering::SeqCst);
    }

    pub fn local_committed(&self) -> bool {
        self.local_committed.load(Ordering::SeqCst)
    }

    /// Mark the local description as written to the call document
    pub fn mark_published(&self) {
        self.published.store(true, Ordering::SeqCst);
    }

    pub fn published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` once the session was closed
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Mark the session closed; only the first caller gets `true`
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Resolves once the session driver should stop
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Stop the driver, drop subscriptions and close the connection
    pub async fn release(&self) {
        self.cancel.cancel();

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }

        if let Err(e) = self.connection.close().await {
            warn!("Session {} failed to close peer connection: {}", self.session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::{EngineOp, MockEngine};
    use crate::webrtc::{PeerEngine, WebRtcConfig};

    async fn session(engine: &MockEngine, role: Role) -> CallSession {
        let connection = engine
            .create_connection(&WebRtcConfig::default(), "test-session")
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        CallSession::new(
            "test-session".to_string(),
            role,
            CallId::from("call-1"),
            connection,
            LocalMedia {
                stream_id: "stream".to_string(),
                tracks: Vec::new(),
            },
            tx,
        )
    }

    #[tokio::test]
    async fn test_early_candidates_flushed_after_remote_description() {
        let engine = MockEngine::default();
        let session = session(&engine, Role::Initiator).await;

        let c1 = IceCandidate::new("candidate:1").with_mid("0", 0);
        let c2 = IceCandidate::new("candidate:2").with_mid("0", 0);
        assert_eq!(
            session.on_remote_candidate("r1", c1.clone()).await.unwrap(),
            CandidateOutcome::Buffered
        );
        assert_eq!(
            session.on_remote_candidate("r2", c2.clone()).await.unwrap(),
            CandidateOutcome::Buffered
        );
        assert!(engine.last_connection().applied_candidates().is_empty());

        let answer = SessionDescription::answer("v=0\r\n");
        assert!(session.apply_remote_description(answer.clone()).await.unwrap());

        assert_eq!(
            engine.last_connection().ops(),
            vec![
                EngineOp::SetRemote(answer),
                EngineOp::AddCandidate(c1),
                EngineOp::AddCandidate(c2),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_record_ignored() {
        let engine = MockEngine::default();
        let session = session(&engine, Role::Responder).await;
        session
            .apply_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();

        let candidate = IceCandidate::new("candidate:1");
        assert_eq!(
            session.on_remote_candidate("r1", candidate.clone()).await.unwrap(),
            CandidateOutcome::Applied
        );
        assert_eq!(
            session.on_remote_candidate("r1", candidate).await.unwrap(),
            CandidateOutcome::Duplicate
        );
        assert_eq!(engine.last_connection().applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_description_applied_once() {
        let engine = MockEngine::default();
        let session = session(&engine, Role::Initiator).await;
        let answer = SessionDescription::answer("v=0\r\n");

        assert!(session.apply_remote_description(answer.clone()).await.unwrap());
        assert!(!session.apply_remote_description(answer).await.unwrap());
        assert_eq!(engine.last_connection().remote_descriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_remote_description_keeps_buffering() {
        let engine = MockEngine::default();
        let session = session(&engine, Role::Initiator).await;
        engine.last_connection().fail_remote_description(true);

        let result = session
            .apply_remote_description(SessionDescription::answer("garbage"))
            .await;
        assert!(matches!(result, Err(AppError::WebRtcError(_))));
        assert!(engine.last_connection().remote_descriptions().is_empty());
        assert_eq!(
            session
                .on_remote_candidate("r1", IceCandidate::new("candidate:1"))
                .await
                .unwrap(),
            CandidateOutcome::Buffered
        );
    }

    #[tokio::test]
    async fn test_closed_session_rejects_subscriptions() {
        let engine = MockEngine::default();
        let session = session(&engine, Role::Initiator).await;
        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        assert!(matches!(session.ensure_open(), Err(AppError::Cancelled)));

        let token = CancellationToken::new();
        session.add_subscription(Subscription::new(token.clone()));
        assert!(token.is_cancelled());

        session.release().await;
        assert_eq!(
            engine.last_connection().ops().last(),
            Some(&EngineOp::Close)
        );
    }
}
