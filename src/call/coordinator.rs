//! Call coordinator
//!
//! Drives one call at a time through offer/answer negotiation, relaying
//! session descriptions and ICE candidates through the session store.
//!
//! Engine callbacks and store subscriptions never touch session state
//! directly. They enqueue a `SessionEvent` and a per-call driver task
//! processes the queue one event at a time, so an answer snapshot, a
//! remote candidate and a state change are never handled concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::session::{CallSession, CandidateOutcome, SessionEvent};
use super::state::{CallState, Role};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::events::{CallEvent, EventBus};
use crate::store::{CallDocument, CallField, CallId, SessionStore, Subcollection, WriteMode};
use crate::webrtc::{
    ConnectionState, IceCandidate, MediaConstraints, MediaSource, PeerEngine, RemoteTrack,
    WebRtcConfig,
};

/// Build the link a responder opens to join `call_id`
pub fn invite_url(origin: &str, call_id: &CallId) -> String {
    format!("{}/join/{}", origin.trim_end_matches('/'), call_id)
}

/// Settings the coordinator hands to the engine and media source
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub webrtc: WebRtcConfig,
    pub media: MediaConstraints,
}

impl From<&AppConfig> for CoordinatorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            webrtc: config.webrtc.clone(),
            media: config.media,
        }
    }
}

enum Slot {
    Empty,
    /// Media or connection setup in progress
    Starting { attempt: u64, role: Role },
    Active(Arc<CallSession>),
}

/// Which store state a teardown removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    /// Nothing was written
    Nothing,
    /// Only the records this side appended
    Records(Subcollection),
    /// Both subcollections, then the call document. Used by the
    /// initiator and by a responder whose answer already reached the
    /// document.
    Call,
}

#[derive(Debug, Default, Clone, Copy)]
struct TeardownReport {
    attempted: usize,
    failed: usize,
}

struct Inner {
    store: Arc<dyn SessionStore>,
    engine: Arc<dyn PeerEngine>,
    media: Arc<dyn MediaSource>,
    config: CoordinatorConfig,
    events: Arc<EventBus>,
    slot: Mutex<Slot>,
    attempts: AtomicU64,
    state_tx: watch::Sender<CallState>,
    webcam_tx: watch::Sender<bool>,
}

/// Two-party call coordinator
///
/// At most one call is active at a time. Cloning yields another handle to
/// the same coordinator.
#[derive(Clone)]
pub struct CallCoordinator {
    inner: Arc<Inner>,
}

impl CallCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        engine: Arc<dyn PeerEngine>,
        media: Arc<dyn MediaSource>,
        config: CoordinatorConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let (state_tx, _) = watch::channel(CallState::Idle);
        let (webcam_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                store,
                engine,
                media,
                config,
                events,
                slot: Mutex::new(Slot::Empty),
                attempts: AtomicU64::new(0),
                state_tx,
                webcam_tx,
            }),
        }
    }

    /// Start a call as initiator
    ///
    /// Acquires local media, publishes the offer and starts listening for
    /// the answer and the responder's candidates. Returns the id the
    /// responder needs to join.
    pub async fn create_call(&self) -> Result<CallId> {
        let inner = &self.inner;
        let attempt = inner.begin(Role::Initiator)?;

        let call_id = match inner.store.create_call_document().await {
            Ok(call_id) => call_id,
            Err(e) => {
                inner.abort_begin(attempt);
                return Err(e);
            }
        };

        let session = inner
            .setup_session(attempt, Role::Initiator, call_id.clone())
            .await?;

        match inner.publish_offer(&session).await {
            Ok(()) => {
                info!("Call {} created, awaiting answer", call_id);
                Ok(call_id)
            }
            Err(e) => {
                inner.fail(&session, &e).await;
                Err(cancelled_or(&session, e))
            }
        }
    }

    /// Join an existing call as responder
    pub async fn join_call(&self, call_id: &CallId) -> Result<()> {
        let inner = &self.inner;
        let attempt = inner.begin(Role::Responder)?;

        let session = inner
            .setup_session(attempt, Role::Responder, call_id.clone())
            .await?;

        match inner.answer_offer(&session).await {
            Ok(()) => {
                info!("Joined call {}", call_id);
                Ok(())
            }
            Err(e) => {
                inner.fail(&session, &e).await;
                Err(cancelled_or(&session, e))
            }
        }
    }

    /// End the current call
    ///
    /// Closes the peer connection, releases media and deletes the call's
    /// records and document. Every deletion is attempted even if an earlier
    /// one fails; `AppError::Teardown` reports how many failed. Calling this
    /// without a call in progress is a no-op.
    pub async fn hang_up(&self) -> Result<()> {
        let inner = &self.inner;
        let current = {
            let mut slot = inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Active(session) => Some(session),
                Slot::Starting { role, .. } => {
                    info!("Abandoning {} call setup", role);
                    inner.webcam_tx.send_replace(false);
                    inner.publish_state(None, role, CallState::Closed);
                    None
                }
                Slot::Empty => None,
            }
        };

        let Some(session) = current else {
            return Ok(());
        };

        match inner.teardown(&session, Cleanup::Call).await {
            Some(report) if report.failed > 0 => Err(AppError::Teardown {
                failed: report.failed,
                attempted: report.attempted,
            }),
            _ => Ok(()),
        }
    }

    pub fn state(&self) -> CallState {
        *self.inner.state_tx.borrow()
    }

    /// Watch signaling state changes
    pub fn state_watch(&self) -> watch::Receiver<CallState> {
        self.inner.state_tx.subscribe()
    }

    /// Watch whether local media is live
    pub fn webcam_active(&self) -> watch::Receiver<bool> {
        self.inner.webcam_tx.subscribe()
    }

    /// Role of the call in progress, if any
    pub fn role(&self) -> Option<Role> {
        match &*self.inner.slot.lock() {
            Slot::Empty => None,
            Slot::Starting { role, .. } => Some(*role),
            Slot::Active(session) => Some(session.role),
        }
    }

    pub fn call_id(&self) -> Option<CallId> {
        match &*self.inner.slot.lock() {
            Slot::Active(session) => Some(session.call_id.clone()),
            _ => None,
        }
    }

    /// Tracks the remote peer added to the current call
    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        match &*self.inner.slot.lock() {
            Slot::Active(session) => session.remote_tracks(),
            _ => Vec::new(),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }
}

/// A setup step that failed because the call was hung up reports `Cancelled`
fn cancelled_or(session: &CallSession, error: AppError) -> AppError {
    if session.is_closed() && !matches!(error, AppError::Cancelled) {
        debug!("Call {} hung up during setup: {}", session.call_id, error);
        AppError::Cancelled
    } else {
        error
    }
}

impl Inner {
    /// Claim the call slot for a new attempt
    fn begin(&self, role: Role) -> Result<u64> {
        let attempt = {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Empty) {
                return Err(AppError::CallActive);
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = Slot::Starting { attempt, role };
            attempt
        };

        self.publish_state(None, role, CallState::AcquiringMedia);
        Ok(attempt)
    }

    /// Release the slot after a failed setup, unless a hang-up already did
    fn abort_begin(&self, attempt: u64) {
        let role = {
            let mut slot = self.slot.lock();
            match *slot {
                Slot::Starting { attempt: current, role } if current == attempt => {
                    *slot = Slot::Empty;
                    role
                }
                _ => return,
            }
        };
        self.publish_state(None, role, CallState::Closed);
    }

    /// Acquire media, create the connection and install the session
    async fn setup_session(
        self: &Arc<Self>,
        attempt: u64,
        role: Role,
        call_id: CallId,
    ) -> Result<Arc<CallSession>> {
        let media = match self.media.acquire(&self.config.media).await {
            Ok(media) => media,
            Err(e) => {
                warn!("Failed to acquire local media: {}", e);
                self.abort_begin(attempt);
                return Err(match e {
                    AppError::MediaAcquisition(_) => e,
                    other => AppError::MediaAcquisition(other.to_string()),
                });
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let connection = match self
            .engine
            .create_connection(&self.config.webrtc, &session_id)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.media.release(&media);
                self.abort_begin(attempt);
                return Err(e);
            }
        };

        for track in &media.tracks {
            if let Err(e) = connection.add_local_track(track, &media.stream_id).await {
                let _ = connection.close().await;
                self.media.release(&media);
                self.abort_begin(attempt);
                return Err(e);
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        connection.on_local_candidate(Box::new(move |candidate| {
            let _ = tx.send(SessionEvent::LocalCandidate(candidate));
        }));
        let tx = events_tx.clone();
        connection.on_connection_state_change(Box::new(move |state| {
            let _ = tx.send(SessionEvent::ConnectionState(state));
        }));
        let tx = events_tx.clone();
        connection.on_remote_track(Box::new(move |track| {
            let _ = tx.send(SessionEvent::RemoteTrack(track));
        }));

        let session = Arc::new(CallSession::new(
            session_id,
            role,
            call_id,
            connection,
            media,
            events_tx,
        ));

        let installed = {
            let mut slot = self.slot.lock();
            match *slot {
                Slot::Starting { attempt: current, .. } if current == attempt => {
                    *slot = Slot::Active(session.clone());
                    true
                }
                _ => false,
            }
        };
        if !installed {
            info!("Call setup for {} cancelled", session.call_id);
            session.mark_closed();
            session.release().await;
            self.media.release(&session.media);
            return Err(AppError::Cancelled);
        }

        self.webcam_tx.send_replace(true);
        self.events.publish(CallEvent::WebcamActive { active: true });
        debug!(
            "Session {} created for call {} as {}",
            session.session_id, session.call_id, role
        );

        tokio::spawn(self.clone().drive(session.clone(), events_rx));
        self.advance(&session, CallState::ConnectionCreated);

        Ok(session)
    }

    /// Initiator: create and persist the offer, then listen for the answer
    async fn publish_offer(self: &Arc<Self>, session: &Arc<CallSession>) -> Result<()> {
        let offer = session.connection.create_offer().await?;
        session.connection.set_local_description(offer.clone()).await?;
        session.mark_local_committed();

        session.ensure_open()?;
        self.store
            .set_field(&session.call_id, CallField::Offer(offer), WriteMode::Upsert)
            .await?;

        if session.is_closed() {
            // Hung up while the write was in flight; the teardown may have
            // run before the document existed.
            self.cleanup_store(&session.call_id, Cleanup::Call).await;
            return Err(AppError::Cancelled);
        }
        self.advance(session, CallState::OfferPublished);

        let tx = session.sender();
        let subscription = self
            .store
            .subscribe_document(
                &session.call_id,
                Box::new(move |document| {
                    let _ = tx.send(SessionEvent::Snapshot(document));
                }),
            )
            .await?;
        session.add_subscription(subscription);

        self.subscribe_remote_candidates(session).await?;
        self.advance(session, CallState::AwaitingAnswer);

        Ok(())
    }

    /// Responder: consume the offer, then persist the answer
    async fn answer_offer(self: &Arc<Self>, session: &Arc<CallSession>) -> Result<()> {
        let call_id = &session.call_id;
        let document = self.store.get_call_document(call_id).await?;

        let offer = match document {
            Some(CallDocument {
                offer: Some(offer),
                answer: None,
            }) => offer,
            Some(CallDocument {
                offer: Some(_),
                answer: Some(_),
            }) => return Err(AppError::CallAlreadyAnswered(call_id.to_string())),
            _ => return Err(AppError::CallNotFound(call_id.to_string())),
        };

        session.ensure_open()?;
        session.apply_remote_description(offer).await?;
        self.advance(session, CallState::OfferConsumed);

        let answer = session.connection.create_answer().await?;
        session.connection.set_local_description(answer.clone()).await?;
        session.mark_local_committed();

        session.ensure_open()?;
        self.store
            .set_field(call_id, CallField::Answer(answer), WriteMode::Update)
            .await?;
        session.mark_published();
        session.ensure_open()?;
        self.advance(session, CallState::AnswerPublished);

        self.subscribe_remote_candidates(session).await
    }

    async fn subscribe_remote_candidates(&self, session: &Arc<CallSession>) -> Result<()> {
        let tx = session.sender();
        let subscription = self
            .store
            .subscribe_collection_adds(
                &session.call_id,
                session.remote_collection(),
                Box::new(move |record| {
                    let _ = tx.send(SessionEvent::RemoteCandidate {
                        record_id: record.reference.id,
                        data: record.data,
                    });
                }),
            )
            .await?;
        session.add_subscription(subscription);
        Ok(())
    }

    /// Process session events until the session is torn down
    async fn drive(
        self: Arc<Self>,
        session: Arc<CallSession>,
        mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = session.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(&session, event).await;
        }
        debug!("Session {} event loop stopped", session.session_id);
    }

    async fn handle_event(self: &Arc<Self>, session: &Arc<CallSession>, event: SessionEvent) {
        match event {
            SessionEvent::Snapshot(document) => self.on_snapshot(session, document).await,
            SessionEvent::RemoteCandidate { record_id, data } => {
                self.on_remote_candidate(session, &record_id, data).await
            }
            SessionEvent::LocalCandidate(candidate) => {
                self.on_local_candidate(session, candidate).await
            }
            SessionEvent::ConnectionState(state) => self.on_connection_state(session, state).await,
            SessionEvent::RemoteTrack(track) => {
                info!(
                    "Call {} received remote {} track {}",
                    session.call_id, track.kind, track.id
                );
                session.add_remote_track(track.clone());
                self.events.publish(CallEvent::RemoteTrack {
                    call_id: session.call_id.to_string(),
                    track,
                });
            }
        }
    }

    /// Initiator: apply the first answer that shows up on the document
    async fn on_snapshot(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        document: Option<CallDocument>,
    ) {
        if session.role != Role::Initiator {
            return;
        }

        let Some(document) = document else {
            debug!("Call {} document removed", session.call_id);
            return;
        };
        let Some(answer) = document.answer else {
            return;
        };

        match session.apply_remote_description(answer).await {
            Ok(true) => info!("Call {} answer applied", session.call_id),
            Ok(false) => debug!("Call {} answer already applied", session.call_id),
            Err(e) => {
                error!("Call {} failed to apply answer: {}", session.call_id, e);
                self.signaling_error(session, &e);
                self.teardown(session, Cleanup::Call).await;
            }
        }
    }

    async fn on_remote_candidate(
        &self,
        session: &Arc<CallSession>,
        record_id: &str,
        data: serde_json::Value,
    ) {
        let candidate = match IceCandidate::from_record(&data) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Call {} skipping record {}: {}", session.call_id, record_id, e);
                self.signaling_error(session, &e);
                return;
            }
        };

        match session.on_remote_candidate(record_id, candidate).await {
            Ok(CandidateOutcome::Applied) => {
                debug!("Call {} applied remote candidate {}", session.call_id, record_id)
            }
            Ok(CandidateOutcome::Buffered) => debug!(
                "Call {} buffered remote candidate {} until the remote description is set",
                session.call_id, record_id
            ),
            Ok(CandidateOutcome::Duplicate) => {
                debug!("Call {} ignoring replayed candidate {}", session.call_id, record_id)
            }
            Err(e) => warn!(
                "Call {} rejected remote candidate {}: {}",
                session.call_id, record_id, e
            ),
        }
    }

    async fn on_local_candidate(&self, session: &Arc<CallSession>, candidate: IceCandidate) {
        if session.is_closed() {
            return;
        }

        let collection = session.local_collection();
        let result = match candidate.to_record() {
            Ok(data) => {
                self.store
                    .append_record(&session.call_id, collection, data)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            // Teardown marks the session closed before listing records, so
            // a record it may have missed is removed here.
            Ok(reference) if session.is_closed() => {
                debug!(
                    "Call {} closed while publishing candidate {}, removing it",
                    session.call_id, reference.id
                );
                if let Err(e) = self.store.delete_record(&reference).await {
                    warn!(
                        "Failed to delete {} record {} of call {}: {}",
                        collection, reference.id, session.call_id, e
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Call {} failed to publish candidate to {}: {}",
                    session.call_id, collection, e
                );
                self.signaling_error(session, &e);
            }
        }
    }

    async fn on_connection_state(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        state: ConnectionState,
    ) {
        info!("Call {} connection state: {}", session.call_id, state);
        self.events.publish(CallEvent::ConnectionState {
            call_id: session.call_id.to_string(),
            state,
        });

        if state == ConnectionState::Connected {
            self.advance(session, CallState::Connected);
        } else if state.is_terminal() {
            info!("Call {} peer connection {}, hanging up", session.call_id, state);
            self.teardown(session, Cleanup::Call).await;
        }
    }

    /// Tear down after a failed create or join
    async fn fail(self: &Arc<Self>, session: &Arc<CallSession>, error: &AppError) {
        warn!("Call {} setup failed: {}", session.call_id, error);

        let cleanup = match session.role {
            Role::Initiator => Cleanup::Call,
            Role::Responder if session.published() => Cleanup::Call,
            Role::Responder if session.local_committed() => {
                Cleanup::Records(session.local_collection())
            }
            Role::Responder => Cleanup::Nothing,
        };
        self.teardown(session, cleanup).await;
    }

    /// Close the session and remove its store state
    ///
    /// Returns `None` if the session was already torn down.
    async fn teardown(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        cleanup: Cleanup,
    ) -> Option<TeardownReport> {
        if !session.mark_closed() {
            return None;
        }

        {
            let mut slot = self.slot.lock();
            if let Slot::Active(current) = &*slot {
                if Arc::ptr_eq(current, session) {
                    *slot = Slot::Empty;
                }
            }
        }

        session.release().await;
        self.media.release(&session.media);
        self.webcam_tx.send_replace(false);
        self.events.publish(CallEvent::WebcamActive { active: false });

        let report = self.cleanup_store(&session.call_id, cleanup).await;
        if report.failed > 0 {
            warn!(
                "Call {} teardown incomplete: {} of {} deletions failed",
                session.call_id, report.failed, report.attempted
            );
        }

        self.publish_state(Some(&session.call_id), session.role, CallState::Closed);
        self.events.publish(CallEvent::HungUp {
            call_id: session.call_id.to_string(),
            cleanup_failures: report.failed,
        });
        info!("Call {} hung up", session.call_id);

        Some(report)
    }

    /// Delete store state, attempting every deletion
    async fn cleanup_store(&self, call_id: &CallId, cleanup: Cleanup) -> TeardownReport {
        let mut report = TeardownReport::default();

        let collections: &[Subcollection] = match cleanup {
            Cleanup::Nothing => return report,
            Cleanup::Records(ref collection) => std::slice::from_ref(collection),
            Cleanup::Call => &Subcollection::ALL,
        };

        for &collection in collections {
            match self.store.list_records(call_id, collection).await {
                Ok(records) => {
                    for record in records {
                        report.attempted += 1;
                        if let Err(e) = self.store.delete_record(&record.reference).await {
                            report.failed += 1;
                            warn!(
                                "Failed to delete {} record {} of call {}: {}",
                                collection, record.reference.id, call_id, e
                            );
                        }
                    }
                }
                Err(e) => {
                    report.attempted += 1;
                    report.failed += 1;
                    warn!("Failed to list {} of call {}: {}", collection, call_id, e);
                }
            }
        }

        if cleanup == Cleanup::Call {
            report.attempted += 1;
            if let Err(e) = self.store.delete_document(call_id).await {
                report.failed += 1;
                warn!("Failed to delete call document {}: {}", call_id, e);
            }
        }

        report
    }

    /// Move the state machine if `session` is still the current call
    fn advance(&self, session: &Arc<CallSession>, state: CallState) {
        let slot = self.slot.lock();
        let current = matches!(&*slot, Slot::Active(s) if Arc::ptr_eq(s, session));
        if current && !session.is_closed() {
            self.publish_state(Some(&session.call_id), session.role, state);
        }
    }

    fn publish_state(&self, call_id: Option<&CallId>, role: Role, state: CallState) {
        self.state_tx.send_replace(state);
        match call_id {
            Some(call_id) => info!("Call {} ({}) -> {}", call_id, role, state),
            None => info!("Call ({}) -> {}", role, state),
        }
        self.events.publish(CallEvent::StateChanged {
            call_id: call_id.map(|id| id.to_string()),
            role,
            state,
        });
    }

    fn signaling_error(&self, session: &CallSession, error: &AppError) {
        self.events.publish(CallEvent::SignalingError {
            call_id: session.call_id.to_string(),
            message: error.to_string(),
        });
    }
}
