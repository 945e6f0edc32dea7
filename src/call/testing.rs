//! Scripted engine and instrumented store for call tests

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::store::{
    CallDocument, CallField, CallId, MemorySessionStore, RecordHandler, RecordRef, SessionStore,
    SnapshotHandler, StoredRecord, Subcollection, Subscription, WriteMode,
};
use crate::webrtc::{
    CandidateHandler, ConnectionState, IceCandidate, LocalTrack, PeerConnection, PeerEngine,
    RemoteTrack, SessionDescription, StateHandler, TrackHandler, TrackKind, WebRtcConfig,
};

/// Engine call recorded by `MockConnection`
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOp {
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Default)]
pub struct MockEngine {
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockEngine {
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn last_connection(&self) -> Arc<MockConnection> {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("no connection created")
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn create_connection(
        &self,
        _config: &WebRtcConfig,
        session_id: &str,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(MockConnection::new(session_id));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

pub struct MockConnection {
    label: String,
    ops: Mutex<Vec<EngineOp>>,
    tracks: Mutex<Vec<TrackKind>>,
    candidate_handler: Mutex<Option<Arc<CandidateHandler>>>,
    state_handler: Mutex<Option<Arc<StateHandler>>>,
    track_handler: Mutex<Option<Arc<TrackHandler>>>,
    has_remote: AtomicBool,
    fail_remote: AtomicBool,
}

impl MockConnection {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ops: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            candidate_handler: Mutex::new(None),
            state_handler: Mutex::new(None),
            track_handler: Mutex::new(None),
            has_remote: AtomicBool::new(false),
            fail_remote: AtomicBool::new(false),
        }
    }

    pub fn ops(&self) -> Vec<EngineOp> {
        self.ops.lock().clone()
    }

    pub fn tracks(&self) -> Vec<TrackKind> {
        self.tracks.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.ops().into_iter().find_map(|op| match op {
            EngineOp::SetLocal(d) => Some(d),
            _ => None,
        })
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                EngineOp::SetRemote(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                EngineOp::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.ops().iter().filter(|op| **op == EngineOp::Close).count()
    }

    /// Make `set_remote_description` fail
    pub fn fail_remote_description(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    /// Simulate the engine gathering a local candidate
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let handler = self.candidate_handler.lock().clone();
        if let Some(handler) = handler {
            handler(candidate);
        }
    }

    /// Simulate an aggregate connection state change
    pub fn emit_state(&self, state: ConnectionState) {
        let handler = self.state_handler.lock().clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    /// Simulate the remote peer adding a track
    pub fn emit_track(&self, track: RemoteTrack) {
        let handler = self.track_handler.lock().clone();
        if let Some(handler) = handler {
            handler(track);
        }
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn add_local_track(&self, track: &LocalTrack, _stream_id: &str) -> Result<()> {
        self.tracks.lock().push(track.kind);
        Ok(())
    }

    fn on_remote_track(&self, handler: TrackHandler) {
        *self.track_handler.lock() = Some(Arc::new(handler));
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        *self.candidate_handler.lock() = Some(Arc::new(handler));
    }

    fn on_connection_state_change(&self, handler: StateHandler) {
        *self.state_handler.lock() = Some(Arc::new(handler));
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=offer\r\n",
            self.label
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(AppError::WebRtcError("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=answer\r\n",
            self.label
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ops.lock().push(EngineOp::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(AppError::WebRtcError("malformed session description".to_string()));
        }
        self.has_remote.store(true, Ordering::SeqCst);
        self.ops.lock().push(EngineOp::SetRemote(description));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(AppError::WebRtcError(
                "remote description not set".to_string(),
            ));
        }
        self.ops.lock().push(EngineOp::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.ops.lock().push(EngineOp::Close);
        Ok(())
    }
}

/// Store mutation recorded by `RecordingStore`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    SetField(&'static str),
    Append(Subcollection),
    DeleteRecord(Subcollection),
    DeleteDocument,
}

/// Wraps a `MemorySessionStore`, recording mutations and injecting faults
pub struct RecordingStore {
    inner: MemorySessionStore,
    ops: Mutex<Vec<StoreOp>>,
    fail_set_field: AtomicBool,
    fail_deletes: AtomicBool,
    fail_reads: AtomicBool,
    fail_subscriptions: AtomicBool,
    write_delay_ms: AtomicU64,
    append_delay_ms: AtomicU64,
}

impl RecordingStore {
    pub fn new(inner: MemorySessionStore) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
            fail_set_field: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_subscriptions: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
            append_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn mutations(&self) -> Vec<StoreOp> {
        self.ops.lock().clone()
    }

    pub fn count(&self, op: &StoreOp) -> usize {
        self.ops.lock().iter().filter(|o| *o == op).count()
    }

    pub fn fail_set_field(&self, fail: bool) {
        self.fail_set_field.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make candidate subscriptions fail to attach
    pub fn fail_subscriptions(&self, fail: bool) {
        self.fail_subscriptions.store(fail, Ordering::SeqCst);
    }

    /// Delay every `set_field` before it takes effect
    pub fn slow_writes(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every `append_record` before it takes effect
    pub fn slow_appends(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn record(&self, op: StoreOp) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl SessionStore for RecordingStore {
    async fn create_call_document(&self) -> Result<CallId> {
        self.inner.create_call_document().await
    }

    async fn get_call_document(&self, call_id: &CallId) -> Result<Option<CallDocument>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::SignalingRead("store unreachable".to_string()));
        }
        self.inner.get_call_document(call_id).await
    }

    async fn set_field(&self, call_id: &CallId, field: CallField, mode: WriteMode) -> Result<()> {
        Self::pause(&self.write_delay_ms).await;
        if self.fail_set_field.load(Ordering::SeqCst) {
            return Err(AppError::SignalingWrite("store unavailable".to_string()));
        }
        self.record(StoreOp::SetField(field.name()));
        self.inner.set_field(call_id, field, mode).await
    }

    async fn subscribe_document(
        &self,
        call_id: &CallId,
        on_snapshot: SnapshotHandler,
    ) -> Result<Subscription> {
        self.inner.subscribe_document(call_id, on_snapshot).await
    }

    async fn subscribe_collection_adds(
        &self,
        call_id: &CallId,
        collection: Subcollection,
        on_added: RecordHandler,
    ) -> Result<Subscription> {
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(AppError::SignalingRead("listener rejected".to_string()));
        }
        self.inner
            .subscribe_collection_adds(call_id, collection, on_added)
            .await
    }

    async fn append_record(
        &self,
        call_id: &CallId,
        collection: Subcollection,
        data: Value,
    ) -> Result<RecordRef> {
        Self::pause(&self.append_delay_ms).await;
        self.record(StoreOp::Append(collection));
        self.inner.append_record(call_id, collection, data).await
    }

    async fn list_records(
        &self,
        call_id: &CallId,
        collection: Subcollection,
    ) -> Result<Vec<StoredRecord>> {
        self.inner.list_records(call_id, collection).await
    }

    async fn delete_record(&self, reference: &RecordRef) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AppError::SignalingWrite("delete rejected".to_string()));
        }
        self.record(StoreOp::DeleteRecord(reference.collection));
        self.inner.delete_record(reference).await
    }

    async fn delete_document(&self, call_id: &CallId) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AppError::SignalingWrite("delete rejected".to_string()));
        }
        self.record(StoreOp::DeleteDocument);
        self.inner.delete_document(call_id).await
    }
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
