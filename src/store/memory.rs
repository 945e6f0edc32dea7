//! In-process session store
//!
//! Every subscriber gets its own unbounded channel, so no change is dropped
//! however slow the handler is. The current state is queued under the same
//! lock that registers the subscriber, which keeps snapshot and change feed
//! gap-free.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    CallDocument, CallField, CallId, RecordHandler, RecordRef, SessionStore, SnapshotHandler,
    StoredRecord, Subcollection, Subscription, WriteMode,
};
use crate::error::{AppError, Result};

#[derive(Debug, Default)]
struct CallEntry {
    document: Option<CallDocument>,
    records: HashMap<Subcollection, Vec<StoredRecord>>,
}

impl CallEntry {
    fn is_empty(&self) -> bool {
        self.document.is_none() && self.records.values().all(|r| r.is_empty())
    }
}

#[derive(Debug, Clone)]
enum Change {
    Document(Option<CallDocument>),
    RecordAdded(StoredRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topic {
    Document,
    Collection(Subcollection),
}

struct Subscriber {
    call_id: CallId,
    topic: Topic,
    tx: mpsc::UnboundedSender<Change>,
}

#[derive(Default)]
struct State {
    calls: HashMap<CallId, CallEntry>,
    subscribers: Vec<Subscriber>,
}

impl State {
    fn notify(&mut self, call_id: &CallId, topic: Topic, change: Change) {
        self.subscribers.retain(|s| {
            if &s.call_id != call_id || s.topic != topic {
                return !s.tx.is_closed();
            }
            s.tx.send(change.clone()).is_ok()
        });
    }
}

/// Session store living in process memory
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    state: Arc<Mutex<State>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of existing call documents
    pub fn call_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .values()
            .filter(|e| e.document.is_some())
            .count()
    }

    /// Number of records in a subcollection
    pub fn record_count(&self, call_id: &CallId, collection: Subcollection) -> usize {
        self.state
            .lock()
            .calls
            .get(call_id)
            .and_then(|e| e.records.get(&collection))
            .map(|r| r.len())
            .unwrap_or(0)
    }

    /// Queue the current state and register the subscriber under one lock
    fn register<F>(
        &self,
        call_id: &CallId,
        topic: Topic,
        initial: F,
    ) -> mpsc::UnboundedReceiver<Change>
    where
        F: FnOnce(&State) -> Vec<Change>,
    {
        let mut state = self.state.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        for change in initial(&state) {
            let _ = tx.send(change);
        }
        state.subscribers.push(Subscriber {
            call_id: call_id.clone(),
            topic,
            tx,
        });
        rx
    }
}

fn spawn_delivery<F>(mut rx: mpsc::UnboundedReceiver<Change>, token: CancellationToken, deliver: F)
where
    F: Fn(Change) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                change = rx.recv() => match change {
                    Some(change) => deliver(change),
                    None => break,
                },
            }
        }
        trace!("Memory store subscription ended");
    });
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_call_document(&self) -> Result<CallId> {
        let state = self.state.lock();
        loop {
            let id = CallId::generate();
            if !state.calls.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    async fn get_call_document(&self, call_id: &CallId) -> Result<Option<CallDocument>> {
        Ok(self
            .state
            .lock()
            .calls
            .get(call_id)
            .and_then(|e| e.document.clone()))
    }

    async fn set_field(&self, call_id: &CallId, field: CallField, mode: WriteMode) -> Result<()> {
        let mut state = self.state.lock();
        let name = field.name();

        let exists = state
            .calls
            .get(call_id)
            .map(|e| e.document.is_some())
            .unwrap_or(false);
        if mode == WriteMode::Update && !exists {
            return Err(AppError::SignalingWrite(format!(
                "Cannot set {} on missing call {}",
                name, call_id
            )));
        }

        let entry = state.calls.entry(call_id.clone()).or_default();
        let document = entry.document.get_or_insert_with(CallDocument::default);
        field.apply(document);
        let snapshot = document.clone();

        debug!("Call {} field {} written", call_id, name);
        state.notify(call_id, Topic::Document, Change::Document(Some(snapshot)));
        Ok(())
    }

    async fn subscribe_document(
        &self,
        call_id: &CallId,
        on_snapshot: SnapshotHandler,
    ) -> Result<Subscription> {
        let rx = self.register(call_id, Topic::Document, |state| {
            vec![Change::Document(
                state.calls.get(call_id).and_then(|e| e.document.clone()),
            )]
        });

        let token = CancellationToken::new();
        spawn_delivery(rx, token.clone(), move |change| {
            if let Change::Document(doc) = change {
                on_snapshot(doc);
            }
        });
        Ok(Subscription::new(token))
    }

    async fn subscribe_collection_adds(
        &self,
        call_id: &CallId,
        collection: Subcollection,
        on_added: RecordHandler,
    ) -> Result<Subscription> {
        let rx = self.register(call_id, Topic::Collection(collection), |state| {
            state
                .calls
                .get(call_id)
                .and_then(|e| e.records.get(&collection))
                .map(|records| records.iter().cloned().map(Change::RecordAdded).collect())
                .unwrap_or_default()
        });

        let token = CancellationToken::new();
        spawn_delivery(rx, token.clone(), move |change| {
            if let Change::RecordAdded(record) = change {
                on_added(record);
            }
        });
        Ok(Subscription::new(token))
    }

    async fn append_record(
        &self,
        call_id: &CallId,
        collection: Subcollection,
        data: Value,
    ) -> Result<RecordRef> {
        let reference = RecordRef {
            call_id: call_id.clone(),
            collection,
            id: uuid::Uuid::new_v4().to_string(),
        };
        let record = StoredRecord {
            reference: reference.clone(),
            data,
        };

        let mut state = self.state.lock();
        state
            .calls
            .entry(call_id.clone())
            .or_default()
            .records
            .entry(collection)
            .or_default()
            .push(record.clone());
        state.notify(
            call_id,
            Topic::Collection(collection),
            Change::RecordAdded(record),
        );

        trace!("Record {} appended to {}/{}", reference.id, call_id, collection);
        Ok(reference)
    }

    async fn list_records(
        &self,
        call_id: &CallId,
        collection: Subcollection,
    ) -> Result<Vec<StoredRecord>> {
        Ok(self
            .state
            .lock()
            .calls
            .get(call_id)
            .and_then(|e| e.records.get(&collection))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_record(&self, reference: &RecordRef) -> Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.calls.get_mut(&reference.call_id) else {
            return Ok(());
        };
        if let Some(records) = entry.records.get_mut(&reference.collection) {
            records.retain(|r| r.reference.id != reference.id);
        }
        if entry.is_empty() {
            state.calls.remove(&reference.call_id);
        }
        Ok(())
    }

    async fn delete_document(&self, call_id: &CallId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.calls.get_mut(call_id) else {
            return Ok(());
        };
        let existed = entry.document.take().is_some();
        if entry.is_empty() {
            state.calls.remove(call_id);
        }
        if existed {
            debug!("Call {} document deleted", call_id);
            state.notify(call_id, Topic::Document, Change::Document(None));
        }
        Ok(())
    }
}
