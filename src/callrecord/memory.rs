use super::{
    CallRecord, CallRecordStore, RecordChange, RecordPatch, RecordQuery, UpdateCondition,
    UpdateOutcome,
};
use crate::CallId;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// In-memory store with conditional writes and a broadcast change feed.
/// Mirrors the semantics expected of the real backend (atomic conditional
/// updates, append-only candidate lists, write-once termination fields) and
/// backs the test suite and lightweight embeddings.
pub struct MemoryCallStore {
    records: Mutex<HashMap<CallId, CallRecord>>,
    changes: broadcast::Sender<RecordChange>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(128);
        Self {
            records: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn publish(&self, record: &CallRecord) {
        let _ = self.changes.send(RecordChange {
            id: record.id.clone(),
            record: record.clone(),
        });
    }
}

impl Default for MemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn create(&self, record: CallRecord) -> Result<CallId> {
        let snapshot = {
            let mut records = self.records.lock().unwrap();
            if records.contains_key(&record.id) {
                anyhow::bail!("duplicate call record id: {}", record.id);
            }
            records.insert(record.id.clone(), record.clone());
            record
        };
        self.publish(&snapshot);
        Ok(snapshot.id)
    }

    async fn update(
        &self,
        id: &str,
        patch: RecordPatch,
        condition: UpdateCondition,
    ) -> Result<UpdateOutcome> {
        let snapshot = {
            let mut records = self.records.lock().unwrap();
            let record = match records.get_mut(id) {
                Some(record) => record,
                None => anyhow::bail!("call record not found: {}", id),
            };

            let holds = match condition {
                UpdateCondition::Always => true,
                UpdateCondition::StatusIs(status) => record.status == status,
                UpdateCondition::StatusNot(status) => record.status != status,
            };
            if !holds {
                debug!(
                    call_id = id,
                    status = ?record.status,
                    "conditional update lost"
                );
                return Ok(UpdateOutcome::Conflict);
            }

            // Write-once guards: answer and the termination triple are set
            // exactly once for the record's lifetime.
            if patch.answer.is_some() && record.answer.is_some() {
                return Ok(UpdateOutcome::Conflict);
            }
            if patch.end_reason.is_some() && record.end_reason.is_some() {
                return Ok(UpdateOutcome::Conflict);
            }
            if let Some(status) = patch.status {
                if !record.status.can_advance_to(status) {
                    return Ok(UpdateOutcome::Conflict);
                }
                record.status = status;
            }
            if let Some(answer) = patch.answer {
                record.answer = Some(answer);
            }
            record
                .caller_candidates
                .extend(patch.append_caller_candidates);
            record
                .callee_candidates
                .extend(patch.append_callee_candidates);
            if let Some(ended_at) = patch.ended_at {
                record.ended_at = Some(ended_at);
            }
            if let Some(ended_by) = patch.ended_by {
                record.ended_by = Some(ended_by);
            }
            if let Some(reason) = patch.end_reason {
                record.end_reason = Some(reason);
            }
            record.clone()
        };
        self.publish(&snapshot);
        Ok(UpdateOutcome::Applied)
    }

    async fn get(&self, id: &str) -> Result<Option<CallRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(id).cloned())
    }

    async fn query(&self, query: RecordQuery) -> Result<Vec<CallRecord>> {
        let records = self.records.lock().unwrap();
        let mut matched: Vec<CallRecord> = records
            .values()
            .filter(|record| {
                query
                    .participant
                    .as_ref()
                    .map(|p| record.involves(p))
                    .unwrap_or(true)
            })
            .filter(|record| {
                query
                    .created_after
                    .map(|cutoff| record.created_at >= cutoff)
                    .unwrap_or(true)
            })
            .filter(|record| {
                query
                    .status
                    .map(|status| record.status == status)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }
}
