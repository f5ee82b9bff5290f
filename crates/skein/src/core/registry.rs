use parking_lot::RwLock;
use skein_transport::TaskId;

use crate::data::{
    AuthHandler, FailureCallback, OperationRecord, Phase, RedirectHandler, RegistryId,
};

/// Ordered, thread-safe collection of [`OperationRecord`]s.
///
/// Reads run concurrently, writes are exclusive. Lookups hand out copies, and
/// a missing id is never an error: callers treat it as a record removed by a
/// concurrent cancel or give-up.
#[derive(Default)]
pub struct OperationRegistry {
    inner: RwLock<State>,
}

#[derive(Default)]
struct State {
    records: Vec<OperationRecord>,
    next_id: u64,
    globals: Globals,
}

#[derive(Default)]
struct Globals {
    redirect: Option<RedirectHandler>,
    failure: Option<FailureCallback>,
    retry_budget: Option<u32>,
    session_auth: Option<AuthHandler>,
}

impl OperationRegistry {
    pub fn new() -> Self { Self::default() }

    /// Append `record`, stamping it with the next registry id.
    pub fn push(&self, mut record: OperationRecord) -> RegistryId {
        let mut state = self.inner.write();
        let id = RegistryId(state.next_id);
        state.next_id += 1;
        record.registry_id = id;
        state.records.push(record);
        id
    }

    pub fn get_by_task_id(&self, task: TaskId) -> Option<OperationRecord> {
        self.inner
            .read()
            .records
            .iter()
            .find(|r| r.platform_task_id == Some(task))
            .cloned()
    }

    pub fn get_by_registry_id(&self, id: RegistryId) -> Option<OperationRecord> {
        self.inner.read().records.iter().find(|r| r.registry_id == id).cloned()
    }

    /// Replace the most recently queued record. No-op when empty.
    pub fn replace_trailing(&self, record: OperationRecord) {
        if let Some(last) = self.inner.write().records.last_mut() {
            *last = record;
        }
    }

    /// Mutate the most recently queued record in place.
    ///
    /// Returns `false` when nothing is queued.
    pub fn update_trailing(&self, f: impl FnOnce(&mut OperationRecord)) -> bool {
        match self.inner.write().records.last_mut() {
            Some(last) => {
                f(last);
                true
            }
            None => false,
        }
    }

    pub fn replace_by_task_id(&self, record: OperationRecord, task: TaskId) {
        let mut state = self.inner.write();
        if let Some(slot) = state.records.iter_mut().find(|r| r.platform_task_id == Some(task)) {
            *slot = record;
        }
    }

    pub fn replace_by_registry_id(&self, record: OperationRecord, id: RegistryId) {
        let mut state = self.inner.write();
        if let Some(slot) = state.records.iter_mut().find(|r| r.registry_id == id) {
            *slot = record;
        }
    }

    pub fn remove_by_task_id(&self, task: TaskId) -> Option<OperationRecord> {
        let mut state = self.inner.write();
        let index = state.records.iter().position(|r| r.platform_task_id == Some(task))?;
        Some(state.records.remove(index))
    }

    pub fn remove_by_registry_id(&self, id: RegistryId) -> Option<OperationRecord> {
        let mut state = self.inner.write();
        let index = state.records.iter().position(|r| r.registry_id == id)?;
        Some(state.records.remove(index))
    }

    /// Drop every record, returning how many there were.
    pub fn remove_all(&self) -> usize {
        let drained = std::mem::take(&mut self.inner.write().records);
        drained.len()
    }

    pub fn is_empty(&self) -> bool { self.inner.read().records.is_empty() }

    pub fn len(&self) -> usize { self.inner.read().records.len() }

    /// Append a body chunk to a data record's buffer.
    pub fn append_chunk(&self, task: TaskId, chunk: &[u8]) -> bool {
        let mut state = self.inner.write();
        let buffer = state
            .records
            .iter_mut()
            .find(|r| r.platform_task_id == Some(task))
            .and_then(|r| r.response_buffer.as_mut());
        match buffer {
            Some(buffer) => {
                buffer.extend_from_slice(chunk);
                true
            }
            None => false,
        }
    }

    /// Mark every queued record as scheduled, returning their ids in order.
    pub fn schedule_pending(&self) -> Vec<RegistryId> {
        let mut state = self.inner.write();
        state
            .records
            .iter_mut()
            .filter(|r| r.phase == Phase::Queued)
            .map(|r| {
                r.phase = Phase::Scheduled;
                r.registry_id
            })
            .collect()
    }

    pub fn has_scheduled(&self) -> bool {
        self.inner.read().records.iter().any(|r| r.phase == Phase::Scheduled)
    }

    /// Record's redirect handler, else the global one.
    pub fn redirect_for(&self, task: TaskId) -> Option<RedirectHandler> {
        let state = self.inner.read();
        state
            .records
            .iter()
            .find(|r| r.platform_task_id == Some(task))
            .and_then(|r| r.redirect.clone())
            .or_else(|| state.globals.redirect.clone())
    }

    /// Record's failure callback, else the global one.
    pub fn failure_for(&self, task: TaskId) -> Option<FailureCallback> {
        let state = self.inner.read();
        state
            .records
            .iter()
            .find(|r| r.platform_task_id == Some(task))
            .and_then(|r| r.failure.clone())
            .or_else(|| state.globals.failure.clone())
    }

    /// Record's remaining budget, else the global budget, else 0.
    pub fn retry_count_for(&self, task: TaskId) -> u32 {
        let state = self.inner.read();
        state
            .records
            .iter()
            .find(|r| r.platform_task_id == Some(task))
            .and_then(|r| r.retry_budget)
            .or(state.globals.retry_budget)
            .unwrap_or(0)
    }

    pub fn session_auth(&self) -> Option<AuthHandler> { self.inner.read().globals.session_auth.clone() }

    pub fn set_global_redirect(&self, handler: RedirectHandler) {
        self.inner.write().globals.redirect = Some(handler);
    }

    pub fn set_global_failure(&self, callback: FailureCallback) {
        self.inner.write().globals.failure = Some(callback);
    }

    pub fn set_global_retry_budget(&self, budget: u32) {
        self.inner.write().globals.retry_budget = Some(budget);
    }

    pub fn set_session_auth(&self, handler: AuthHandler) {
        self.inner.write().globals.session_auth = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use skein_transport::Request;

    use super::*;
    use crate::data::RequestFactory;
    use crate::error::NetError;

    fn record() -> OperationRecord {
        OperationRecord::new(RequestFactory::data(|| Request::get("http://example.com/".parse().unwrap())))
    }

    fn stamped(registry: &OperationRegistry, id: RegistryId, task: u64) {
        let mut r = registry.get_by_registry_id(id).unwrap();
        r.platform_task_id = Some(TaskId(task));
        registry.replace_by_registry_id(r, id);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let registry = OperationRegistry::new();
        let first = registry.push(record());
        let second = registry.push(record());
        registry.remove_by_registry_id(first);
        let third = registry.push(record());

        assert_eq!((first, second, third), (RegistryId(0), RegistryId(1), RegistryId(2)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_missing_ids_are_benign() {
        let registry = OperationRegistry::new();
        assert!(registry.get_by_task_id(TaskId(9)).is_none());
        assert!(registry.remove_by_task_id(TaskId(9)).is_none());
        registry.replace_by_registry_id(record(), RegistryId(4));
        registry.replace_trailing(record());
        assert!(!registry.update_trailing(|r| r.retry_budget = Some(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_trailing_touches_last_only() {
        let registry = OperationRegistry::new();
        let first = registry.push(record());
        let second = registry.push(record());
        registry.update_trailing(|r| r.retry_budget = Some(3));

        assert_eq!(registry.get_by_registry_id(first).unwrap().retry_budget(), None);
        assert_eq!(registry.get_by_registry_id(second).unwrap().retry_budget(), Some(3));
    }

    #[test]
    fn test_retry_count_falls_back_to_global() {
        let registry = OperationRegistry::new();
        let id = registry.push(record());
        stamped(&registry, id, 7);
        assert_eq!(registry.retry_count_for(TaskId(7)), 0);

        registry.set_global_retry_budget(2);
        assert_eq!(registry.retry_count_for(TaskId(7)), 2);

        registry.update_trailing(|r| r.retry_budget = Some(5));
        assert_eq!(registry.retry_count_for(TaskId(7)), 5);
    }

    #[test]
    fn test_failure_falls_back_to_global() {
        let registry = OperationRegistry::new();
        let id = registry.push(record());
        stamped(&registry, id, 1);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registry.set_global_failure(Arc::new(move |_: &NetError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let failure = registry.failure_for(TaskId(1)).unwrap();
        failure(&NetError::NoResponse);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_append_chunk_and_schedule() {
        let registry = OperationRegistry::new();
        let id = registry.push(record());
        stamped(&registry, id, 3);

        assert!(registry.append_chunk(TaskId(3), b"he"));
        assert!(registry.append_chunk(TaskId(3), b"llo"));
        assert_eq!(registry.get_by_task_id(TaskId(3)).unwrap().buffered(), Some(&b"hello"[..]));

        assert_eq!(registry.schedule_pending(), vec![id]);
        assert!(registry.has_scheduled());
        assert!(registry.schedule_pending().is_empty());
        assert_eq!(registry.remove_all(), 1);
    }
}
