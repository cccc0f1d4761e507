//! Re-submission bookkeeping for asynchronous requests.
//!
//! A server restart invalidates every outstanding request id. Callers that
//! keep async work in flight record each submission in a [`PendingSet`];
//! when a call reports [`Error::ServerRestarted`] they re-submit the whole
//! set with fresh ids and keep polling.

use tracing::debug;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::layout::RequestId;

/// The operands of a re-submittable asynchronous request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncOp {
    Multiply(i32, i32),
    Divide(i32, i32),
    Concat(String, String),
    Search(String, String),
}

impl AsyncOp {
    fn submit(&self, client: &mut Client) -> Result<RequestId> {
        match self {
            AsyncOp::Multiply(a, b) => client.multiply(*a, *b),
            AsyncOp::Divide(a, b) => client.divide(*a, *b),
            AsyncOp::Concat(s1, s2) => client.concat(s1, s2),
            AsyncOp::Search(s1, s2) => client.search(s1, s2),
        }
    }
}

/// One tracked in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub op: AsyncOp,
}

/// In-flight asynchronous requests, re-submittable after a restart.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: Vec<PendingRequest>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.entries.iter()
    }

    /// Records a submitted request.
    pub fn track(&mut self, id: RequestId, op: AsyncOp) {
        self.entries.push(PendingRequest { id, op });
    }

    /// Drops the entry for `id` (its reply was consumed). Returns whether
    /// the id was tracked.
    pub fn forget(&mut self, id: RequestId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Re-submits every tracked request with a fresh id.
    ///
    /// Returns the `(old, new)` id pairs that were re-submitted. Entries
    /// whose re-submission reports another restart stay tracked under
    /// their stale id for the next attempt; entries failing for any other
    /// reason are dropped.
    pub fn resubmit_all(&mut self, client: &mut Client) -> Vec<(RequestId, RequestId)> {
        let mut remapped = Vec::new();
        let mut keep = Vec::new();

        let entries = std::mem::take(&mut self.entries);
        let mut pending = entries.into_iter();
        for mut entry in pending.by_ref() {
            match entry.op.submit(client) {
                Ok(new_id) => {
                    debug!(old = %entry.id, new = %new_id, "re-submitted after restart");
                    remapped.push((entry.id, new_id));
                    entry.id = new_id;
                    keep.push(entry);
                }
                Err(Error::ServerRestarted) => {
                    // Still mid-restart; retry this and the rest later.
                    keep.push(entry);
                    break;
                }
                Err(e) => {
                    debug!(id = %entry.id, error = %e, "dropping request that failed to re-submit");
                }
            }
        }
        keep.extend(pending);
        self.entries = keep;
        remapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_and_forget() {
        let mut set = PendingSet::new();
        assert!(set.is_empty());
        set.track(RequestId(7), AsyncOp::Multiply(6, 7));
        set.track(RequestId(8), AsyncOp::Concat("a".into(), "b".into()));
        assert_eq!(set.len(), 2);

        assert!(set.forget(RequestId(7)));
        assert!(!set.forget(RequestId(7)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().id, RequestId(8));
    }
}
