use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::protocol::RpcResponse;
use crate::{CorrelationId, Result, RpcError};

/// Sending half of a result slot.
pub(crate) type Resolver = oneshot::Sender<Result<RpcResponse>>;

/// Tracks calls that have been issued and not yet resolved.
///
/// An id is present iff its call is outstanding. Every removal path
/// (response, publish failure, timeout, connection failure, close) takes the
/// resolver out of the map before sending, so a slot is resolved at most once.
pub(crate) struct CorrelationTable {
    // ---
    entries: HashMap<CorrelationId, Resolver>,
}

impl CorrelationTable {
    // ---

    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a pending call.
    ///
    /// A duplicate id is refused and the resolver handed back so the caller
    /// can fail it; the existing entry is left untouched.
    pub fn insert(&mut self, id: CorrelationId, resolver: Resolver) -> std::result::Result<(), Resolver> {
        // ---
        if self.entries.contains_key(&id) {
            return Err(resolver);
        }
        self.entries.insert(id, resolver);
        Ok(())
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    /// Deliver a response and drop the entry.
    ///
    /// Returns false when the id is unknown (never issued, already resolved,
    /// or cleaned up).
    pub fn resolve(&mut self, id: &CorrelationId, response: RpcResponse) -> bool {
        self.complete(id, Ok(response))
    }

    /// Fail one pending call and drop the entry.
    pub fn fail(&mut self, id: &CorrelationId, err: RpcError) -> bool {
        self.complete(id, Err(err))
    }

    /// Fail every pending call, leaving the table empty.
    ///
    /// Returns the number of calls failed.
    pub fn fail_all(&mut self, err: &RpcError) -> usize {
        // ---
        let n = self.entries.len();
        for (_, resolver) in self.entries.drain() {
            // receiver may already be gone
            let _ = resolver.send(Err(err.duplicate()));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn complete(&mut self, id: &CorrelationId, outcome: Result<RpcResponse>) -> bool {
        // ---
        match self.entries.remove(id) {
            Some(resolver) => {
                let _ = resolver.send(outcome);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::protocol::build_response;
    use serde_json::json;

    fn ok() -> RpcResponse {
        build_response(200, "OK", json!([]))
    }

    #[test]
    fn resolve_delivers_once() {
        // ---
        let mut table = CorrelationTable::new();
        let id = CorrelationId::generate();
        let (tx, mut rx) = oneshot::channel();

        table.insert(id.clone(), tx).unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.resolve(&id, ok()));
        assert_eq!(table.len(), 0);
        assert_eq!(rx.try_recv().unwrap().unwrap(), ok());

        // second delivery is a no-op
        assert!(!table.resolve(&id, ok()));
        assert!(!table.fail(&id, RpcError::Timeout));
    }

    #[test]
    fn duplicate_id_is_refused() {
        // ---
        let mut table = CorrelationTable::new();
        let id = CorrelationId::from("same");
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        table.insert(id.clone(), tx1).unwrap();
        assert!(table.insert(id.clone(), tx2).is_err());
        assert_eq!(table.len(), 1);

        table.resolve(&id, ok());
        assert!(rx1.try_recv().unwrap().is_ok());
    }

    #[test]
    fn fail_all_empties_table() {
        // ---
        let mut table = CorrelationTable::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            table.insert(CorrelationId::generate(), tx).unwrap();
            receivers.push(rx);
        }

        let err = RpcError::BrokerUnavailable("gone".into());
        assert_eq!(table.fail_all(&err), 3);
        assert_eq!(table.len(), 0);

        for mut rx in receivers {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Err(RpcError::BrokerUnavailable(reason)) if reason == "gone"
            ));
        }
    }

    #[test]
    fn resolve_after_receiver_dropped_still_removes() {
        // ---
        let mut table = CorrelationTable::new();
        let id = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();
        table.insert(id.clone(), tx).unwrap();
        drop(rx);

        assert!(table.resolve(&id, ok()));
        assert!(!table.contains(&id));
    }
}
