//! Transaction id generation and the in-flight transaction registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use duplink_common::Tid;

use crate::error::LinkError;
use crate::link::Role;

/// Generator for one side's transaction id series.
///
/// Servers count `1, 2, 3, …`, clients `-1, -2, -3, …`. The counter is
/// seeded with the step value and `next` returns the pre-add value, so
/// the first issued id is exactly ±1 and zero is never produced.
#[derive(Debug)]
pub(crate) struct TidSeries {
    counter: AtomicI64,
    step: i64,
}

impl TidSeries {
    pub(crate) fn new(role: Role) -> Self {
        let step = match role {
            Role::Server => 1,
            Role::Client => -1,
        };
        Self {
            counter: AtomicI64::new(step),
            step,
        }
    }

    pub(crate) fn next(&self) -> Tid {
        self.counter.fetch_add(self.step, Ordering::Relaxed)
    }
}

/// Whether a transaction was started locally or by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Opened by the peer. Peer-opened exchanges currently complete
    /// within a single dispatch and are never registered.
    #[allow(dead_code)]
    Incoming,
    /// Opened locally, awaiting the peer's terminal response.
    Outgoing,
}

/// Terminal outcome of an outbound call, delivered to the caller's
/// future. Dropping the sender without an outcome fails the future with
/// a connection-closed error.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    /// Encoded results from a `func_result`.
    Results(Value),
    /// Remote failure info from a `func_err`.
    RemoteError(String),
    /// The call was never sent; carries the local cause.
    Failed(LinkError),
}

/// What kind of exchange a transaction belongs to.
pub(crate) enum TransactionKind {
    /// The handshake exchange opened by our own `auth` message.
    Auth,
    /// An outbound function call awaiting `func_result` / `func_err`.
    FunctionCall {
        /// Completes the caller's future.
        reply: oneshot::Sender<CallOutcome>,
    },
}

impl TransactionKind {
    fn tag(&self) -> KindTag {
        match self {
            Self::Auth => KindTag::Auth,
            Self::FunctionCall { .. } => KindTag::FunctionCall,
        }
    }
}

/// Kind selector for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KindTag {
    Auth,
    FunctionCall,
}

/// One in-flight multi-message exchange.
pub(crate) struct Transaction {
    pub(crate) id: Tid,
    pub(crate) direction: Direction,
    pub(crate) kind: TransactionKind,
}

/// Map of all transactions that still await a terminal message.
#[derive(Default)]
pub(crate) struct TransactionTable {
    active: BTreeMap<Tid, Transaction>,
}

impl TransactionTable {
    /// Registers a new transaction.
    pub(crate) fn create(
        &mut self,
        id: Tid,
        direction: Direction,
        kind: TransactionKind,
    ) -> Result<(), LinkError> {
        if self.active.contains_key(&id) {
            return Err(LinkError::DuplicateTransaction(id));
        }
        self.active.insert(id, Transaction { id, direction, kind });
        Ok(())
    }

    /// Whether a transaction with this id is still active.
    pub(crate) fn contains(&self, id: Tid) -> bool {
        self.active.contains_key(&id)
    }

    /// Looks up an active transaction, requiring the expected kind.
    pub(crate) fn expect(&self, id: Tid, kind: KindTag) -> Result<&Transaction, LinkError> {
        match self.active.get(&id) {
            Some(transaction) if transaction.kind.tag() == kind => Ok(transaction),
            _ => Err(LinkError::InvalidTransaction(id)),
        }
    }

    /// Removes a transaction, returning it for hook extraction.
    pub(crate) fn complete(&mut self, id: Tid) -> Option<Transaction> {
        self.active.remove(&id)
    }

    /// Fails every pending function call by dropping its reply sender.
    /// Called during link teardown so awaiting futures are released.
    pub(crate) fn fail_pending(&mut self) {
        for (_, transaction) in std::mem::take(&mut self.active) {
            if matches!(transaction.kind, TransactionKind::FunctionCall { .. }) {
                debug!(tid = transaction.id, "cancelling pending call on teardown");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_series_counts_up_from_one() {
        let series = TidSeries::new(Role::Server);
        assert_eq!(series.next(), 1);
        assert_eq!(series.next(), 2);
        assert_eq!(series.next(), 3);
    }

    #[test]
    fn client_series_counts_down_from_minus_one() {
        let series = TidSeries::new(Role::Client);
        assert_eq!(series.next(), -1);
        assert_eq!(series.next(), -2);
        assert_eq!(series.next(), -3);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let mut table = TransactionTable::default();
        table
            .create(1, Direction::Outgoing, TransactionKind::Auth)
            .unwrap();
        assert!(matches!(
            table.create(1, Direction::Outgoing, TransactionKind::Auth),
            Err(LinkError::DuplicateTransaction(1))
        ));
    }

    #[test]
    fn expect_rejects_missing_and_kind_mismatched_ids() {
        let mut table = TransactionTable::default();
        table
            .create(5, Direction::Outgoing, TransactionKind::Auth)
            .unwrap();

        assert!(matches!(
            table.expect(6, KindTag::Auth),
            Err(LinkError::InvalidTransaction(6))
        ));
        assert!(matches!(
            table.expect(5, KindTag::FunctionCall),
            Err(LinkError::InvalidTransaction(5))
        ));
        assert!(table.expect(5, KindTag::Auth).is_ok());
    }

    #[test]
    fn complete_removes_the_transaction() {
        let mut table = TransactionTable::default();
        table
            .create(-1, Direction::Outgoing, TransactionKind::Auth)
            .unwrap();
        assert!(table.complete(-1).is_some());
        assert!(table.complete(-1).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn fail_pending_releases_awaiting_receivers() {
        let mut table = TransactionTable::default();
        let (tx, mut rx) = oneshot::channel();
        table
            .create(
                -2,
                Direction::Outgoing,
                TransactionKind::FunctionCall { reply: tx },
            )
            .unwrap();

        table.fail_pending();
        assert_eq!(table.len(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
