//! Transactional work over a coordinator link.
//!
//! A session exposes `begin_transaction` / `commit_transaction` /
//! `rollback_transaction`; the controller below owns the coordinator link
//! and the Declare/Discharge exchanges. While a transaction is active,
//! the session's current-txn slot stamps every outgoing transfer and
//! disposition with the active txn-id.

use std::sync::Arc;

use fe2o3_amqp_types::transaction::TransactionId;
use parking_lot::Mutex;

mod controller;
mod error;

pub(crate) use controller::TxnController;
pub use error::TransactionError;

/// The transaction currently active on a session, shared with every link
/// opened on it. `None` outside a transaction.
pub(crate) type CurrentTransaction = Arc<Mutex<Option<TransactionId>>>;
