use fe2o3_amqp_types::definitions;

/// Error with transactional work on a session
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// `begin_transaction` was called while a transaction is active
    #[error("A transaction is already active on the session")]
    IllegalState,

    /// `commit_transaction` or `rollback_transaction` was called without
    /// an active transaction
    #[error("No transaction is active on the session")]
    NotActive,

    /// The coordinator did not answer within the request timeout; the
    /// client-side transaction is treated as never begun
    #[error("Operation timed out")]
    OperationTimedOut,

    /// The coordinator refused the Declare (or the coordinator link could
    /// not be established), carrying the remote condition when one was
    /// supplied
    #[error("Transaction declaration failed {:?}", .0)]
    DeclarationFailed(Option<definitions::Error>),

    /// The coordinator rejected the Discharge; the transactional work has
    /// been rolled back
    #[error("Transaction rolled back {:?}", .0)]
    RolledBack(Option<definitions::Error>),

    /// Error serializing the Declare or Discharge message
    #[error(transparent)]
    MessageEncode(#[from] serde_amqp::Error),
}
