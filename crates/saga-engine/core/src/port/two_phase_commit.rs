//! Two-phase commit port.
//!
//! A [`TwoPhaseCommitCoordinator`] drives a set of [`Participant`]s through
//! prepare/commit, or aborts them. The two-phase-commit step variant
//! delegates to it; its compensation is an abort.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One resource taking part in a distributed transaction.
#[async_trait]
pub trait Participant: Send + Sync {
    fn name(&self) -> &str;

    /// Vote on the transaction. An error is a "no" vote.
    async fn prepare(&self, transaction_id: &str) -> Result<()>;

    async fn commit(&self, transaction_id: &str) -> Result<()>;

    /// Roll back. Must tolerate transactions it never prepared.
    async fn abort(&self, transaction_id: &str) -> Result<()>;
}

/// Coordinates prepare/commit/abort across participants.
#[async_trait]
pub trait TwoPhaseCommitCoordinator: Send + Sync {
    /// Run both phases. On error no participant is left prepared.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        transaction_id: &str,
        participants: &[Arc<dyn Participant>],
    ) -> Result<()>;

    /// Abort every participant, in reverse order. Returns the first error
    /// after attempting all of them.
    async fn abort(&self, transaction_id: &str, participants: &[Arc<dyn Participant>]) -> Result<()> {
        let mut first_error = None;
        for participant in participants.iter().rev() {
            if let Err(e) = participant.abort(transaction_id).await {
                tracing::error!(
                    transaction_id,
                    participant = participant.name(),
                    error = %e,
                    "Participant abort failed"
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
