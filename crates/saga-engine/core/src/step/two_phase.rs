//! Two-phase-commit step and an in-process coordinator.

use super::{SagaStep, StepConfig};
use crate::context::SagaContext;
use crate::error::{Error, Result};
use crate::port::{Participant, TwoPhaseCommitCoordinator};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Step spanning several participants through a [`TwoPhaseCommitCoordinator`].
///
/// Each execution generates a transaction id and stores it in the context;
/// compensation aborts that transaction on every participant.
pub struct TwoPhaseCommitStep {
    config: StepConfig,
    coordinator: Arc<dyn TwoPhaseCommitCoordinator>,
    participants: Vec<Arc<dyn Participant>>,
}

impl std::fmt::Debug for TwoPhaseCommitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoPhaseCommitStep")
            .field("config", &self.config)
            .field(
                "participants",
                &self.participants.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl TwoPhaseCommitStep {
    pub fn new(
        name: impl Into<String>,
        coordinator: Arc<dyn TwoPhaseCommitCoordinator>,
        participants: Vec<Arc<dyn Participant>>,
    ) -> Result<Self> {
        Self::with_config(StepConfig::new(name), coordinator, participants)
    }

    pub fn with_config(
        config: StepConfig,
        coordinator: Arc<dyn TwoPhaseCommitCoordinator>,
        participants: Vec<Arc<dyn Participant>>,
    ) -> Result<Self> {
        if participants.is_empty() {
            return Err(Error::validation(
                "participants",
                "two-phase commit step requires at least one participant",
            )
            .with_context("step", config.name.clone()));
        }
        Ok(Self {
            config,
            coordinator,
            participants,
        })
    }

    pub fn transaction_key(&self) -> String {
        format!("_2pc:{}:transaction_id", self.config.name)
    }

    pub fn transaction_id(&self, ctx: &SagaContext) -> Option<String> {
        ctx.get_string(&self.transaction_key())
    }
}

#[async_trait]
impl SagaStep for TwoPhaseCommitStep {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn execute(&self, ctx: &SagaContext, cancel: &CancellationToken) -> Result<()> {
        let transaction_id = Uuid::new_v4().to_string();
        ctx.set(self.transaction_key(), transaction_id.as_str());

        tracing::debug!(
            step = %self.config.name,
            transaction_id = %transaction_id,
            participants = self.participants.len(),
            "Starting two-phase commit"
        );

        self.coordinator
            .execute(cancel, &transaction_id, &self.participants)
            .await
            .map_err(|e| {
                e.with_context("step", self.config.name.clone())
                    .with_context("transaction_id", transaction_id)
            })
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<()> {
        let Some(transaction_id) = self.transaction_id(ctx) else {
            return Ok(());
        };
        self.coordinator
            .abort(&transaction_id, &self.participants)
            .await
    }

    async fn can_execute(&self, ctx: &SagaContext) -> bool {
        self.config.allows(ctx)
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.config.retry_policy.as_ref()
    }
}

/// In-process coordinator.
///
/// Prepares participants in order; the first "no" vote aborts the already
/// prepared participants in reverse and fails the transaction. Once every
/// participant has voted, all of them are committed. A commit failure is
/// reported but does not undo earlier commits.
#[derive(Debug, Clone, Default)]
pub struct LocalTwoPhaseCoordinator;

impl LocalTwoPhaseCoordinator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TwoPhaseCommitCoordinator for LocalTwoPhaseCoordinator {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        transaction_id: &str,
        participants: &[Arc<dyn Participant>],
    ) -> Result<()> {
        for (index, participant) in participants.iter().enumerate() {
            let vote = if cancel.is_cancelled() {
                Err(Error::cancelled(format!(
                    "transaction {} cancelled before prepare",
                    transaction_id
                )))
            } else {
                participant.prepare(transaction_id).await
            };

            if let Err(e) = vote {
                tracing::warn!(
                    transaction_id,
                    participant = participant.name(),
                    error = %e,
                    "Prepare failed, aborting transaction"
                );
                // Abort failures are logged by `abort`; the prepare error wins.
                let _ = self.abort(transaction_id, &participants[..index]).await;
                return Err(e.wrap(format!(
                    "participant '{}' failed to prepare transaction {}",
                    participant.name(),
                    transaction_id
                )));
            }
        }

        for participant in participants {
            participant.commit(transaction_id).await.map_err(|e| {
                e.wrap(format!(
                    "participant '{}' failed to commit transaction {}",
                    participant.name(),
                    transaction_id
                ))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;

    struct RecordingParticipant {
        name: String,
        fail_prepare: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingParticipant {
        fn new(name: &str, fail_prepare: bool, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Participant> {
            Arc::new(Self {
                name: name.to_string(),
                fail_prepare,
                log,
            })
        }
    }

    #[async_trait]
    impl Participant for RecordingParticipant {
        fn name(&self) -> &str {
            &self.name
        }

        async fn prepare(&self, _transaction_id: &str) -> Result<()> {
            self.log.lock().push(format!("prepare:{}", self.name));
            if self.fail_prepare {
                return Err(Error::step_execution("vote no"));
            }
            Ok(())
        }

        async fn commit(&self, _transaction_id: &str) -> Result<()> {
            self.log.lock().push(format!("commit:{}", self.name));
            Ok(())
        }

        async fn abort(&self, _transaction_id: &str) -> Result<()> {
            self.log.lock().push(format!("abort:{}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_prepare_then_commit_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = TwoPhaseCommitStep::new(
            "book_trip",
            Arc::new(LocalTwoPhaseCoordinator::new()),
            vec![
                RecordingParticipant::new("flight", false, log.clone()),
                RecordingParticipant::new("hotel", false, log.clone()),
            ],
        )
        .unwrap();

        let ctx = SagaContext::new();
        step.execute(&ctx, &CancellationToken::new()).await.unwrap();

        assert!(step.transaction_id(&ctx).is_some());
        assert_eq!(
            *log.lock(),
            vec!["prepare:flight", "prepare:hotel", "commit:flight", "commit:hotel"]
        );
    }

    #[tokio::test]
    async fn test_failed_prepare_aborts_prepared_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = TwoPhaseCommitStep::new(
            "book_trip",
            Arc::new(LocalTwoPhaseCoordinator::new()),
            vec![
                RecordingParticipant::new("flight", false, log.clone()),
                RecordingParticipant::new("hotel", false, log.clone()),
                RecordingParticipant::new("car", true, log.clone()),
            ],
        )
        .unwrap();

        let err = step
            .execute(&SagaContext::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("'car' failed to prepare"));
        assert_eq!(err.get_context("step"), Some("book_trip"));
        assert_eq!(
            *log.lock(),
            vec![
                "prepare:flight",
                "prepare:hotel",
                "prepare:car",
                "abort:hotel",
                "abort:flight"
            ]
        );
    }

    #[tokio::test]
    async fn test_compensation_aborts_every_participant() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = TwoPhaseCommitStep::new(
            "book_trip",
            Arc::new(LocalTwoPhaseCoordinator::new()),
            vec![
                RecordingParticipant::new("flight", false, log.clone()),
                RecordingParticipant::new("hotel", false, log.clone()),
            ],
        )
        .unwrap();

        let ctx = SagaContext::new();
        step.execute(&ctx, &CancellationToken::new()).await.unwrap();
        log.lock().clear();

        step.compensate(&ctx).await.unwrap();
        assert_eq!(*log.lock(), vec!["abort:hotel", "abort:flight"]);
    }

    #[tokio::test]
    async fn test_compensation_without_transaction_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = TwoPhaseCommitStep::new(
            "book_trip",
            Arc::new(LocalTwoPhaseCoordinator::new()),
            vec![RecordingParticipant::new("flight", false, log.clone())],
        )
        .unwrap();

        step.compensate(&SagaContext::new()).await.unwrap();
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_prepare() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let coordinator = LocalTwoPhaseCoordinator::new();
        let token = CancellationToken::new();
        token.cancel();

        let err = coordinator
            .execute(
                &token,
                "tx-1",
                &[RecordingParticipant::new("flight", false, log.clone())],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_requires_participants() {
        let result = TwoPhaseCommitStep::new(
            "empty",
            Arc::new(LocalTwoPhaseCoordinator::new()),
            vec![],
        );
        assert!(result.is_err());
    }
}
