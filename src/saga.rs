//! Ordered `{action, compensation}` steps. When a step fails, the steps that
//! already ran are compensated in reverse order before the original error is
//! handed back.

use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::AppError;

pub const MIN_COMPENSATION_ATTEMPTS: usize = 2;

#[async_trait]
pub trait SagaStep<C: Send + Sync>: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, context: &mut C) -> Result<(), AppError>;
    async fn compensate(&self, context: &C) -> Result<(), AppError>;
}

#[derive(Debug)]
pub struct SagaFailure {
    /// Step whose action failed.
    pub step: &'static str,
    pub error: AppError,
    /// Completed steps whose compensation never succeeded.
    pub unresolved: Vec<&'static str>,
}

impl SagaFailure {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

pub struct Saga<C> {
    steps: Vec<Box<dyn SagaStep<C>>>,
    compensation_attempts: usize,
}

impl<C: Send + Sync> Saga<C> {
    pub fn new(compensation_attempts: usize) -> Self {
        Self {
            steps: Vec::new(),
            compensation_attempts: compensation_attempts.max(MIN_COMPENSATION_ATTEMPTS),
        }
    }

    pub fn step(mut self, step: impl SagaStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub async fn run(&self, context: &mut C) -> Result<(), SagaFailure> {
        for (index, step) in self.steps.iter().enumerate() {
            if let Err(err) = step.execute(context).await {
                warn!(step = step.name(), ?err, "saga step failed, compensating");
                let unresolved = self.compensate(&self.steps[..index], context).await;
                return Err(SagaFailure {
                    step: step.name(),
                    error: err,
                    unresolved,
                });
            }
        }
        Ok(())
    }

    async fn compensate(&self, completed: &[Box<dyn SagaStep<C>>], context: &C) -> Vec<&'static str> {
        let mut unresolved = Vec::new();
        for step in completed.iter().rev() {
            let mut compensated = false;
            for attempt in 1..=self.compensation_attempts {
                match step.compensate(context).await {
                    Ok(()) => {
                        compensated = true;
                        break;
                    }
                    Err(err) => warn!(step = step.name(), attempt, ?err, "compensation failed"),
                }
            }
            if !compensated {
                error!(
                    step = step.name(),
                    attempts = self.compensation_attempts,
                    "compensation exhausted, resource orphaned"
                );
                unresolved.push(step.name());
            }
        }
        unresolved
    }
}
