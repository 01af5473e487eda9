//! Checkpoint-guarded step runner.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::plan::{Step, StepId, StepKind};
use crate::error::InstallError;
use crate::state::RetryConfig;
use crate::store::ConfigStore;
use crate::ui;

/// Performs the work behind each step.
#[async_trait]
pub trait StepExecutor: Send {
    async fn execute(&mut self, step: StepId, store: &mut ConfigStore) -> Result<(), InstallError>;
}

/// What a run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub executed: Vec<StepId>,
    pub skipped: Vec<StepId>,
}

/// Runs a plan against a store.
pub struct Pipeline {
    name: &'static str,
    steps: Vec<Step>,
    retry: RetryConfig,
    dry_run: bool,
}

impl Pipeline {
    #[must_use]
    pub fn new(name: &'static str, steps: Vec<Step>) -> Self {
        Self {
            name,
            steps,
            retry: RetryConfig::default(),
            dry_run: false,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Whether a checkpointed step after `index` has not completed yet.
    fn pending_after(&self, index: usize, store: &ConfigStore) -> bool {
        self.steps[index + 1..]
            .iter()
            .filter_map(Step::checkpoint)
            .any(|cp| !store.checkpoint(cp))
    }

    fn should_run(&self, index: usize, store: &ConfigStore) -> bool {
        match &self.steps[index].kind {
            StepKind::Checkpointed(cp) => !store.checkpoint(cp),
            StepKind::Session => self.pending_after(index, store),
            StepKind::Always => true,
        }
    }

    /// Run every pending step in order.
    ///
    /// The store is flushed after each completed step and before returning
    /// an error, so an aborted run resumes at the failed step.
    ///
    /// # Errors
    /// Returns the first non-retryable step error, or a retryable one once
    /// its retries are spent.
    pub async fn run<E>(&self, executor: &mut E, store: &mut ConfigStore) -> Result<RunReport, InstallError>
    where
        E: StepExecutor + ?Sized,
    {
        let total = self.steps.len();
        let mut report = RunReport::default();
        info!(pipeline = self.name, steps = total, dry_run = self.dry_run, "Starting pipeline");

        for (index, step) in self.steps.iter().enumerate() {
            let number = index + 1;
            if !self.should_run(index, store) {
                if step.checkpoint().is_some() {
                    ui::print_skipped_step(number, total, step.id.description());
                }
                report.skipped.push(step.id);
                continue;
            }

            ui::print_progress_step(number, total, step.id.description());

            if self.dry_run && step.external {
                info!(step = %step.id, "[dry-run] skipping external step");
            } else {
                self.execute_with_retry(step, executor, store).await?;
            }

            if let Some(cp) = step.checkpoint() {
                store.mark(cp);
            }
            store.flush()?;
            report.executed.push(step.id);
        }

        info!(pipeline = self.name, executed = report.executed.len(), "Pipeline finished");
        Ok(report)
    }

    async fn execute_with_retry<E>(
        &self,
        step: &Step,
        executor: &mut E,
        store: &mut ConfigStore,
    ) -> Result<(), InstallError>
    where
        E: StepExecutor + ?Sized,
    {
        let mut attempt = 0;
        loop {
            match executor.execute(step.id, store).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        step = %step.id,
                        kind = e.kind(),
                        attempt,
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "Transient error, retrying"
                    );
                    ui::print_warning(&format!("Transient error (attempt {attempt}): {e}"));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if let Err(flush) = store.flush() {
                        warn!(error = %flush, "Failed to save state after error");
                    }
                    error!(
                        step = %step.id,
                        kind = e.kind(),
                        error = %e,
                        "Step failed"
                    );
                    ui::print_error(&format!(
                        "{} failed at step '{}': {e}",
                        self.name,
                        step.id.description()
                    ));
                    ui::print_info(e.remedy());
                    return Err(e);
                }
            }
        }
    }
}
