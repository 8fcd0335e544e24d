//! Compaction engine
//!
//! A pass folds one buffer into its columnar target:
//!
//! ```text
//! Idle -> Isolating -> Skipped
//!                   -> Reading -> Merging -> Writing -> Validating -> CleaningUp -> Done
//!                      any failure from Reading on  -> MarkingFailed -> Failed
//! ```
//!
//! The buffer is isolated first, so appenders keep writing to a fresh
//! buffer while the snapshot is read. Prior rows always precede new rows
//! in the rewritten target. A pass that fails after isolation keeps its
//! snapshot under `<buffer>.failed.<ts>` for recovery (or discards it when
//! configured to) and then returns the original error.
//!
//! At most one pass per target may be in flight. Passes over different
//! targets are independent and may run concurrently.

use crate::append::AppendWriter;
use crate::columnar::{self, ColumnarContents};
use crate::config::{BufpondConfig, CompactionConfig, CompactionOptions, WriteStrategy};
use crate::error::{CompactorError, Result};
use crate::integrity::IntegrityValidator;
use crate::isolation::{self, IsolatedBuffer};
use crate::outcome::{BatchReport, Outcome};
use crate::resilience::{ResiliencePolicy, RetryClass};
use crate::rows::{self, DecodedRows};
use crate::schema;
use arrow::compute::concat_batches;
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use blobfs::BlobStore;
use diagnostics::*;
use futures::StreamExt;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    Idle,
    Isolating,
    Skipped,
    Reading,
    Merging,
    Writing,
    Validating,
    CleaningUp,
    Done,
    MarkingFailed,
    Failed,
}

impl CompactionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CompactionState::Skipped | CompactionState::Done | CompactionState::Failed
        )
    }
}

impl fmt::Display for CompactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompactionState::Idle => "idle",
            CompactionState::Isolating => "isolating",
            CompactionState::Skipped => "skipped",
            CompactionState::Reading => "reading",
            CompactionState::Merging => "merging",
            CompactionState::Writing => "writing",
            CompactionState::Validating => "validating",
            CompactionState::CleaningUp => "cleaning-up",
            CompactionState::Done => "done",
            CompactionState::MarkingFailed => "marking-failed",
            CompactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Logs every transition of one pass
struct StateTracker {
    buffer: String,
    state: CompactionState,
}

impl StateTracker {
    fn new(buffer: &str) -> Self {
        Self {
            buffer: buffer.to_string(),
            state: CompactionState::Idle,
        }
    }

    fn enter(&mut self, next: CompactionState) {
        let buffer = self.buffer.as_str();
        log_debug!(
            "Compaction of {buffer}: {from} -> {to}",
            buffer: buffer,
            from: self.state.to_string(),
            to: next.to_string()
        );
        self.state = next;
    }
}

/// Fold `buffer` into `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRequest {
    pub buffer: String,
    pub target: String,
}

impl CompactionRequest {
    pub fn new(buffer: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            buffer: buffer.into(),
            target: target.into(),
        }
    }
}

/// A pass that got past isolation. Lives only as long as the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionJob {
    pub buffer_path: String,
    pub target_path: String,
    pub isolated_path: String,
    pub timestamp: i64,
}

impl CompactionJob {
    fn new(request: &CompactionRequest, isolated: IsolatedBuffer) -> Self {
        Self {
            buffer_path: isolated.buffer_path,
            target_path: request.target.clone(),
            isolated_path: isolated.path,
            timestamp: isolated.timestamp,
        }
    }

    pub fn failed_path(&self) -> String {
        isolation::failed_path(&self.buffer_path, self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    Compacted,
    /// There was no buffer; the target is untouched
    Skipped,
}

/// What a successful pass did
#[derive(Debug, Clone)]
pub struct CompactionReport {
    pub buffer: String,
    pub target: String,
    pub outcome: CompactionOutcome,
    /// Rows the target held before the pass
    pub rows_before: usize,
    pub rows_appended: usize,
    /// Committed length of the rewritten target; 0 if it was not rewritten
    pub bytes_written: u64,
    /// Target schema after the pass, if there is a target
    pub schema: Option<SchemaRef>,
    /// Fields the pass introduced, in schema order
    pub added_fields: Vec<String>,
    pub isolated_path: Option<String>,
    /// The isolated snapshot still exists
    pub snapshot_retained: bool,
    pub final_state: CompactionState,
}

impl CompactionReport {
    fn skipped(request: &CompactionRequest) -> Self {
        Self {
            buffer: request.buffer.clone(),
            target: request.target.clone(),
            outcome: CompactionOutcome::Skipped,
            rows_before: 0,
            rows_appended: 0,
            bytes_written: 0,
            schema: None,
            added_fields: Vec::new(),
            isolated_path: None,
            snapshot_retained: false,
            final_state: CompactionState::Skipped,
        }
    }

    pub fn rows_total(&self) -> usize {
        self.rows_before + self.rows_appended
    }
}

/// Rows ready to be written
struct Merged {
    schema: SchemaRef,
    row_groups: Vec<Vec<RecordBatch>>,
    added_fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Compactor {
    store: Arc<dyn BlobStore>,
    policy: ResiliencePolicy,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(store: Arc<dyn BlobStore>, policy: ResiliencePolicy, config: CompactionConfig) -> Self {
        Self {
            store,
            policy,
            config,
        }
    }

    pub fn from_config(store: Arc<dyn BlobStore>, config: &BufpondConfig) -> Self {
        Self::new(
            store,
            ResiliencePolicy::new(config.resilience.clone()),
            config.compaction.clone(),
        )
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// An appender for buffers on the same store, with the same retry policy
    pub fn writer(&self) -> AppendWriter {
        AppendWriter::new(self.store.clone(), self.policy.clone())
            .with_max_recreate_attempts(self.config.max_recreate_attempts)
    }

    /// Run one compaction pass.
    ///
    /// `options.deadline` bounds the whole pass. When it trips the pass is
    /// failed like any other cancellation and `DeadlineExceeded` is returned.
    pub async fn compact(
        &self,
        request: &CompactionRequest,
        options: &CompactionOptions,
        cancel: &CancellationToken,
    ) -> Result<CompactionReport> {
        let settings = options.resolve(&self.config);
        let pass = cancel.child_token();
        let _deadline = options.deadline.map(|deadline| arm_deadline(&pass, deadline));

        self.run(request, &settings, &pass)
            .await
            .map_err(|err| surface(err, cancel, options.deadline))
    }

    /// Compact independent targets concurrently.
    ///
    /// Every request gets an [`Outcome`]; a later request naming a target
    /// already in the batch fails with `InFlight` without running.
    pub async fn compact_many(
        &self,
        requests: Vec<CompactionRequest>,
        options: &CompactionOptions,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut in_flight = HashSet::new();
        let passes = requests.into_iter().map(|request| {
            let duplicate = !in_flight.insert(request.target.clone());
            async move {
                let target = request.target.clone();
                if duplicate {
                    log_warn!(
                        "Skipping duplicate compaction into {target}",
                        target: target.as_str()
                    );
                    return Outcome::Failed {
                        error: CompactorError::InFlight {
                            target: target.clone(),
                        },
                        target,
                    };
                }
                match self.compact(&request, options, cancel).await {
                    Ok(report) if report.outcome == CompactionOutcome::Skipped => {
                        Outcome::Skipped(target)
                    }
                    Ok(report) => Outcome::Compacted(report),
                    Err(error) => Outcome::Failed { target, error },
                }
            }
        });

        let outcomes = futures::stream::iter(passes)
            .buffered(self.config.max_concurrent_jobs.max(1))
            .collect::<Vec<_>>()
            .await;

        let report = BatchReport { outcomes };
        log_info!("Batch compaction finished: {summary}", summary: report.to_string());
        report
    }

    async fn run(
        &self,
        request: &CompactionRequest,
        settings: &CompactionConfig,
        cancel: &CancellationToken,
    ) -> Result<CompactionReport> {
        let buffer = request.buffer.as_str();
        let target = request.target.as_str();
        let mut tracker = StateTracker::new(buffer);

        tracker.enter(CompactionState::Isolating);
        let isolated =
            isolation::isolate(self.store.as_ref(), &self.policy, buffer, cancel).await?;
        let Some(isolated) = isolated else {
            tracker.enter(CompactionState::Skipped);
            log_info!(
                "Nothing to compact from {buffer} into {target}",
                buffer: buffer,
                target: target
            );
            return Ok(CompactionReport::skipped(request));
        };

        let job = CompactionJob::new(request, isolated);
        match self.fold(&job, settings, cancel, &mut tracker).await {
            Ok(report) => {
                log_info!(
                    "Compacted {rows} rows from {buffer} into {target} ({bytes} bytes)",
                    buffer: buffer,
                    target: target,
                    rows: report.rows_appended,
                    bytes: report.bytes_written
                );
                Ok(report)
            }
            Err(err) => {
                tracker.enter(CompactionState::MarkingFailed);
                self.mark_failed(&job, settings).await;
                tracker.enter(CompactionState::Failed);
                log_error!(
                    "Compaction of {buffer} into {target} failed: {error}",
                    buffer: buffer,
                    target: target,
                    error: err.to_string()
                );
                Err(err)
            }
        }
    }

    /// Everything between isolation and the final state
    async fn fold(
        &self,
        job: &CompactionJob,
        settings: &CompactionConfig,
        cancel: &CancellationToken,
        tracker: &mut StateTracker,
    ) -> Result<CompactionReport> {
        tracker.enter(CompactionState::Reading);
        let incoming = self.read_snapshot(&job.isolated_path, cancel).await?;
        let prior = self.read_target(&job.target_path, cancel).await?;
        checkpoint(cancel)?;
        let rows_before = prior.as_ref().map_or(0, ColumnarContents::num_rows);

        let mut report = CompactionReport {
            buffer: job.buffer_path.clone(),
            target: job.target_path.clone(),
            outcome: CompactionOutcome::Compacted,
            rows_before,
            rows_appended: 0,
            bytes_written: 0,
            schema: None,
            added_fields: Vec::new(),
            isolated_path: Some(job.isolated_path.clone()),
            snapshot_retained: false,
            final_state: CompactionState::Done,
        };

        let Some(incoming) = incoming else {
            let isolated = job.isolated_path.as_str();
            log_debug!(
                "Snapshot {isolated} holds no records, leaving the target as it is",
                isolated: isolated
            );
            report.schema = prior.map(|p| p.schema);
            report.snapshot_retained = self.clean_up(job, settings, tracker).await;
            tracker.enter(CompactionState::Done);
            return Ok(report);
        };
        report.rows_appended = incoming.num_rows();

        tracker.enter(CompactionState::Merging);
        let merged = merge(prior, incoming, settings.write_strategy)?;
        checkpoint(cancel)?;

        tracker.enter(CompactionState::Writing);
        let encoded = columnar::write(
            &merged.schema,
            &merged.row_groups,
            settings.max_row_group_size,
        )?;
        let store = &self.store;
        let target = job.target_path.as_str();
        let written = self
            .policy
            .execute(
                RetryClass::Mutation,
                &format!("write {target}"),
                cancel,
                |_| {
                    let encoded = encoded.clone();
                    async move { Ok(store.upload(target, encoded).await?) }
                },
            )
            .await;

        tracker.enter(CompactionState::Validating);
        let validator = IntegrityValidator::new(self.store.clone(), self.policy.clone());
        report.bytes_written = validator
            .validate_or_cleanup(target, settings.min_valid_size, written, cancel)
            .await?;
        report.schema = Some(merged.schema);
        report.added_fields = merged.added_fields;

        report.snapshot_retained = self.clean_up(job, settings, tracker).await;
        tracker.enter(CompactionState::Done);
        Ok(report)
    }

    async fn read_snapshot(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<DecodedRows>> {
        let store = &self.store;
        let data = self
            .policy
            .execute(
                RetryClass::Mutation,
                &format!("read {path}"),
                cancel,
                |_| async move { Ok(store.read_all(path).await?) },
            )
            .await?;
        rows::decode(&data)
    }

    async fn read_target(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ColumnarContents>> {
        let store = &self.store;
        let exists = self
            .policy
            .execute(
                RetryClass::Metadata,
                &format!("check {path}"),
                cancel,
                |_| async move { Ok(store.exists(path).await?) },
            )
            .await?;
        if !exists {
            return Ok(None);
        }

        let data = self
            .policy
            .execute(
                RetryClass::Mutation,
                &format!("read {path}"),
                cancel,
                |_| async move { Ok(store.read_all(path).await?) },
            )
            .await?;
        Ok(Some(columnar::read(data)?))
    }

    /// Retire the snapshot of a successful pass. Returns whether it is
    /// still there.
    async fn clean_up(
        &self,
        job: &CompactionJob,
        settings: &CompactionConfig,
        tracker: &mut StateTracker,
    ) -> bool {
        tracker.enter(CompactionState::CleaningUp);
        if !settings.delete_isolated_on_success {
            return true;
        }

        let store = &self.store;
        let isolated = job.isolated_path.as_str();
        // The target already holds these rows; finish even if cancelled
        let result = self
            .policy
            .execute(
                RetryClass::Mutation,
                &format!("delete {isolated}"),
                &CancellationToken::new(),
                |_| async move { Ok(store.delete(isolated).await?) },
            )
            .await;
        match result {
            Ok(()) => false,
            Err(e) => {
                log_warn!(
                    "Compacted snapshot {isolated} could not be deleted: {error}",
                    isolated: isolated,
                    error: e.to_string()
                );
                true
            }
        }
    }

    /// Preserve or discard the snapshot of a failed pass. Runs to
    /// completion regardless of cancellation and never fails.
    async fn mark_failed(&self, job: &CompactionJob, settings: &CompactionConfig) {
        let store = &self.store;
        let isolated = job.isolated_path.as_str();
        let uncancellable = CancellationToken::new();

        if !settings.preserve_failed {
            let result = self
                .policy
                .execute(
                    RetryClass::Mutation,
                    &format!("discard {isolated}"),
                    &uncancellable,
                    |_| async move { Ok(store.delete(isolated).await?) },
                )
                .await;
            if let Err(e) = result {
                log_error!(
                    "Could not discard failed snapshot {isolated}: {error}",
                    isolated: isolated,
                    error: e.to_string()
                );
            }
            return;
        }

        let failed = job.failed_path();
        let failed_ref = failed.as_str();
        let result = self
            .policy
            .execute(
                RetryClass::Mutation,
                &format!("preserve {isolated}"),
                &uncancellable,
                |ctx| async move {
                    match store.rename(isolated, failed_ref).await {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_not_found() && ctx.is_retry() => {
                            if store.exists(failed_ref).await? {
                                Ok(())
                            } else {
                                Err(e.into())
                            }
                        }
                        Err(e) => Err(e.into()),
                    }
                },
            )
            .await;
        match result {
            Ok(()) => {
                log_warn!(
                    "Preserved failed snapshot {isolated} as {failed}",
                    isolated: isolated,
                    failed: failed.as_str()
                );
            }
            Err(e) => {
                log_error!(
                    "Could not preserve failed snapshot {isolated}: {error}",
                    isolated: isolated,
                    error: e.to_string()
                );
            }
        }
    }
}

/// Combine prior and incoming rows under the widened schema, prior first
fn merge(
    prior: Option<ColumnarContents>,
    incoming: DecodedRows,
    strategy: WriteStrategy,
) -> Result<Merged> {
    let (schema, prior_groups, added_fields) = match prior {
        None => {
            let added = incoming
                .schema
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect();
            (incoming.schema.clone(), Vec::new(), added)
        }
        Some(prior) => {
            let schema = Arc::new(schema::evolve(&prior.schema, &incoming.schema));
            let added = schema::added_fields(&prior.schema, &schema);
            let groups = prior
                .row_groups
                .iter()
                .map(|group| {
                    group
                        .iter()
                        .map(|batch| schema::conform(batch, &schema))
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()?;
            (schema, groups, added)
        }
    };

    let fresh = incoming
        .batches
        .iter()
        .map(|batch| schema::conform(batch, &schema))
        .collect::<Result<Vec<_>>>()?;

    let row_groups = match strategy {
        WriteStrategy::Rewrite => {
            let all: Vec<RecordBatch> = prior_groups.into_iter().flatten().chain(fresh).collect();
            vec![vec![concat_batches(&schema, &all)?]]
        }
        WriteStrategy::AppendRowGroup => {
            let mut groups = prior_groups;
            groups.push(fresh);
            groups
        }
    };

    Ok(Merged {
        schema,
        row_groups,
        added_fields,
    })
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(CompactorError::Cancelled)
    } else {
        Ok(())
    }
}

/// Cancel `pass` once `deadline` has elapsed. Dropping the guard stops the timer.
fn arm_deadline(pass: &CancellationToken, deadline: Duration) -> DropGuard {
    let timer = pass.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    pass.clone().drop_guard()
}

/// A cancellation the caller did not ask for came from the deadline
fn surface(
    err: CompactorError,
    caller: &CancellationToken,
    deadline: Option<Duration>,
) -> CompactorError {
    match (err, deadline) {
        (CompactorError::Cancelled, Some(deadline)) if !caller.is_cancelled() => {
            CompactorError::DeadlineExceeded {
                millis: deadline.as_millis() as u64,
            }
        }
        (err, _) => err,
    }
}
