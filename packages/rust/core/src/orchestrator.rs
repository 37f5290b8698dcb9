//! Run driver: corpus → pending set → chunks → stages → manifest commit.
//!
//! A run takes the corpus and keeps the records that have not exited under the
//! current pipeline signature. It then works through them in chunks of
//! `chunk_size`. Every stage sees the whole chunk before the next stage
//! starts, which keeps batches full. For each stage the orchestrator:
//!
//! 1. serves records from the versioned cache where it can,
//! 2. batches the misses by the stage's `batch_size` and invokes it,
//! 3. caches successes and merges them into the record,
//! 4. routes failures by class (fatal aborts, exhausted retryable errors
//!    leave the record pending, anything else is logged and the record
//!    continues without this stage's output).
//!
//! After the gate stage the quality gate rejects low scorers, and they skip
//! all later stages. At the end of a chunk, exited records go to the record
//! store and then to the manifest, and the chunk's checkpoints are dropped.

use std::time::Instant;

use paperflow_shared::{
    ErrorClass, ExitOutcome, FailureRecord, ManifestEntry, ManifestState, PaperflowError, Record,
    Result, StageCounts, StageDescriptor, StageError,
};
use paperflow_storage::{Checkpointer, RecordStore, StoredRecord};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::batch::{assemble, disassemble};
use crate::context::RunContext;
use crate::pipeline::Pipeline;
use crate::report::{FailedRecord, RunReport, StageReport};
use crate::stage::Stage;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a stage starts on a chunk of `total` records.
    fn stage_started(&self, stage: &str, total: usize);
    /// Called as records of the current stage are handled.
    fn stage_progress(&self, stage: &str, done: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn stage_started(&self, _stage: &str, _total: usize) {}
    fn stage_progress(&self, _stage: &str, _done: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// What to do with a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Abort the run.
    Abort,
    /// Leave the record pending; a later run retries it.
    Retry,
    /// Log it and continue with the next stage.
    Degrade,
}

fn disposition(descriptor: &StageDescriptor, err: &StageError) -> Disposition {
    if err.kind.class() == ErrorClass::Fatal {
        Disposition::Abort
    } else if err.is_retryable(&descriptor.transient) {
        Disposition::Retry
    } else {
        Disposition::Degrade
    }
}

/// Per-record state while a chunk moves through the stages.
struct Slot {
    record: Record,
    /// Still flowing through stages.
    active: bool,
    outcome: Option<ExitOutcome>,
}

/// Drives a [`Pipeline`] over a corpus.
#[derive(Debug)]
pub struct Orchestrator {
    pipeline: Pipeline,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Process every pending record of `corpus`.
    ///
    /// A run with nothing pending returns immediately and writes nothing.
    #[instrument(skip_all, fields(run_id = %ctx.run_id(), corpus = corpus.len()))]
    pub async fn run(
        &self,
        ctx: &RunContext,
        corpus: Vec<Record>,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let signature = self.pipeline.signature();
        let mut report = RunReport::new(ctx.run_id(), &signature, corpus.len());
        report.stages = self
            .pipeline
            .stages()
            .iter()
            .map(|s| {
                let d = s.descriptor();
                StageReport {
                    name: d.name.clone(),
                    version: d.version,
                    counts: StageCounts::default(),
                    elapsed_ms: 0,
                }
            })
            .collect();

        progress.phase("Loading manifest");
        let mut manifest = ctx.manifest().load()?;
        let options = ctx.options();
        let pending: Vec<Record> = corpus
            .into_iter()
            .filter(|r| {
                options.is_forced(&r.record_id) || !manifest.is_done(&r.record_id, &signature)
            })
            .collect();
        report.pending = pending.len();

        if pending.is_empty() {
            info!(signature = %signature, "nothing pending");
            report.elapsed_ms = start.elapsed().as_millis() as u64;
            progress.done(&report);
            return Ok(report);
        }

        info!(
            pending = pending.len(),
            signature = %signature,
            stages = self.pipeline.len(),
            "starting run"
        );

        ctx.layout().ensure()?;
        let store = ctx.layout().open_records().await?;
        store.start_run(ctx.run_id()).await?;

        let chunks = assemble(pending, options.chunk_size);
        let chunk_count = chunks.len();
        for (n, chunk) in chunks.into_iter().enumerate() {
            progress.phase(&format!("Chunk {}/{}", n + 1, chunk_count));
            debug!(chunk = n + 1, of = chunk_count, records = chunk.len(), "processing chunk");
            self.run_chunk(ctx, &store, &mut manifest, chunk, &mut report, progress)
                .await?;
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        let report_json = serde_json::to_string(&report)
            .map_err(|e| PaperflowError::Storage(format!("serialize run report: {e}")))?;
        store.finish_run(ctx.run_id(), &report_json).await?;

        info!(
            completed = report.completed,
            rejected = report.rejected,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "run finished"
        );
        progress.done(&report);
        Ok(report)
    }

    async fn run_chunk(
        &self,
        ctx: &RunContext,
        store: &RecordStore,
        manifest: &mut ManifestState,
        chunk: Vec<Record>,
        report: &mut RunReport,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let mut slots: Vec<Slot> = chunk
            .into_iter()
            .map(|record| Slot {
                record,
                active: true,
                outcome: None,
            })
            .collect();

        for (index, stage) in self.pipeline.stages().iter().enumerate() {
            let stage_start = Instant::now();
            let mut counts = self
                .run_stage(ctx, stage.as_ref(), &mut slots, report, progress)
                .await?;

            if let Some((_, gate)) = self.pipeline.gate().filter(|(i, _)| *i == index) {
                for slot in slots.iter_mut().filter(|s| s.active) {
                    let verdict = gate.apply(&mut slot.record);
                    if !verdict.passed {
                        debug!(record = %slot.record.record_id, score = verdict.score, "rejected by quality gate");
                        slot.active = false;
                        slot.outcome = Some(ExitOutcome::Rejected);
                        counts.rejected += 1;
                    }
                }
            }

            let name = &stage.descriptor().name;
            info!(
                stage = %name,
                cache_hits = counts.cache_hits,
                processed = counts.processed,
                failed = counts.failed,
                rejected = counts.rejected,
                "stage finished"
            );
            let stage_report = &mut report.stages[index];
            stage_report.counts.add(&counts);
            stage_report.elapsed_ms += stage_start.elapsed().as_millis() as u64;
        }

        for slot in slots.iter_mut().filter(|s| s.active) {
            slot.outcome = Some(ExitOutcome::Completed);
        }

        self.commit_chunk(ctx, store, manifest, &slots, report).await
    }

    /// Run one stage over the active records of a chunk.
    async fn run_stage(
        &self,
        ctx: &RunContext,
        stage: &dyn Stage,
        slots: &mut [Slot],
        report: &mut RunReport,
        progress: &dyn ProgressReporter,
    ) -> Result<StageCounts> {
        let descriptor = stage.descriptor();
        let options = ctx.options();
        let bypass_cache = options.refresh_stages.contains(&descriptor.name);
        let mut checkpoint = Checkpointer::resume(
            ctx.checkpoints(),
            options.checkpoint,
            &descriptor.name,
            descriptor.version,
            ctx.run_id(),
        );
        let mut counts = StageCounts::default();

        let live: Vec<usize> = (0..slots.len()).filter(|&i| slots[i].active).collect();
        let total = live.len();
        progress.stage_started(&descriptor.name, total);

        let mut misses = Vec::new();
        for &i in &live {
            let record = &mut slots[i].record;
            let cached = if bypass_cache {
                None
            } else {
                ctx.cache()
                    .get(&descriptor.name, descriptor.version, &record.record_id)
            };
            if let Some(payload) = cached {
                record.merge_namespace(&descriptor.namespace, &payload);
                checkpoint.mark_cached(&record.record_id)?;
                counts.cache_hits += 1;
                continue;
            }

            if checkpoint.previously_failed(&record.record_id)
                && !options.force_ids.contains(&record.record_id)
                && !options.force
            {
                debug!(stage = %descriptor.name, record = %record.record_id, "already failed before interruption");
                continue;
            }

            let missing = descriptor.missing_inputs(record);
            if !missing.is_empty() {
                let err = StageError::invalid_input(format!(
                    "missing required field(s): {}",
                    missing.join(", ")
                ));
                let id = record.record_id.clone();
                self.log_failure(ctx, descriptor, &id, &err, true, report)?;
                checkpoint.mark_failed(&id)?;
                counts.failed += 1;
                continue;
            }

            misses.push(i);
        }
        progress.stage_progress(&descriptor.name, total - misses.len(), total);

        let mut done = total - misses.len();
        for batch_slots in assemble(misses, descriptor.batch_size) {
            let batch: Vec<Record> = batch_slots
                .iter()
                .map(|&i| slots[i].record.clone())
                .collect();
            let results = self.invoke(stage, &batch).await?;

            for (&i, result) in batch_slots.iter().zip(results) {
                let id = slots[i].record.record_id.clone();
                match result {
                    Ok(payload) => {
                        ctx.cache()
                            .put(&descriptor.name, descriptor.version, &id, &payload)?;
                        slots[i]
                            .record
                            .merge_namespace(&descriptor.namespace, &payload);
                        checkpoint.mark_processed(&id)?;
                        counts.processed += 1;
                    }
                    Err(err) => match disposition(descriptor, &err) {
                        Disposition::Abort => {
                            checkpoint.flush()?;
                            return Err(err.into());
                        }
                        Disposition::Retry => {
                            self.log_failure(ctx, descriptor, &id, &err, false, report)?;
                            checkpoint.counts_mut().failed += 1;
                            slots[i].active = false;
                            report.failed += 1;
                            counts.failed += 1;
                        }
                        Disposition::Degrade => {
                            self.log_failure(ctx, descriptor, &id, &err, true, report)?;
                            checkpoint.mark_failed(&id)?;
                            counts.failed += 1;
                        }
                    },
                }
            }
            done += batch_slots.len();
            progress.stage_progress(&descriptor.name, done, total);
        }

        checkpoint.finish()?;
        Ok(counts)
    }

    /// Invoke `stage` on a batch and align the answers to it.
    ///
    /// When the whole batch fails with a non-fatal error, each record is
    /// retried on its own so one bad record cannot sink its neighbours. If the
    /// first of those single calls runs into the same retryable error, the
    /// source is treated as down and the rest of the batch is left pending
    /// without further calls.
    async fn invoke(
        &self,
        stage: &dyn Stage,
        batch: &[Record],
    ) -> Result<Vec<std::result::Result<Value, StageError>>> {
        let descriptor = stage.descriptor();
        let keys: Vec<String> = batch.iter().map(|r| r.record_id.clone()).collect();
        let err = match stage.run_batch(batch).await {
            Ok(results) => return Ok(disassemble(&keys, results)),
            Err(err) if err.kind.class() == ErrorClass::Fatal => return Err(err.into()),
            Err(err) => err,
        };
        if batch.len() == 1 {
            return Ok(vec![Err(err)]);
        }

        warn!(
            stage = %descriptor.name,
            size = batch.len(),
            error = %err,
            "batch failed, retrying records one at a time"
        );
        let mut out = Vec::with_capacity(batch.len());
        for (n, (record, key)) in batch.iter().zip(&keys).enumerate() {
            match stage.run_batch(std::slice::from_ref(record)).await {
                Ok(results) => out.extend(disassemble(std::slice::from_ref(key), results)),
                Err(e) if e.kind.class() == ErrorClass::Fatal => return Err(e.into()),
                Err(e) if n == 0 && e.kind == err.kind && e.is_retryable(&descriptor.transient) => {
                    warn!(
                        stage = %descriptor.name,
                        kind = %e.kind,
                        pending = batch.len(),
                        "source still failing, leaving the batch for the next run"
                    );
                    out.extend(std::iter::repeat_n(Err(e), batch.len()));
                    break;
                }
                Err(e) => out.push(Err(e)),
            }
        }
        Ok(out)
    }

    fn log_failure(
        &self,
        ctx: &RunContext,
        descriptor: &StageDescriptor,
        record_id: &str,
        err: &StageError,
        committed: bool,
        report: &mut RunReport,
    ) -> Result<()> {
        warn!(
            stage = %descriptor.name,
            record = %record_id,
            kind = %err.kind,
            attempts = err.attempts,
            "record failed: {}",
            err.message
        );
        ctx.failures().append(&FailureRecord {
            record_id: record_id.to_string(),
            stage_name: descriptor.name.clone(),
            error_kind: err.kind,
            message: err.message.clone(),
            timestamp: chrono::Utc::now(),
            attempts: err.attempts,
            run_id: Some(ctx.run_id().to_string()),
        })?;
        report.failures.push(FailedRecord {
            record_id: record_id.to_string(),
            stage: descriptor.name.clone(),
            kind: err.kind,
            message: err.message.clone(),
            committed,
        });
        Ok(())
    }

    /// Persist exited records, then commit them to the manifest.
    async fn commit_chunk(
        &self,
        ctx: &RunContext,
        store: &RecordStore,
        manifest: &mut ManifestState,
        slots: &[Slot],
        report: &mut RunReport,
    ) -> Result<()> {
        let gate_ns = self.pipeline.gate().map(|(_, g)| g.stage_name().to_string());
        let now = chrono::Utc::now();
        let mut exits = Vec::new();

        for slot in slots {
            let Some(outcome) = slot.outcome else {
                continue;
            };
            let record = &slot.record;
            let (score, components) = match &gate_ns {
                Some(ns) => (
                    record.get_f64(&format!("{ns}.score")),
                    record.get(&format!("{ns}.components")).cloned(),
                ),
                None => (None, None),
            };
            store
                .upsert(&StoredRecord {
                    record_id: record.record_id.clone(),
                    status: outcome,
                    searchable: outcome == ExitOutcome::Completed,
                    score,
                    components,
                    fields: record.fields.clone(),
                    run_id: ctx.run_id().to_string(),
                    updated_at: now,
                })
                .await?;

            match outcome {
                ExitOutcome::Completed => report.completed += 1,
                ExitOutcome::Rejected => report.rejected += 1,
            }
            exits.push((
                record.record_id.clone(),
                ManifestEntry {
                    outcome,
                    signature: report.signature.clone(),
                },
            ));
        }

        ctx.manifest()
            .commit(manifest, exits, &self.pipeline.stage_versions())?;
        ctx.checkpoints().clear_all()?;
        Ok(())
    }
}
