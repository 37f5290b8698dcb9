//! End-to-end runs of the orchestrator against a temporary state directory.
//!
//! Stages are scripted fakes (or real stages wrapped in a counter) so each
//! test can assert exactly which records were sent to which stage.

mod helpers;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use helpers::{Counted, FakeStage, TestState, abc, count, record, strong};
use paperflow_core::{
    Orchestrator, Pipeline, QualityGate, QualityStage, RunOptions, SilentProgress,
};
use paperflow_core::stages::ValidateStage;
use paperflow_storage::CheckpointPolicy;
use paperflow_shared::{
    ErrorClass, ErrorKind, ExitOutcome, GateConfig, PaperflowError, StageCost, StageError,
};
use serde_json::json;

fn two_stage(validate: FakeStage, enrich: FakeStage) -> Orchestrator {
    Orchestrator::new(Pipeline::new(vec![validate.boxed(), enrich.boxed()]).unwrap())
}

fn cache_entries(state: &TestState) -> usize {
    state
        .ctx()
        .cache()
        .stats()
        .unwrap()
        .iter()
        .map(|s| s.entries)
        .sum()
}

fn gated(gate: GateConfig) -> (Orchestrator, Arc<std::sync::atomic::AtomicUsize>) {
    let embed = FakeStage::new("embed", 1)
        .with_cost(StageCost::Inference)
        .with_batch_size(8);
    let embed_calls = embed.calls();
    let pipeline = Pipeline::new(vec![
        Box::new(ValidateStage::new()),
        Box::new(QualityStage::new(QualityGate::new(gate.clone()))),
        embed.boxed(),
    ])
    .unwrap()
    .with_gate(QualityGate::new(gate))
    .unwrap();
    (Orchestrator::new(pipeline), embed_calls)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_run_caches_every_stage() {
    let state = TestState::new();
    let ctx = state.ctx();
    let orch = two_stage(FakeStage::new("validate", 1), FakeStage::new("enrich", 1));

    let report = orch.run(&ctx, abc(), &SilentProgress).await.unwrap();

    assert_eq!(report.pending, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(report.rejected, 0);
    assert_eq!(report.failed, 0);
    assert!(report.failures.is_empty());

    let manifest = ctx.manifest().load().unwrap();
    let ids: Vec<&str> = manifest.exited.keys().map(String::as_str).collect();
    assert_eq!(ids, vec!["A", "B", "C"]);
    assert!(manifest.exited.values().all(|e| e.outcome == ExitOutcome::Completed));
    assert_eq!(manifest.stage_versions.get("enrich"), Some(&1));

    assert_eq!(cache_entries(&state), 6);
    assert!(ctx.failures().read_all().unwrap().is_empty());
    assert!(ctx.checkpoints().list().is_empty());
}

#[tokio::test]
async fn permanent_failure_degrades_only_that_stage() {
    let state = TestState::new();
    let ctx = state.ctx();
    let enrich = FakeStage::new("enrich", 1).responding(|r| {
        if r.record_id == "B" {
            Err(StageError::not_found("no such paper"))
        } else {
            Ok(json!({ "cited_by_count": 7 }))
        }
    });
    let orch = two_stage(FakeStage::new("validate", 1), enrich);

    let report = orch.run(&ctx, abc(), &SilentProgress).await.unwrap();
    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].committed);

    let manifest = ctx.manifest().load().unwrap();
    assert_eq!(manifest.exited.len(), 3);

    let failures = ctx.failures().read_all().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].record_id, "B");
    assert_eq!(failures[0].stage_name, "enrich");
    assert_eq!(failures[0].error_kind.class(), ErrorClass::Permanent);

    let store = ctx.layout().open_records().await.unwrap();
    let b = store.get("B").await.unwrap().unwrap();
    assert!(b.fields.contains_key("validate.tag"));
    assert!(!b.fields.keys().any(|k| k.starts_with("enrich.")));
    let a = store.get("A").await.unwrap().unwrap();
    assert_eq!(a.fields.get("enrich.cited_by_count"), Some(&json!(7)));
}

#[tokio::test]
async fn version_bump_reinvokes_only_the_bumped_stage() {
    let state = TestState::new();
    let not_found_for_b = |r: &paperflow_shared::Record| {
        if r.record_id == "B" {
            Err(StageError::not_found("no such paper"))
        } else {
            Ok(json!({ "ok": true }))
        }
    };
    let first = two_stage(
        FakeStage::new("validate", 1),
        FakeStage::new("enrich", 1).responding(not_found_for_b),
    );
    first.run(&state.ctx(), abc(), &SilentProgress).await.unwrap();

    let validate = FakeStage::new("validate", 1);
    let enrich = FakeStage::new("enrich", 2);
    let (validate_calls, enrich_calls) = (validate.calls(), enrich.calls());
    let second = two_stage(validate, enrich);
    let report = second
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(report.pending, 3);
    assert_eq!(count(&validate_calls), 0);
    assert_eq!(count(&enrich_calls), 3);
    assert_eq!(report.stage("validate").unwrap().counts.cache_hits, 3);

    let manifest = state.ctx().manifest().load().unwrap();
    assert_eq!(manifest.stage_versions.get("enrich"), Some(&2));
    assert!(manifest.exited.values().all(|e| e.signature == report.signature));
}

#[tokio::test]
async fn gate_rejection_skips_later_stages() {
    let state = TestState::new();
    let ctx = state.ctx();
    let (orch, embed_calls) = gated(GateConfig::default());
    let mut corpus = vec![strong("A", "Alpha"), strong("B", "Beta"), strong("C", "Gamma")];
    corpus.push(record("D", "A short note"));

    let report = orch.run(&ctx, corpus, &SilentProgress).await.unwrap();
    assert_eq!(report.completed, 3);
    assert_eq!(report.rejected, 1);
    assert_eq!(count(&embed_calls), 3);

    let manifest = ctx.manifest().load().unwrap();
    assert_eq!(manifest.outcome("D"), Some(ExitOutcome::Rejected));
    assert_eq!(manifest.outcome("A"), Some(ExitOutcome::Completed));
    assert!(ctx.cache().peek("embed", "D").is_none());
    assert!(ctx.cache().peek("embed", "A").is_some());

    let store = ctx.layout().open_records().await.unwrap();
    let d = store.get("D").await.unwrap().unwrap();
    assert!(!d.searchable);
    assert!(d.score.is_some_and(|s| s < 40.0));
    assert!(d.components.is_some());
    let counts = store.counts().await.unwrap();
    assert_eq!((counts.completed, counts.rejected, counts.searchable), (3, 1, 3));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unchanged_rerun_is_zero_work() {
    let state = TestState::new();
    two_stage(FakeStage::new("validate", 1), FakeStage::new("enrich", 1))
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();
    let manifest_path = state.ctx().layout().manifest_path();
    let before = std::fs::read(&manifest_path).unwrap();

    let validate = FakeStage::new("validate", 1);
    let enrich = FakeStage::new("enrich", 1);
    let (validate_calls, enrich_calls) = (validate.calls(), enrich.calls());
    let report = two_stage(validate, enrich)
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();

    assert!(report.is_zero_work());
    assert_eq!(count(&validate_calls) + count(&enrich_calls), 0);
    assert_eq!(std::fs::read(&manifest_path).unwrap(), before);
}

#[tokio::test]
async fn zero_work_run_writes_nothing() {
    let state = TestState::new();
    let orch = two_stage(FakeStage::new("validate", 1), FakeStage::new("enrich", 1));
    let report = orch.run(&state.ctx(), Vec::new(), &SilentProgress).await.unwrap();
    assert!(report.is_zero_work());
    assert!(!state.path().exists());
}

#[tokio::test]
async fn interrupted_run_resumes_to_the_same_manifest() {
    let reference = TestState::new();
    two_stage(FakeStage::new("validate", 1), FakeStage::new("enrich", 1))
        .run(&reference.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();
    let expected = reference.ctx().manifest().load().unwrap().exited;

    let state = TestState::new();
    let options = RunOptions {
        chunk_size: 1,
        ..RunOptions::default()
    };
    let crashed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&crashed);
    let enrich = FakeStage::new("enrich", 1).responding(move |r| {
        if r.record_id == "C" && !flag.swap(true, Ordering::SeqCst) {
            return Err(StageError::new(ErrorKind::Fatal, "disk unplugged"));
        }
        Ok(json!({ "tag": "enrich-v1", "title_len": r.get_str("source.title").unwrap_or_default().len() }))
    });
    let err = two_stage(FakeStage::new("validate", 1), enrich)
        .run(&state.ctx_with(options.clone()), abc(), &SilentProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, PaperflowError::Stage(ref e) if e.kind == ErrorKind::Fatal));
    assert!(crashed.load(Ordering::SeqCst));
    assert_eq!(state.ctx().manifest().load().unwrap().exited.len(), 2);

    let validate = FakeStage::new("validate", 1);
    let enrich = FakeStage::new("enrich", 1);
    let (validate_calls, enrich_calls) = (validate.calls(), enrich.calls());
    let report = two_stage(validate, enrich)
        .run(&state.ctx_with(options), abc(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(report.pending, 1);
    assert_eq!(count(&validate_calls), 0);
    assert_eq!(count(&enrich_calls), 1);
    assert_eq!(state.ctx().manifest().load().unwrap().exited, expected);
}

#[tokio::test]
async fn resume_mid_stage_skips_records_that_already_failed() {
    let enrich_with = |crash: Option<Arc<AtomicBool>>| {
        FakeStage::new("enrich", 1).responding(move |r| match r.record_id.as_str() {
            "A" => Err(StageError::not_found("unknown DOI")),
            "C" if crash.as_ref().is_some_and(|f| !f.swap(true, Ordering::SeqCst)) => {
                Err(StageError::new(ErrorKind::Fatal, "disk unplugged"))
            }
            _ => Ok(json!({ "tag": "enrich-v1" })),
        })
    };

    let reference = TestState::new();
    two_stage(FakeStage::new("validate", 1), enrich_with(None))
        .run(&reference.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();
    let expected = reference.ctx().manifest().load().unwrap().exited;

    let state = TestState::new();
    let options = RunOptions {
        checkpoint: CheckpointPolicy::new(1, Duration::from_secs(3600)),
        ..RunOptions::default()
    };
    let crashed = Arc::new(AtomicBool::new(false));
    let err = two_stage(FakeStage::new("validate", 1), enrich_with(Some(Arc::clone(&crashed))))
        .run(&state.ctx_with(options.clone()), abc(), &SilentProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, PaperflowError::Stage(ref e) if e.kind == ErrorKind::Fatal));
    assert!(crashed.load(Ordering::SeqCst));
    assert!(state.ctx().manifest().load().unwrap().exited.is_empty());

    let saved = state.ctx().checkpoints().load("enrich", 1).unwrap();
    assert!(saved.failed.contains("A"));
    assert!(saved.processed.contains("B"));
    assert_eq!(saved.counts.failed, 1);
    assert_eq!(saved.counts.processed, 1);
    assert_eq!(state.ctx().failures().read_all().unwrap().len(), 1);

    // a healthy source would answer A now, so any call for it would show up
    let enrich = FakeStage::new("enrich", 1);
    let enrich_calls = enrich.calls();
    let report = two_stage(FakeStage::new("validate", 1), enrich)
        .run(&state.ctx_with(options), abc(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(report.pending, 3);
    assert_eq!(count(&enrich_calls), 1);
    assert_eq!(report.stage("enrich").unwrap().counts.cache_hits, 1);
    assert_eq!(state.ctx().failures().read_all().unwrap().len(), 1);
    assert_eq!(state.ctx().manifest().load().unwrap().exited, expected);
    assert!(state.ctx().checkpoints().list().is_empty());

    let store = state.ctx().layout().open_records().await.unwrap();
    let a = store.get("A").await.unwrap().unwrap();
    assert!(a.fields.keys().all(|k| !k.starts_with("enrich.")));
}

#[tokio::test]
async fn batched_and_serial_runs_agree() {
    let batched = TestState::new();
    let serial = TestState::new();
    let corpus = || {
        let mut c = abc();
        c.push(record("D", "Diffusion"));
        c.push(record("E", "Embeddings"));
        c
    };

    let big = FakeStage::new("enrich", 1).with_batch_size(4);
    let big_batches = big.batches();
    two_stage(FakeStage::new("validate", 1).with_batch_size(4), big)
        .run(&batched.ctx(), corpus(), &SilentProgress)
        .await
        .unwrap();
    let one = FakeStage::new("enrich", 1).with_batch_size(1);
    let one_batches = one.batches();
    two_stage(FakeStage::new("validate", 1), one)
        .run(&serial.ctx(), corpus(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(count(&big_batches), 2);
    assert_eq!(count(&one_batches), 5);

    let a = batched.ctx().layout().open_records().await.unwrap();
    let b = serial.ctx().layout().open_records().await.unwrap();
    for id in ["A", "B", "C", "D", "E"] {
        let left = a.get(id).await.unwrap().unwrap();
        let right = b.get(id).await.unwrap().unwrap();
        assert_eq!(left.fields, right.fields, "fields differ for {id}");
    }
}

#[tokio::test]
async fn raising_the_threshold_only_rejects_more() {
    let state = TestState::new();
    let corpus = || {
        vec![
            strong("A", "Alpha"),
            strong("B", "Beta").with_field("source.citation_count", 3),
            record("C", "Gamma"),
        ]
    };
    let mut gate = GateConfig::default();
    gate.threshold = 20.0;
    let (low, _) = gated(gate.clone());
    low.run(&state.ctx(), corpus(), &SilentProgress).await.unwrap();
    let before = state.ctx().manifest().load().unwrap();

    gate.threshold = 60.0;
    let (high, _) = gated(gate);
    let report = high.run(&state.ctx(), corpus(), &SilentProgress).await.unwrap();
    assert_eq!(report.pending, 3);
    let after = state.ctx().manifest().load().unwrap();

    for (id, entry) in &after.exited {
        if before.outcome(id) == Some(ExitOutcome::Rejected) {
            assert_eq!(entry.outcome, ExitOutcome::Rejected, "{id} was un-rejected");
        }
    }
    assert!(after.counts().1 >= before.counts().1);
}

#[tokio::test]
async fn reweighting_recomputes_the_gate_from_cache() {
    let state = TestState::new();
    let build = |gate: GateConfig| {
        let (validate, validate_calls) = Counted::new(ValidateStage::new());
        let (quality, quality_calls) = Counted::new(QualityStage::new(QualityGate::new(gate.clone())));
        let pipeline = Pipeline::new(vec![validate, quality])
            .unwrap()
            .with_gate(QualityGate::new(gate))
            .unwrap();
        (Orchestrator::new(pipeline), validate_calls, quality_calls)
    };
    let corpus = || vec![strong("A", "Alpha"), record("B", "Beta")];

    let (first, _, _) = build(GateConfig::default());
    first.run(&state.ctx(), corpus(), &SilentProgress).await.unwrap();

    let mut gate = GateConfig::default();
    gate.weights_version = 2;
    gate.weights.venue_signal = 0.5;
    let (second, validate_calls, quality_calls) = build(gate);
    let report = second.run(&state.ctx(), corpus(), &SilentProgress).await.unwrap();

    assert_eq!(report.pending, 2);
    assert_eq!(count(&validate_calls), 0);
    assert_eq!(count(&quality_calls), 0);
    let store = state.ctx().layout().open_records().await.unwrap();
    let a = store.get("A").await.unwrap().unwrap();
    assert_eq!(a.fields.get("quality.weights_version"), Some(&json!(2)));
}

// ---------------------------------------------------------------------------
// Failure routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_transient_error_leaves_record_pending() {
    let state = TestState::new();
    let flaky = FakeStage::new("enrich", 1).responding(|r| {
        if r.record_id == "B" {
            Err(StageError::new(ErrorKind::Timeout, "timed out").with_attempts(4))
        } else {
            Ok(json!({ "ok": true }))
        }
    });
    let report = two_stage(FakeStage::new("validate", 1), flaky)
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 1);
    assert!(!report.failures[0].committed);
    let manifest = state.ctx().manifest().load().unwrap();
    assert!(!manifest.exited.contains_key("B"));
    let logged = state.ctx().failures().read_all().unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].attempts, 4);

    let validate = FakeStage::new("validate", 1);
    let enrich = FakeStage::new("enrich", 1);
    let (validate_calls, enrich_calls) = (validate.calls(), enrich.calls());
    let report = two_stage(validate, enrich)
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(count(&validate_calls), 0);
    assert_eq!(count(&enrich_calls), 1);
    assert_eq!(state.ctx().manifest().load().unwrap().exited.len(), 3);
}

#[tokio::test]
async fn failed_batch_falls_back_to_single_records() {
    let state = TestState::new();
    let enrich = FakeStage::new("enrich", 1)
        .with_batch_size(3)
        .failing_batches();
    let (calls, batches) = (enrich.calls(), enrich.batches());
    let report = two_stage(FakeStage::new("validate", 1), enrich)
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(report.completed, 3);
    assert!(report.failures.is_empty());
    assert_eq!(count(&batches), 4);
    assert_eq!(count(&calls), 6);
    assert_eq!(cache_entries(&state), 6);
}

#[tokio::test]
async fn unreachable_source_costs_one_fallback_call_per_batch() {
    let state = TestState::new();
    let mut corpus = abc();
    corpus.push(record("D", "Diffusion"));
    corpus.push(record("E", "Embeddings"));
    let enrich = FakeStage::new("enrich", 1)
        .with_batch_size(5)
        .down(ErrorKind::Timeout);
    let (calls, batches) = (enrich.calls(), enrich.batches());
    let report = two_stage(FakeStage::new("validate", 1), enrich)
        .run(&state.ctx(), corpus.clone(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(count(&batches), 2);
    assert_eq!(count(&calls), 6);
    assert_eq!(report.failed, 5);
    assert!(report.failures.iter().all(|f| !f.committed && f.kind == ErrorKind::Timeout));
    assert!(state.ctx().manifest().load().unwrap().exited.is_empty());

    let enrich = FakeStage::new("enrich", 1).with_batch_size(5);
    let batches = enrich.batches();
    let report = two_stage(FakeStage::new("validate", 1), enrich)
        .run(&state.ctx(), corpus, &SilentProgress)
        .await
        .unwrap();
    assert_eq!(report.pending, 5);
    assert_eq!(report.completed, 5);
    assert_eq!(count(&batches), 1);
}

#[tokio::test]
async fn missing_required_input_is_recorded_without_a_call() {
    let state = TestState::new();
    let enrich = FakeStage::new("enrich", 1).requires("source.doi");
    let calls = enrich.calls();
    let mut corpus = abc();
    corpus[0] = corpus[0].clone().with_field("source.doi", "10.1000/a");

    let report = two_stage(FakeStage::new("validate", 1), enrich)
        .run(&state.ctx(), corpus, &SilentProgress)
        .await
        .unwrap();

    assert_eq!(count(&calls), 1);
    assert_eq!(report.completed, 3);
    let logged = state.ctx().failures().for_stage("enrich").unwrap();
    assert_eq!(logged.len(), 2);
    assert!(logged.iter().all(|f| f.error_kind == ErrorKind::InvalidInput));
}

#[tokio::test]
async fn fatal_error_aborts_the_run() {
    let state = TestState::new();
    let broken = FakeStage::new("validate", 1)
        .responding(|_| Err(StageError::new(ErrorKind::Fatal, "state dir read-only")));
    let err = two_stage(broken, FakeStage::new("enrich", 1))
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, PaperflowError::Stage(_)));
    assert!(state.ctx().manifest().load().unwrap().exited.is_empty());
}

// ---------------------------------------------------------------------------
// Rerun targeting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn force_reprocesses_from_cache() {
    let state = TestState::new();
    two_stage(FakeStage::new("validate", 1), FakeStage::new("enrich", 1))
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();

    let validate = FakeStage::new("validate", 1);
    let enrich = FakeStage::new("enrich", 1);
    let (validate_calls, enrich_calls) = (validate.calls(), enrich.calls());
    let options = RunOptions {
        force: true,
        ..RunOptions::default()
    };
    let report = two_stage(validate, enrich)
        .run(&state.ctx_with(options), abc(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(report.pending, 3);
    assert_eq!(report.cache_hits(), 6);
    assert_eq!(count(&validate_calls) + count(&enrich_calls), 0);
}

#[tokio::test]
async fn refresh_stage_bypasses_its_cache() {
    let state = TestState::new();
    two_stage(FakeStage::new("validate", 1), FakeStage::new("enrich", 1))
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();

    let validate = FakeStage::new("validate", 1);
    let enrich = FakeStage::new("enrich", 1);
    let (validate_calls, enrich_calls) = (validate.calls(), enrich.calls());
    let options = RunOptions {
        refresh_stages: BTreeSet::from(["enrich".to_string()]),
        ..RunOptions::default()
    };
    two_stage(validate, enrich)
        .run(&state.ctx_with(options), abc(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(count(&validate_calls), 0);
    assert_eq!(count(&enrich_calls), 3);
}

#[tokio::test]
async fn retry_failed_targets_logged_records() {
    let state = TestState::new();
    let enrich = FakeStage::new("enrich", 1).responding(|r| {
        if r.record_id == "C" {
            Err(StageError::not_found("unknown"))
        } else {
            Ok(json!({ "ok": true }))
        }
    });
    two_stage(FakeStage::new("validate", 1), enrich)
        .run(&state.ctx(), abc(), &SilentProgress)
        .await
        .unwrap();

    let failed = state.ctx().layout().outstanding_failures().await.unwrap();
    assert_eq!(failed, BTreeSet::from(["C".to_string()]));

    let enrich = FakeStage::new("enrich", 1);
    let enrich_calls = enrich.calls();
    let options = RunOptions {
        force_ids: failed,
        ..RunOptions::default()
    };
    let report = two_stage(FakeStage::new("validate", 1), enrich)
        .run(&state.ctx_with(options), abc(), &SilentProgress)
        .await
        .unwrap();

    assert_eq!(report.pending, 1);
    assert_eq!(count(&enrich_calls), 1);
    let store = state.ctx().layout().open_records().await.unwrap();
    let c = store.get("C").await.unwrap().unwrap();
    assert_eq!(c.fields.get("enrich.ok"), Some(&json!(true)));

    // the log keeps C's old entry, but the clean rerun resolved it
    assert_eq!(state.ctx().failures().failed_ids().unwrap().len(), 1);
    assert!(state.ctx().layout().outstanding_failures().await.unwrap().is_empty());
}

#[tokio::test]
async fn run_history_keeps_the_report() {
    let state = TestState::new();
    let ctx = state.ctx();
    let report = two_stage(FakeStage::new("validate", 1), FakeStage::new("enrich", 1))
        .run(&ctx, abc(), &SilentProgress)
        .await
        .unwrap();

    let store = ctx.layout().open_records().await.unwrap();
    let run = store.last_run().await.unwrap().unwrap();
    assert_eq!(run.run_id, report.run_id);
    assert!(run.finished_at.is_some());
    let json: serde_json::Value = serde_json::from_str(&run.report_json.unwrap()).unwrap();
    assert_eq!(json["completed"], 3);
}
