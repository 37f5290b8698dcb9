//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use paperflow_core::{RecordOutcome, RunContext, RunOptions, Stage};
use paperflow_shared::{ErrorKind, Record, StageCost, StageDescriptor, StageError};
use serde_json::{Value, json};
use uuid::Uuid;

type Respond = dyn Fn(&Record) -> Result<Value, StageError> + Send + Sync;

/// Scripted stage that counts every record it is asked to process.
pub struct FakeStage {
    descriptor: StageDescriptor,
    respond: Arc<Respond>,
    calls: Arc<AtomicUsize>,
    batches: Arc<AtomicUsize>,
    fail_multi_record_batches: bool,
    outage: Option<ErrorKind>,
}

impl FakeStage {
    /// Stage whose payload echoes the record's title under its own namespace.
    pub fn new(name: &str, version: u32) -> Self {
        let tag = format!("{name}-v{version}");
        Self {
            descriptor: StageDescriptor::new(name, version, name)
                .with_transient(vec![ErrorKind::Timeout, ErrorKind::RateLimited]),
            respond: Arc::new(move |record: &Record| {
                let title = record.get_str("source.title").unwrap_or_default();
                Ok(json!({ "tag": tag, "title_len": title.len() }))
            }),
            calls: Arc::new(AtomicUsize::new(0)),
            batches: Arc::new(AtomicUsize::new(0)),
            fail_multi_record_batches: false,
            outage: None,
        }
    }

    pub fn responding<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> Result<Value, StageError> + Send + Sync + 'static,
    {
        self.respond = Arc::new(f);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.descriptor = self.descriptor.with_batch_size(size);
        self
    }

    pub fn with_cost(mut self, cost: StageCost) -> Self {
        self.descriptor = self.descriptor.with_cost(cost);
        self
    }

    pub fn requires(mut self, field: &str) -> Self {
        self.descriptor = self.descriptor.requires(field);
        self
    }

    /// Any call with more than one record fails as a whole.
    pub fn failing_batches(mut self) -> Self {
        self.fail_multi_record_batches = true;
        self
    }

    /// Every call fails as a whole with `kind`, as if the source were down.
    pub fn down(mut self, kind: ErrorKind) -> Self {
        self.outage = Some(kind);
        self
    }

    /// Records handed to the stage so far.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn batches(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.batches)
    }

    pub fn boxed(self) -> Box<dyn Stage> {
        Box::new(self)
    }
}

#[async_trait]
impl Stage for FakeStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run_batch(&self, batch: &[Record]) -> Result<Vec<RecordOutcome>, StageError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.calls.fetch_add(batch.len(), Ordering::SeqCst);
        if let Some(kind) = self.outage {
            return Err(StageError::new(kind, "source unreachable").with_attempts(4));
        }
        if self.fail_multi_record_batches && batch.len() > 1 {
            return Err(StageError::new(ErrorKind::Upstream, "batch endpoint down"));
        }
        Ok(batch
            .iter()
            .map(|r| (r.record_id.clone(), (self.respond)(r)))
            .collect())
    }
}

/// Wraps a real stage and counts the records it is asked to process.
pub struct Counted {
    inner: Box<dyn Stage>,
    calls: Arc<AtomicUsize>,
}

impl Counted {
    pub fn new(inner: impl Stage + 'static) -> (Box<dyn Stage>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let stage = Self {
            inner: Box::new(inner),
            calls: Arc::clone(&calls),
        };
        (Box::new(stage), calls)
    }
}

#[async_trait]
impl Stage for Counted {
    fn descriptor(&self) -> &StageDescriptor {
        self.inner.descriptor()
    }

    async fn run_batch(&self, batch: &[Record]) -> Result<Vec<RecordOutcome>, StageError> {
        self.calls.fetch_add(batch.len(), Ordering::SeqCst);
        self.inner.run_batch(batch).await
    }
}

pub fn count(calls: &Arc<AtomicUsize>) -> usize {
    calls.load(Ordering::SeqCst)
}

/// Temporary state directory removed on drop.
pub struct TestState {
    dir: PathBuf,
}

impl TestState {
    pub fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("pf-run-{}", Uuid::now_v7()));
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn ctx(&self) -> RunContext {
        self.ctx_with(RunOptions::default())
    }

    pub fn ctx_with(&self, options: RunOptions) -> RunContext {
        RunContext::new(&self.dir, options)
    }
}

impl Drop for TestState {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn record(id: &str, title: &str) -> Record {
    Record::new(id).with_field("source.title", title)
}

pub fn abc() -> Vec<Record> {
    vec![
        record("A", "Attention is all you need"),
        record("B", "BERT"),
        record("C", "Convolutional networks"),
    ]
}

/// Record that clears the default quality gate on its own.
pub fn strong(id: &str, title: &str) -> Record {
    record(id, title)
        .with_field("source.citation_count", 500)
        .with_field("source.venue", "Journal of Machine Learning Research")
        .with_field("source.venue_type", "journal")
        .with_field("source.abstract", "We study things.")
        .with_field("source.doi", format!("10.1000/{}", id.to_lowercase()))
        .with_field("source.year", 2020)
}
