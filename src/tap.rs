use futures::TryStreamExt;
use std::collections::HashSet;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{CatalogEntry, Discoverer, DiscoveryEvent, DiscoveryWarning, Selection, StreamDescriptor};
use crate::checkpoint::CheckpointManager;
use crate::singer::Emitter;
use crate::source::{ExecutorFactory, QueryExecutor};
use crate::sync::{extract, plan, StateDocument, StateTracker};
use crate::{Config, Error, Result};

/// Everything one run shares between its stream workers.
pub struct RunContext {
    pub config: Config,
    pub selection: Selection,
    pub emitter: Emitter,
    tracker: Mutex<StateTracker>,
    checkpoints: Option<CheckpointManager>,
    stop: watch::Receiver<bool>,
}

impl RunContext {
    /// Selects every stream and starts from empty state.
    pub fn new(config: Config, emitter: Emitter) -> Self {
        let (_, stop) = watch::channel(false);
        let tracker = StateTracker::new(StateDocument::default(), config.sync.checkpoint_every);
        Self {
            config,
            selection: Selection::all(),
            emitter,
            tracker: Mutex::new(tracker),
            checkpoints: None,
            stop,
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    /// Resumes from a prior run's state.
    pub fn with_state(mut self, state: StateDocument) -> Self {
        self.tracker = Mutex::new(StateTracker::new(state, self.config.sync.checkpoint_every));
        self
    }

    /// Also writes every checkpoint to a state file.
    pub fn with_state_output(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Stops the run once `true` is sent.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = stop;
        self
    }

    /// Current state of every stream.
    pub async fn state(&self) -> StateDocument {
        self.tracker.lock().await.document().clone()
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Emits a STATE message and persists it.
    ///
    /// The tracker stays locked until the STATE is written so concurrent
    /// workers never emit an older snapshot after a newer one.
    async fn checkpoint(&self) -> Result<()> {
        let mut tracker = self.tracker.lock().await;
        let state = tracker.checkpoint();
        self.emitter.state(&state).await?;
        if let Some(manager) = &self.checkpoints {
            manager.save(&state).await?;
        }
        Ok(())
    }
}

/// Outcome of a run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub failed: Vec<(String, Error)>,
    pub warnings: Vec<DiscoveryWarning>,
    pub cancelled: bool,
    pub records: u64,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// The tap: discovery and extraction over executors from one factory.
pub struct Tap<F> {
    ctx: RunContext,
    factory: F,
}

impl<F: ExecutorFactory> Tap<F> {
    pub fn new(ctx: RunContext, factory: F) -> Self {
        Self { ctx, factory }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Writes a Singer catalog of every discoverable stream to `out`, one
    /// entry at a time.
    pub async fn discover<W: AsyncWrite + Unpin>(&self, mut out: W) -> Result<Vec<DiscoveryWarning>> {
        let mut executor = self.connect_catalog().await?;
        let mut events = Discoverer::new(executor.as_mut())
            .with_include_schemas(self.ctx.config.include_schemas.clone())
            .discover();

        let mut warnings = Vec::new();
        let mut count = 0usize;
        out.write_all(b"{\"streams\": [").await?;
        while let Some(event) = events.try_next().await? {
            match event {
                DiscoveryEvent::Warning(warning) => warnings.push(warning),
                DiscoveryEvent::Stream(descriptor) => {
                    if count > 0 {
                        out.write_all(b",").await?;
                    }
                    out.write_all(b"\n").await?;
                    let entry = serde_json::to_vec(&CatalogEntry::from_descriptor(&descriptor))?;
                    out.write_all(&entry).await?;
                    count += 1;
                }
            }
        }
        out.write_all(b"\n]}\n").await?;
        out.flush().await?;

        info!("Discovered {} streams ({} warnings)", count, warnings.len());
        Ok(warnings)
    }

    /// Extracts every selected stream.
    ///
    /// Per-stream failures are collected in the summary. The final STATE is
    /// emitted even when the run fails; only catalog-level errors are
    /// returned as `Err`.
    pub async fn run(&self) -> Result<RunSummary> {
        let summary = Mutex::new(RunSummary::default());
        let discovered = Mutex::new(HashSet::new());

        let result = self.extract_all(&summary, &discovered).await;
        let final_state = self.ctx.checkpoint().await;
        let mut summary = summary.into_inner();

        if let Err(e) = result {
            error!("Run aborted: {}", e);
            if let Err(state_error) = final_state {
                warn!("Final checkpoint failed: {}", state_error);
            }
            return Err(e);
        }
        final_state?;

        for missing in self.ctx.selection.missing(&discovered.into_inner()) {
            if let Error::InvalidSelection { stream, .. } = &missing {
                error!("{}", missing);
                summary.failed.push((stream.clone(), missing));
            }
        }

        info!(
            "Run complete: {} streams synced, {} failed, {} records{}",
            summary.completed.len(),
            summary.failed.len(),
            summary.records,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }

    async fn connect_catalog(&self) -> Result<Box<dyn QueryExecutor>> {
        self.factory.connect().await.map_err(|e| match e {
            Error::Connection(_) => e,
            other => Error::Connection(other.to_string()),
        })
    }

    async fn extract_all(
        &self,
        summary: &Mutex<RunSummary>,
        discovered: &Mutex<HashSet<String>>,
    ) -> Result<()> {
        let mut executor = self.connect_catalog().await?;
        let events = Discoverer::new(executor.as_mut())
            .with_include_schemas(self.ctx.config.include_schemas.clone())
            .discover();

        let limit = self.ctx.config.sync.max_concurrent_streams;
        events
            .try_for_each_concurrent(limit, move |event| async move {
                match event {
                    DiscoveryEvent::Warning(warning) => summary.lock().await.warnings.push(warning),
                    DiscoveryEvent::Stream(descriptor) => {
                        discovered.lock().await.insert(descriptor.name.clone());
                        self.handle_stream(descriptor, summary).await;
                    }
                }
                Ok(())
            })
            .await
    }

    async fn handle_stream(&self, descriptor: StreamDescriptor, summary: &Mutex<RunSummary>) {
        let stream = descriptor.name.clone();
        if !self.ctx.selection.is_selected(&stream) {
            debug!("Skipping unselected stream {}", stream);
            return;
        }
        if self.ctx.stop_requested() {
            summary.lock().await.cancelled = true;
            return;
        }

        let result = self.sync_stream(&descriptor).await;
        let mut summary = summary.lock().await;
        match result {
            Ok(records) => {
                summary.records += records;
                summary.completed.push(stream);
            }
            Err(Error::Shutdown) => {
                warn!("Stream {} interrupted by shutdown", stream);
                summary.cancelled = true;
            }
            Err(e) => {
                error!("Stream {} failed: {}", stream, e);
                summary.failed.push((stream, e));
            }
        }
    }

    #[instrument(skip_all, fields(stream = %descriptor.name))]
    async fn sync_stream(&self, descriptor: &StreamDescriptor) -> Result<u64> {
        let ctx = &self.ctx;
        let stream = descriptor.name.as_str();
        let settings = ctx
            .selection
            .resolve(descriptor, ctx.config.sync.default_replication_method)?;

        let mut executor = self.factory.connect().await?;
        let change_log = executor.change_log(&descriptor.object());
        let prior = ctx.tracker.lock().await.get(stream).cloned();
        let plan = plan(
            descriptor,
            prior.as_ref(),
            &settings,
            ctx.config.sync.bookmark_comparison,
            change_log.as_deref(),
        )?;

        let descriptor = descriptor.project(&plan.query.columns);
        let bookmark_properties = plan.cursor_column.iter().cloned().collect();
        ctx.emitter.schema(&descriptor, bookmark_properties).await?;
        ctx.tracker.lock().await.begin(&plan);

        let version = plan.is_versioned().then_some(plan.version);
        if plan.is_versioned() && plan.prior_version.is_none() {
            ctx.emitter.activate_version(stream, plan.version).await?;
        }

        let mut records = extract(executor.as_mut(), &descriptor, &plan).await?;
        let mut count = 0u64;
        while let Some(record) = records.try_next().await? {
            ctx.emitter.record(stream, &record, version).await?;
            count += 1;

            let due = {
                let mut tracker = ctx.tracker.lock().await;
                tracker.advance(stream, &record);
                tracker.checkpoint_due(stream)
            };
            if due {
                ctx.checkpoint().await?;
            }
            if ctx.stop_requested() {
                if let Err(e) = ctx.checkpoint().await {
                    warn!("Checkpoint on shutdown failed: {}", e);
                }
                return Err(Error::Shutdown);
            }
        }

        if let Some(version) = version {
            ctx.emitter.activate_version(stream, version).await?;
        }
        ctx.checkpoint().await?;
        info!("Synced {} records", count);
        Ok(count)
    }
}
