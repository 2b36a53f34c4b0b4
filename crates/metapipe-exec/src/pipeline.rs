//! Run orchestration.
//!
//! A [`Pipeline`] is prepared once from a [`RunConfig`] (scripts compiled,
//! templates parsed) and then executed: discovery, parsing, the per-item
//! stages on the worker pool, reduce, and finally the envelope.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metapipe_core::config::{Flow, Operation, OutputFormat, RunConfig};
use metapipe_core::diff::{Desired, DiffEntry, DiffReport};
use metapipe_core::discovery::{discover, file_info, DiscoveredFile, DiscoveryOptions, DiscoveryResult};
use metapipe_core::domain::{
    sort_errors, FileEntry, MetapipeError, Record, Result, StageError, StageKind,
};
use metapipe_core::envelope::{Counts, ItemAction, Outcome, OutputItem, ResultEnvelope, RunMeta};
use metapipe_core::git::{is_git_repo, GitIndex};
use metapipe_core::output::{write_envelope, LineSink};
use metapipe_core::record::load_record;
use metapipe_core::store::{MetaIndex, MetaStore};
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pool::{Aborted, ItemOutcome, ItemProcessor, WorkerPool};
use crate::sandbox::{Bindings, Sandbox};
use crate::shell::{ShellRunner, TemplateContext};
use crate::stage::{is_truthy, parse_file_result, run_script, CompiledScripts};

/// What a finished (or aborted) run hands back to its caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub exit_code: i32,
    /// Lines for the diagnostic stream.
    pub diagnostics: Vec<String>,
    /// The aggregate envelope; absent for aborted runs and streamed output.
    pub envelope: Option<ResultEnvelope>,
}

impl RunReport {
    fn aborted(error: &StageError) -> Self {
        Self {
            exit_code: if error.stage.is_script() { 3 } else { 2 },
            diagnostics: vec![format!("run aborted: {error}")],
            envelope: None,
        }
    }
}

/// Destination for records as the reorder buffer releases them.
pub trait RecordSink {
    fn accept(&mut self, item: OutputItem) -> Result<()>;
}

impl RecordSink for Vec<OutputItem> {
    fn accept(&mut self, item: OutputItem) -> Result<()> {
        self.push(item);
        Ok(())
    }
}

impl RecordSink for LineSink {
    fn accept(&mut self, item: OutputItem) -> Result<()> {
        self.record(&item)
    }
}

/// Outcome of one item's trip through the stages.
#[derive(Debug)]
enum ItemResult {
    Filtered,
    Emitted {
        item: OutputItem,
        reduce_input: Option<(String, Value)>,
    },
    Compared(DiffEntry),
    Failed {
        error: StageError,
        item: OutputItem,
        /// Keep the item in the record list even without `errors.embed`.
        listed: bool,
    },
}

impl ItemResult {
    fn failure(error: StageError, item: OutputItem) -> Self {
        ItemResult::Failed {
            error,
            item,
            listed: false,
        }
    }
}

impl ItemOutcome for ItemResult {
    fn failed(&self) -> bool {
        matches!(self, ItemResult::Failed { .. })
    }
}

/// Orchestrator-side accumulation, merged serially in canonical order.
#[derive(Debug, Default)]
struct Tally {
    counts: Counts,
    errors: Vec<StageError>,
    failed_stages: Vec<StageKind>,
    reduce_inputs: Vec<(String, Value)>,
    diff_entries: Vec<DiffEntry>,
}

impl Tally {
    fn fail(&mut self, error: StageError) {
        self.counts.failed += 1;
        self.failed_stages.push(error.stage);
        self.errors.push(error);
    }

    fn absorb<S: RecordSink>(&mut self, result: ItemResult, embed: bool, sink: &mut S) -> Result<()> {
        match result {
            ItemResult::Filtered => self.counts.filtered += 1,
            ItemResult::Emitted { item, reduce_input } => {
                self.counts.succeeded += 1;
                if let Some(input) = reduce_input {
                    self.reduce_inputs.push(input);
                }
                sink.accept(item)?;
            }
            ItemResult::Compared(entry) => {
                self.counts.succeeded += 1;
                self.diff_entries.push(entry);
            }
            ItemResult::Failed {
                error,
                mut item,
                listed,
            } => {
                if embed {
                    item.error = Some(error.clone());
                }
                if embed || listed {
                    sink.accept(item)?;
                }
                self.fail(error);
            }
        }
        Ok(())
    }

    fn outcome(&self) -> Outcome {
        if self.errors.is_empty() {
            if self.counts.processed == 0 {
                Outcome::NoItems
            } else {
                Outcome::Success
            }
        } else if self.counts.succeeded == 0 && self.counts.failed > 0 {
            Outcome::AllFailed
        } else {
            Outcome::PartialFailure
        }
    }
}

struct Completed {
    errors: Vec<StageError>,
    reduce: Option<Value>,
    diff: Option<DiffReport>,
    meta: RunMeta,
    diagnostics: Vec<String>,
}

enum RunEnd {
    Completed(Completed),
    Aborted(StageError),
}

/// The item being processed, as the stages see it.
enum Subject {
    Record(Record),
    File(FileEntry),
}

impl Subject {
    fn locator(&self) -> &str {
        match self {
            Subject::Record(record) => &record.locator,
            Subject::File(file) => &file.rel_path,
        }
    }

    fn bindings(&self) -> Bindings {
        match self {
            Subject::Record(record) => Bindings::new()
                .with("record", record.to_value())
                .with("locator", Value::String(record.locator.clone()))
                .with("meta", record.meta.clone()),
            Subject::File(file) => Bindings::new().with("file", file.to_value()),
        }
    }

    /// `value` seen by later stages when no map stage ran.
    fn default_value(&self) -> Value {
        match self {
            Subject::Record(record) => record.meta.clone(),
            Subject::File(file) => file.to_value(),
        }
    }

    fn template_context(&self, index: usize, value: Value) -> TemplateContext {
        match self {
            Subject::Record(record) => TemplateContext::for_record(&record.locator, index, value),
            Subject::File(file) => TemplateContext::for_file(file, index, value),
        }
    }

    fn output_item(&self) -> OutputItem {
        match self {
            Subject::Record(record) => OutputItem::for_record(record.locator.clone(), record.meta.clone()),
            Subject::File(file) => OutputItem::for_file(file.clone()),
        }
    }
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn write_failure(error: &MetapipeError) -> String {
    match error {
        MetapipeError::Collision { path, existing, .. } => format!(
            "metadata file {} already records locator {existing:?}",
            file_name(path)
        ),
        MetapipeError::UnreadableTarget { path, reason, .. } => format!(
            "metadata file {} is unreadable ({reason}), not overwriting it",
            file_name(path)
        ),
        other => other.to_string(),
    }
}

fn join_failure(e: tokio::task::JoinError) -> MetapipeError {
    MetapipeError::Worker(e.to_string())
}

/// Everything a worker needs, shared read-only.
#[derive(Clone)]
struct Stages {
    config: Arc<RunConfig>,
    sandbox: Arc<Sandbox>,
    scripts: Arc<CompiledScripts>,
    shell: Option<Arc<ShellRunner>>,
}

impl Stages {
    /// filter → map → shell → post-map for the `pipeline` operation.
    async fn run_item(&self, index: usize, subject: Subject) -> ItemResult {
        let locator = subject.locator().to_string();
        let mut item = subject.output_item();
        let bindings = subject.bindings();

        if let Some(filter) = &self.scripts.filter {
            match run_script(&self.sandbox, filter, bindings.clone()).await {
                Ok(verdict) if !is_truthy(&verdict) => {
                    debug!(locator = %locator, "filtered out");
                    return ItemResult::Filtered;
                }
                Ok(_) => {}
                Err(e) => return ItemResult::failure(filter.error(&locator, &e), item),
            }
        }

        let mut value = None;
        if let Some(map) = &self.scripts.map {
            match run_script(&self.sandbox, map, bindings.clone()).await {
                Ok(mapped) => value = Some(mapped),
                Err(e) => return ItemResult::failure(map.error(&locator, &e), item),
            }
        }
        let current = value.clone().unwrap_or_else(|| subject.default_value());

        if let Some(shell) = &self.shell {
            let mut result = shell.run(&subject.template_context(index, current.clone())).await;
            if !self.config.output.include_timings {
                result.duration_ms = None;
            }
            let failure = result.failure_message();
            let details = json!({ "exitCode": result.exit_code, "timedOut": result.timed_out });
            item.shell = Some(result);
            if let Some(message) = failure {
                item.value = value;
                let error = StageError::for_locator(StageKind::Shell, &locator, message).with_details(details);
                return ItemResult::Failed {
                    error,
                    item,
                    listed: true,
                };
            }
        }

        if let Some(post_map) = &self.scripts.post_map {
            let mut bindings = bindings;
            bindings.set("value", current.clone());
            if let Some(shell) = &item.shell {
                match serde_json::to_value(shell) {
                    Ok(shell) => bindings.set("shell", shell),
                    Err(e) => {
                        item.value = value;
                        let message = format!("cannot bind shell result: {e}");
                        let error = StageError::for_locator(StageKind::PostMap, &locator, message);
                        return ItemResult::failure(error, item);
                    }
                }
            }
            match run_script(&self.sandbox, post_map, bindings).await {
                Ok(result) => value = Some(result),
                Err(e) => {
                    item.value = value;
                    return ItemResult::failure(post_map.error(&locator, &e), item);
                }
            }
        }

        let reduce_input = self.scripts.reduce.is_some().then(|| {
            let input = value.clone().unwrap_or_else(|| subject.default_value());
            (locator.clone(), input)
        });
        item.value = value;
        debug!(locator = %locator, index, "item complete");
        ItemResult::Emitted { item, reduce_input }
    }
}

struct ParseProcessor {
    config: Arc<RunConfig>,
}

#[async_trait]
impl ItemProcessor for ParseProcessor {
    type Item = DiscoveredFile;
    type Output = std::result::Result<(String, Record), StageError>;

    async fn process(&self, _index: usize, file: DiscoveredFile) -> Self::Output {
        let config = Arc::clone(&self.config);
        let rel_path = file.rel_path.clone();
        let loaded = tokio::task::spawn_blocking(move || load_record(&file.path, &config)).await;
        match loaded {
            Ok(Ok(record)) => Ok((rel_path, record)),
            Ok(Err(e)) => Err(StageError::for_context(e.stage(), rel_path, e.to_string())),
            Err(e) => Err(StageError::for_context(
                StageKind::Parse,
                rel_path,
                format!("parse task failed: {e}"),
            )),
        }
    }
}

struct RecordProcessor {
    stages: Stages,
}

#[async_trait]
impl ItemProcessor for RecordProcessor {
    type Item = Record;
    type Output = ItemResult;

    async fn process(&self, index: usize, record: Record) -> ItemResult {
        self.stages.run_item(index, Subject::Record(record)).await
    }
}

struct FileProcessor {
    stages: Stages,
}

#[async_trait]
impl ItemProcessor for FileProcessor {
    type Item = FileEntry;
    type Output = ItemResult;

    async fn process(&self, index: usize, file: FileEntry) -> ItemResult {
        self.stages.run_item(index, Subject::File(file)).await
    }
}

/// create / update / diff over raw files.
struct WriteProcessor {
    stages: Stages,
    operation: Operation,
    index: Arc<MetaIndex>,
    store: Arc<MetaStore>,
}

impl WriteProcessor {
    async fn desired(
        &self,
        file: &FileEntry,
        value: &Option<Value>,
        existing: Option<&Value>,
    ) -> std::result::Result<Desired, StageError> {
        let locator = file.rel_path.as_str();
        if let Some(post_map) = &self.stages.scripts.post_map {
            let mut bindings = Bindings::new()
                .with("file", file.to_value())
                .with("value", value.clone().unwrap_or_else(|| file.to_value()));
            if let Some(existing) = existing {
                bindings.set("existing", existing.clone());
            }
            let result = run_script(&self.stages.sandbox, post_map, bindings)
                .await
                .map_err(|e| post_map.error(locator, &e))?;
            return parse_file_result(result)
                .map_err(|message| StageError::for_locator(StageKind::PostMap, locator, message));
        }
        match value {
            Some(meta @ Value::Object(_)) => Ok(Desired::Meta(meta.clone())),
            Some(_) => Err(StageError::for_locator(
                StageKind::Map,
                locator,
                "map must return a table of metadata",
            )),
            None => Err(StageError::for_locator(
                StageKind::Map,
                locator,
                "no map or post-map stage produced metadata",
            )),
        }
    }

    async fn write(&self, rel_path: &str, meta: &Value) -> Result<metapipe_core::store::WriteOutcome> {
        let store = Arc::clone(&self.store);
        let rel_path = rel_path.to_string();
        let meta = meta.clone();
        tokio::task::spawn_blocking(move || store.write(&rel_path, &meta))
            .await
            .map_err(join_failure)?
    }
}

#[async_trait]
impl ItemProcessor for WriteProcessor {
    type Item = FileEntry;
    type Output = ItemResult;

    async fn process(&self, _index: usize, file: FileEntry) -> ItemResult {
        let locator = file.rel_path.clone();
        let mut item = OutputItem::for_file(file.clone());
        let bindings = Bindings::new().with("file", file.to_value());
        let scripts = &self.stages.scripts;
        let sandbox = &self.stages.sandbox;

        if let Some(filter) = &scripts.filter {
            match run_script(sandbox, filter, bindings.clone()).await {
                Ok(verdict) if !is_truthy(&verdict) => return ItemResult::Filtered,
                Ok(_) => {}
                Err(e) => return ItemResult::failure(filter.error(&locator, &e), item),
            }
        }

        let mut value = None;
        if let Some(map) = &scripts.map {
            match run_script(sandbox, map, bindings).await {
                Ok(mapped) => value = Some(mapped),
                Err(e) => return ItemResult::failure(map.error(&locator, &e), item),
            }
        }

        let existing = self.index.get(&locator);
        let skip = match (self.operation, existing) {
            (Operation::Create, Some(_)) | (Operation::Update, None) => true,
            _ => false,
        };
        if skip {
            item.action = Some(ItemAction::Skipped);
            item.meta = existing.map(|e| e.meta.clone());
            item.meta_path = existing.map(|e| display_path(&e.path));
            item.value = value;
            return ItemResult::Emitted {
                item,
                reduce_input: None,
            };
        }

        let existing_meta = existing.map(|e| &e.meta);
        let desired = match self.desired(&file, &value, existing_meta).await {
            Ok(desired) => desired,
            Err(error) => return ItemResult::failure(error, item),
        };
        if scripts.post_map.is_some() {
            value = Some(match &desired {
                Desired::Meta(meta) => json!({ "meta": meta }),
                Desired::Patch(ops) => json!({ "patch": ops }),
            });
        }
        let config = &self.stages.config;
        let merged = match desired.resolve(existing_meta, config.diff.strategy) {
            Ok(merged) => merged,
            Err(e) => {
                let error = StageError::for_locator(StageKind::Diff, &locator, e.to_string());
                return ItemResult::failure(error, item);
            }
        };

        if self.operation == Operation::Diff {
            return ItemResult::Compared(DiffEntry::compare(
                locator,
                existing_meta,
                &merged,
                config.diff.include_snapshots,
            ));
        }

        item.value = value;
        if let Some(existing) = existing.filter(|e| e.meta == merged) {
            item.action = Some(ItemAction::Unchanged);
            item.meta_path = Some(display_path(&existing.path));
            item.meta = Some(merged);
            return ItemResult::Emitted {
                item,
                reduce_input: None,
            };
        }

        match self.write(&locator, &merged).await {
            Ok(outcome) => {
                item.action = Some(match (outcome.written, existing) {
                    (false, _) => ItemAction::Unchanged,
                    (true, Some(_)) => ItemAction::Updated,
                    (true, None) => ItemAction::Created,
                });
                item.meta_path = Some(display_path(&outcome.path));
                item.meta = Some(merged);
                debug!(locator = %locator, action = ?item.action, "metadata written");
                ItemResult::Emitted {
                    item,
                    reduce_input: None,
                }
            }
            Err(e) => {
                let error = StageError::for_locator(StageKind::Write, &locator, write_failure(&e));
                ItemResult::failure(error, item)
            }
        }
    }
}

/// A prepared run.
pub struct Pipeline {
    config: Arc<RunConfig>,
    sandbox: Arc<Sandbox>,
    scripts: Arc<CompiledScripts>,
    shell: Option<Arc<ShellRunner>>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    /// Validate `config` and compile everything that can fail before the
    /// first item is touched.
    pub fn prepare(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let cancel = Arc::new(AtomicBool::new(false));
        let sandbox = Sandbox::new(
            config.sandbox.clone(),
            config.locator_policy.clone(),
            Arc::clone(&cancel),
        );
        let scripts = CompiledScripts::compile(&config.stages, &sandbox)?;

        let shell = if config.shell.enabled {
            let runner = ShellRunner::new(&config.shell)
                .map_err(|e| MetapipeError::InvalidConfig(format!("shell: {e}")))?;
            Some(Arc::new(runner))
        } else {
            None
        };

        if config.operation != Operation::Pipeline {
            if !scripts.produces_value() {
                return Err(MetapipeError::InvalidConfig(format!(
                    "operation `{}` needs a map or post_map script",
                    config.operation.as_str()
                )));
            }
            if scripts.reduce.is_some() {
                return Err(MetapipeError::InvalidConfig(
                    "the reduce stage is only available for operation `pipeline`".to_string(),
                ));
            }
        }

        Ok(Self {
            config: Arc::new(config),
            sandbox: Arc::new(sandbox),
            scripts: Arc::new(scripts),
            shell,
            cancel,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run and return the aggregate envelope without writing it anywhere.
    pub async fn collect(&self) -> Result<RunReport> {
        let mut records = Vec::new();
        Ok(match self.run(&mut records).await? {
            RunEnd::Aborted(error) => RunReport::aborted(&error),
            RunEnd::Completed(done) => {
                let envelope = ResultEnvelope::new(records, done.errors, done.meta)
                    .with_reduce(done.reduce)
                    .with_diff(done.diff);
                RunReport {
                    exit_code: envelope.exit_code(),
                    diagnostics: done.diagnostics,
                    envelope: Some(envelope),
                }
            }
        })
    }

    /// Run and write the result to the configured destination.
    pub async fn execute(&self) -> Result<RunReport> {
        let output = &self.config.output;
        if output.format == OutputFormat::Json {
            let report = self.collect().await?;
            if let Some(envelope) = &report.envelope {
                write_envelope(envelope, output)?;
            }
            return Ok(report);
        }

        let mut sink = LineSink::open(output, self.config.fail_fast())?;
        match self.run(&mut sink).await? {
            RunEnd::Aborted(error) => {
                sink.discard();
                Ok(RunReport::aborted(&error))
            }
            RunEnd::Completed(done) => {
                sink.finish(&done.errors, done.reduce.as_ref(), done.diff.as_ref(), &done.meta)?;
                Ok(RunReport {
                    exit_code: done.meta.outcome.exit_code(),
                    diagnostics: done.diagnostics,
                    envelope: None,
                })
            }
        }
    }

    async fn run<S: RecordSink>(&self, sink: &mut S) -> Result<RunEnd> {
        self.cancel.store(false, Ordering::SeqCst);
        let span = info_span!(
            "run",
            run_id = %Uuid::new_v4(),
            flow = self.config.flow.as_str(),
            operation = self.config.operation.as_str()
        );
        async move {
            let end = match self.config.flow {
                Flow::Records => self.run_records(sink).await?,
                Flow::Files => self.run_files(sink).await?,
            };
            match &end {
                RunEnd::Completed(done) => info!(
                    outcome = ?done.meta.outcome,
                    succeeded = done.meta.counts.succeeded,
                    failed = done.meta.counts.failed,
                    "run complete"
                ),
                RunEnd::Aborted(error) => warn!(%error, "run aborted"),
            }
            Ok(end)
        }
        .instrument(span)
        .await
    }

    fn pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.config.effective_workers(),
            self.config.fail_fast(),
            Arc::clone(&self.cancel),
        )
    }

    fn stages(&self) -> Stages {
        Stages {
            config: Arc::clone(&self.config),
            sandbox: Arc::clone(&self.sandbox),
            scripts: Arc::clone(&self.scripts),
            shell: self.shell.clone(),
        }
    }

    async fn walk(&self) -> Result<DiscoveryResult> {
        let options = DiscoveryOptions::from_config(&self.config);
        let result = tokio::task::spawn_blocking(move || discover(&options))
            .await
            .map_err(join_failure)??;
        info!(
            files = result.files.len(),
            errors = result.errors.len(),
            "discovery complete"
        );
        Ok(result)
    }

    /// Under fail-fast, the first of `errors` in canonical order.
    fn first_fatal(&self, errors: &mut Vec<StageError>) -> Option<StageError> {
        if !self.config.fail_fast() || errors.is_empty() {
            return None;
        }
        sort_errors(errors);
        Some(errors.remove(0))
    }

    async fn run_records<S: RecordSink>(&self, sink: &mut S) -> Result<RunEnd> {
        let DiscoveryResult { files, mut errors } = self.walk().await?;
        if let Some(error) = self.first_fatal(&mut errors) {
            return Ok(RunEnd::Aborted(error));
        }
        self.config.check_buffer_cap(files.len())?;

        let mut tally = Tally {
            errors,
            ..Tally::default()
        };
        tally.counts.discovered = files.len();

        let parser = Arc::new(ParseProcessor {
            config: Arc::clone(&self.config),
        });
        let mut parsed = Vec::with_capacity(files.len());
        let aborted = self
            .pool()
            .run(parser, files, |_, result| {
                parsed.push(result);
                Ok(())
            })
            .await?;
        if let Some(Aborted { output: Err(error), .. }) = aborted {
            return Ok(RunEnd::Aborted(error));
        }

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(parsed.len());
        for result in parsed {
            match result {
                Ok((rel_path, record)) if !seen.insert(record.locator.clone()) => {
                    let error = StageError::for_context(
                        StageKind::Parse,
                        rel_path,
                        format!("duplicate locator {:?}", record.locator),
                    );
                    if self.config.fail_fast() {
                        return Ok(RunEnd::Aborted(error));
                    }
                    tally.fail(error);
                }
                Ok((_, record)) => records.push(record),
                Err(error) => tally.fail(error),
            }
        }
        records.sort_by(|a, b| a.locator.cmp(&b.locator));
        tally.counts.processed = records.len();

        let processor = Arc::new(RecordProcessor {
            stages: self.stages(),
        });
        let embed = self.config.errors.embed;
        let aborted = self
            .pool()
            .run(processor, records, |_, result| tally.absorb(result, embed, sink))
            .await?;
        if let Some(Aborted {
            output: ItemResult::Failed { error, .. },
            ..
        }) = aborted
        {
            return Ok(RunEnd::Aborted(error));
        }

        self.finish_pipeline(tally).await
    }

    /// Build `FileEntry` values, attaching filesystem and git facts on request.
    async fn file_entries(&self, files: Vec<DiscoveredFile>) -> Result<(Vec<FileEntry>, Vec<StageError>)> {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || {
            let discovery = &config.discovery;
            let root_display = display_path(&discovery.root);
            let git = if !discovery.include_git {
                None
            } else if !is_git_repo(&discovery.root) {
                warn!(root = %root_display, "discovery root is not inside a git work tree, omitting git facts");
                None
            } else {
                match GitIndex::load(&discovery.root) {
                    Ok(index) => Some(index),
                    Err(e) => {
                        warn!(error = %e, "cannot read git status, omitting git facts");
                        None
                    }
                }
            };

            let mut entries = Vec::with_capacity(files.len());
            let mut errors = Vec::new();
            for file in files {
                let mut entry = FileEntry::from_rel_path(&root_display, &file.rel_path);
                if discovery.include_info {
                    match file_info(&file.path) {
                        Ok(info) => entry.info = Some(info),
                        Err(e) => {
                            errors.push(StageError::for_context(
                                StageKind::Discovery,
                                file.rel_path,
                                e.to_string(),
                            ));
                            continue;
                        }
                    }
                }
                if let Some(git) = &git {
                    entry.git = Some(git.info_for(&file.rel_path));
                }
                entries.push(entry);
            }
            (entries, errors)
        })
        .await
        .map_err(join_failure)
    }

    async fn run_files<S: RecordSink>(&self, sink: &mut S) -> Result<RunEnd> {
        let DiscoveryResult { files, mut errors } = self.walk().await?;
        if let Some(error) = self.first_fatal(&mut errors) {
            return Ok(RunEnd::Aborted(error));
        }
        self.config.check_buffer_cap(files.len())?;
        let discovered = files.len();

        let (entries, mut entry_errors) = self.file_entries(files).await?;
        if let Some(error) = self.first_fatal(&mut entry_errors) {
            return Ok(RunEnd::Aborted(error));
        }
        errors.extend(entry_errors);

        let mut tally = Tally {
            errors,
            ..Tally::default()
        };
        tally.counts.discovered = discovered;
        tally.counts.processed = entries.len();
        let embed = self.config.errors.embed;

        if self.config.operation == Operation::Pipeline {
            let processor = Arc::new(FileProcessor {
                stages: self.stages(),
            });
            let aborted = self
                .pool()
                .run(processor, entries, |_, result| tally.absorb(result, embed, sink))
                .await?;
            if let Some(Aborted {
                output: ItemResult::Failed { error, .. },
                ..
            }) = aborted
            {
                return Ok(RunEnd::Aborted(error));
            }
            return self.finish_pipeline(tally).await;
        }

        let store = MetaStore::new(&self.config)?;
        let meta_dir = store.meta_dir().to_path_buf();
        let max_bytes = self.config.limits.max_record_bytes;
        let mut index = tokio::task::spawn_blocking(move || MetaIndex::load(&meta_dir, max_bytes))
            .await
            .map_err(join_failure)??;
        let mut index_errors = std::mem::take(&mut index.errors);
        let is_diff = self.config.operation == Operation::Diff;
        if !is_diff {
            if let Some(error) = self.first_fatal(&mut index_errors) {
                return Ok(RunEnd::Aborted(error));
            }
        }
        let invalid_input = is_diff && !index_errors.is_empty();
        tally.errors.extend(index_errors);

        let index = Arc::new(index);
        let store = Arc::new(store);
        let processor = Arc::new(WriteProcessor {
            stages: self.stages(),
            operation: self.config.operation,
            index: Arc::clone(&index),
            store: Arc::clone(&store),
        });
        let aborted = self
            .pool()
            .run(processor, entries, |_, result| tally.absorb(result, embed, sink))
            .await?;
        if let Some(Aborted {
            output: ItemResult::Failed { error, .. },
            ..
        }) = aborted
        {
            return Ok(RunEnd::Aborted(error));
        }

        let diff = is_diff.then(|| {
            let snapshots = self.config.diff.include_snapshots;
            let mut entries = std::mem::take(&mut tally.diff_entries);
            for (locator, existing) in index.orphans(store.canonical_root()) {
                entries.push(DiffEntry::orphan(locator, &existing.meta, snapshots));
            }
            DiffReport::build(entries, self.config.diff.only)
        });
        Ok(RunEnd::Completed(self.finish(tally, None, diff, invalid_input)))
    }

    async fn finish_pipeline(&self, mut tally: Tally) -> Result<RunEnd> {
        let Some(script) = self.scripts.reduce.clone() else {
            return Ok(RunEnd::Completed(self.finish(tally, None, None, false)));
        };

        let inputs = std::mem::take(&mut tally.reduce_inputs);
        let sandbox = Arc::clone(&self.sandbox);
        let fail_fast = self.config.fail_fast();
        let (acc, errors) = tokio::task::spawn_blocking(move || {
            let mut acc = Value::Null;
            let mut errors = Vec::new();
            for (locator, value) in inputs {
                let mut bindings = Bindings::new().with("value", value);
                if !acc.is_null() {
                    bindings.set("acc", acc.clone());
                }
                match sandbox.eval(script.kind().as_str(), script.source(), &bindings) {
                    Ok(next) => acc = next,
                    Err(e) => {
                        errors.push(script.error(&locator, &e));
                        if fail_fast {
                            break;
                        }
                    }
                }
            }
            (acc, errors)
        })
        .await
        .map_err(join_failure)?;

        if fail_fast {
            if let Some(error) = errors.into_iter().next() {
                return Ok(RunEnd::Aborted(error));
            }
        } else {
            tally.errors.extend(errors);
        }
        Ok(RunEnd::Completed(self.finish(tally, Some(acc), None, false)))
    }

    fn finish(
        &self,
        mut tally: Tally,
        reduce: Option<Value>,
        diff: Option<DiffReport>,
        invalid_input: bool,
    ) -> Completed {
        sort_errors(&mut tally.errors);
        let mut outcome = tally.outcome();
        if invalid_input {
            outcome = Outcome::InvalidInput;
        } else if let Some(report) = &diff {
            let clean = matches!(outcome, Outcome::Success | Outcome::NoItems);
            if clean && self.config.diff.fail_on_change && report.has_changes() {
                outcome = Outcome::ChangesDetected;
            }
        }

        let failed = tally.counts.failed;
        let diagnostic = match outcome {
            Outcome::Success => None,
            Outcome::NoItems => Some("no items to process".to_string()),
            Outcome::AllFailed if tally.failed_stages.iter().all(|s| *s == StageKind::Shell) => {
                Some(format!("all {failed} items failed at the shell stage"))
            }
            Outcome::AllFailed => Some(format!("all {failed} items failed")),
            Outcome::PartialFailure => Some(format!(
                "completed with {} errors ({failed} items failed)",
                tally.errors.len()
            )),
            Outcome::ChangesDetected => Some("diff found changes".to_string()),
            Outcome::InvalidInput => Some("some existing metadata files could not be read".to_string()),
        };

        let meta = RunMeta::new(self.config.flow, self.config.operation, tally.counts, outcome);
        Completed {
            errors: tally.errors,
            reduce,
            diff,
            meta,
            diagnostics: diagnostic.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_rejects_write_without_map() {
        let mut config = RunConfig {
            flow: Flow::Files,
            operation: Operation::Create,
            ..RunConfig::default()
        };
        assert!(matches!(
            Pipeline::prepare(config.clone()),
            Err(MetapipeError::InvalidConfig(_))
        ));
        config.stages.map = Some("{ title = file.name }".into());
        Pipeline::prepare(config.clone()).unwrap();
        config.stages.reduce = Some("value".into());
        assert!(Pipeline::prepare(config).is_err());
    }

    #[test]
    fn test_prepare_rejects_syntax_errors() {
        let mut config = RunConfig::default();
        config.stages.filter = Some("return (".into());
        let err = Pipeline::prepare(config).err().unwrap();
        assert!(err.to_string().contains("filter script"));
    }

    #[test]
    fn test_tally_outcomes() {
        let mut tally = Tally::default();
        assert_eq!(tally.outcome(), Outcome::NoItems);
        tally.counts.processed = 2;
        tally.counts.succeeded = 2;
        assert_eq!(tally.outcome(), Outcome::Success);
        tally.fail(StageError::for_locator(StageKind::Shell, "a", "exit 1"));
        assert_eq!(tally.outcome(), Outcome::PartialFailure);
        tally.counts.succeeded = 0;
        assert_eq!(tally.outcome(), Outcome::AllFailed);
    }

    #[test]
    fn test_aborted_exit_codes() {
        let script = StageError::for_locator(StageKind::Map, "a", "boom");
        let report = RunReport::aborted(&script);
        assert_eq!(report.exit_code, 3);
        assert_eq!(report.diagnostics, vec!["run aborted: map failed for a: boom".to_string()]);
        let shell = StageError::for_locator(StageKind::Shell, "a", "command exited with code 1");
        assert_eq!(RunReport::aborted(&shell).exit_code, 2);
    }

    #[test]
    fn test_collision_message_uses_file_name() {
        let err = MetapipeError::Collision {
            path: Path::new("/tmp/abc/meta/0123-docs-a.md.yaml").to_path_buf(),
            existing: "docs/b.md".into(),
            locator: "docs/a.md".into(),
        };
        let message = write_failure(&err);
        assert!(message.contains("0123-docs-a.md.yaml"));
        assert!(!message.contains("/tmp/abc"));
    }
}
