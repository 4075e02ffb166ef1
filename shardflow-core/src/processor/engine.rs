//! Processing engine
//!
//! Runs one worker of the group. Rank 0 prepares the sink and resolves the
//! canonical key set; every worker transforms the keys it owns, then takes
//! its turn writing through the token protocol.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::buffer::OutputBuffer;
use super::builtin::{self, BUILTIN_NAMES};
use super::output::{normalize, OutputItem, Transform, TransformInput};
use crate::comm::{broadcast, Channel};
use crate::config::{OnError, ProcessorConfig};
use crate::coordinator::{
    CoordinationContext, Election, FixedElection, KeyAssigner, KeyEntry, KeySet,
    LockFileElection, WriteCoordinator,
};
use crate::data::{Accessor, KeyResolver};
use crate::error::{Result, ShardflowError};
use crate::metrics::RunMetrics;
use crate::store::{DataSource, JsonStore, SinkStore, SourceStore};
use crate::DEFAULT_OUTPUT_TAG;

/// Handler for recoverable errors under [`OnError::Callback`]
pub type ErrorCallback = Box<dyn FnMut(&ShardflowError) + Send>;

/// Outcome of one worker's run
#[derive(Debug)]
pub struct RunReport {
    pub rank: u32,
    /// Keys assigned to this worker
    pub owned: usize,
    /// Keys transformed successfully
    pub processed: usize,
    pub failed: usize,
    /// Entries staged for the sink
    pub buffered: usize,
    /// Whether this worker's buffer reached the sink
    pub wrote: bool,
    /// Every recoverable error, with context
    pub errors: Vec<String>,
    pub metrics: RunMetrics,
}

type KeyFailure = (ShardflowError, String);

/// Distributed key processor
pub struct Processor {
    config: ProcessorConfig,
    transform: Transform,
    callback: Mutex<Option<ErrorCallback>>,
    sources: Arc<dyn SourceStore>,
    sink: Arc<dyn SinkStore>,
}

impl Processor {
    /// Create a processor reading and writing JSON containers
    pub fn new(config: ProcessorConfig, transform: Transform) -> Self {
        Self::with_stores(config, transform, Arc::new(JsonStore), Arc::new(JsonStore))
    }

    /// Create a processor over custom stores
    pub fn with_stores(
        config: ProcessorConfig,
        transform: Transform,
        sources: Arc<dyn SourceStore>,
        sink: Arc<dyn SinkStore>,
    ) -> Self {
        Self {
            config,
            transform,
            callback: Mutex::new(None),
            sources,
            sink,
        }
    }

    /// Create a processor running the builtin transform named in the config
    pub fn from_config(config: ProcessorConfig) -> Result<Self> {
        let name = config
            .transform
            .as_deref()
            .ok_or_else(|| ShardflowError::InvalidConfig {
                reason: "no transform named".into(),
            })?;
        let transform = builtin::lookup(name).ok_or_else(|| ShardflowError::InvalidConfig {
            reason: format!("unknown transform {:?}, expected one of {:?}", name, BUILTIN_NAMES),
        })?;
        Ok(Self::new(config, transform))
    }

    /// Register the handler used under [`OnError::Callback`]
    pub fn on_error(self, callback: impl FnMut(&ShardflowError) + Send + 'static) -> Self {
        *self.callback.lock() = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Validate the configuration. Performs no I/O.
    pub fn check(&self) -> Result<()> {
        self.config.validate()?;
        if self.config.on_error == OnError::Callback && self.callback.lock().is_none() {
            return Err(ShardflowError::InvalidConfig {
                reason: "callback error policy needs a registered callback".into(),
            });
        }
        Ok(())
    }

    /// Accessors of every complete key, one per source, in canonical order.
    ///
    /// Local to the caller: no partitioning and no channel.
    pub fn access(&self) -> Result<Vec<Vec<Accessor>>> {
        self.check()?;
        let sources = self.open_sources()?;
        let keys = self.resolve_keys(&sources)?;
        let all: Vec<usize> = (0..keys.len()).collect();
        Ok(self.build_accessors(&sources, &keys, &all))
    }

    /// Run this worker with the lock-marker election next to the sink
    pub async fn run(&self, channel: Arc<dyn Channel>) -> Result<RunReport> {
        let election: Box<dyn Election> = match self.config.lock_path() {
            Some(lock) => Box::new(LockFileElection::new(lock, &self.config.lock)),
            None => Box::new(FixedElection(0)),
        };
        self.run_with_election(channel, election).await
    }

    /// Run this worker. Every worker of the group must call this exactly
    /// once with the same configuration.
    pub async fn run_with_election(
        &self,
        channel: Arc<dyn Channel>,
        election: Box<dyn Election>,
    ) -> Result<RunReport> {
        self.check()?;

        let rank = channel.rank();
        let size = channel.size();
        let metrics = RunMetrics::new();
        let mut errors = Vec::new();
        let mut fatal = None;

        let mut sources = match self.open_sources() {
            Ok(sources) => sources,
            Err(e) => {
                self.absorb(e, "opening sources", &mut errors, &mut fatal);
                Vec::new()
            }
        };

        let root_keys = if rank == 0 {
            Some(self.root_setup(&sources, &mut errors, &mut fatal).await)
        } else {
            None
        };
        let keys: KeySet = broadcast(channel.as_ref(), root_keys.as_ref(), 0).await?;
        debug!("Worker {} received {} keys", rank, keys.len());

        if keys.entries().iter().any(|e| e.tags.len() != sources.len()) && !sources.is_empty() {
            let err = ShardflowError::InvalidMessage {
                reason: format!("key set does not match {} sources", sources.len()),
            };
            self.absorb(err, "receiving keys", &mut errors, &mut fatal);
            sources.clear();
        }

        let owned: Vec<usize> = if sources.is_empty() {
            Vec::new()
        } else {
            KeyAssigner::new(size)
                .keys_for_worker(&keys, rank)
                .into_iter()
                .map(|(position, _)| position)
                .collect()
        };
        metrics.keys_owned.inc_by(owned.len() as u64);
        info!("Worker {} owns {} of {} keys", rank, owned.len(), keys.len());

        let mut buffer = OutputBuffer::new();
        let accessors = self.build_accessors(&sources, &keys, &owned);
        for (&position, inputs) in owned.iter().zip(accessors) {
            if fatal.is_some() {
                break;
            }
            let entry = &keys.entries()[position];

            match self.process_key(entry, &inputs) {
                Ok(items) if items.is_empty() => {
                    metrics.keys_processed.inc();
                    metrics.keys_skipped.inc();
                }
                Ok(items) => {
                    metrics.keys_processed.inc();
                    let tag = self.output_tag(entry);
                    for (id, item) in items {
                        buffer.add(&id, item, tag);
                    }
                    forward_inventory(&inputs, &mut buffer);
                }
                Err((err, shapes)) => {
                    metrics.keys_failed.inc();
                    let context =
                        format!("key {} (tags {:?}, inputs [{}])", entry.key, entry.tags, shapes);
                    self.absorb(err, &context, &mut errors, &mut fatal);
                }
            }
        }
        drop(sources);

        if fatal.is_some() {
            buffer.clear();
        }
        let buffered = buffer.len();
        metrics.items_buffered.inc_by(buffered as u64);

        let wrote = match self.config.sink.clone() {
            Some(sink) => {
                let writer =
                    WriteCoordinator::new(CoordinationContext::new(channel.clone()), election);
                let store = self.sink.clone();
                let metrics = &metrics;

                let outcome = writer
                    .write(|| async move {
                        let started = Instant::now();
                        let path = sink.clone();
                        let stats = tokio::task::spawn_blocking(move || {
                            buffer.flush(store.as_ref(), &path)
                        })
                        .await
                        .map_err(|e| ShardflowError::Sink {
                            path: sink.display().to_string(),
                            reason: format!("flush task failed: {}", e),
                        })??;
                        metrics.flushes.inc();
                        metrics.flush_duration.observe_since(started);
                        debug!("Worker {} flushed {} entries", rank, stats.total());
                        Ok(())
                    })
                    .await?;
                debug!("Worker {} wrote under manager {}", rank, outcome.manager);
                true
            }
            None => {
                channel.barrier().await?;
                false
            }
        };

        if let Some(err) = fatal {
            return Err(err);
        }

        info!(
            "Worker {} done: {} processed, {} failed, {} buffered",
            rank,
            metrics.keys_processed.get(),
            metrics.keys_failed.get(),
            buffered
        );

        Ok(RunReport {
            rank,
            owned: owned.len(),
            processed: metrics.keys_processed.get() as usize,
            failed: metrics.keys_failed.get() as usize,
            buffered,
            wrote,
            errors,
            metrics,
        })
    }

    async fn root_setup(
        &self,
        sources: &[Arc<dyn DataSource>],
        errors: &mut Vec<String>,
        fatal: &mut Option<ShardflowError>,
    ) -> KeySet {
        if let Some(sink) = &self.config.sink {
            if let Err(e) = self.prepare_sink(sink, sources).await {
                self.absorb(e, "preparing sink", errors, fatal);
            }
        }

        if sources.is_empty() {
            return KeySet::default();
        }
        match self.resolve_keys(sources) {
            Ok(keys) => keys,
            Err(e) => {
                self.absorb(e, "resolving keys", errors, fatal);
                KeySet::default()
            }
        }
    }

    /// Open every source path once, in source order
    fn open_sources(&self) -> Result<Vec<Arc<dyn DataSource>>> {
        let mut opened: HashMap<&Path, Arc<dyn DataSource>> = HashMap::new();
        let mut sources = Vec::with_capacity(self.config.sources.len());

        for path in &self.config.sources {
            let source = match opened.get(path.as_path()) {
                Some(source) => source.clone(),
                None => {
                    let source = self.sources.open(path)?;
                    opened.insert(path.as_path(), source.clone());
                    source
                }
            };
            sources.push(source);
        }
        Ok(sources)
    }

    fn resolve_keys(&self, sources: &[Arc<dyn DataSource>]) -> Result<KeySet> {
        let maps = sources
            .iter()
            .enumerate()
            .map(|(j, source)| {
                KeyResolver::new(self.config.mode_for(j), self.config.input_tag.clone())
                    .resolve(source.as_ref())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(KeySet::intersect(&maps))
    }

    /// Fresh sink holding the events of every source, without a stale lock
    async fn prepare_sink(&self, sink: &Path, sources: &[Arc<dyn DataSource>]) -> Result<()> {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut events = Vec::new();
        for source in sources {
            if seen.insert(source.path().to_path_buf()) {
                events.extend(source.events()?);
            }
        }

        self.sink.create(sink, &events)?;
        if let Some(lock) = self.config.lock_path() {
            LockFileElection::new(lock, &self.config.lock).clear().await?;
        }

        info!("Prepared sink {} with {} events", sink.display(), events.len());
        Ok(())
    }

    /// Accessors for the keys at `positions`, one per source
    fn build_accessors(
        &self,
        sources: &[Arc<dyn DataSource>],
        keys: &KeySet,
        positions: &[usize],
    ) -> Vec<Vec<Accessor>> {
        let fellows: Vec<Option<Arc<Vec<Accessor>>>> = (0..sources.len())
            .map(|j| {
                self.config.pairwise.then(|| {
                    Arc::new(
                        keys.entries()
                            .iter()
                            .map(|entry| self.accessor(sources, j, entry))
                            .collect(),
                    )
                })
            })
            .collect();

        positions
            .iter()
            .map(|&position| {
                let entry = &keys.entries()[position];
                (0..sources.len())
                    .map(|j| {
                        let accessor = self.accessor(sources, j, entry);
                        match &fellows[j] {
                            Some(list) => accessor.with_fellows(list.clone()),
                            None => accessor,
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn accessor(&self, sources: &[Arc<dyn DataSource>], j: usize, entry: &KeyEntry) -> Accessor {
        Accessor::new(
            sources[j].clone(),
            self.config.mode_for(j),
            entry.tags[j].clone(),
            entry.key.clone(),
        )
    }

    fn process_key(
        &self,
        entry: &KeyEntry,
        accessors: &[Accessor],
    ) -> std::result::Result<Vec<(String, OutputItem)>, KeyFailure> {
        let inputs: Vec<TransformInput> = if self.config.pass_accessor {
            accessors.iter().cloned().map(TransformInput::Accessor).collect()
        } else {
            let mut resolved = Vec::with_capacity(accessors.len());
            for accessor in accessors {
                match accessor.target() {
                    Ok(target) => resolved.push(TransformInput::Target(target)),
                    Err(e) => {
                        let shapes = accessors
                            .iter()
                            .map(|a| TransformInput::Accessor(a.clone()))
                            .collect::<Vec<_>>();
                        return Err((e, describe(&shapes)));
                    }
                }
            }
            resolved
        };

        match (self.transform)(&inputs) {
            Ok(output) => Ok(normalize(&entry.key, output)),
            Err(source) => Err((
                ShardflowError::Transform {
                    key: entry.key.clone(),
                    source,
                },
                describe(&inputs),
            )),
        }
    }

    fn output_tag<'a>(&'a self, entry: &'a KeyEntry) -> &'a str {
        self.config
            .output_tag
            .as_deref()
            .or(self.config.input_tag.as_deref())
            .or(entry.tags.first().map(String::as_str))
            .unwrap_or(DEFAULT_OUTPUT_TAG)
    }

    /// Route a recoverable error through the configured policy. Under
    /// [`OnError::Raise`] the first error is kept as fatal.
    fn absorb(
        &self,
        err: ShardflowError,
        context: &str,
        errors: &mut Vec<String>,
        fatal: &mut Option<ShardflowError>,
    ) {
        errors.push(format!("{}: {}", context, err));

        match self.config.on_error {
            OnError::Raise => {
                error!("Aborting on {}: {}", context, err);
                fatal.get_or_insert(err);
            }
            OnError::Callback => match self.callback.lock().as_mut() {
                Some(callback) => callback(&err),
                None => error!("{}: {}", context, err),
            },
            OnError::Report => error!("{}: {}", context, err),
        }
    }
}

/// Buffer the inventory of the first input's unit, if it has one
fn forward_inventory(inputs: &[Accessor], buffer: &mut OutputBuffer) {
    let Some(first) = inputs.first() else {
        return;
    };
    let Some(unit) = first.unit() else {
        return;
    };

    match first.inventory() {
        Ok(Some(inventory)) => buffer.add_metadata(unit, inventory),
        Ok(None) => {}
        Err(e) => warn!("No inventory for {}: {}", unit, e),
    }
}

fn describe(inputs: &[TransformInput]) -> String {
    inputs
        .iter()
        .map(TransformInput::describe)
        .collect::<Vec<_>>()
        .join(", ")
}
