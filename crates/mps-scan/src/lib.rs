//! Scan pipeline: configuration, the entity processor, the bounded worker pool
//! and the orchestrator that turns a roster into a ranked candidate report.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::num::{NonZeroU64, NonZeroUsize};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use mps_adapters::{
    adapter_for_source, load_roster_file, AdapterError, ExtractError, ExtractorConfig,
    StatExtractor, StatsSource, KNOWN_SOURCES,
};
use mps_core::{rank_candidates, Candidate, Entity, MilestoneRule, ScanResult, StatSnapshot};
use mps_storage::{
    FallbackFetcher, FetchError, FetcherConfig, HttpClientConfig, RateGateConfig, ReportStore,
    TokenBucketConfig, DEFAULT_PROXY_ENDPOINT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mps-scan";

const PROGRESS_EVERY: usize = 25;

const DEFAULT_BUCKET_REFILL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("unknown source {0:?} (known: {known})", known = KNOWN_SOURCES.join(", "))]
    UnknownSource(String),
    #[error("source {0} is disabled in sources.yaml")]
    SourceDisabled(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("roster for {source_id} unavailable: {detail}")]
    RosterUnavailable { source_id: String, detail: String },
    #[error(transparent)]
    Adapter(AdapterError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<AdapterError> for ScanError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::RosterUnavailable { source_id, detail } => {
                Self::RosterUnavailable { source_id, detail }
            }
            AdapterError::UnsupportedStat { .. } => Self::Config(err.to_string()),
            other => Self::Adapter(other),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub stat_type: Option<String>,
    #[serde(default)]
    pub milestone: Option<MilestoneRule>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub extractor: Option<ExtractorConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub const FILE_NAME: &'static str = "sources.yaml";

    /// `Ok(None)` when the workspace has no `sources.yaml`; adapter defaults
    /// then apply.
    pub async fn load(workspace_root: &Path) -> anyhow::Result<Option<Self>> {
        let path = workspace_root.join(Self::FILE_NAME);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(registry))
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.source_id.eq_ignore_ascii_case(source_id))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = raw.as_str(), "ignoring unparseable environment value");
            None
        }
    }
}

/// Environment-level configuration. Every field is an override of the
/// per-source defaults; nothing here is hardcoded into the scan itself.
#[derive(Clone)]
pub struct ScanConfig {
    pub workspace_root: PathBuf,
    pub source_id: String,
    pub workers: usize,
    pub http_timeout_secs: u64,
    pub proxy_endpoint: String,
    pub proxy_credential: Option<String>,
    pub user_agent: Option<String>,
    pub rate_gate: RateGateConfig,
    /// Off unless a bucket capacity is configured.
    pub token_bucket: Option<TokenBucketConfig>,
    pub stat_type: Option<String>,
    pub milestone_step: Option<u64>,
    pub milestone_threshold: Option<u64>,
    pub milestone_min_value: Option<u64>,
    pub output_file: Option<PathBuf>,
    pub roster_file: Option<PathBuf>,
    pub wall_clock_budget: Option<Duration>,
}

impl fmt::Debug for ScanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanConfig")
            .field("workspace_root", &self.workspace_root)
            .field("source_id", &self.source_id)
            .field("workers", &self.workers)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("proxy_endpoint", &self.proxy_endpoint)
            .field(
                "proxy_credential",
                &self.proxy_credential.as_ref().map(|_| "<redacted>"),
            )
            .field("user_agent", &self.user_agent)
            .field("rate_gate", &self.rate_gate)
            .field("token_bucket", &self.token_bucket)
            .field("stat_type", &self.stat_type)
            .field("milestone_step", &self.milestone_step)
            .field("milestone_threshold", &self.milestone_threshold)
            .field("milestone_min_value", &self.milestone_min_value)
            .field("output_file", &self.output_file)
            .field("roster_file", &self.roster_file)
            .field("wall_clock_budget", &self.wall_clock_budget)
            .finish()
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        let rate_gate = RateGateConfig::default();
        Self {
            workspace_root: PathBuf::from("."),
            source_id: "nhl".to_string(),
            workers: 5,
            http_timeout_secs: 20,
            proxy_endpoint: DEFAULT_PROXY_ENDPOINT.to_string(),
            proxy_credential: None,
            user_agent: None,
            rate_gate,
            token_bucket: None,
            stat_type: None,
            milestone_step: None,
            milestone_threshold: None,
            milestone_min_value: None,
            output_file: None,
            roster_file: None,
            wall_clock_budget: None,
        }
    }
}

impl ScanConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ms = |name: &str, fallback: Duration| {
            env_parse::<u64>(name)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        Self {
            workspace_root: env_var("MPS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            source_id: env_var("MPS_SOURCE").unwrap_or(defaults.source_id),
            workers: env_parse("MPS_WORKERS").unwrap_or(defaults.workers),
            http_timeout_secs: env_parse("MPS_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            proxy_endpoint: env_var("MPS_PROXY_ENDPOINT").unwrap_or(defaults.proxy_endpoint),
            proxy_credential: env_var("SCRAPERAPI_KEY"),
            user_agent: env_var("MPS_USER_AGENT"),
            rate_gate: RateGateConfig {
                base_delay: ms("MPS_RATE_BASE_MS", defaults.rate_gate.base_delay),
                jitter_min: ms("MPS_RATE_JITTER_MIN_MS", defaults.rate_gate.jitter_min),
                jitter_max: ms("MPS_RATE_JITTER_MAX_MS", defaults.rate_gate.jitter_max),
            },
            token_bucket: token_bucket_from(
                env_parse("MPS_RATE_BUCKET_CAPACITY"),
                env_parse("MPS_RATE_BUCKET_REFILL_MS"),
            ),
            stat_type: env_var("MPS_STAT_TYPE"),
            milestone_step: env_parse("MILESTONE_STEP"),
            milestone_threshold: env_parse("MILESTONE_THRESHOLD"),
            milestone_min_value: env_parse("MILESTONE_MIN_VALUE"),
            output_file: env_var("MPS_OUTPUT_FILE").map(PathBuf::from),
            roster_file: env_var("MPS_ROSTER_FILE").map(PathBuf::from),
            wall_clock_budget: env_parse::<u64>("MPS_WALL_CLOCK_SECS").map(Duration::from_secs),
        }
    }

    pub fn fetcher_config(&self, source: &dyn StatsSource) -> FetcherConfig {
        let mut browser_headers = source.browser_headers();
        if let Some(user_agent) = &self.user_agent {
            browser_headers.user_agent = user_agent.clone();
        }
        FetcherConfig {
            http: HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
                user_agent: None,
            },
            proxy_endpoint: self.proxy_endpoint.clone(),
            proxy_credential: self.proxy_credential.clone(),
            browser_headers,
            rate_gate: self.rate_gate,
            token_bucket: self.token_bucket,
        }
    }
}

/// A capacity turns the bucket on; the refill interval defaults to one second.
pub fn token_bucket_from(
    capacity: Option<u32>,
    refill_ms: Option<u64>,
) -> Option<TokenBucketConfig> {
    let capacity = capacity?;
    Some(
        TokenBucketConfig {
            capacity,
            refill_every: Duration::from_millis(refill_ms.unwrap_or(DEFAULT_BUCKET_REFILL_MS)),
        }
        .normalized(),
    )
}

/// Frozen, resolved settings for one scan run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub source_id: String,
    pub stat_type: String,
    pub rule: MilestoneRule,
    pub extractor: ExtractorConfig,
    pub workers: NonZeroUsize,
    pub output_file: PathBuf,
}

impl ScanSettings {
    /// Layering: adapter defaults, then the `sources.yaml` entry, then the
    /// environment/CLI overrides in `config`.
    pub fn resolve(
        config: &ScanConfig,
        source: &dyn StatsSource,
        entry: Option<&SourceConfig>,
    ) -> Result<Self, ScanError> {
        let stat_type = config
            .stat_type
            .clone()
            .or_else(|| entry.and_then(|e| e.stat_type.clone()))
            .unwrap_or_else(|| source.default_stat_type().to_string())
            .to_ascii_lowercase();

        let extractor = match entry.and_then(|e| e.extractor.clone()) {
            Some(extractor) if config.stat_type.is_none() => extractor,
            _ => source.extractor_for(&stat_type)?,
        };

        let base = entry
            .and_then(|e| e.milestone)
            .unwrap_or_else(|| source.default_milestone());
        let step = match config.milestone_step {
            Some(step) => NonZeroU64::new(step)
                .ok_or_else(|| ScanError::Config("milestone step must be positive".to_string()))?,
            None => base.step,
        };
        let rule = MilestoneRule::new(
            step,
            config.milestone_threshold.unwrap_or(base.threshold),
            config.milestone_min_value.unwrap_or(base.min_value),
        );

        let output_file = config
            .output_file
            .clone()
            .or_else(|| entry.and_then(|e| e.output_file.clone()))
            .unwrap_or_else(|| PathBuf::from(source.default_output_file()));

        Ok(Self {
            source_id: source.source_id().to_string(),
            stat_type,
            rule,
            extractor,
            workers: NonZeroUsize::new(config.workers).unwrap_or(NonZeroUsize::MIN),
            output_file,
        })
    }
}

#[derive(Debug, Error)]
pub enum EntityFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unreadable stats payload: {0}")]
    Extract(#[from] ExtractError),
}

#[derive(Debug)]
pub enum EntityOutcome {
    Candidate(Candidate),
    /// Fetched and parsed, but not within reach of a milestone.
    Suppressed,
    Failed(EntityFailure),
}

impl EntityOutcome {
    pub fn into_candidate(self) -> Option<Candidate> {
        match self {
            Self::Candidate(candidate) => Some(candidate),
            Self::Suppressed | Self::Failed(_) => None,
        }
    }
}

/// Fetches one entity's stats and applies the milestone rule. Never fails the
/// caller: every problem becomes `EntityOutcome::Failed`.
pub struct EntityProcessor {
    source: Arc<dyn StatsSource>,
    fetcher: FallbackFetcher,
    extractor: Box<dyn StatExtractor>,
    rule: MilestoneRule,
    stat_type: String,
}

impl fmt::Debug for EntityProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityProcessor")
            .field("source_id", &self.source.source_id())
            .field("fetcher", &self.fetcher)
            .field("extractor", &self.extractor)
            .field("rule", &self.rule)
            .field("stat_type", &self.stat_type)
            .finish()
    }
}

impl EntityProcessor {
    pub fn new(
        source: Arc<dyn StatsSource>,
        fetcher: FallbackFetcher,
        settings: &ScanSettings,
    ) -> Self {
        Self {
            source,
            fetcher,
            extractor: settings.extractor.build(),
            rule: settings.rule,
            stat_type: settings.stat_type.clone(),
        }
    }

    pub async fn evaluate(&self, entity: &Entity) -> EntityOutcome {
        let url = self.source.stats_url(&entity.id);
        let payload = match self.fetcher.fetch_with_fallback(&url).await {
            Ok(payload) => payload,
            Err(err) => {
                debug!(entity_id = %entity.id, kind = ?err.kind(), error = %err, "stats fetch failed");
                return EntityOutcome::Failed(err.into());
            }
        };

        let value = match self.extractor.extract(&payload) {
            Ok(value) => value,
            Err(err) => {
                debug!(entity_id = %entity.id, error = %err, "stats payload unreadable");
                return EntityOutcome::Failed(err.into());
            }
        };

        let Some(hit) = self.rule.evaluate(value) else {
            return EntityOutcome::Suppressed;
        };

        let snapshot = StatSnapshot {
            entity: entity.clone(),
            cumulative_value: value,
            metadata: self.source.metadata(entity, &payload),
        };
        EntityOutcome::Candidate(Candidate::from_snapshot(snapshot, hit, &self.stat_type))
    }

    pub async fn process(&self, entity: &Entity) -> Option<Candidate> {
        self.evaluate(entity).await.into_candidate()
    }
}

/// Live counters for an in-progress scan.
#[derive(Debug, Default)]
pub struct ScanProgress {
    total: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    candidates: AtomicUsize,
}

impl ScanProgress {
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn candidates(&self) -> usize {
        self.candidates.load(Ordering::Relaxed)
    }

    fn reset(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.candidates.store(0, Ordering::Relaxed);
    }

    fn record(&self, outcome: &EntityOutcome) -> usize {
        match outcome {
            EntityOutcome::Candidate(_) => {
                self.candidates.fetch_add(1, Ordering::Relaxed);
            }
            EntityOutcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            EntityOutcome::Suppressed => {}
        }
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Everything a pool run produced. Each submitted item lands in exactly one
/// of the three buckets.
#[derive(Debug)]
pub struct PoolRun<T, R> {
    pub completed: Vec<(T, R)>,
    pub panicked: Vec<T>,
    /// Never started because the run was cancelled.
    pub unscheduled: Vec<T>,
}

enum Completion<T, R> {
    Done(T, R),
    Panicked(T),
}

/// Fixed number of workers pulling from one shared queue. Results flow over a
/// channel into the single consumer that called [`BoundedPool::run`].
#[derive(Debug, Clone, Copy)]
pub struct BoundedPool {
    workers: NonZeroUsize,
}

impl BoundedPool {
    pub fn new(workers: NonZeroUsize) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> usize {
        self.workers.get()
    }

    pub async fn run<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        work: F,
        mut on_result: impl FnMut(&T, &R),
    ) -> PoolRun<T, R>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let worker_count = self.workers.get().min(items.len().max(1));
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let work = Arc::new(work);
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion<T, R>>();

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let queue = Arc::clone(&queue);
            let work = Arc::clone(&work);
            let tx = tx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(item) = next else {
                        break;
                    };
                    let input = item.clone();
                    let work = Arc::clone(&work);
                    let result = AssertUnwindSafe(async move { work(input).await })
                        .catch_unwind()
                        .await;
                    let completion = match result {
                        Ok(output) => Completion::Done(item, output),
                        Err(_) => Completion::Panicked(item),
                    };
                    if tx.send(completion).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut completed = Vec::new();
        let mut panicked = Vec::new();
        while let Some(completion) = rx.recv().await {
            match completion {
                Completion::Done(item, output) => {
                    on_result(&item, &output);
                    completed.push((item, output));
                }
                Completion::Panicked(item) => panicked.push(item),
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "scan worker exited abnormally");
            }
        }

        let unscheduled = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        PoolRun {
            completed,
            panicked,
            unscheduled,
        }
    }
}

/// Drops repeated identities, keeping the first occurrence. Returns the
/// distinct roster and how many entries were dropped.
pub fn dedupe_roster(roster: Vec<Entity>) -> (Vec<Entity>, usize) {
    let before = roster.len();
    let mut seen = HashSet::with_capacity(before);
    let distinct: Vec<Entity> = roster
        .into_iter()
        .filter(|entity| seen.insert(entity.id.clone()))
        .collect();
    let dropped = before - distinct.len();
    (distinct, dropped)
}

pub struct ScanOrchestrator {
    settings: ScanSettings,
    processor: Arc<EntityProcessor>,
    pool: BoundedPool,
    cancel: CancellationToken,
    progress: Arc<ScanProgress>,
}

impl fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("settings", &self.settings)
            .field("pool", &self.pool)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress)
            .finish()
    }
}

impl ScanOrchestrator {
    pub fn new(settings: ScanSettings, processor: EntityProcessor) -> Self {
        Self {
            pool: BoundedPool::new(settings.workers),
            settings,
            processor: Arc::new(processor),
            cancel: CancellationToken::new(),
            progress: Arc::new(ScanProgress::default()),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> Arc<ScanProgress> {
        Arc::clone(&self.progress)
    }

    /// Runs every distinct roster entity through the processor. Individual
    /// failures only move counters; this never errors.
    pub async fn scan(&self, roster: Vec<Entity>) -> ScanResult {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let (entities, duplicate_count) = dedupe_roster(roster);
        let roster_size = entities.len();
        if duplicate_count > 0 {
            debug!(duplicate_count, "dropped duplicate roster entries");
        }
        info!(
            %run_id,
            source_id = self.settings.source_id.as_str(),
            entities = roster_size,
            workers = self.pool.workers(),
            "scan started"
        );

        self.progress.reset(roster_size);
        let progress = Arc::clone(&self.progress);
        let processor = Arc::clone(&self.processor);
        let run = self
            .pool
            .run(
                entities,
                &self.cancel,
                move |entity: Entity| {
                    let processor = Arc::clone(&processor);
                    async move { processor.evaluate(&entity).await }
                },
                |entity, outcome| {
                    let processed = progress.record(outcome);
                    if let EntityOutcome::Candidate(candidate) = outcome {
                        info!(
                            entity_id = %entity.id,
                            name = entity.display_name.as_str(),
                            needed = candidate.amount_needed,
                            target = candidate.target_milestone,
                            "milestone candidate"
                        );
                    }
                    if processed % PROGRESS_EVERY == 0 {
                        info!(processed, total = roster_size, "scan progress");
                    }
                },
            )
            .await;

        let mut candidates = Vec::new();
        let mut suppressed_count = 0;
        let mut failure_count = run.panicked.len();
        for entity in &run.panicked {
            warn!(entity_id = %entity.id, "entity processing panicked, counted as failure");
        }
        let processed_count = run.completed.len() + run.panicked.len();
        for (_, outcome) in run.completed {
            match outcome {
                EntityOutcome::Candidate(candidate) => candidates.push(candidate),
                EntityOutcome::Suppressed => suppressed_count += 1,
                EntityOutcome::Failed(_) => failure_count += 1,
            }
        }
        rank_candidates(&mut candidates);

        let skipped_count = run.unscheduled.len();
        if skipped_count > 0 {
            warn!(skipped_count, "scan cancelled before every entity was processed");
        }

        let result = ScanResult {
            run_id,
            source_id: self.settings.source_id.clone(),
            stat_type: self.settings.stat_type.clone(),
            started_at,
            finished_at: Utc::now(),
            roster_size,
            duplicate_count,
            processed_count,
            failure_count,
            suppressed_count,
            skipped_count,
            candidates,
        };
        debug_assert!(result.is_fully_accounted());
        info!(
            %run_id,
            candidates = result.candidate_count(),
            failures = failure_count,
            skipped = skipped_count,
            "scan finished"
        );
        result
    }
}

#[derive(Debug, Clone)]
pub struct ScanRunSummary {
    pub result: ScanResult,
    pub report_path: PathBuf,
    pub report_sha256: String,
    pub report_bytes: usize,
}

/// Roster acquisition, scan and report write for one configured source.
pub struct ScanPipeline {
    config: ScanConfig,
    settings: ScanSettings,
    source: Arc<dyn StatsSource>,
    fetcher: FallbackFetcher,
    report_store: ReportStore,
    cancel: CancellationToken,
}

impl ScanPipeline {
    pub fn new(config: ScanConfig, registry: Option<&SourceRegistry>) -> Result<Self, ScanError> {
        let source: Arc<dyn StatsSource> = adapter_for_source(&config.source_id)
            .ok_or_else(|| ScanError::UnknownSource(config.source_id.clone()))?
            .into();
        let entry = registry.and_then(|r| r.get(source.source_id()));
        if entry.is_some_and(|e| !e.enabled) {
            return Err(ScanError::SourceDisabled(source.source_id().to_string()));
        }
        let settings = ScanSettings::resolve(&config, source.as_ref(), entry)?;
        let fetcher = FallbackFetcher::from_config(&config.fetcher_config(source.as_ref()))?;
        if !fetcher.proxy_enabled() {
            info!("no proxy credential configured, using the direct channel only");
        }
        Ok(Self {
            report_store: ReportStore::new(config.workspace_root.clone()),
            config,
            settings,
            source,
            fetcher,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_fetcher(mut self, fetcher: FallbackFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Cancelling stops scheduling new entities; in-flight ones finish and a
    /// partial report is still written.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn load_roster(&self) -> Result<Vec<Entity>, ScanError> {
        if let Some(path) = &self.config.roster_file {
            let path = self.config.workspace_root.join(path);
            return load_roster_file(&path).map_err(|err| ScanError::RosterUnavailable {
                source_id: self.settings.source_id.clone(),
                detail: format!("{err:#}"),
            });
        }
        Ok(self.source.fetch_roster(&self.fetcher).await?)
    }

    pub async fn run_once(&self) -> Result<ScanRunSummary, ScanError> {
        let budget = self.config.wall_clock_budget.map(|budget| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                warn!(budget_secs = budget.as_secs(), "wall-clock budget exhausted, cancelling scan");
                cancel.cancel();
            })
        });

        let outcome = self.scan_and_write().await;
        if let Some(timer) = budget {
            timer.abort();
        }
        outcome
    }

    async fn scan_and_write(&self) -> Result<ScanRunSummary, ScanError> {
        let roster = self.load_roster().await?;
        info!(
            source_id = self.settings.source_id.as_str(),
            roster = roster.len(),
            "roster loaded"
        );

        let processor =
            EntityProcessor::new(Arc::clone(&self.source), self.fetcher.clone(), &self.settings);
        let orchestrator = ScanOrchestrator::new(self.settings.clone(), processor)
            .with_cancellation(self.cancel.clone());
        let result = orchestrator.scan(roster).await;

        let stored = self
            .report_store
            .write_report(&self.settings.output_file, &result.candidates)
            .await?;
        info!(
            path = %stored.path.display(),
            bytes = stored.byte_size,
            candidates = result.candidate_count(),
            "report written"
        );

        Ok(ScanRunSummary {
            result,
            report_path: stored.path,
            report_sha256: stored.content_hash,
            report_bytes: stored.byte_size,
        })
    }
}

/// One known source as `scan` would run it under `config` and `registry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceListing {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub supported_stats: Vec<&'static str>,
    pub settings: ScanSettings,
}

pub fn list_sources(
    config: &ScanConfig,
    registry: Option<&SourceRegistry>,
) -> Result<Vec<SourceListing>, ScanError> {
    KNOWN_SOURCES
        .iter()
        .filter_map(|id| adapter_for_source(id))
        .map(|source| {
            let entry = registry.and_then(|r| r.get(source.source_id()));
            Ok(SourceListing {
                source_id: source.source_id().to_string(),
                display_name: source.display_name().to_string(),
                enabled: entry.map_or(true, |e| e.enabled),
                supported_stats: source.supported_stat_types(),
                settings: ScanSettings::resolve(config, source.as_ref(), entry)?,
            })
        })
        .collect()
}

pub async fn run_scan_once(config: ScanConfig) -> Result<ScanRunSummary, ScanError> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let pipeline = ScanPipeline::new(config, registry.as_ref())?;
    pipeline.run_once().await
}

pub async fn run_scan_once_from_env() -> Result<ScanRunSummary, ScanError> {
    run_scan_once(ScanConfig::from_env()).await
}
