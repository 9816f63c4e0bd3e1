//! Harvest pipeline orchestration: configuration, bounded fetch scheduling, artifact output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use harvest_adapters::{extract_rows, CatalogIndex, SitemapIndexer, SitemapSelection};
use harvest_core::{BatchWindow, FetchState, FetchTask, InMemorySeenStore, ProductUrl, SeenStore, VariantRow};
use harvest_storage::{
    digest_file, open_sink, FetchError, FtpConfig, FtpUploader, HttpClientConfig, HttpFetcher, LocalDirUploader,
    OutputFormat, PageSource, RowSink, SinkSummary, UploadTarget,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvestMode {
    #[default]
    Concurrent,
    Sequential,
}

impl FromStr for HarvestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concurrent" => Ok(HarvestMode::Concurrent),
            "sequential" => Ok(HarvestMode::Sequential),
            other => Err(format!("unknown harvest mode {other:?} (expected concurrent or sequential)")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UploadConfig {
    Ftp { ftp: FtpConfig, base_dir: String },
    LocalDir { root: PathBuf },
}

impl UploadConfig {
    pub fn handoff(&self) -> UploadHandoff {
        match self {
            UploadConfig::Ftp { ftp, base_dir } => {
                UploadHandoff::new(Box::new(FtpUploader::new(ftp.clone())), base_dir.clone())
            }
            UploadConfig::LocalDir { root } => {
                UploadHandoff::new(Box::new(LocalDirUploader::new(root.clone())), String::new())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub base_url: String,
    pub concurrency: usize,
    pub window: BatchWindow,
    pub mode: HarvestMode,
    pub ordered_output: bool,
    pub output_dir: PathBuf,
    pub output_format: OutputFormat,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub throttle: Duration,
    pub selection: SitemapSelection,
    pub upload: Option<UploadConfig>,
    pub scheduler_enabled: bool,
    pub cron: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup; `from_env` passes the process
    /// environment. Unparsable numbers fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = non_empty(lookup("HARVEST_BASE_URL"))
            .context("HARVEST_BASE_URL must be set to the storefront base URL")?
            .trim_end_matches('/')
            .to_string();

        let mode = non_empty(lookup("HARVEST_MODE"))
            .map(|v| v.parse::<HarvestMode>())
            .transpose()
            .map_err(|e| anyhow!("HARVEST_MODE: {e}"))?
            .unwrap_or_default();
        let output_format = non_empty(lookup("HARVEST_OUTPUT_FORMAT"))
            .map(|v| v.parse::<OutputFormat>())
            .transpose()
            .map_err(|e| anyhow!("HARVEST_OUTPUT_FORMAT: {e}"))?
            .unwrap_or_default();

        let ftp_host = non_empty(lookup("FTP_HOST"));
        let ftp_user = non_empty(lookup("FTP_USER"));
        let ftp_pass = lookup("FTP_PASS").filter(|v| !v.is_empty());
        let ftp_dir = non_empty(lookup("FTP_BASE_DIR"));
        let upload = match (ftp_host, ftp_user, ftp_pass, ftp_dir) {
            (Some(host), Some(user), Some(password), Some(base_dir)) => Some(UploadConfig::Ftp {
                ftp: FtpConfig {
                    host,
                    port: parse_or(lookup("FTP_PORT"), 21),
                    user,
                    password,
                },
                base_dir,
            }),
            _ => non_empty(lookup("HARVEST_UPLOAD_DIR")).map(|root| UploadConfig::LocalDir {
                root: PathBuf::from(root),
            }),
        };

        Ok(Self {
            base_url,
            concurrency: parse_or(lookup("HARVEST_CONCURRENCY"), 15usize).max(1),
            window: BatchWindow::new(
                parse_or(lookup("HARVEST_BATCH_START"), 0),
                parse_or(lookup("HARVEST_BATCH_SIZE"), 5000),
            ),
            mode,
            ordered_output: flag(lookup("HARVEST_ORDERED_OUTPUT")),
            output_dir: non_empty(lookup("HARVEST_OUTPUT_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output")),
            output_format,
            http_timeout: Duration::from_secs(parse_or(lookup("HARVEST_HTTP_TIMEOUT_SECS"), 30)),
            user_agent: non_empty(lookup("HARVEST_USER_AGENT"))
                .unwrap_or_else(|| "catalog-harvest/0.1".to_string()),
            throttle: Duration::from_millis(parse_or(lookup("HARVEST_THROTTLE_MS"), 150)),
            selection: SitemapSelection {
                offset: parse_or(lookup("HARVEST_SITEMAP_OFFSET"), 0),
                max_sitemaps: parse_or(lookup("HARVEST_MAX_SITEMAPS"), 0),
                max_urls_per_sitemap: parse_or(lookup("HARVEST_MAX_URLS_PER_SITEMAP"), 0),
                url_contains: non_empty(lookup("HARVEST_URL_CONTAINS")),
            },
            upload,
            scheduler_enabled: flag(lookup("HARVEST_SCHEDULER_ENABLED")),
            cron: non_empty(lookup("HARVEST_CRON")).unwrap_or_else(|| "0 0 */6 * * *".to_string()),
        })
    }
}

pub fn artifact_name(start: usize, format: OutputFormat) -> String {
    format!("products_chunk_{start}.{}", format.extension())
}

pub fn manifest_name(start: usize) -> String {
    format!("products_chunk_{start}.manifest.json")
}

#[derive(Debug)]
pub struct CompletedFetch {
    pub position: usize,
    pub url: ProductUrl,
    pub result: Result<Vec<u8>, FetchError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub admitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_in_flight: usize,
}

async fn fetch_with_timeout(source: &dyn PageSource, url: &str, after: Duration) -> Result<Vec<u8>, FetchError> {
    match tokio::time::timeout(after, source.fetch(url)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            url: url.to_string(),
            after,
        }),
    }
}

/// Sliding in-flight window over an ordered URL slice.
///
/// At most `concurrency` payload fetches run at once; each completion is passed to the
/// callback on the coordinating task and the next unadmitted URL takes its place. Fetch
/// failures are reported to the callback, never retried. A callback error aborts every
/// in-flight fetch and is returned.
#[derive(Debug, Clone, Copy)]
pub struct FetchScheduler {
    concurrency: usize,
    request_timeout: Duration,
}

impl FetchScheduler {
    pub fn new(concurrency: usize, request_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            request_timeout,
        }
    }

    pub async fn run<F>(
        &self,
        source: Arc<dyn PageSource>,
        urls: Vec<ProductUrl>,
        mut on_result: F,
    ) -> Result<SchedulerReport>
    where
        F: FnMut(CompletedFetch) -> Result<()>,
    {
        let mut tasks = urls
            .into_iter()
            .enumerate()
            .map(|(position, url)| FetchTask::new(position, url))
            .collect::<Vec<_>>();
        let mut in_flight: JoinSet<(usize, Result<Vec<u8>, FetchError>)> = JoinSet::new();
        let mut next = 0usize;
        let mut report = SchedulerReport::default();

        loop {
            while in_flight.len() < self.concurrency && next < tasks.len() {
                let task = &mut tasks[next];
                task.transition(FetchState::InFlight);
                let position = task.position;
                let payload_url = task.url.payload_url();
                let source = Arc::clone(&source);
                let after = self.request_timeout;
                debug!(position, url = %payload_url, "admitting payload fetch");
                in_flight.spawn(async move {
                    let result = fetch_with_timeout(source.as_ref(), &payload_url, after).await;
                    (position, result)
                });
                next += 1;
                report.admitted += 1;
                report.max_in_flight = report.max_in_flight.max(in_flight.len());
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (position, result) = joined.context("payload fetch task failed")?;

            let task = &mut tasks[position];
            if result.is_ok() {
                task.transition(FetchState::Completed);
                report.completed += 1;
            } else {
                task.transition(FetchState::Failed);
                report.failed += 1;
            }

            let completed = CompletedFetch {
                position,
                url: task.url.clone(),
                result,
            };
            if let Err(err) = on_result(completed) {
                in_flight.abort_all();
                return Err(err.context("result handler failed; in-flight fetches aborted"));
            }
        }

        Ok(report)
    }
}

/// Releases items in position order regardless of the order they arrive in.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `item` and returns every item now contiguous with the already-released prefix.
    pub fn push(&mut self, position: usize, item: T) -> Vec<T> {
        self.pending.insert(position, item);
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Remaining items in position order, gaps skipped.
    pub fn drain(self) -> Vec<T> {
        self.pending.into_values().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitStats {
    pub fetched: usize,
    pub fetch_failed: usize,
    pub parse_failed: usize,
    pub products: usize,
    pub rows: usize,
}

struct RowEmitter {
    sink: Box<dyn RowSink>,
    reorder: Option<ReorderBuffer<Vec<VariantRow>>>,
    stats: EmitStats,
    total: usize,
}

impl RowEmitter {
    fn new(sink: Box<dyn RowSink>, ordered: bool, total: usize) -> Self {
        Self {
            sink,
            reorder: ordered.then(ReorderBuffer::new),
            stats: EmitStats::default(),
            total,
        }
    }

    /// 1-based index of `position` and the batch size, for progress lines.
    fn progress(&self, position: usize) -> (usize, usize) {
        (position + 1, self.total)
    }

    fn handle(&mut self, done: CompletedFetch) -> Result<()> {
        let rows = match done.result {
            Ok(bytes) => {
                self.stats.fetched += 1;
                match extract_rows(&done.url, &bytes) {
                    Ok(rows) => {
                        self.stats.products += 1;
                        rows
                    }
                    Err(err) => {
                        self.stats.parse_failed += 1;
                        warn!(position = done.position, error = %err, "skipping product payload");
                        Vec::new()
                    }
                }
            }
            Err(err) => {
                self.stats.fetch_failed += 1;
                warn!(position = done.position, error = %err, "payload fetch failed");
                Vec::new()
            }
        };
        let (index, of) = self.progress(done.position);
        info!(product = index, of, url = %done.url, rows = rows.len(), "product processed");

        let ready = match self.reorder.as_mut() {
            Some(buffer) => buffer.push(done.position, rows),
            None => vec![rows],
        };
        for rows in ready {
            self.write_rows(&rows)?;
        }
        Ok(())
    }

    fn write_rows(&mut self, rows: &[VariantRow]) -> Result<()> {
        for row in rows {
            self.sink
                .write_row(row)
                .with_context(|| format!("writing row to {}", self.sink.path().display()))?;
            self.stats.rows += 1;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(SinkSummary, EmitStats)> {
        if let Some(buffer) = self.reorder.take() {
            for rows in buffer.drain() {
                self.write_rows(&rows)?;
            }
        }
        let summary = self.sink.close().context("closing artifact")?;
        Ok((summary, self.stats))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    Skipped,
    Uploaded { remote: String },
    Failed { error: String },
}

pub struct UploadHandoff {
    target: Box<dyn UploadTarget>,
    dir: String,
}

impl UploadHandoff {
    pub fn new(target: Box<dyn UploadTarget>, dir: impl Into<String>) -> Self {
        Self {
            target,
            dir: dir.into(),
        }
    }

    /// Best effort: failures are logged and reported, never propagated.
    pub async fn deliver(&self, artifact: &Path) -> UploadOutcome {
        info!(
            destination = %self.target.describe(),
            dir = %self.dir,
            artifact = %artifact.display(),
            "uploading artifact"
        );
        match self.target.upload(artifact, &self.dir).await {
            Ok(remote) => {
                info!(remote = %remote, "artifact uploaded");
                UploadOutcome::Uploaded { remote }
            }
            Err(err) => {
                warn!(error = %err, "artifact upload failed");
                UploadOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub catalog: CatalogIndex,
    pub window: BatchWindow,
    pub urls: Vec<ProductUrl>,
    pub duplicates_skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub base_url: String,
    pub window: BatchWindow,
    pub mode: HarvestMode,
    pub format: String,
    pub artifact: String,
    pub urls_selected: usize,
    pub duplicates_skipped: usize,
    pub stats: EmitStats,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sitemaps_listed: usize,
    pub sitemaps_visited: usize,
    pub sitemaps_failed: usize,
    pub urls_indexed: usize,
    pub urls_selected: usize,
    pub duplicates_skipped: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub parse_failed: usize,
    pub products: usize,
    pub rows: usize,
    pub max_in_flight: usize,
    pub artifact: String,
    pub manifest: String,
    pub upload: UploadOutcome,
}

pub struct HarvestPipeline {
    config: HarvestConfig,
    source: Arc<dyn PageSource>,
    upload: Option<UploadHandoff>,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::with_source(config, Arc::new(http)))
    }

    pub fn with_source(config: HarvestConfig, source: Arc<dyn PageSource>) -> Self {
        let upload = config.upload.as_ref().map(UploadConfig::handoff);
        Self {
            config,
            source,
            upload,
        }
    }

    pub fn with_upload(mut self, upload: UploadHandoff) -> Self {
        self.upload = Some(upload);
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Index the storefront, apply the batch window and drop URLs already in `seen`.
    pub async fn plan_batch(&self, seen: &mut dyn SeenStore) -> Result<BatchPlan> {
        let window = self.config.window;
        let indexer = SitemapIndexer::new(self.source.as_ref(), self.config.selection.clone());
        let catalog = indexer
            .index(&self.config.base_url, window.end())
            .await
            .with_context(|| format!("indexing storefront {}", self.config.base_url))?;

        let windowed = window.slice(&catalog.page_urls);
        let mut urls = Vec::with_capacity(windowed.len());
        let mut duplicates_skipped = 0usize;
        for page in &windowed {
            let url = ProductUrl::from_page_url(page);
            if seen.insert(url.base_url()) {
                urls.push(url);
            } else {
                duplicates_skipped += 1;
                debug!(url = %url, "duplicate product url skipped");
            }
        }

        info!(
            indexed = catalog.page_urls.len(),
            windowed = windowed.len(),
            selected = urls.len(),
            duplicates_skipped,
            "batch window applied"
        );
        Ok(BatchPlan {
            catalog,
            window,
            urls,
            duplicates_skipped,
        })
    }

    pub async fn run_once(&self) -> Result<HarvestRunSummary> {
        let mut seen = InMemorySeenStore::new();
        self.run_with(&mut seen).await
    }

    pub async fn run_with(&self, seen: &mut dyn SeenStore) -> Result<HarvestRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, seen)
            .instrument(info_span!("harvest_run", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid, seen: &mut dyn SeenStore) -> Result<HarvestRunSummary> {
        let started_at = Utc::now();
        let config = &self.config;
        info!(
            base_url = %config.base_url,
            start = config.window.start,
            size = config.window.size,
            concurrency = config.concurrency,
            mode = ?config.mode,
            "harvest run starting"
        );

        let BatchPlan {
            catalog,
            window,
            urls,
            duplicates_skipped,
        } = self.plan_batch(seen).await?;
        let urls_selected = urls.len();

        fs::create_dir_all(&config.output_dir)
            .await
            .with_context(|| format!("creating {}", config.output_dir.display()))?;
        let artifact_path = config
            .output_dir
            .join(artifact_name(window.start, config.output_format));
        let mut sink = open_sink(config.output_format, &artifact_path)
            .with_context(|| format!("opening {}", artifact_path.display()))?;
        sink.write_header().context("writing artifact header")?;
        let mut emitter = RowEmitter::new(sink, config.ordered_output, urls_selected);

        let report = match config.mode {
            HarvestMode::Concurrent => {
                FetchScheduler::new(config.concurrency, config.http_timeout)
                    .run(Arc::clone(&self.source), urls, |done| emitter.handle(done))
                    .await?
            }
            HarvestMode::Sequential => self.run_sequential(urls, &mut emitter).await?,
        };

        let (sink_summary, stats) = emitter.finish()?;
        let digest = digest_file(&sink_summary.path).await?;
        let finished_at = Utc::now();

        let manifest_path = config.output_dir.join(manifest_name(window.start));
        let manifest = ArtifactManifest {
            schema_version: 1,
            run_id,
            started_at,
            finished_at,
            base_url: config.base_url.clone(),
            window,
            mode: config.mode,
            format: config.output_format.extension().to_string(),
            artifact: artifact_name(window.start, config.output_format),
            urls_selected,
            duplicates_skipped,
            stats,
            bytes: digest.bytes,
            sha256: digest.sha256,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing artifact manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        let upload = match &self.upload {
            Some(handoff) => handoff.deliver(&sink_summary.path).await,
            None => {
                debug!("no upload target configured");
                UploadOutcome::Skipped
            }
        };

        let summary = HarvestRunSummary {
            run_id,
            started_at,
            finished_at,
            sitemaps_listed: catalog.sitemaps_listed,
            sitemaps_visited: catalog.sitemaps_visited,
            sitemaps_failed: catalog.sitemaps_failed,
            urls_indexed: catalog.page_urls.len(),
            urls_selected,
            duplicates_skipped,
            fetched: stats.fetched,
            fetch_failed: stats.fetch_failed,
            parse_failed: stats.parse_failed,
            products: stats.products,
            rows: stats.rows,
            max_in_flight: report.max_in_flight,
            artifact: sink_summary.path.display().to_string(),
            manifest: manifest_path.display().to_string(),
            upload,
        };
        info!(
            rows = summary.rows,
            products = summary.products,
            fetch_failed = summary.fetch_failed,
            parse_failed = summary.parse_failed,
            artifact = %summary.artifact,
            "harvest run finished"
        );
        Ok(summary)
    }

    async fn run_sequential(&self, urls: Vec<ProductUrl>, emitter: &mut RowEmitter) -> Result<SchedulerReport> {
        let mut report = SchedulerReport::default();
        for (position, url) in urls.into_iter().enumerate() {
            if position > 0 && !self.config.throttle.is_zero() {
                tokio::time::sleep(self.config.throttle).await;
            }

            let mut task = FetchTask::new(position, url);
            task.transition(FetchState::InFlight);
            report.admitted += 1;
            report.max_in_flight = 1;

            let result =
                fetch_with_timeout(self.source.as_ref(), &task.url.payload_url(), self.config.http_timeout).await;
            if result.is_ok() {
                task.transition(FetchState::Completed);
                report.completed += 1;
            } else {
                task.transition(FetchState::Failed);
                report.failed += 1;
            }
            emitter.handle(CompletedFetch {
                position,
                url: task.url,
                result,
            })?;
        }
        Ok(report)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        rows = summary.rows,
                        "scheduled harvest finished"
                    ),
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!(error = %message, "scheduled harvest failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "harvest scheduler configured");
        Ok(Some(sched))
    }
}

pub async fn run_harvest_once_from_env() -> Result<HarvestRunSummary> {
    let config = HarvestConfig::from_env()?;
    HarvestPipeline::new(config)?.run_once().await
}
