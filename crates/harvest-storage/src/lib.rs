//! HTTP fetch, row sinks and upload handoff for the catalog harvester.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, SchemaRef};
use async_trait::async_trait;
use harvest_core::{VariantRow, COLUMNS};
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "harvest-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {after:?} fetching {url}")]
    Timeout { url: String, after: Duration },
    #[error("empty response body from {url}")]
    EmptyBody { url: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Request { url, .. }
            | FetchError::HttpStatus { url, .. }
            | FetchError::Timeout { url, .. }
            | FetchError::EmptyBody { url } => url,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Single-attempt HTTP fetcher. Failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.send_once(url).instrument(span).await
    }

    async fn send_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| self.request_error(url, err))?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|err| self.request_error(url, err))?
            .to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    fn request_error(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                after: self.timeout,
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.fetch_bytes(url).await?;
        if response.body.is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }
        Ok(response.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "parquet" => Ok(OutputFormat::Parquet),
            other => Err(format!("unknown output format {other:?} (expected csv or parquet)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("header already written to {0}")]
    HeaderAlreadyWritten(PathBuf),
    #[error("row written before header to {0}")]
    HeaderMissing(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("arrow error on {path}: {source}")]
    Arrow {
        path: PathBuf,
        #[source]
        source: ArrowError,
    },
    #[error("parquet error on {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSummary {
    pub path: PathBuf,
    pub rows: usize,
}

/// Append-only destination for variant rows.
///
/// `write_header` must be called exactly once before the first `write_row`.
pub trait RowSink: Send {
    fn path(&self) -> &Path;
    fn write_header(&mut self) -> Result<(), SinkError>;
    fn write_row(&mut self, row: &VariantRow) -> Result<(), SinkError>;
    fn close(self: Box<Self>) -> Result<SinkSummary, SinkError>;
}

/// Create (or truncate) the artifact at `path` in the requested format.
pub fn open_sink(format: OutputFormat, path: impl Into<PathBuf>) -> Result<Box<dyn RowSink>, SinkError> {
    let path = path.into();
    let sink: Box<dyn RowSink> = match format {
        OutputFormat::Csv => Box::new(CsvRowSink::create(path)?),
        OutputFormat::Parquet => Box::new(ParquetRowSink::create(path)?),
    };
    Ok(sink)
}

fn create_file(path: &Path) -> Result<File, SinkError> {
    File::create(path).map_err(|source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub struct CsvRowSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    header_written: bool,
    rows: usize,
}

impl CsvRowSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = create_file(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        Ok(Self {
            path,
            writer,
            header_written: false,
            rows: 0,
        })
    }

    fn csv_error(&self, source: csv::Error) -> SinkError {
        SinkError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

impl RowSink for CsvRowSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self) -> Result<(), SinkError> {
        if self.header_written {
            return Err(SinkError::HeaderAlreadyWritten(self.path.clone()));
        }
        self.writer
            .write_record(COLUMNS)
            .map_err(|e| self.csv_error(e))?;
        self.header_written = true;
        Ok(())
    }

    fn write_row(&mut self, row: &VariantRow) -> Result<(), SinkError> {
        if !self.header_written {
            return Err(SinkError::HeaderMissing(self.path.clone()));
        }
        self.writer
            .write_record(row.fields())
            .map_err(|e| self.csv_error(e))?;
        self.rows += 1;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<SinkSummary, SinkError> {
        self.writer.flush().map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(SinkSummary {
            path: self.path,
            rows: self.rows,
        })
    }
}

pub const DEFAULT_PARQUET_BATCH_ROWS: usize = 1024;

pub fn variant_row_schema() -> SchemaRef {
    Arc::new(Schema::new(
        COLUMNS
            .iter()
            .map(|name| ArrowField::new(*name, DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ))
}

/// Parquet sink. The Arrow schema plays the role of the header; rows are flushed as
/// record batches of at most `batch_rows`.
pub struct ParquetRowSink {
    path: PathBuf,
    schema: SchemaRef,
    writer: ArrowWriter<File>,
    pending: Vec<VariantRow>,
    batch_rows: usize,
    header_written: bool,
    rows: usize,
}

impl ParquetRowSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        Self::with_batch_rows(path, DEFAULT_PARQUET_BATCH_ROWS)
    }

    pub fn with_batch_rows(path: impl Into<PathBuf>, batch_rows: usize) -> Result<Self, SinkError> {
        let path = path.into();
        let file = create_file(&path)?;
        let schema = variant_row_schema();
        let writer = ArrowWriter::try_new(file, schema.clone(), None).map_err(|source| {
            SinkError::Parquet {
                path: path.clone(),
                source,
            }
        })?;
        Ok(Self {
            path,
            schema,
            writer,
            pending: Vec::new(),
            batch_rows: batch_rows.max(1),
            header_written: false,
            rows: 0,
        })
    }

    fn flush_pending(&mut self) -> Result<(), SinkError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let columns = (0..COLUMNS.len())
            .map(|idx| {
                let values = self
                    .pending
                    .iter()
                    .map(|row| row.fields()[idx])
                    .collect::<Vec<&str>>();
                Arc::new(StringArray::from(values)) as ArrayRef
            })
            .collect::<Vec<_>>();
        let batch = RecordBatch::try_new(self.schema.clone(), columns).map_err(|source| {
            SinkError::Arrow {
                path: self.path.clone(),
                source,
            }
        })?;
        self.writer.write(&batch).map_err(|source| SinkError::Parquet {
            path: self.path.clone(),
            source,
        })?;
        self.pending.clear();
        Ok(())
    }
}

impl RowSink for ParquetRowSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self) -> Result<(), SinkError> {
        if self.header_written {
            return Err(SinkError::HeaderAlreadyWritten(self.path.clone()));
        }
        self.header_written = true;
        Ok(())
    }

    fn write_row(&mut self, row: &VariantRow) -> Result<(), SinkError> {
        if !self.header_written {
            return Err(SinkError::HeaderMissing(self.path.clone()));
        }
        self.pending.push(row.clone());
        self.rows += 1;
        if self.pending.len() >= self.batch_rows {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<SinkSummary, SinkError> {
        self.flush_pending()?;
        let ParquetRowSink {
            path, writer, rows, ..
        } = *self;
        writer.close().map_err(|source| SinkError::Parquet {
            path: path.clone(),
            source,
        })?;
        Ok(SinkSummary { path, rows })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub sha256: String,
    pub bytes: u64,
}

pub async fn digest_file(path: &Path) -> anyhow::Result<FileDigest> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(FileDigest {
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("ftp error: {0}")]
    Ftp(#[from] FtpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact {0} has no file name")]
    NoFileName(PathBuf),
    #[error("upload task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait UploadTarget: Send + Sync {
    fn describe(&self) -> String;

    async fn ensure_dir(&self, dir: &str) -> Result<(), UploadError>;

    /// Copy `local` into `dir` under its base name; returns the remote path.
    async fn put_file(&self, local: &Path, dir: &str) -> Result<String, UploadError>;

    async fn upload(&self, local: &Path, dir: &str) -> Result<String, UploadError> {
        self.ensure_dir(dir).await?;
        self.put_file(local, dir).await
    }
}

fn artifact_file_name(local: &Path) -> Result<String, UploadError> {
    local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| UploadError::NoFileName(local.to_path_buf()))
}

fn remote_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn path_segments(dir: &str) -> impl Iterator<Item = &str> {
    dir.split('/').filter(|s| !s.is_empty() && *s != ".")
}

#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Passive-mode, binary FTP transfer. One control connection per call.
#[derive(Debug, Clone)]
pub struct FtpUploader {
    config: FtpConfig,
}

impl FtpUploader {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    fn connect(config: &FtpConfig) -> Result<FtpStream, UploadError> {
        let mut stream = FtpStream::connect((config.host.as_str(), config.port))?;
        stream.login(config.user.as_str(), config.password.as_str())?;
        stream.set_mode(Mode::Passive);
        stream.transfer_type(FileType::Binary)?;
        Ok(stream)
    }

    fn enter_dir(stream: &mut FtpStream, dir: &str, create: bool) -> Result<(), UploadError> {
        if dir.starts_with('/') {
            stream.cwd("/")?;
        }
        for segment in path_segments(dir) {
            if stream.cwd(segment).is_err() {
                if !create {
                    return Err(UploadError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("remote directory {dir} does not exist"),
                    )));
                }
                stream.mkdir(segment)?;
                stream.cwd(segment)?;
            }
        }
        Ok(())
    }

    async fn session(
        &self,
        local: Option<PathBuf>,
        dir: String,
        create: bool,
    ) -> Result<Option<String>, UploadError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<String>, UploadError> {
            let mut stream = Self::connect(&config)?;
            Self::enter_dir(&mut stream, &dir, create)?;
            let remote = match local {
                Some(local) => {
                    let name = artifact_file_name(&local)?;
                    let mut file = File::open(&local)?;
                    let bytes = stream.put_file(name.as_str(), &mut file)?;
                    debug!(bytes, name = %name, "ftp transfer finished");
                    Some(remote_path(&dir, &name))
                }
                None => None,
            };
            if let Err(err) = stream.quit() {
                debug!(error = %err, "ftp quit failed after transfer");
            }
            Ok(remote)
        })
        .await?
    }
}

#[async_trait]
impl UploadTarget for FtpUploader {
    fn describe(&self) -> String {
        format!("ftp://{}@{}:{}", self.config.user, self.config.host, self.config.port)
    }

    async fn ensure_dir(&self, dir: &str) -> Result<(), UploadError> {
        self.session(None, dir.to_string(), true).await.map(|_| ())
    }

    async fn put_file(&self, local: &Path, dir: &str) -> Result<String, UploadError> {
        let remote = self
            .session(Some(local.to_path_buf()), dir.to_string(), false)
            .await?;
        remote.ok_or_else(|| UploadError::NoFileName(local.to_path_buf()))
    }

    async fn upload(&self, local: &Path, dir: &str) -> Result<String, UploadError> {
        let remote = self
            .session(Some(local.to_path_buf()), dir.to_string(), true)
            .await?;
        remote.ok_or_else(|| UploadError::NoFileName(local.to_path_buf()))
    }
}

#[derive(Debug, Clone)]
pub struct LocalDirUploader {
    root: PathBuf,
}

impl LocalDirUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, dir: &str) -> PathBuf {
        path_segments(dir).fold(self.root.clone(), |acc, seg| acc.join(seg))
    }
}

#[async_trait]
impl UploadTarget for LocalDirUploader {
    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }

    async fn ensure_dir(&self, dir: &str) -> Result<(), UploadError> {
        fs::create_dir_all(self.resolve(dir)).await?;
        Ok(())
    }

    async fn put_file(&self, local: &Path, dir: &str) -> Result<String, UploadError> {
        let name = artifact_file_name(local)?;
        let dest = self.resolve(dir).join(&name);
        let bytes = fs::copy(local, &dest).await?;
        info!(bytes, dest = %dest.display(), "artifact copied");
        Ok(dest.display().to_string())
    }
}
