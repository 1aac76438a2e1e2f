//! Persistence bridge: storage backends, serializers and the write-behind worker.
//!
//! The session never touches storage directly. It reads its notebook once at
//! startup through [`NotebookPersister::read_or_create`] and afterwards hands
//! snapshots to a [`PersistWorker`], which writes them in the background.
//! Write failures are reported on the flow bus and in the log; the in-memory
//! document is never rolled back.
//!
//! ```text
//! Session ──schedule(snapshot)──▶ watch ──▶ PersistWorker ──▶ Serializer ──▶ Storage
//!                                 (latest wins)
//! ```

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use quire_types::{ModelError, Notebook};

use crate::flows::{SessionFlow, SharedSessionFlowBus};

/// Persistence error type.
#[derive(Debug, Error)]
pub enum PersistError {
    /// No serializer is registered for the path's extension.
    #[error("unsupported notebook format: {0}")]
    UnsupportedFormat(String),

    /// Path escapes the storage root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse notebook: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("stored notebook is invalid: {0}")]
    Invalid(#[from] ModelError),

    /// Storage refused the write.
    #[error("storage write rejected: {0}")]
    WriteRejected(String),
}

/// Result type for persistence operations.
pub type PersistResult<T> = std::result::Result<T, PersistError>;

// ============================================================================
// Storage
// ============================================================================

/// Byte storage addressed by notebook path.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the stored bytes, or `None` if nothing is stored at `path`.
    async fn read(&self, path: &str) -> PersistResult<Option<Vec<u8>>>;

    /// Store `data` at `path`, replacing any previous content.
    async fn write(&self, path: &str, data: &[u8]) -> PersistResult<()>;

    /// The key this storage files `path` under.
    ///
    /// Spellings that address the same stored notebook canonicalize to the
    /// same string, so sessions can be keyed on the result.
    fn canonical(&self, path: &str) -> PersistResult<String> {
        normalize_path(path)
    }
}

/// Lexically normalize a notebook path.
///
/// A leading `/` and `.` components are dropped, repeated separators
/// collapse, and `..` is rejected. The result is `/`-joined and never empty.
pub fn normalize_path(path: &str) -> PersistResult<String> {
    let mut parts = Vec::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(PersistError::PathEscapesRoot(path.to_string()));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PersistError::InvalidPath(path.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(PersistError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// In-memory storage. All data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed content directly.
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.entries.write().insert(path.into(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.entries.read().get(path).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, path: &str) -> PersistResult<Option<Vec<u8>>> {
        let key = self.canonical(path)?;
        Ok(self.entries.read().get(&key).cloned())
    }

    async fn write(&self, path: &str, data: &[u8]) -> PersistResult<()> {
        let key = self.canonical(path)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistError::WriteRejected(key));
        }
        self.entries.write().insert(key, data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Local filesystem storage.
///
/// All paths are relative to `root`; a leading `/` is ignored and `..`
/// components are rejected. Writes go to a sibling temp file and are renamed
/// into place.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PersistResult<PathBuf> {
        let relative = self.canonical(path)?;
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn read(&self, path: &str) -> PersistResult<Option<Vec<u8>>> {
        let full = self.resolve(path)?;
        match fs::read(&full).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> PersistResult<()> {
        let full = self.resolve(path)?;
        let io_err = |source| PersistError::Io {
            path: path.to_string(),
            source,
        };

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut temp = full.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        fs::write(&temp, data).await.map_err(io_err)?;
        fs::rename(&temp, &full).await.map_err(io_err)?;
        Ok(())
    }
}

// ============================================================================
// Serializers
// ============================================================================

/// Converts notebooks to and from stored bytes.
pub trait NotebookSerializer: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, data: &[u8]) -> PersistResult<Notebook>;

    fn stringify(&self, notebook: &Notebook) -> PersistResult<Vec<u8>>;
}

/// The native format: pretty-printed JSON of the notebook model.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelSerializer;

impl NotebookSerializer for ModelSerializer {
    fn name(&self) -> &'static str {
        "model"
    }

    fn parse(&self, data: &[u8]) -> PersistResult<Notebook> {
        let notebook: Notebook = serde_json::from_slice(data)?;
        notebook.validate()?;
        Ok(notebook)
    }

    fn stringify(&self, notebook: &Notebook) -> PersistResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(notebook)?)
    }
}

/// Serializers selected by path extension.
#[derive(Clone)]
pub struct SerializerRegistry {
    by_extension: HashMap<String, Arc<dyn NotebookSerializer>>,
}

impl SerializerRegistry {
    /// A registry with no serializers.
    pub fn empty() -> Self {
        Self {
            by_extension: HashMap::new(),
        }
    }

    /// `.json` and `.qnb` both map to [`ModelSerializer`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let model: Arc<dyn NotebookSerializer> = Arc::new(ModelSerializer);
        registry.register("json", model.clone());
        registry.register("qnb", model);
        registry
    }

    pub fn register(&mut self, extension: &str, serializer: Arc<dyn NotebookSerializer>) {
        self.by_extension
            .insert(extension.to_ascii_lowercase(), serializer);
    }

    /// Pick the serializer for a notebook path.
    pub fn for_path(&self, path: &str) -> PersistResult<Arc<dyn NotebookSerializer>> {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| PersistError::UnsupportedFormat(path.to_string()))?;
        self.by_extension
            .get(&extension)
            .cloned()
            .ok_or(PersistError::UnsupportedFormat(extension))
    }

    pub fn supports(&self, path: &str) -> bool {
        self.for_path(path).is_ok()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut extensions: Vec<&String> = self.by_extension.keys().collect();
        extensions.sort();
        f.debug_struct("SerializerRegistry")
            .field("extensions", &extensions)
            .finish()
    }
}

// ============================================================================
// Persister
// ============================================================================

/// Storage plus serializer selection, shared by every session.
#[derive(Clone)]
pub struct Persistence {
    storage: Arc<dyn Storage>,
    registry: Arc<SerializerRegistry>,
}

impl Persistence {
    pub fn new(storage: Arc<dyn Storage>, registry: SerializerRegistry) -> Self {
        Self {
            storage,
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &SerializerRegistry {
        &self.registry
    }

    /// Canonical form of `path` for the configured storage.
    pub fn canonical(&self, path: &str) -> PersistResult<String> {
        self.storage.canonical(path)
    }

    /// Bind to one notebook path, stored in canonical form.
    pub fn persister(&self, path: &str) -> PersistResult<NotebookPersister> {
        let path = self.storage.canonical(path)?;
        Ok(NotebookPersister {
            serializer: self.registry.for_path(&path)?,
            path,
            storage: self.storage.clone(),
            registry: self.registry.clone(),
        })
    }

    /// Read the notebook at `path`, or build a fresh one if nothing is stored.
    pub async fn read_or_create(&self, path: &str, starter: bool) -> PersistResult<Notebook> {
        self.persister(path)?.read_or_create(starter).await
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// One notebook path with the serializer its extension selects.
#[derive(Clone)]
pub struct NotebookPersister {
    path: String,
    serializer: Arc<dyn NotebookSerializer>,
    storage: Arc<dyn Storage>,
    registry: Arc<SerializerRegistry>,
}

impl NotebookPersister {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn serializer_name(&self) -> &'static str {
        self.serializer.name()
    }

    /// Move to a new path, reselecting the serializer.
    ///
    /// The path is validated against the storage before anything changes; on
    /// error the persister keeps its old path. Returns the canonical new path.
    pub fn set_path(&mut self, path: &str) -> PersistResult<&str> {
        let path = self.storage.canonical(path)?;
        self.serializer = self.registry.for_path(&path)?;
        self.path = path;
        Ok(&self.path)
    }

    /// Read and parse, or create a starter (or empty) notebook if absent.
    pub async fn read_or_create(&self, starter: bool) -> PersistResult<Notebook> {
        tracing::debug!(path = %self.path, serializer = self.serializer.name(), "reading notebook");
        match self.storage.read(&self.path).await? {
            Some(data) => self.serializer.parse(&data),
            None => {
                tracing::info!(path = %self.path, starter, "notebook not found, creating");
                Ok(if starter {
                    Notebook::starter()
                } else {
                    Notebook::empty()
                })
            }
        }
    }

    pub async fn write(&self, notebook: &Notebook) -> PersistResult<()> {
        let data = self.serializer.stringify(notebook)?;
        self.storage.write(&self.path, &data).await
    }
}

// ============================================================================
// Write-behind worker
// ============================================================================

#[derive(Clone)]
struct PersistJob {
    persister: NotebookPersister,
    notebook: Notebook,
    version: u64,
}

/// Session-side handle that queues snapshots for writing.
///
/// Scheduling never blocks. Pending snapshots coalesce: only the latest one
/// is written. Dropping the handle lets the worker flush and exit.
pub struct PersistHandle {
    tx: watch::Sender<Option<PersistJob>>,
}

impl PersistHandle {
    /// Queue `notebook` to be written through `persister`.
    pub fn schedule(&self, persister: &NotebookPersister, notebook: Notebook, version: u64) {
        self.tx.send_replace(Some(PersistJob {
            persister: persister.clone(),
            notebook,
            version,
        }));
    }
}

/// Background task writing queued snapshots.
pub struct PersistWorker;

impl PersistWorker {
    /// Start the worker. Failures are published on `flows` under `notebook_path`
    /// of the job being written.
    pub fn spawn(flows: SharedSessionFlowBus) -> (PersistHandle, JoinHandle<()>) {
        let (tx, mut rx) = watch::channel::<Option<PersistJob>>(None);
        let task = tokio::spawn(async move {
            let mut written: Option<u64> = None;
            loop {
                let closed = rx.changed().await.is_err();
                let job = rx.borrow_and_update().clone();
                if let Some(job) = job {
                    if written != Some(job.version) {
                        write_job(&job, &flows).await;
                        written = Some(job.version);
                    }
                }
                if closed {
                    break;
                }
            }
        });
        (PersistHandle { tx }, task)
    }
}

async fn write_job(job: &PersistJob, flows: &SharedSessionFlowBus) {
    let path = job.persister.path();
    match job.persister.write(&job.notebook).await {
        Ok(()) => {
            tracing::debug!(path, version = job.version, "notebook saved");
        }
        Err(e) => {
            tracing::error!(path, version = job.version, error = %e, "failed to save notebook");
            flows.publish(SessionFlow::PersistFailed {
                notebook_path: path.to_string(),
                error: e.to_string(),
            });
        }
    }
}
