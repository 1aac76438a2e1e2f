//! Directory of live sessions, keyed by canonical notebook path.
//!
//! The first client to open a path starts its session (document read,
//! kernel spawned); later clients join the same one, whichever spelling of
//! the path they use. Creation is serialized per path, so a slow start on one
//! notebook does not hold up clients of another. Sessions follow
//! renames: the manager listens for [`SessionFlow::Renamed`] and moves the
//! entry to the new key.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use quire_types::{ConnectionId, Update};

use crate::connection::{ChannelConnection, ClientConnection};
use crate::flows::{SessionFlow, Subscription};
use crate::session::{SessionError, SessionHandle, SessionServices, spawn_session};

/// A client freshly attached to a session.
#[derive(Debug)]
pub struct Connected {
    pub session: SessionHandle,
    pub connection_id: ConnectionId,
    /// Updates for this client, starting with the snapshot.
    pub updates: mpsc::Receiver<Update>,
}

pub struct SessionManager {
    sessions: Arc<DashMap<String, SessionHandle>>,
    services: SessionServices,
    // One lock per path being started, so racing clients share the session.
    creating: DashMap<String, Arc<Mutex<()>>>,
    renames: JoinHandle<()>,
}

impl SessionManager {
    /// Build a manager. Must be called inside a tokio runtime.
    pub fn new(services: SessionServices) -> Self {
        let sessions = Arc::new(DashMap::new());
        let sub = services.flows.subscribe("session.renamed");
        let renames = tokio::spawn(follow_renames(sessions.clone(), sub));
        Self {
            sessions,
            services,
            creating: DashMap::new(),
            renames,
        }
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Paths with a live session.
    pub fn paths(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// The live session for `path`, if any.
    pub fn get(&self, path: &str) -> Option<SessionHandle> {
        let key = self.services.persistence.canonical(path).ok()?;
        self.live(&key)
    }

    fn live(&self, key: &str) -> Option<SessionHandle> {
        let handle = self.sessions.get(key).map(|e| e.value().clone())?;
        if handle.is_closed() {
            self.sessions.remove(key);
            return None;
        }
        Some(handle)
    }

    /// Return the session for `path`, starting it if needed.
    pub async fn open(&self, path: &str) -> Result<SessionHandle, SessionError> {
        let key = self.services.persistence.canonical(path)?;
        if let Some(handle) = self.live(&key) {
            return Ok(handle);
        }

        let lock = self.creating.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;
        if let Some(handle) = self.live(&key) {
            return Ok(handle);
        }
        let spawned = spawn_session(&key, &self.services).await;
        if let Ok(handle) = &spawned {
            self.sessions.insert(key.clone(), handle.clone());
            tracing::info!(path = %key, sessions = self.sessions.len(), "session registered");
        }
        // Leave the lock in place while other openers are queued on it.
        self.creating
            .remove_if(&key, |_, lock| Arc::strong_count(lock) <= 2);
        spawned
    }

    /// Open `path` and attach a new channel-backed client to it.
    pub async fn connect(&self, path: &str) -> Result<Connected, SessionError> {
        let session = self.open(path).await?;
        let label = session.path();
        let (conn, updates) = ChannelConnection::new(label, session.client_buffer());
        let connection_id = conn.id().clone();
        session.connect(Arc::new(conn)).await?;
        Ok(Connected {
            session,
            connection_id,
            updates,
        })
    }

    /// Stop every session, flushing pending writes.
    pub async fn shutdown_all(&self) {
        let paths = self.paths();
        tracing::info!(sessions = paths.len(), "shutting down sessions");
        for path in paths {
            if let Some((_, handle)) = self.sessions.remove(&path) {
                if let Err(e) = handle.shutdown().await {
                    tracing::debug!(path, error = %e, "session already stopped");
                }
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.renames.abort();
    }
}

async fn follow_renames(
    sessions: Arc<DashMap<String, SessionHandle>>,
    mut sub: Subscription<SessionFlow>,
) {
    while let Some(msg) = sub.recv().await {
        let SessionFlow::Renamed { from, to } = msg.payload else {
            continue;
        };
        let Some((_, handle)) = sessions.remove(&from) else {
            continue;
        };
        if let Some(previous) = sessions.insert(to.clone(), handle) {
            tracing::warn!(path = %to, replaced = %previous.id().short(), "rename replaced a live session");
        }
        tracing::debug!(%from, %to, "session re-keyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::shared_session_flow_bus;
    use crate::kernel::{EchoKernelFactory, Kernel, KernelEvent, KernelFactory, KernelResult};
    use crate::persist::{LocalStorage, MemoryStorage, Persistence, SerializerRegistry, Storage};
    use crate::session::SessionConfig;
    use async_trait::async_trait;
    use quire_types::{Action, SessionId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    fn services(storage: Arc<dyn Storage>, kernels: Arc<dyn KernelFactory>) -> SessionServices {
        SessionServices {
            persistence: Persistence::new(storage, SerializerRegistry::with_defaults()),
            kernels,
            flows: shared_session_flow_bus(64),
            config: SessionConfig::default(),
        }
    }

    fn manager() -> (SessionManager, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let services = services(storage.clone(), Arc::new(EchoKernelFactory));
        (SessionManager::new(services), storage)
    }

    /// Holds the first kernel start until released; later starts go through.
    struct GatedKernelFactory {
        starts: AtomicUsize,
        entered: Notify,
        gate: Semaphore,
    }

    impl GatedKernelFactory {
        fn new() -> Self {
            Self {
                starts: AtomicUsize::new(0),
                entered: Notify::new(),
                gate: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl KernelFactory for GatedKernelFactory {
        async fn spawn(
            &self,
            session: &SessionId,
            events: mpsc::Sender<KernelEvent>,
        ) -> KernelResult<Arc<dyn Kernel>> {
            if self.starts.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.gate.acquire().await.unwrap().forget();
            }
            EchoKernelFactory.spawn(session, events).await
        }
    }

    #[tokio::test]
    async fn test_clients_share_session_per_path() {
        let (manager, _) = manager();
        let a = manager.connect("a.json").await.unwrap();
        let b = manager.connect("a.json").await.unwrap();
        let c = manager.connect("c.json").await.unwrap();

        assert_eq!(a.session.id(), b.session.id());
        assert_ne!(a.session.id(), c.session.id());
        assert_ne!(a.connection_id, b.connection_id);
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_path_spellings_share_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()));
        let manager = SessionManager::new(services(storage, Arc::new(EchoKernelFactory)));

        let plain = manager.connect("demo.json").await.unwrap();
        for spelling in ["/demo.json", "./demo.json", "//./demo.json"] {
            let other = manager.connect(spelling).await.unwrap();
            assert_eq!(other.session.id(), plain.session.id(), "{spelling}");
        }
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.paths(), vec!["demo.json".to_string()]);
        assert_eq!(plain.session.path(), "demo.json");
        assert!(manager.get("/./demo.json").is_some());

        let err = manager.connect("../demo.json").await.unwrap_err();
        assert!(matches!(err, SessionError::Persist(_)));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_start_does_not_block_other_paths() {
        let kernels = Arc::new(GatedKernelFactory::new());
        let manager = Arc::new(SessionManager::new(services(
            Arc::new(MemoryStorage::new()),
            kernels.clone(),
        )));

        let entered = kernels.entered.notified();
        let slow = tokio::spawn({
            let manager = manager.clone();
            async move { manager.open("slow.json").await.map(|h| h.id().clone()) }
        });
        entered.await;

        let fast = tokio::time::timeout(Duration::from_secs(2), manager.open("fast.json"))
            .await
            .expect("fast path blocked behind slow start")
            .unwrap();
        assert_eq!(manager.paths(), vec!["fast.json".to_string()]);

        // A second opener of the slow path waits for and joins the first.
        let joiner = tokio::spawn({
            let manager = manager.clone();
            async move { manager.open("/slow.json").await.map(|h| h.id().clone()) }
        });
        kernels.gate.add_permits(1);
        let slow_id = slow.await.unwrap().unwrap();
        assert_eq!(joiner.await.unwrap().unwrap(), slow_id);
        assert_ne!(&slow_id, fast.id());
        assert_eq!(manager.len(), 2);
        assert_eq!(kernels.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsupported_path_fails_to_open() {
        let (manager, _) = manager();
        let err = manager.connect("legacy.ipynb").await.unwrap_err();
        assert!(matches!(err, SessionError::Persist(_)));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_rename_rekeys_session() {
        let (manager, _) = manager();
        let first = manager.connect("old.json").await.unwrap();
        first
            .session
            .submit(Action::Rename {
                path: "new.json".into(),
            })
            .await
            .unwrap();

        for _ in 0..100 {
            if manager.get("new.json").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let moved = manager.get("new.json").expect("session re-keyed");
        assert_eq!(moved.id(), first.session.id());
        assert_eq!(moved.path(), "new.json");
        assert!(manager.get("old.json").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_all_flushes() {
        let (manager, storage) = manager();
        let mut conn = manager.connect("keep.json").await.unwrap();
        let Some(Update::Snapshot { notebook }) = conn.updates.recv().await else {
            panic!("expected snapshot");
        };
        let ws = notebook.worksheet_ids()[0].clone();
        conn.session
            .submit(Action::AddCell {
                worksheet_id: ws,
                cell_id: "c1".into(),
                kind: quire_types::CellKind::Code,
                source: "1".into(),
                insert_after: quire_types::InsertPoint::Head,
            })
            .await
            .unwrap();

        manager.shutdown_all().await;
        assert!(manager.is_empty());
        assert!(storage.get("keep.json").is_some());
        assert!(conn.session.is_closed());
    }
}
