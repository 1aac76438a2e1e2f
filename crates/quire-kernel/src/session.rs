//! Session orchestrator: one notebook, its clients, its kernel.
//!
//! [`Session`] is the synchronous core. It owns the document, the correlation
//! table and the client set, and handles one input at a time: a client
//! action, a kernel event, or a deadline sweep. [`spawn_session`] wraps it in
//! an actor task so every input for a notebook is serialized through a single
//! command queue.
//!
//! ```text
//! client ─Action─▶ pipeline ─▶ NotebookDocument::apply ─Update─▶ every client
//!                                                         └─▶ PersistWorker
//! cell.execute ─▶ CorrelationTable::insert ─▶ Kernel::execute
//! kernel ─KernelEvent─▶ CorrelationTable::get ─▶ cell.update ─▶ apply ─▶ every client
//! ```
//!
//! Failed actions, filtered actions, correlation misses and dropped clients
//! are soft: logged, published on the flow bus, never propagated.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use quire_doc::{DocError, NotebookDocument};
use quire_types::{
    Action, CellId, CellOutput, CellRef, ConnectionId, Notebook, OutputKind, RequestId,
    SessionId, Update, UpdateCell, WorksheetId,
};

use crate::connection::ClientConnection;
use crate::constants::{
    DEFAULT_CLIENT_BUFFER, DEFAULT_MAX_SOURCE_BYTES, EXECUTION_TIMEOUT_ERROR, KERNEL_EVENT_BUFFER,
    KERNEL_STATE_STARTING, SESSION_COMMAND_BUFFER, SWEEP_INTERVAL,
};
use crate::correlation::{CorrelationConfig, CorrelationError, CorrelationTable, Expired};
use crate::flows::{SessionFlow, SharedSessionFlowBus};
use crate::kernel::{ExecuteReply, ExecuteRequest, Kernel, KernelError, KernelEvent, KernelFactory, OutputData};
use crate::persist::{NotebookPersister, PersistError, PersistHandle, PersistWorker, Persistence};
use crate::pipeline::{ActionPipeline, PipelineOutcome, SourceLimit};

/// Errors starting or talking to a session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// The session task has stopped.
    #[error("session is closed")]
    Closed,
}

/// Why a client action was not applied.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error(transparent)]
    Document(#[from] DocError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Lifecycle of a session. Sessions live until the process stops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    /// Reading or creating the document, starting the kernel.
    Initializing,
    /// Serving actions and kernel events.
    Active,
}

/// Per-session tunables.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub correlation: CorrelationConfig,
    pub client_buffer: usize,
    /// Seed missing notebooks with starter cells instead of leaving them empty.
    pub starter_notebook: bool,
    pub max_source_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            correlation: CorrelationConfig::default(),
            client_buffer: DEFAULT_CLIENT_BUFFER,
            starter_notebook: true,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
        }
    }
}

impl SessionConfig {
    /// The pipeline every session runs actions through.
    pub fn pipeline(&self) -> ActionPipeline {
        ActionPipeline::new().with(SourceLimit::new(self.max_source_bytes))
    }
}

/// Collaborators a [`Session`] is built from.
pub struct SessionParts {
    pub id: SessionId,
    pub persister: NotebookPersister,
    pub persist: PersistHandle,
    pub kernel: Arc<dyn Kernel>,
    pub pipeline: ActionPipeline,
    pub flows: SharedSessionFlowBus,
    pub correlation: CorrelationConfig,
}

// ============================================================================
// Session core
// ============================================================================

/// The orchestrator for one notebook.
pub struct Session {
    id: SessionId,
    persister: NotebookPersister,
    persist: PersistHandle,
    persist_seq: u64,
    document: NotebookDocument,
    correlation: CorrelationTable,
    kernel: Arc<dyn Kernel>,
    kernel_state: String,
    clients: Vec<Arc<dyn ClientConnection>>,
    pipeline: ActionPipeline,
    flows: SharedSessionFlowBus,
}

impl Session {
    pub fn new(notebook: Notebook, parts: SessionParts) -> Self {
        Self {
            id: parts.id,
            persister: parts.persister,
            persist: parts.persist,
            persist_seq: 0,
            document: NotebookDocument::new(notebook),
            correlation: CorrelationTable::new(parts.correlation),
            kernel: parts.kernel,
            kernel_state: KERNEL_STATE_STARTING.to_string(),
            clients: Vec::new(),
            pipeline: parts.pipeline,
            flows: parts.flows,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current storage path of the notebook.
    pub fn path(&self) -> &str {
        self.persister.path()
    }

    pub fn document(&self) -> &NotebookDocument {
        &self.document
    }

    pub fn correlation(&self) -> &CorrelationTable {
        &self.correlation
    }

    pub fn kernel_state(&self) -> &str {
        &self.kernel_state
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // ------------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------------

    /// Register a client and send it the full notebook and kernel state.
    pub fn connect(&mut self, client: Arc<dyn ClientConnection>) {
        tracing::info!(
            path = %self.path(),
            connection = %client.id().short(),
            clients = self.clients.len() + 1,
            "client connected"
        );
        let greeting = [
            Update::snapshot(self.document.snapshot()),
            self.session_status(),
        ];
        for update in greeting {
            if let Err(e) = client.send_update(update) {
                self.report_dropped(client.id(), &e.to_string());
                return;
            }
        }
        self.clients.push(client);
    }

    /// Forget a client. The document and kernel stay alive.
    pub fn disconnect(&mut self, connection_id: &ConnectionId) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| c.id() != connection_id);
        let removed = self.clients.len() != before;
        if removed {
            tracing::info!(
                path = %self.path(),
                connection = %connection_id.short(),
                clients = self.clients.len(),
                "client disconnected"
            );
        }
        removed
    }

    /// Send one update to every client, dropping those whose send fails.
    fn broadcast(&mut self, update: &Update) {
        let mut dropped = Vec::new();
        for client in &self.clients {
            if let Err(e) = client.send_update(update.clone()) {
                dropped.push((client.id().clone(), e.to_string()));
            }
        }
        for (connection_id, reason) in dropped {
            self.clients.retain(|c| c.id() != &connection_id);
            self.report_dropped(&connection_id, &reason);
        }
    }

    fn report_dropped(&self, connection_id: &ConnectionId, reason: &str) {
        tracing::warn!(
            path = %self.path(),
            connection = %connection_id.short(),
            reason,
            "dropping client"
        );
        self.flows.publish(SessionFlow::ClientDropped {
            notebook_path: self.path().to_string(),
            connection_id: connection_id.clone(),
            reason: reason.to_string(),
        });
    }

    fn session_status(&self) -> Update {
        Update::SessionStatus {
            kernel_state: self.kernel_state.clone(),
            kernel_name: Some(self.kernel.name().to_string()),
        }
    }

    // ------------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------------

    /// Run a client action through the pipeline and apply it.
    ///
    /// Returns the updates that were broadcast, in order. A failed or
    /// filtered action broadcasts nothing.
    pub fn handle_action(&mut self, action: Action, now: Instant) -> Vec<Update> {
        let kind = action.kind();
        match self.pipeline.run(action) {
            PipelineOutcome::Accepted(action) => {
                let mut sent = Vec::new();
                if let Err(e) = self.process(action, now, &mut sent) {
                    self.report_failure(kind, &e);
                }
                sent
            }
            PipelineOutcome::Filtered { processor, reason } => {
                tracing::warn!(path = %self.path(), action = kind, %processor, %reason, "action filtered");
                self.flows.publish(SessionFlow::ActionFiltered {
                    notebook_path: self.path().to_string(),
                    action: kind.to_string(),
                    processor,
                    reason,
                });
                Vec::new()
            }
        }
    }

    fn report_failure(&self, action: &str, error: &ActionError) {
        tracing::warn!(path = %self.path(), action, error = %error, "action failed");
        self.flows.publish(SessionFlow::ActionFailed {
            notebook_path: self.path().to_string(),
            action: action.to_string(),
            error: error.to_string(),
        });
    }

    fn process(
        &mut self,
        action: Action,
        now: Instant,
        sent: &mut Vec<Update>,
    ) -> Result<(), ActionError> {
        match action {
            Action::Composite { sub_actions } => {
                for sub in sub_actions {
                    self.process(sub, now, sent)?;
                }
                Ok(())
            }
            Action::ExecuteCell {
                worksheet_id,
                cell_id,
            } => self.execute_cell(&worksheet_id, &cell_id, now, sent),
            Action::ExecuteCells => {
                let cells: Vec<(WorksheetId, CellId)> = self
                    .document
                    .code_cells()
                    .map(|(ws, cell)| (ws.clone(), cell.id.clone()))
                    .collect();
                for (worksheet_id, cell_id) in cells {
                    // One cell failing to dispatch does not stop the rest.
                    if let Err(e) = self.execute_cell(&worksheet_id, &cell_id, now, sent) {
                        self.report_failure("cell.execute", &e);
                    }
                }
                Ok(())
            }
            Action::Rename { path } => self.rename(&path, sent),
            edit => self.apply(&edit, sent),
        }
    }

    /// Apply a document edit, broadcast and persist it.
    fn apply(&mut self, action: &Action, sent: &mut Vec<Update>) -> Result<(), ActionError> {
        let update = self.document.apply(action)?;
        self.broadcast(&update);
        if update.is_mutation() {
            self.schedule_persist();
        }
        sent.push(update);
        Ok(())
    }

    fn schedule_persist(&mut self) {
        self.persist_seq += 1;
        self.persist
            .schedule(&self.persister, self.document.snapshot(), self.persist_seq);
    }

    fn execute_cell(
        &mut self,
        worksheet_id: &WorksheetId,
        cell_id: &CellId,
        now: Instant,
        sent: &mut Vec<Update>,
    ) -> Result<(), ActionError> {
        let cell = self.document.cell(cell_id, worksheet_id)?;
        if !cell.is_code() {
            tracing::warn!(path = %self.path(), cell = %cell_id, kind = %cell.kind, "ignoring execute on non-code cell");
            return Ok(());
        }
        let source = cell.source.clone();

        self.apply(
            &Action::ClearOutput {
                worksheet_id: worksheet_id.clone(),
                cell_id: cell_id.clone(),
            },
            sent,
        )?;

        let request_id = RequestId::new();
        let cell_ref = CellRef::new(cell_id.clone(), worksheet_id.clone());
        if let Some(evicted) = self.correlation.insert(request_id.clone(), cell_ref, now)? {
            if evicted.in_flight {
                self.abandon(evicted, sent);
            }
        }

        tracing::debug!(path = %self.path(), request = %request_id.short(), cell = %cell_id, "dispatching execution");
        let request = ExecuteRequest {
            request_id: request_id.clone(),
            cell_id: cell_id.clone(),
            code: source,
        };
        if let Err(e) = self.kernel.execute(request) {
            tracing::warn!(path = %self.path(), request = %request_id.short(), error = %e, "kernel refused execution");
            let reply = ExecuteReply::error(request_id, "KernelError", e.to_string());
            self.on_execute_reply(reply, now, sent);
            return Err(e.into());
        }
        Ok(())
    }

    fn rename(&mut self, path: &str, sent: &mut Vec<Update>) -> Result<(), ActionError> {
        let from = self.path().to_string();
        let to = self.persister.set_path(path)?.to_string();

        tracing::info!(from = %from, to = %to, "notebook renamed");
        let update = Update::NotebookMetadata { path: to.clone() };
        self.broadcast(&update);
        sent.push(update);
        self.schedule_persist();
        self.flows.publish(SessionFlow::Renamed { from, to });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Kernel events
    // ------------------------------------------------------------------------

    /// Route one kernel event. Returns the updates that were broadcast.
    pub fn on_kernel_event(&mut self, event: KernelEvent, now: Instant) -> Vec<Update> {
        let mut sent = Vec::new();
        match event {
            KernelEvent::ExecuteReply(reply) => self.on_execute_reply(reply, now, &mut sent),
            KernelEvent::OutputData(output) => self.on_output(output, &mut sent),
            KernelEvent::KernelStatus { status } => {
                tracing::debug!(path = %self.path(), %status, "kernel status");
                self.kernel_state = status;
                let update = self.session_status();
                self.broadcast(&update);
                sent.push(update);
            }
        }
        sent
    }

    fn lookup(&self, request_id: &RequestId, event: &str) -> Option<CellRef> {
        let found = self.correlation.get(request_id).cloned();
        if found.is_none() {
            self.correlation_miss(request_id, event);
        }
        found
    }

    fn correlation_miss(&self, request_id: &RequestId, event: &str) {
        tracing::debug!(path = %self.path(), request = %request_id.short(), event, "correlation miss, dropping event");
        self.flows.publish(SessionFlow::CorrelationMiss {
            notebook_path: self.path().to_string(),
            request_id: request_id.clone(),
            event: event.to_string(),
        });
    }

    fn on_execute_reply(&mut self, reply: ExecuteReply, now: Instant, sent: &mut Vec<Update>) {
        let Some(cell) = self.lookup(&reply.request_id, "executeReply") else {
            return;
        };
        // Only the first reply for a request counts.
        if !self.correlation.complete(&reply.request_id, now) {
            self.correlation_miss(&reply.request_id, "executeReply");
            return;
        }
        self.apply_reply(&cell, &reply, sent);
    }

    fn apply_reply(&mut self, cell: &CellRef, reply: &ExecuteReply, sent: &mut Vec<Update>) {
        let mut edit = UpdateCell::new(cell.worksheet_id.clone(), cell.cell_id.clone());
        if let Some(counter) = reply.execution_counter {
            edit = edit.with_prompt(counter.to_string());
        }
        if !reply.success {
            edit = edit.append_outputs(vec![CellOutput::plain_text(
                OutputKind::Error,
                reply.error_text(),
            )]);
        }
        if edit.prompt.is_none() && edit.outputs.is_none() {
            return;
        }
        self.route_to_cell(&reply.request_id, edit, "executeReply", sent);
    }

    fn on_output(&mut self, output: OutputData, sent: &mut Vec<Update>) {
        let Some(cell) = self.lookup(&output.request_id, "outputData") else {
            return;
        };
        let edit = UpdateCell::new(cell.worksheet_id, cell.cell_id).append_outputs(vec![
            CellOutput::new(output.kind, output.mimetype_bundle),
        ]);
        self.route_to_cell(&output.request_id, edit, "outputData", sent);
    }

    /// Apply a kernel-originated cell edit. If the cell has gone away the
    /// request is forgotten so later events for it miss cleanly.
    fn route_to_cell(
        &mut self,
        request_id: &RequestId,
        edit: UpdateCell,
        event: &str,
        sent: &mut Vec<Update>,
    ) {
        if let Err(e) = self.apply(&edit.into(), sent) {
            tracing::debug!(path = %self.path(), request = %request_id.short(), event, error = %e, "target cell gone, forgetting request");
            self.correlation.remove(request_id);
        }
    }

    // ------------------------------------------------------------------------
    // Deadlines
    // ------------------------------------------------------------------------

    /// Abandon executions whose deadline has passed.
    ///
    /// Each one gets a synthesized failure reply so its cell shows the timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<Update> {
        let mut sent = Vec::new();
        for expired in self.correlation.expire(now) {
            self.abandon(expired, &mut sent);
        }
        sent
    }

    fn abandon(&mut self, expired: Expired, sent: &mut Vec<Update>) {
        let timeout = self.correlation.config().execution_timeout;
        tracing::warn!(
            path = %self.path(),
            request = %expired.request.short(),
            cell = %expired.cell,
            timeout_secs = timeout.as_secs(),
            "execution abandoned"
        );
        self.flows.publish(SessionFlow::ExecutionExpired {
            notebook_path: self.path().to_string(),
            request_id: expired.request.clone(),
            cell: expired.cell.clone(),
        });
        let reply = ExecuteReply::error(
            expired.request,
            EXECUTION_TIMEOUT_ERROR,
            format!("no reply within {}s", timeout.as_secs()),
        );
        self.apply_reply(&expired.cell, &reply, sent);
    }

    /// Stop the kernel and hand back the persist handle so it can be flushed.
    async fn shutdown(self) -> PersistHandle {
        tracing::info!(path = %self.path(), "session shutting down");
        self.kernel.shutdown().await;
        self.persist
    }
}

// ============================================================================
// Actor
// ============================================================================

enum SessionCommand {
    Connect(Arc<dyn ClientConnection>),
    Disconnect(ConnectionId),
    Action(Action),
    Snapshot(oneshot::Sender<Notebook>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    path: watch::Receiver<String>,
    client_buffer: usize,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Current notebook path (follows renames).
    pub fn path(&self) -> String {
        self.path.borrow().clone()
    }

    /// Outbound buffer size clients of this session should use.
    pub fn client_buffer(&self) -> usize {
        self.client_buffer
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn connect(&self, client: Arc<dyn ClientConnection>) -> Result<(), SessionError> {
        self.send(SessionCommand::Connect(client)).await
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect(connection_id)).await
    }

    /// Queue an action. Results arrive as updates on connected clients.
    pub async fn submit(&self, action: Action) -> Result<(), SessionError> {
        self.send(SessionCommand::Action(action)).await
    }

    pub async fn snapshot(&self) -> Result<Notebook, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Stop the session, flushing pending writes.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("path", &*self.path.borrow())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// Shared collaborators for starting sessions.
#[derive(Clone)]
pub struct SessionServices {
    pub persistence: Persistence,
    pub kernels: Arc<dyn KernelFactory>,
    pub flows: SharedSessionFlowBus,
    pub config: SessionConfig,
}

/// Read or create the notebook at `path`, start its kernel, and run the
/// session actor. Returns once the session is active.
pub async fn spawn_session(
    path: &str,
    services: &SessionServices,
) -> Result<SessionHandle, SessionError> {
    let id = SessionId::new();
    let (state_tx, state_rx) = watch::channel(SessionState::Initializing);
    tracing::info!(session = %id.short(), path, state = %SessionState::Initializing, "starting session");

    let persister = services.persistence.persister(path)?;
    let path = persister.path().to_string();
    let notebook = persister
        .read_or_create(services.config.starter_notebook)
        .await?;

    let (events_tx, events_rx) = mpsc::channel(KERNEL_EVENT_BUFFER);
    let kernel = services.kernels.spawn(&id, events_tx).await?;

    let (persist, persist_task) = PersistWorker::spawn(services.flows.clone());
    let session = Session::new(
        notebook,
        SessionParts {
            id: id.clone(),
            persister,
            persist,
            kernel,
            pipeline: services.config.pipeline(),
            flows: services.flows.clone(),
            correlation: services.config.correlation,
        },
    );

    let (tx, rx) = mpsc::channel(SESSION_COMMAND_BUFFER);
    let (path_tx, path_rx) = watch::channel(path.clone());
    state_tx.send_replace(SessionState::Active);
    tracing::info!(session = %id.short(), %path, state = %SessionState::Active, "session active");

    tokio::spawn(run_session(session, rx, events_rx, path_tx, persist_task));

    Ok(SessionHandle {
        id,
        tx,
        state: state_rx,
        path: path_rx,
        client_buffer: services.config.client_buffer,
    })
}

async fn run_session(
    mut session: Session,
    mut commands: mpsc::Receiver<SessionCommand>,
    mut events: mpsc::Receiver<KernelEvent>,
    path_tx: watch::Sender<String>,
    persist_task: JoinHandle<()>,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;
    let mut shutdown_reply = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    SessionCommand::Connect(client) => session.connect(client),
                    SessionCommand::Disconnect(id) => {
                        session.disconnect(&id);
                    }
                    SessionCommand::Action(action) => {
                        session.handle_action(action, Instant::now());
                        if *path_tx.borrow() != session.path() {
                            path_tx.send_replace(session.path().to_string());
                        }
                    }
                    SessionCommand::Snapshot(reply) => {
                        let _ = reply.send(session.document().snapshot());
                    }
                    SessionCommand::Shutdown(reply) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                }
            }
            event = events.recv(), if events_open => {
                match event {
                    Some(event) => {
                        session.on_kernel_event(event, Instant::now());
                    }
                    None => events_open = false,
                }
            }
            _ = sweep.tick() => {
                session.sweep(Instant::now());
            }
        }
    }

    drop(commands);
    let persist = session.shutdown().await;
    drop(persist);
    if let Err(e) = persist_task.await {
        tracing::error!(error = %e, "persist worker panicked");
    }
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;
    use crate::flows::shared_session_flow_bus;
    use crate::kernel::{EchoKernelFactory, KernelResult};
    use crate::persist::{MemoryStorage, ModelSerializer, NotebookSerializer, SerializerRegistry};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use quire_types::{CellKind, InsertPoint, MimetypeBundle};
    use std::time::Duration;

    /// Kernel that records requests and never replies on its own.
    #[derive(Default)]
    struct RecordingKernel {
        requests: Mutex<Vec<ExecuteRequest>>,
        refuse: Mutex<bool>,
    }

    #[async_trait]
    impl Kernel for RecordingKernel {
        fn name(&self) -> &str {
            "recording"
        }

        fn execute(&self, request: ExecuteRequest) -> KernelResult<()> {
            if *self.refuse.lock() {
                return Err(KernelError::Dead);
            }
            self.requests.lock().push(request);
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    struct Fixture {
        session: Session,
        kernel: Arc<RecordingKernel>,
        storage: Arc<MemoryStorage>,
        flows: SharedSessionFlowBus,
        ws: WorksheetId,
    }

    fn fixture_with(correlation: CorrelationConfig) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let persistence = Persistence::new(storage.clone(), SerializerRegistry::with_defaults());
        let flows = shared_session_flow_bus(64);
        let kernel = Arc::new(RecordingKernel::default());
        let (persist, _task) = PersistWorker::spawn(flows.clone());
        let notebook = Notebook::empty();
        let ws = notebook.worksheet_ids()[0].clone();
        let session = Session::new(
            notebook,
            SessionParts {
                id: SessionId::new(),
                persister: persistence.persister("nb.json").unwrap(),
                persist,
                kernel: kernel.clone(),
                pipeline: SessionConfig::default().pipeline(),
                flows: flows.clone(),
                correlation,
            },
        );
        Fixture {
            session,
            kernel,
            storage,
            flows,
            ws,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CorrelationConfig::default())
    }

    fn client(f: &mut Fixture) -> mpsc::Receiver<Update> {
        let (conn, mut rx) = ChannelConnection::new("nb.json", 64);
        f.session.connect(Arc::new(conn));
        // Drain the greeting.
        assert!(matches!(rx.try_recv(), Ok(Update::Snapshot { .. })));
        assert!(matches!(rx.try_recv(), Ok(Update::SessionStatus { .. })));
        rx
    }

    fn add_code(f: &mut Fixture, id: &str, source: &str) {
        let sent = f.session.handle_action(
            Action::AddCell {
                worksheet_id: f.ws.clone(),
                cell_id: id.into(),
                kind: CellKind::Code,
                source: source.into(),
                insert_after: InsertPoint::Head,
            },
            Instant::now(),
        );
        assert_eq!(sent.len(), 1);
    }

    fn execute(f: &Fixture, id: &str) -> Action {
        Action::ExecuteCell {
            worksheet_id: f.ws.clone(),
            cell_id: id.into(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Update>) -> Vec<Update> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    #[tokio::test]
    async fn test_connect_sends_snapshot_then_status() {
        let mut f = fixture();
        let (conn, mut rx) = ChannelConnection::new("nb.json", 8);
        f.session.connect(Arc::new(conn));

        let Ok(Update::Snapshot { notebook }) = rx.try_recv() else {
            panic!("expected snapshot first");
        };
        assert_eq!(&notebook, f.session.document().notebook());
        let Ok(Update::SessionStatus { kernel_state, kernel_name }) = rx.try_recv() else {
            panic!("expected session status");
        };
        assert_eq!(kernel_state, KERNEL_STATE_STARTING);
        assert_eq!(kernel_name.as_deref(), Some("recording"));
        assert_eq!(f.session.client_count(), 1);
    }

    #[tokio::test]
    async fn test_updates_reach_every_client_including_author() {
        let mut f = fixture();
        let mut a = client(&mut f);
        let mut b = client(&mut f);

        add_code(&mut f, "c1", "1+1");

        for rx in [&mut a, &mut b] {
            let updates = drain(rx);
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].kind(), "worksheet.addCell");
        }
    }

    #[tokio::test]
    async fn test_failed_action_broadcasts_nothing() {
        let mut f = fixture();
        let mut rx = client(&mut f);
        let mut failures = f.flows.subscribe("session.action_failed");

        let sent = f.session.handle_action(
            Action::DeleteCell {
                worksheet_id: f.ws.clone(),
                cell_id: "ghost".into(),
            },
            Instant::now(),
        );
        assert!(sent.is_empty());
        assert!(drain(&mut rx).is_empty());
        assert!(failures.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_execute_reply_sets_prompt() {
        let mut f = fixture();
        add_code(&mut f, "c1", "2+2");
        let mut rx = client(&mut f);
        let now = Instant::now();

        let sent = f.session.handle_action(execute(&f, "c1"), now);
        // Outputs are cleared before dispatch.
        assert_eq!(sent.len(), 1);
        let request = f.kernel.requests.lock()[0].clone();
        assert_eq!(request.code, "2+2");
        assert_eq!(request.cell_id, "c1");
        assert_eq!(
            f.session.correlation().get(&request.request_id),
            Some(&CellRef::new("c1".into(), f.ws.clone()))
        );

        let sent = f.session.on_kernel_event(
            KernelEvent::ExecuteReply(ExecuteReply::ok(request.request_id.clone(), 1)),
            now,
        );
        assert_eq!(sent.len(), 1);
        let Update::CellUpdate(delta) = &sent[0] else {
            panic!("expected cell.update");
        };
        assert_eq!(delta.prompt.as_deref(), Some("1"));
        assert!(delta.outputs.is_none());

        let cell = f.session.document().cell(&"c1".into(), &f.ws).unwrap();
        assert_eq!(cell.prompt.as_deref(), Some("1"));
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_error_reply_appends_error_output() {
        let mut f = fixture();
        add_code(&mut f, "c1", "x");
        let now = Instant::now();
        f.session.handle_action(execute(&f, "c1"), now);
        let request_id = f.kernel.requests.lock()[0].request_id.clone();

        let mut bundle = MimetypeBundle::new();
        bundle.insert("text/plain".into(), "partial".into());
        f.session.on_kernel_event(
            KernelEvent::OutputData(OutputData {
                request_id: request_id.clone(),
                kind: OutputKind::Stdout,
                mimetype_bundle: bundle,
            }),
            now,
        );
        let reply = ExecuteReply {
            execution_counter: Some(2),
            ..ExecuteReply::error(request_id, "NameError", "name 'x' is not defined")
        };
        f.session.on_kernel_event(KernelEvent::ExecuteReply(reply), now);

        let cell = f.session.document().cell(&"c1".into(), &f.ws).unwrap();
        assert_eq!(cell.prompt.as_deref(), Some("2"));
        assert_eq!(cell.outputs.len(), 2);
        assert_eq!(cell.outputs[0].text(), Some("partial"));
        assert_eq!(cell.outputs[1].kind, OutputKind::Error);
        assert_eq!(cell.outputs[1].text(), Some("NameError: name 'x' is not defined"));
    }

    #[tokio::test]
    async fn test_unknown_request_is_dropped() {
        let mut f = fixture();
        add_code(&mut f, "c1", "1");
        let mut rx = client(&mut f);
        let mut misses = f.flows.subscribe("session.correlation_miss");
        let before = f.session.document().snapshot();

        let sent = f.session.on_kernel_event(
            KernelEvent::ExecuteReply(ExecuteReply::ok("never-seen".into(), 1)),
            Instant::now(),
        );
        assert!(sent.is_empty());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(f.session.document().notebook(), &before);
        assert_eq!(misses.try_recv().unwrap().subject, "session.correlation_miss");
    }

    #[tokio::test]
    async fn test_output_after_reply_routes_during_grace() {
        let mut f = fixture();
        add_code(&mut f, "c1", "print(1)");
        let now = Instant::now();
        f.session.handle_action(execute(&f, "c1"), now);
        let request_id = f.kernel.requests.lock()[0].request_id.clone();

        f.session.on_kernel_event(KernelEvent::ExecuteReply(ExecuteReply::ok(request_id.clone(), 1)), now);
        let sent = f.session.on_kernel_event(
            KernelEvent::OutputData(OutputData {
                request_id,
                kind: OutputKind::Stdout,
                mimetype_bundle: MimetypeBundle::new(),
            }),
            now + Duration::from_secs(1),
        );
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_reply_is_dropped() {
        let mut f = fixture();
        add_code(&mut f, "c1", "x");
        let now = Instant::now();
        f.session.handle_action(execute(&f, "c1"), now);
        let request_id = f.kernel.requests.lock()[0].request_id.clone();
        let mut misses = f.flows.subscribe("session.correlation_miss");

        let reply = ExecuteReply::error(request_id, "NameError", "name 'x' is not defined");
        let first = f
            .session
            .on_kernel_event(KernelEvent::ExecuteReply(reply.clone()), now);
        assert_eq!(first.len(), 1);
        let second = f
            .session
            .on_kernel_event(KernelEvent::ExecuteReply(reply), now + Duration::from_millis(500));
        assert!(second.is_empty());
        assert!(misses.try_recv().is_some());

        let cell = f.session.document().cell(&"c1".into(), &f.ws).unwrap();
        assert_eq!(cell.outputs.len(), 1);
        assert_eq!(cell.outputs[0].kind, OutputKind::Error);
    }

    #[tokio::test]
    async fn test_events_for_deleted_cell_forget_request() {
        let mut f = fixture();
        add_code(&mut f, "c1", "print(1)");
        let now = Instant::now();
        f.session.handle_action(execute(&f, "c1"), now);
        let request_id = f.kernel.requests.lock()[0].request_id.clone();
        f.session.handle_action(
            Action::DeleteCell {
                worksheet_id: f.ws.clone(),
                cell_id: "c1".into(),
            },
            now,
        );
        assert_eq!(f.session.correlation().len(), 1);
        let mut failures = f.flows.subscribe("session.action_failed");
        let mut misses = f.flows.subscribe("session.correlation_miss");

        let output = || {
            KernelEvent::OutputData(OutputData {
                request_id: request_id.clone(),
                kind: OutputKind::Stdout,
                mimetype_bundle: MimetypeBundle::new(),
            })
        };
        assert!(f.session.on_kernel_event(output(), now).is_empty());
        assert!(f.session.correlation().is_empty());
        assert!(failures.try_recv().is_none());

        // Nothing is left to abandon, and later events miss.
        assert!(f.session.sweep(now + Duration::from_secs(3600)).is_empty());
        assert!(f.session.on_kernel_event(output(), now).is_empty());
        assert!(misses.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_kernel_status_broadcast_directly() {
        let mut f = fixture();
        let mut rx = client(&mut f);
        let version = f.session.document().version();

        f.session.on_kernel_event(KernelEvent::status("busy"), Instant::now());
        let updates = drain(&mut rx);
        assert!(matches!(
            updates.as_slice(),
            [Update::SessionStatus { kernel_state, .. }] if kernel_state == "busy"
        ));
        assert_eq!(f.session.kernel_state(), "busy");
        assert_eq!(f.session.document().version(), version);
    }

    #[tokio::test]
    async fn test_execute_non_code_cell_is_noop() {
        let mut f = fixture();
        f.session.handle_action(
            Action::AddCell {
                worksheet_id: f.ws.clone(),
                cell_id: "md".into(),
                kind: CellKind::Markdown,
                source: "# hi".into(),
                insert_after: InsertPoint::Head,
            },
            Instant::now(),
        );
        let sent = f.session.handle_action(execute(&f, "md"), Instant::now());
        assert!(sent.is_empty());
        assert!(f.kernel.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_execute_cells_dispatches_in_order() {
        let mut f = fixture();
        add_code(&mut f, "b", "second");
        add_code(&mut f, "a", "first");
        f.session.handle_action(Action::ExecuteCells, Instant::now());
        let codes: Vec<String> = f.kernel.requests.lock().iter().map(|r| r.code.clone()).collect();
        assert_eq!(codes, vec!["first", "second"]);
        assert_eq!(f.session.correlation().in_flight(), 2);
    }

    #[tokio::test]
    async fn test_composite_stops_at_first_failure() {
        let mut f = fixture();
        add_code(&mut f, "c1", "old");
        let sent = f.session.handle_action(
            Action::Composite {
                sub_actions: vec![
                    UpdateCell::new(f.ws.clone(), "c1".into()).with_source("new").into(),
                    Action::DeleteCell {
                        worksheet_id: f.ws.clone(),
                        cell_id: "ghost".into(),
                    },
                    execute(&f, "c1"),
                ],
            },
            Instant::now(),
        );
        assert_eq!(sent.len(), 1);
        assert_eq!(f.session.document().cell(&"c1".into(), &f.ws).unwrap().source, "new");
        assert!(f.kernel.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_composite_failure_is_reported_once() {
        let mut f = fixture();
        let mut failures = f.flows.subscribe("session.action_failed");
        f.session.handle_action(
            Action::Composite {
                sub_actions: vec![
                    Action::DeleteCell {
                        worksheet_id: f.ws.clone(),
                        cell_id: "ghost".into(),
                    },
                    Action::DeleteCell {
                        worksheet_id: f.ws.clone(),
                        cell_id: "phantom".into(),
                    },
                ],
            },
            Instant::now(),
        );
        let msg = failures.try_recv().unwrap();
        let SessionFlow::ActionFailed { action, error, .. } = msg.payload else {
            panic!("expected action failure");
        };
        assert_eq!(action, "composite");
        assert!(error.contains("ghost"), "{error}");
        assert!(failures.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_update_then_execute_uses_new_source() {
        let mut f = fixture();
        add_code(&mut f, "c1", "old");
        f.session.handle_action(
            Action::Composite {
                sub_actions: vec![
                    UpdateCell::new(f.ws.clone(), "c1".into()).with_source("new").into(),
                    execute(&f, "c1"),
                ],
            },
            Instant::now(),
        );
        assert_eq!(f.kernel.requests.lock()[0].code, "new");
    }

    #[tokio::test]
    async fn test_sweep_abandons_expired_execution() {
        let mut f = fixture_with(CorrelationConfig {
            capacity: 8,
            execution_timeout: Duration::from_secs(10),
            reply_grace: Duration::from_secs(1),
        });
        add_code(&mut f, "c1", "loop()");
        let mut expired = f.flows.subscribe("session.execution_expired");
        let now = Instant::now();
        f.session.handle_action(execute(&f, "c1"), now);

        assert!(f.session.sweep(now + Duration::from_secs(5)).is_empty());
        let sent = f.session.sweep(now + Duration::from_secs(11));
        assert_eq!(sent.len(), 1);
        let cell = f.session.document().cell(&"c1".into(), &f.ws).unwrap();
        assert_eq!(cell.outputs.len(), 1);
        assert!(cell.outputs[0].text().unwrap().starts_with(EXECUTION_TIMEOUT_ERROR));
        assert!(f.session.correlation().is_empty());
        assert!(expired.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_kernel_refusal_is_visible_on_cell() {
        let mut f = fixture();
        add_code(&mut f, "c1", "1");
        *f.kernel.refuse.lock() = true;
        f.session.handle_action(execute(&f, "c1"), Instant::now());
        let cell = f.session.document().cell(&"c1".into(), &f.ws).unwrap();
        assert_eq!(cell.outputs.len(), 1);
        assert_eq!(cell.outputs[0].kind, OutputKind::Error);
        assert!(cell.outputs[0].text().unwrap().starts_with("KernelError"));
    }

    #[tokio::test]
    async fn test_slow_client_is_dropped_others_still_served() {
        let mut f = fixture();
        let mut healthy = client(&mut f);
        let (slow, _slow_rx) = ChannelConnection::new("nb.json", 2);
        f.session.connect(Arc::new(slow));
        let mut dropped = f.flows.subscribe("session.client_dropped");
        assert_eq!(f.session.client_count(), 2);

        add_code(&mut f, "c1", "");
        add_code(&mut f, "c2", "");

        assert_eq!(f.session.client_count(), 1);
        assert_eq!(drain(&mut healthy).len(), 2);
        assert!(dropped.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_document() {
        let mut f = fixture();
        let (conn, _rx) = ChannelConnection::new("nb.json", 8);
        let id = conn.id().clone();
        f.session.connect(Arc::new(conn));
        add_code(&mut f, "c1", "");
        assert!(f.session.disconnect(&id));
        assert!(!f.session.disconnect(&id));
        assert_eq!(f.session.client_count(), 0);
        assert_eq!(f.session.document().notebook().cell_count(), 1);
    }

    #[tokio::test]
    async fn test_rename_broadcasts_metadata() {
        let mut f = fixture();
        let mut rx = client(&mut f);
        let mut renamed = f.flows.subscribe("session.renamed");

        let sent = f.session.handle_action(Action::Rename { path: "moved.qnb".into() }, Instant::now());
        assert_eq!(sent, vec![Update::NotebookMetadata { path: "moved.qnb".into() }]);
        assert_eq!(f.session.path(), "moved.qnb");
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(
            renamed.try_recv().unwrap().payload,
            SessionFlow::Renamed {
                from: "nb.json".into(),
                to: "moved.qnb".into()
            }
        );

        let sent = f.session.handle_action(Action::Rename { path: "moved.ipynb".into() }, Instant::now());
        assert!(sent.is_empty());
        assert_eq!(f.session.path(), "moved.qnb");
    }

    #[tokio::test]
    async fn test_rename_validates_path_before_moving() {
        let mut f = fixture();
        let mut rx = client(&mut f);
        let mut failures = f.flows.subscribe("session.action_failed");
        let mut renamed = f.flows.subscribe("session.renamed");

        for bad in ["../escape.json", "a/../../escape.json", "/"] {
            let sent = f.session.handle_action(Action::Rename { path: bad.into() }, Instant::now());
            assert!(sent.is_empty(), "{bad} accepted");
            assert_eq!(f.session.path(), "nb.json");
            assert!(failures.try_recv().is_some());
        }
        assert!(drain(&mut rx).is_empty());
        assert!(renamed.try_recv().is_none());

        // Accepted paths are stored, broadcast and announced in canonical form.
        let sent = f.session.handle_action(
            Action::Rename { path: "/./sub//moved.json".into() },
            Instant::now(),
        );
        assert_eq!(sent, vec![Update::NotebookMetadata { path: "sub/moved.json".into() }]);
        assert_eq!(f.session.path(), "sub/moved.json");
        assert_eq!(
            renamed.try_recv().unwrap().payload,
            SessionFlow::Renamed {
                from: "nb.json".into(),
                to: "sub/moved.json".into()
            }
        );
    }

    #[tokio::test]
    async fn test_source_limit_filters() {
        let mut f = fixture();
        let mut filtered = f.flows.subscribe("session.action_filtered");
        let huge = "x".repeat(DEFAULT_MAX_SOURCE_BYTES + 1);
        let sent = f.session.handle_action(
            Action::AddCell {
                worksheet_id: f.ws.clone(),
                cell_id: "big".into(),
                kind: CellKind::Code,
                source: huge,
                insert_after: InsertPoint::Head,
            },
            Instant::now(),
        );
        assert!(sent.is_empty());
        assert_eq!(f.session.document().notebook().cell_count(), 0);
        assert!(filtered.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_mutations_are_persisted() {
        let mut f = fixture();
        add_code(&mut f, "c1", "1+1");
        let storage = f.storage.clone();

        for _ in 0..50 {
            if storage.get("nb.json").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stored = ModelSerializer.parse(&storage.get("nb.json").unwrap()).unwrap();
        assert_eq!(stored.cell_count(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_state() {
        let mut f = fixture();
        f.storage.set_fail_writes(true);
        let mut failures = f.flows.subscribe("session.persist_failed");
        add_code(&mut f, "c1", "1+1");

        let msg = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .expect("timeout")
            .expect("bus closed");
        assert_eq!(msg.payload.notebook_path(), "nb.json");
        assert_eq!(f.session.document().notebook().cell_count(), 1);
    }

    #[tokio::test]
    async fn test_spawned_session_round_trip() {
        let storage = Arc::new(MemoryStorage::new());
        let services = SessionServices {
            persistence: Persistence::new(storage.clone(), SerializerRegistry::with_defaults()),
            kernels: Arc::new(EchoKernelFactory),
            flows: shared_session_flow_bus(64),
            config: SessionConfig::default(),
        };
        let handle = spawn_session("demo.json", &services).await.unwrap();
        assert_eq!(handle.state(), SessionState::Active);

        let (conn, mut rx) = ChannelConnection::new("demo.json", 64);
        handle.connect(Arc::new(conn)).await.unwrap();
        let Some(Update::Snapshot { notebook }) = rx.recv().await else {
            panic!("expected snapshot");
        };
        // Starter notebook: heading, markdown, empty code cell.
        assert_eq!(notebook.cell_count(), 3);
        let ws = notebook.worksheet_ids()[0].clone();
        let code_id = notebook.first_worksheet().unwrap().cells[2].id.clone();

        handle
            .submit(Action::Composite {
                sub_actions: vec![
                    UpdateCell::new(ws.clone(), code_id.clone()).with_source("hello").into(),
                    Action::ExecuteCell {
                        worksheet_id: ws.clone(),
                        cell_id: code_id.clone(),
                    },
                ],
            })
            .await
            .unwrap();

        let mut prompt = None;
        while prompt.is_none() {
            let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timeout")
                .expect("closed");
            if let Update::CellUpdate(delta) = update {
                prompt = delta.prompt;
            }
        }
        assert_eq!(prompt.as_deref(), Some("1"));

        let snapshot = handle.snapshot().await.unwrap();
        let cell = snapshot.worksheet(&ws).unwrap().cell(&code_id).unwrap();
        assert_eq!(cell.outputs[0].text(), Some("hello"));

        handle.shutdown().await.unwrap();
        assert!(storage.get("demo.json").is_some());
        assert!(matches!(handle.submit(Action::ClearOutputs).await, Err(SessionError::Closed)));
    }
}
