//! # quire-kernel
//!
//! Everything between a client connection and the notebook document.
//!
//! A [`Session`] owns one [`NotebookDocument`](quire_doc::NotebookDocument),
//! the clients viewing it and one [`Kernel`]. It routes client actions into
//! the document, dispatches code to the kernel, routes kernel events back to
//! the cell that asked through the [`CorrelationTable`], and broadcasts every
//! resulting update. The [`SessionManager`] keeps one session per notebook
//! path; the [`PersistWorker`] writes snapshots behind the session.
//!
//! Soft failures (rejected actions, stray kernel events, failed writes,
//! dropped clients) never escape a session. They are logged and published on
//! the [`FlowBus`] as [`SessionFlow`] events.

pub mod config;
pub mod connection;
pub mod constants;
pub mod correlation;
pub mod flows;
pub mod kernel;
pub mod manager;
pub mod persist;
pub mod pipeline;
pub mod session;

pub use config::{ConfigError, KernelConfig, QuireConfig, load_config, load_config_file};
pub use connection::{ChannelConnection, ClientConnection, ConnectionError};
pub use correlation::{CorrelationConfig, CorrelationError, CorrelationTable, Expired};
pub use flows::{
    FlowBus, FlowMessage, HasSubject, SessionFlow, SharedSessionFlowBus, Subscription,
    log_session_flows, matches_pattern, shared_session_flow_bus,
};
pub use kernel::{
    EchoKernelFactory, ExecuteReply, ExecuteRequest, Kernel, KernelError, KernelEvent,
    KernelFactory, OutputData, ProcessKernelFactory,
};
pub use manager::{Connected, SessionManager};
pub use persist::{
    LocalStorage, MemoryStorage, ModelSerializer, NotebookSerializer, PersistError, Persistence,
    SerializerRegistry, Storage, normalize_path,
};
pub use pipeline::{ActionPipeline, ActionProcessor, Processed, SourceLimit};
pub use session::{
    ActionError, Session, SessionConfig, SessionError, SessionHandle, SessionServices, SessionState,
    spawn_session,
};
