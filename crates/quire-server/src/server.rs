//! Composition root: wires storage, kernels, the session manager and the
//! transport together from a resolved [`QuireConfig`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use quire_kernel::{
    EchoKernelFactory, KernelConfig, KernelFactory, LocalStorage, Persistence, ProcessKernelFactory,
    QuireConfig, SerializerRegistry, SessionManager, SessionServices, SharedSessionFlowBus,
    Storage, log_session_flows, shared_session_flow_bus,
};

use crate::constants::FLOW_BUS_CAPACITY;
use crate::transport;

/// Pick the kernel factory a config asks for.
pub fn kernel_factory(config: &KernelConfig) -> Arc<dyn KernelFactory> {
    if config.is_builtin() {
        tracing::info!("using built-in echo kernel");
        Arc::new(EchoKernelFactory)
    } else {
        tracing::info!(command = %config.command, args = ?config.args, "using process kernel");
        Arc::new(ProcessKernelFactory::new(config.command.clone(), config.args.clone()))
    }
}

/// A configured server, ready to bind.
pub struct QuireServer {
    config: QuireConfig,
    manager: Arc<SessionManager>,
    flows: SharedSessionFlowBus,
    flow_log: JoinHandle<()>,
}

impl QuireServer {
    /// Server storing notebooks under `config.storage.root`.
    pub fn new(config: QuireConfig) -> Self {
        let storage = Arc::new(LocalStorage::new(config.storage.root.clone()));
        Self::with_storage(config, storage)
    }

    /// Server over caller-provided storage. Must be called inside a tokio runtime.
    pub fn with_storage(config: QuireConfig, storage: Arc<dyn Storage>) -> Self {
        let flows = shared_session_flow_bus(FLOW_BUS_CAPACITY);
        let flow_log = tokio::spawn(log_session_flows(flows.subscribe("session.>")));
        let services = SessionServices {
            persistence: Persistence::new(storage, SerializerRegistry::with_defaults()),
            kernels: kernel_factory(&config.kernel),
            flows: flows.clone(),
            config: config.session.to_session_config(),
        };
        Self {
            config,
            manager: Arc::new(SessionManager::new(services)),
            flows,
            flow_log,
        }
    }

    pub fn config(&self) -> &QuireConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn flows(&self) -> &SharedSessionFlowBus {
        &self.flows
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = format!("{}:{}", self.config.server.bind, self.config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %local_addr(&listener), "listening");
        Ok(listener)
    }

    /// Serve `listener` until `shutdown` resolves, then stop every session.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        tokio::select! {
            _ = transport::serve(
                listener,
                self.manager.clone(),
                self.config.server.max_line_bytes,
            ) => {}
            _ = shutdown => {
                tracing::info!("shutdown requested");
            }
        }
        self.manager.shutdown_all().await;
        self.flow_log.abort();
    }
}

fn local_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map(|a: SocketAddr| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}
