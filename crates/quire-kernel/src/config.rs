//! Rhai-driven server configuration.
//!
//! Evaluates a `quire.rhai` script and reads the `server`, `storage`,
//! `kernel` and `session` maps out of its scope. Anything the script leaves
//! out keeps the value from the embedded defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::correlation::CorrelationConfig;
use crate::session::SessionConfig;

/// The embedded default configuration script.
pub const DEFAULT_CONFIG: &str = include_str!("../../../assets/defaults/quire.rhai");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("quire.rhai parse error: {0}")]
    Parse(String),

    #[error("quire.rhai eval error: {0}")]
    Eval(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Longest inbound line a connection accepts.
    pub max_line_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub root: PathBuf,
}

/// How kernels are started. An empty command selects the echo kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl KernelConfig {
    pub fn is_builtin(&self) -> bool {
        self.command.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub correlation_capacity: usize,
    pub execution_timeout_secs: u64,
    pub reply_grace_secs: u64,
    pub client_buffer: usize,
    pub starter_notebook: bool,
    pub max_source_bytes: usize,
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            correlation: CorrelationConfig {
                capacity: self.correlation_capacity,
                execution_timeout: Duration::from_secs(self.execution_timeout_secs),
                reply_grace: Duration::from_secs(self.reply_grace_secs),
            },
            client_buffer: self.client_buffer,
            starter_notebook: self.starter_notebook,
            max_source_bytes: self.max_source_bytes,
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuireConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub kernel: KernelConfig,
    pub session: SessionSettings,
}

impl Default for QuireConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1".to_string(),
                port: 8421,
                max_line_bytes: crate::constants::DEFAULT_MAX_LINE_BYTES,
            },
            storage: StorageConfig {
                root: PathBuf::from("notebooks"),
            },
            kernel: KernelConfig::default(),
            session: SessionSettings {
                correlation_capacity: crate::constants::DEFAULT_CORRELATION_CAPACITY,
                execution_timeout_secs: crate::constants::DEFAULT_EXECUTION_TIMEOUT.as_secs(),
                reply_grace_secs: crate::constants::DEFAULT_REPLY_GRACE.as_secs(),
                client_buffer: crate::constants::DEFAULT_CLIENT_BUFFER,
                starter_notebook: true,
                max_source_bytes: crate::constants::DEFAULT_MAX_SOURCE_BYTES,
            },
        }
    }
}

/// Parse a `quire.rhai` script on top of the built-in defaults.
///
/// ```rhai
/// let server = #{ bind: "0.0.0.0", port: 9000 };
/// let kernel = #{ command: "python3", args: ["-u", "kernel.py"] };
/// ```
pub fn load_config(script: &str) -> ConfigResult<QuireConfig> {
    let mut config = QuireConfig::default();
    apply_script(&mut config, script)?;
    Ok(config)
}

/// Read and parse a config file.
pub fn load_config_file(path: &Path) -> ConfigResult<QuireConfig> {
    let script = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), "loading config");
    load_config(&script)
}

fn apply_script(config: &mut QuireConfig, script: &str) -> ConfigResult<()> {
    let engine = rhai::Engine::new();
    let ast = engine
        .compile(script)
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut scope = rhai::Scope::new();
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| ConfigError::Eval(e.to_string()))?;

    if let Some(map) = scope.get_value::<rhai::Map>("server") {
        if let Some(bind) = get_string(&map, "bind") {
            config.server.bind = bind;
        }
        if let Some(port) = get_int(&map, "server.port")? {
            config.server.port = u16::try_from(port).map_err(|_| invalid("server.port", port))?;
        }
        if let Some(v) = get_usize(&map, "server.max_line_bytes")? {
            if v == 0 {
                return Err(invalid("server.max_line_bytes", 0));
            }
            config.server.max_line_bytes = v;
        }
    }

    if let Some(map) = scope.get_value::<rhai::Map>("storage") {
        if let Some(root) = get_string(&map, "root") {
            config.storage.root = PathBuf::from(root);
        }
    }

    if let Some(map) = scope.get_value::<rhai::Map>("kernel") {
        if let Some(command) = get_string(&map, "command") {
            config.kernel.command = command;
        }
        if let Some(args) = get_strings(&map, "args") {
            config.kernel.args = args;
        }
    }

    if let Some(map) = scope.get_value::<rhai::Map>("session") {
        let s = &mut config.session;
        if let Some(v) = get_usize(&map, "session.correlation_capacity")? {
            s.correlation_capacity = v;
        }
        if let Some(v) = get_usize(&map, "session.execution_timeout_secs")? {
            s.execution_timeout_secs = v as u64;
        }
        if let Some(v) = get_usize(&map, "session.reply_grace_secs")? {
            s.reply_grace_secs = v as u64;
        }
        if let Some(v) = get_usize(&map, "session.client_buffer")? {
            if v == 0 {
                return Err(invalid("session.client_buffer", 0));
            }
            s.client_buffer = v;
        }
        if let Some(v) = map.get("starter_notebook").and_then(|v| v.as_bool().ok()) {
            s.starter_notebook = v;
        }
        if let Some(v) = get_usize(&map, "session.max_source_bytes")? {
            s.max_source_bytes = v;
        }
    }

    Ok(())
}

fn invalid(field: &str, value: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: format!("{value} is out of range"),
    }
}

fn get_string(map: &rhai::Map, key: &str) -> Option<String> {
    map.get(key)
        .and_then(|v| v.clone().into_string().ok())
        .map(|s| s.to_string())
}

fn get_strings(map: &rhai::Map, key: &str) -> Option<Vec<String>> {
    map.get(key)
        .and_then(|v| v.clone().try_cast::<rhai::Array>())
        .map(|arr| {
            arr.into_iter()
                .filter_map(|v| v.into_string().ok().map(|s| s.to_string()))
                .collect()
        })
}

/// `field` is the dotted name used in errors; its last segment is the key.
fn get_int(map: &rhai::Map, field: &str) -> ConfigResult<Option<i64>> {
    let key = field.rsplit('.').next().unwrap_or(field);
    match map.get(key) {
        None => Ok(None),
        Some(v) => v.as_int().map(Some).map_err(|ty| ConfigError::Invalid {
            field: field.to_string(),
            message: format!("expected integer, got {ty}"),
        }),
    }
}

fn get_usize(map: &rhai::Map, field: &str) -> ConfigResult<Option<usize>> {
    match get_int(map, field)? {
        None => Ok(None),
        Some(v) => usize::try_from(v).map(Some).map_err(|_| invalid(field, v)),
    }
}
