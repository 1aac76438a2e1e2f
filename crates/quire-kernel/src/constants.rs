//! Session defaults.
//!
//! Centralizes hardcoded values; the Rhai config overrides most of them.

use std::time::Duration;

/// Maximum correlation entries per session (concurrently in-flight executions).
pub const DEFAULT_CORRELATION_CAPACITY: usize = 256;

/// How long an execution may run before the session abandons it.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a replied request keeps routing trailing output.
pub const DEFAULT_REPLY_GRACE: Duration = Duration::from_secs(5);

/// Interval between correlation sweeps in the session actor.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-client outbound update buffer; a client that falls this far behind is dropped.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Session command queue depth.
pub const SESSION_COMMAND_BUFFER: usize = 1024;

/// Kernel event queue depth.
pub const KERNEL_EVENT_BUFFER: usize = 1024;

/// Capacity of the session flow bus.
pub const FLOW_BUS_CAPACITY: usize = 1024;

/// Longest inbound protocol line. Longer lines are discarded whole.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Largest cell source accepted by the default pipeline.
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 1024 * 1024;

/// Kernel status reported when the kernel process exits.
pub const KERNEL_STATE_DEAD: &str = "dead";

/// Kernel status reported while the kernel process is starting.
pub const KERNEL_STATE_STARTING: &str = "starting";

/// Error name used in the synthesized reply for an abandoned execution.
pub const EXECUTION_TIMEOUT_ERROR: &str = "ExecutionTimeout";
