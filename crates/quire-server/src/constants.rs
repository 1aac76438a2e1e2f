//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// How long a new connection has to send its handshake line.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the session flow bus shared by every session.
pub const FLOW_BUS_CAPACITY: usize = quire_kernel::constants::FLOW_BUS_CAPACITY;
