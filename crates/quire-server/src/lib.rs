//! quire server library
//!
//! TCP JSON-lines front end for quire notebook sessions.

pub mod constants;
pub mod server;
pub mod transport;

pub use server::{QuireServer, kernel_factory};
pub use transport::{Handshake, TransportError};
