// Library root. Exposes the node core for the binary and integration tests.
// The binary entry point is src/main.rs.

pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod logger;
pub mod node;
pub mod peers;
pub mod relay;
pub mod shell;
pub mod store;
pub mod ticker;
pub mod transport;
