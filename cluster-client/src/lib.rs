//! Client-side session machine for the cluster RPC protocol.

pub mod caller;
pub mod connection;
pub mod facade;
pub mod options;
pub mod registry;

pub use caller::{Caller, ValidatedCaller};
pub use connection::ClientConnection;
pub use facade::{call, call_host, send, send_host};
pub use options::ClientOptions;
pub use registry::ClusterRegistry;
