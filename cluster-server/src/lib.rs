//! Server-side dispatch machine for the cluster RPC protocol.

pub mod context;
pub mod dispatch;
pub mod gate;
pub mod monitor;

pub use context::Context;
pub use dispatch::{Dispatcher, RecoveryHook, Service, ServiceBuilder, ServiceOptions};
pub use gate::{AccessLogHook, GateAgent, GateListener, GateOptions};
