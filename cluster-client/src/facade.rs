//! Thin top-level convenience wrappers: `Call`/`Send` resolve an
//! already-registered node; `CallHost`/`SendHost` additionally register the
//! node (or rebind it, if the address changed) before invoking.

use serde::de::DeserializeOwned;
use serde::Serialize;

use cluster_core::{Address, ClusterError, ClusterResult};

use crate::options::ClientOptions;
use crate::registry::ClusterRegistry;

pub fn call<A, R>(registry: &ClusterRegistry, node: &str, addr: Address, method: &str, args: Option<&A>) -> ClusterResult<Option<R>>
where
    A: Serialize + 'static,
    R: DeserializeOwned + 'static,
{
    let conn = registry
        .query(node)
        .ok_or_else(|| ClusterError::routing(format!("no connection registered for node {:?}", node)))?;
    conn.call(addr, method, args, None, None)
}

pub fn send<A>(registry: &ClusterRegistry, node: &str, addr: Address, method: &str, args: Option<&A>) -> ClusterResult<()>
where
    A: Serialize + 'static,
{
    let conn = registry
        .query(node)
        .ok_or_else(|| ClusterError::routing(format!("no connection registered for node {:?}", node)))?;
    conn.push(addr, method, args, None)
}

pub fn call_host<A, R>(
    registry: &ClusterRegistry,
    node: &str,
    address: &str,
    options: ClientOptions,
    addr: Address,
    method: &str,
    args: Option<&A>,
) -> ClusterResult<Option<R>>
where
    A: Serialize + 'static,
    R: DeserializeOwned + 'static,
{
    let conn = registry.register(node, address, options);
    conn.call(addr, method, args, None, None)
}

pub fn send_host<A>(
    registry: &ClusterRegistry,
    node: &str,
    address: &str,
    options: ClientOptions,
    addr: Address,
    method: &str,
    args: Option<&A>,
) -> ClusterResult<()>
where
    A: Serialize + 'static,
{
    let conn = registry.register(node, address, options);
    conn.push(addr, method, args, None)
}
