//! Caller builder: `NewCaller(..).WithReply(..).WithTimeout(..)
//! .WithPayloadCodec(..).WithPush().Done()`.
//!
//! The reply type `R` is fixed generically at the call site, so there is no
//! runtime reply-slot-shape check to perform here; the type system rules out
//! an invalid reply slot at compile time.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use cluster_core::{Address, ClusterError, ClusterResult, CodecName};

use crate::connection::ClientConnection;

/// A request description under construction.
pub struct Caller<A, R> {
    node: String,
    addr: Address,
    method: String,
    args: Option<A>,
    timeout: Option<Duration>,
    codec: Option<CodecName>,
    push: bool,
    _reply: PhantomData<R>,
}

impl<A, R> Caller<A, R>
where
    A: Serialize + 'static,
    R: DeserializeOwned + 'static,
{
    pub fn new(node: impl Into<String>, addr: Address, method: impl Into<String>, args: Option<A>) -> Self {
        Caller {
            node: node.into(),
            addr,
            method: method.into(),
            args,
            timeout: None,
            codec: None,
            push: false,
            _reply: PhantomData,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_payload_codec(mut self, codec: CodecName) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_push(mut self) -> Self {
        self.push = true;
        self
    }

    /// Validates and freezes the caller. The only runtime check left in Rust
    /// is that the node name is non-empty; address validity is already
    /// enforced by [`Address`]'s constructors.
    pub fn done(self) -> ClusterResult<ValidatedCaller<A, R>> {
        if self.node.trim().is_empty() {
            return Err(ClusterError::validation("caller node name must not be empty"));
        }
        Ok(ValidatedCaller(self))
    }
}

/// An immutable, validated request description. May be invoked more than
/// once; nothing about it can be mutated between invocations.
pub struct ValidatedCaller<A, R>(Caller<A, R>);

impl<A, R> ValidatedCaller<A, R>
where
    A: Serialize + 'static,
    R: DeserializeOwned + 'static,
{
    pub fn node(&self) -> &str {
        &self.0.node
    }

    pub fn is_push(&self) -> bool {
        self.0.push
    }

    /// Runs this caller against the given connection.
    pub fn invoke(&self, conn: &Arc<ClientConnection>) -> ClusterResult<Option<R>> {
        if self.0.push {
            conn.push(self.0.addr.clone(), &self.0.method, self.0.args.as_ref(), self.0.codec.clone())?;
            Ok(None)
        } else {
            conn.call(self.0.addr.clone(), &self.0.method, self.0.args.as_ref(), self.0.timeout, self.0.codec.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_rejects_empty_node() {
        let caller = Caller::<(), ()>::new("", Address::Id(1), "Add", None);
        assert!(caller.done().is_err());
    }

    #[test]
    fn done_accepts_a_well_formed_caller() {
        let caller = Caller::<i32, i32>::new("db", Address::Id(1), "Add", Some(1)).with_push();
        let validated = caller.done().unwrap();
        assert_eq!(validated.node(), "db");
        assert!(validated.is_push());
    }
}
