//! Per-call execution context handed to service methods.

use std::time::Instant;

/// Carried into every handler invocation. `call_count` is the post-increment
/// value of the method's process-lifetime call counter, copied in at entry.
#[derive(Debug, Clone)]
pub struct Context {
    call_count: u64,
    deadline: Option<Instant>,
}

impl Context {
    pub(crate) fn new(call_count: u64, deadline: Option<Instant>) -> Self {
        Context { call_count, deadline }
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}
