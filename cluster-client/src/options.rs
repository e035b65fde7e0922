//! Per-connection options.

use std::sync::Arc;
use std::time::Duration;

use cluster_core::CodecName;

/// Callback fired once a connection transitions to/from the connected state.
pub type ConnCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct ClientOptions {
    pub default_codec: CodecName,
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub on_connect: Option<ConnCallback>,
    pub on_disconnect: Option<ConnCallback>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            default_codec: CodecName::Json,
            call_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            on_connect: None,
            on_disconnect: None,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_codec(mut self, codec: CodecName) -> Self {
        self.default_codec = codec;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_on_connect<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn with_on_disconnect<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }
}
