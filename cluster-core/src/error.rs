use std::fmt;
use std::io;

/// Coarse error category, mirroring the way `flux::shared::NetworkError` wraps
/// an inner reason rather than growing one variant per call site.
#[derive(Debug)]
pub enum ClusterError {
    /// A caller was built with invalid inputs (empty node, bad address, bad reply slot).
    Validation(String),
    /// Dialing or maintaining the underlying socket failed.
    Connect(String),
    /// Marshalling or unmarshalling a payload failed.
    Codec(String),
    /// The wire format itself was violated (bad header, unknown type, truncated frame).
    Protocol(String),
    /// No such service or method is registered.
    Routing(String),
    /// The peer reported an application-level error; the text is verbatim from the wire.
    Remote(String),
    /// A call did not complete before its deadline.
    Timeout,
    /// The connection (or the whole client) is shutting down.
    Closing,
    /// The underlying socket failed.
    Io(io::Error),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Validation(msg) => write!(f, "validation error: {}", msg),
            ClusterError::Connect(msg) => write!(f, "connect error: {}", msg),
            ClusterError::Codec(msg) => write!(f, "codec error: {}", msg),
            ClusterError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ClusterError::Routing(msg) => write!(f, "routing error: {}", msg),
            ClusterError::Remote(msg) => write!(f, "remote error: {}", msg),
            ClusterError::Timeout => write!(f, "call timed out"),
            ClusterError::Closing => write!(f, "connection is closing"),
            ClusterError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClusterError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ClusterError {
    fn from(err: io::Error) -> Self {
        ClusterError::Io(err)
    }
}

impl ClusterError {
    /// The text that should cross the wire as a response payload when this error
    /// is reported back to the peer: the error text verbatim.
    pub fn wire_text(&self) -> String {
        self.to_string()
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        ClusterError::Protocol(msg.into())
    }

    pub fn routing<S: Into<String>>(msg: S) -> Self {
        ClusterError::Routing(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        ClusterError::Validation(msg.into())
    }

    pub fn codec<S: Into<String>>(msg: S) -> Self {
        ClusterError::Codec(msg.into())
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
