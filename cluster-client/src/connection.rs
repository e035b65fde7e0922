//! One TCP socket to a remote node.
//!
//! Sequence allocation and the pending-reply table are guarded by one lock;
//! the writer socket handle by a second, separate lock, so a slow write never
//! blocks a concurrent session allocation and vice versa. Dialing is
//! serialised by a third lock held only across the connect attempt itself.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{o, warn};

use cluster_core::{decode_resp, encode_req, marshal, unmarshal, Address, ClusterError, ClusterResult, RespReassembly, ReqPack, RespPack};

use crate::options::ClientOptions;

struct PendingCall {
    done: mpsc::SyncSender<ClusterResult<Vec<u8>>>,
}

struct PendingTable {
    seq: u32,
    entries: HashMap<u32, PendingCall>,
}

impl PendingTable {
    fn new() -> Self {
        PendingTable { seq: 0, entries: HashMap::new() }
    }

    /// Allocates the next session id: never 0, never a session still in use.
    fn next_session(&mut self) -> u32 {
        loop {
            self.seq = self.seq.wrapping_add(1);
            if self.seq != 0 && !self.entries.contains_key(&self.seq) {
                return self.seq;
            }
        }
    }
}

/// A single outbound connection to one remote node.
pub struct ClientConnection {
    address: String,
    options: ClientOptions,
    closing: AtomicBool,
    connect_lock: Mutex<()>,
    writer: Mutex<Option<TcpStream>>,
    pending: Mutex<PendingTable>,
    log: slog::Logger,
}

impl ClientConnection {
    pub fn new(address: impl Into<String>, options: ClientOptions, log: slog::Logger) -> Arc<ClientConnection> {
        let address = address.into();
        let log = log.new(o!("remote" => address.clone()));
        Arc::new(ClientConnection {
            address,
            options,
            closing: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
            writer: Mutex::new(None),
            pending: Mutex::new(PendingTable::new()),
            log,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Lazily dials the remote node, serialised so concurrent invokers never
    /// race each other into opening two sockets.
    fn ensure_connected(self: &Arc<Self>) -> ClusterResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let _dial_guard = self.connect_lock.lock();
        if self.is_connected() {
            return Ok(());
        }
        if self.closing.load(Ordering::SeqCst) {
            return Err(ClusterError::Closing);
        }

        let addr: SocketAddr = self
            .address
            .parse()
            .map_err(|e| ClusterError::Connect(format!("invalid remote address {:?}: {}", self.address, e)))?;
        let stream = TcpStream::connect_timeout(&addr, self.options.connect_timeout)
            .map_err(|e| ClusterError::Connect(e.to_string()))?;
        let reader_stream = stream.try_clone().map_err(ClusterError::from)?;

        *self.writer.lock() = Some(stream);
        self.spawn_reader(reader_stream);

        if let Some(cb) = &self.options.on_connect {
            cb();
        }
        Ok(())
    }

    fn write_frame(&self, wire: &[u8]) -> ClusterResult<()> {
        let mut guard = self.writer.lock();
        match guard.as_mut() {
            Some(stream) => stream.write_all(wire).map_err(ClusterError::from),
            None => Err(ClusterError::Closing),
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: TcpStream) {
        let this = Arc::clone(self);
        let name = format!("cluster-client-reader-{}", self.address);
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut pending_resp = RespReassembly::new();
                loop {
                    match cluster_core::read_frame(&mut stream) {
                        Ok(Some(body)) => match decode_resp(&body, &mut pending_resp) {
                            Ok(Some(resp)) => this.deliver(resp),
                            Ok(None) => continue,
                            Err(err) => {
                                warn!(this.log, "response decode error, closing connection"; "error" => %err);
                                break;
                            }
                        },
                        Ok(None) => break,
                        Err(err) => {
                            warn!(this.log, "socket read error, closing connection"; "error" => %err);
                            break;
                        }
                    }
                }
                this.on_disconnected();
            })
            .expect("failed to spawn reader thread");
    }

    fn deliver(&self, resp: RespPack) {
        let call = {
            let mut pending = self.pending.lock();
            pending.entries.remove(&resp.session)
        };
        // Unknown sessions (late replies past a timeout) are silently discarded.
        if let Some(call) = call {
            let result = if resp.ok {
                Ok(resp.payload)
            } else {
                Err(ClusterError::Remote(String::from_utf8_lossy(&resp.payload).into_owned()))
            };
            let _ = call.done.try_send(result);
        }
    }

    fn on_disconnected(&self) {
        *self.writer.lock() = None;
        let drained: Vec<_> = self.pending.lock().entries.drain().collect();
        for (_, call) in drained {
            let _ = call.done.try_send(Err(ClusterError::Closing));
        }
        if let Some(cb) = &self.options.on_disconnect {
            cb();
        }
    }

    /// Call path: marshal, connect if needed, allocate a session,
    /// enqueue the frame, then wait for the reply or the timeout.
    ///
    /// Returns `Ok(None)` when the remote method declared no reply.
    pub fn call<A, R>(
        self: &Arc<Self>,
        addr: Address,
        method: &str,
        args: Option<&A>,
        timeout: Option<Duration>,
        codec_override: Option<cluster_core::CodecName>,
    ) -> ClusterResult<Option<R>>
    where
        A: Serialize + 'static,
        R: DeserializeOwned + 'static,
    {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ClusterError::Closing);
        }

        let codec = codec_override.unwrap_or_else(|| self.options.default_codec.clone());
        let payload = match args {
            Some(value) => marshal(value, &codec)?,
            None => Vec::new(),
        };

        self.ensure_connected()?;

        let (tx, rx) = mpsc::sync_channel::<ClusterResult<Vec<u8>>>(1);
        let session = {
            let mut pending = self.pending.lock();
            let session = pending.next_session();
            pending.entries.insert(session, PendingCall { done: tx });
            session
        };

        let req = ReqPack { addr, session, method: method.as_bytes().to_vec(), payload };
        let wire = encode_req(&req);
        if let Err(err) = self.write_frame(&wire) {
            self.pending.lock().entries.remove(&session);
            return Err(err);
        }

        let effective_timeout = timeout.unwrap_or(self.options.call_timeout);
        match rx.recv_timeout(effective_timeout) {
            Ok(Ok(payload)) if payload.is_empty() => Ok(None),
            Ok(Ok(payload)) => unmarshal(&payload, &codec).map(Some),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.pending.lock().entries.remove(&session);
                Err(ClusterError::Timeout)
            }
        }
    }

    /// Push path: fire-and-forget, session 0. If not currently
    /// connected, a background task dials then sends; the caller never waits.
    pub fn push<A>(self: &Arc<Self>, addr: Address, method: &str, args: Option<&A>, codec_override: Option<cluster_core::CodecName>) -> ClusterResult<()>
    where
        A: Serialize + 'static,
    {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ClusterError::Closing);
        }

        let codec = codec_override.unwrap_or_else(|| self.options.default_codec.clone());
        let payload = match args {
            Some(value) => marshal(value, &codec)?,
            None => Vec::new(),
        };
        let req = ReqPack { addr, session: 0, method: method.as_bytes().to_vec(), payload };
        let wire = encode_req(&req);

        if self.is_connected() {
            if let Err(err) = self.write_frame(&wire) {
                warn!(self.log, "push send failed"; "error" => %err);
            }
            return Ok(());
        }

        let this = Arc::clone(self);
        thread::spawn(move || {
            if let Err(err) = this.ensure_connected() {
                warn!(this.log, "deferred push connect failed"; "error" => %err);
                return;
            }
            if let Err(err) = this.write_frame(&wire) {
                warn!(this.log, "deferred push send failed"; "error" => %err);
            }
        });
        Ok(())
    }

    /// Marks the connection closing immediately, then hard-closes the socket
    /// after a 15s grace window to let in-flight replies drain.
    pub fn close(self: &Arc<Self>) {
        self.closing.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(15));
            this.hard_close();
        });
    }

    fn hard_close(&self) {
        *self.writer.lock() = None;
        let drained: Vec<_> = self.pending.lock().entries.drain().collect();
        for (_, call) in drained {
            let _ = call.done.try_send(Err(ClusterError::Closing));
        }
    }
}
