//! Connection acceptor and per-connection actor.
//!
//! `GateListener` accepts TCP connections and spawns one `GateAgent` per
//! connection. Each agent owns two threads: a reader that drains framed
//! bytes off the socket and pushes them onto a bounded channel (capacity
//! 1000, backpressuring the socket when full), and a processing thread that
//! decodes and dispatches. The reassembly table lives only on the
//! processing thread, so it needs no lock.

use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slog::{debug, o, warn};

use cluster_core::{decode_req, encode_resp, read_frame, recoverable_session, ClusterError, ClusterResult, ReqPack, ReqReassembly, RespPack};

use crate::context::Context;
use crate::dispatch::Dispatcher;

/// `(ctx, service, method, elapsed, error message if any)`.
pub type AccessLogHook = Arc<dyn Fn(&Context, &str, &str, Duration, Option<&str>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct GateOptions {
    pub access_log: Option<AccessLogHook>,
}

impl GateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access_log(mut self, hook: AccessLogHook) -> Self {
        self.access_log = Some(hook);
        self
    }
}

const READER_CHANNEL_CAPACITY: usize = 1000;

/// Accepts inbound connections on one bound address.
pub struct GateListener {
    dispatcher: Arc<Dispatcher>,
    options: GateOptions,
    log: slog::Logger,
    closing: Arc<AtomicBool>,
}

impl GateListener {
    pub fn new(dispatcher: Arc<Dispatcher>, options: GateOptions, log: slog::Logger) -> Arc<GateListener> {
        Arc::new(GateListener { dispatcher, options, log, closing: Arc::new(AtomicBool::new(false)) })
    }

    /// Binds and starts accepting in a background thread. Returns the bound
    /// address (handy when `bind_addr` used port 0).
    pub fn start(self: &Arc<Self>, bind_addr: &str) -> ClusterResult<std::net::SocketAddr> {
        let listener = TcpListener::bind(bind_addr).map_err(ClusterError::from)?;
        listener.set_nonblocking(true).map_err(ClusterError::from)?;
        let local_addr = listener.local_addr().map_err(ClusterError::from)?;

        let this = Arc::clone(self);
        thread::Builder::new()
            .name(format!("cluster-server-listener-{}", local_addr))
            .spawn(move || loop {
                if this.closing.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        if stream.set_nonblocking(false).is_err() {
                            continue;
                        }
                        GateAgent::accept(stream, Arc::clone(&this.dispatcher), this.options.clone(), this.log.clone());
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        warn!(this.log, "accept error"; "error" => %err);
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            })
            .expect("failed to spawn listener thread");

        Ok(local_addr)
    }

    /// Stops accepting new connections. In-flight agents are left to drain
    /// on their own; `timeout` is accepted for interface symmetry but isn't
    /// enforced against agents directly owned by this listener (each
    /// agent's socket closes with its peer independently).
    pub fn close(&self, _timeout: Duration) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// Per-connection server actor.
pub struct GateAgent {
    dispatcher: Arc<Dispatcher>,
    options: GateOptions,
    log: slog::Logger,
    writer: Mutex<TcpStream>,
}

impl GateAgent {
    pub fn accept(stream: TcpStream, dispatcher: Arc<Dispatcher>, options: GateOptions, log: slog::Logger) -> Arc<GateAgent> {
        let remote = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
        let writer_stream = stream.try_clone().expect("failed to clone tcp stream for gate writer");

        let agent = Arc::new(GateAgent {
            dispatcher,
            options,
            log: log.new(o!("remote" => remote.clone())),
            writer: Mutex::new(writer_stream),
        });

        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Vec<u8>>(READER_CHANNEL_CAPACITY);

        {
            let agent = Arc::clone(&agent);
            let mut reader_stream = stream;
            thread::Builder::new()
                .name(format!("cluster-server-read-{}", remote))
                .spawn(move || {
                    loop {
                        match read_frame(&mut reader_stream) {
                            Ok(Some(body)) => {
                                if frame_tx.send(body).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                warn!(agent.log, "socket read error, closing connection"; "error" => %err);
                                break;
                            }
                        }
                    }
                })
                .expect("failed to spawn gate reader thread");
        }

        {
            let agent = Arc::clone(&agent);
            thread::Builder::new()
                .name(format!("cluster-server-process-{}", remote))
                .spawn(move || {
                    let mut pending = ReqReassembly::new();
                    for body in frame_rx {
                        match decode_req(&body, &mut pending) {
                            Ok(Some(req)) => agent.dispatch_request(req),
                            Ok(None) => continue,
                            Err(err) => {
                                warn!(agent.log, "request decode/reassembly error"; "error" => %err);
                                // Session 0 means push; a push frame's decode error is
                                // logged only, a call's is reported back on its session
                                // where the session can be recovered.
                                match recoverable_session(&body) {
                                    Some(session) if session != 0 => agent.respond(session, false, err.wire_text().into_bytes()),
                                    _ => {}
                                }
                            }
                        }
                    }
                })
                .expect("failed to spawn gate processing thread");
        }

        agent
    }

    fn dispatch_request(self: &Arc<Self>, req: ReqPack) {
        let service_name = req.addr.display();
        let method = String::from_utf8_lossy(&req.method).into_owned();
        let session = req.session;
        let is_push = req.is_push();
        let payload = req.payload;
        let started = Instant::now();

        let this = Arc::clone(self);
        let log_service = service_name.clone();
        let log_method = method.clone();

        self.dispatcher.dispatch(&service_name, session, method, payload, None, move |ctx, result| {
            let elapsed = started.elapsed();
            if let Some(hook) = &this.options.access_log {
                let err_message = result.as_ref().err().map(|e| e.to_string());
                hook(&ctx, &log_service, &log_method, elapsed, err_message.as_deref());
            }

            if is_push {
                if let Err(err) = &result {
                    debug!(this.log, "push dispatch error (discarded)"; "service" => &log_service, "method" => &log_method, "error" => %err);
                }
                return;
            }

            match result {
                Ok(Some(payload)) => this.respond(session, true, payload),
                Ok(None) => this.respond(session, true, Vec::new()),
                Err(err) => {
                    warn!(this.log, "call failed"; "service" => &log_service, "method" => &log_method, "error" => %err);
                    this.respond(session, false, err.wire_text().into_bytes());
                }
            }
        });
    }

    fn respond(&self, session: u32, ok: bool, payload: Vec<u8>) {
        let resp = RespPack { session, ok, payload };
        let wire = encode_resp(&resp);
        let mut writer = self.writer.lock();
        if let Err(err) = writer.write_all(&wire) {
            warn!(self.log, "response write error"; "error" => %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::dispatch::{ServiceBuilder, ServiceOptions};
    use cluster_core::{encode_req, read_frame, Address, CodecName};
    use serde_derive::{Deserialize, Serialize};
    use std::net::TcpStream as ClientStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Serialize, Deserialize)]
    struct Args {
        a: i32,
        b: i32,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Reply {
        sum: i32,
    }

    fn add_dispatcher() -> Arc<Dispatcher> {
        let service = ServiceBuilder::new("Arith", ServiceOptions::new())
            .method("Add", |_ctx: &Context, args: Option<Args>| -> ClusterResult<Option<Reply>> {
                let args = args.ok_or_else(|| ClusterError::validation("missing request parameters"))?;
                Ok(Some(Reply { sum: args.a + args.b }))
            })
            .build(cluster_core::logging::discard())
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(service).unwrap();
        dispatcher
    }

    #[test]
    fn gate_dispatches_a_call_and_responds() {
        let dispatcher = add_dispatcher();
        let listener = GateListener::new(dispatcher, GateOptions::new(), cluster_core::logging::discard());
        let addr = listener.start("127.0.0.1:0").unwrap();

        let mut client = ClientStream::connect(addr).unwrap();
        let req = ReqPack { addr: Address::Name("Arith".into()), session: 1, method: b"Add".to_vec(), payload: cluster_core::marshal(&Args { a: 4, b: 5 }, &CodecName::Json).unwrap() };
        let wire = encode_req(&req);
        client.write_all(&wire).unwrap();

        let body = read_frame(&mut client).unwrap().unwrap();
        let mut pending = cluster_core::RespReassembly::new();
        let resp = cluster_core::decode_resp(&body, &mut pending).unwrap().unwrap();
        assert!(resp.ok);
        let reply: Reply = cluster_core::unmarshal(&resp.payload, &CodecName::Json).unwrap();
        assert_eq!(reply, Reply { sum: 9 });
    }

    #[test]
    fn gate_reports_routing_error_for_unknown_service() {
        let dispatcher = add_dispatcher();
        let listener = GateListener::new(dispatcher, GateOptions::new(), cluster_core::logging::discard());
        let addr = listener.start("127.0.0.1:0").unwrap();

        let mut client = ClientStream::connect(addr).unwrap();
        let req = ReqPack { addr: Address::Name("Nope".into()), session: 1, method: b"Add".to_vec(), payload: Vec::new() };
        client.write_all(&encode_req(&req)).unwrap();

        let body = read_frame(&mut client).unwrap().unwrap();
        let mut pending = cluster_core::RespReassembly::new();
        let resp = cluster_core::decode_resp(&body, &mut pending).unwrap().unwrap();
        assert!(!resp.ok);
    }

    #[test]
    fn access_log_hook_fires_once_per_call() {
        let dispatcher = add_dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let (tx, rx) = mpsc::channel::<()>();
        let hook: AccessLogHook = Arc::new(move |_ctx, _service, _method, _elapsed, _err| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });
        let options = GateOptions::new().with_access_log(hook);
        let listener = GateListener::new(dispatcher, options, cluster_core::logging::discard());
        let addr = listener.start("127.0.0.1:0").unwrap();

        let mut client = ClientStream::connect(addr).unwrap();
        let req = ReqPack { addr: Address::Name("Arith".into()), session: 1, method: b"Add".to_vec(), payload: cluster_core::marshal(&Args { a: 1, b: 1 }, &CodecName::Json).unwrap() };
        client.write_all(&encode_req(&req)).unwrap();
        let _ = read_frame(&mut client).unwrap().unwrap();

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_continuation_for_a_call_gets_an_error_response_on_its_session() {
        use byteorder::{LittleEndian, WriteBytesExt};

        let dispatcher = add_dispatcher();
        let listener = GateListener::new(dispatcher, GateOptions::new(), cluster_core::logging::discard());
        let addr = listener.start("127.0.0.1:0").unwrap();
        let mut client = ClientStream::connect(addr).unwrap();

        // A final continuation frame for a session that was never opened by a
        // header frame -- decode_req reports "unknown session", which must be
        // reported back since this session (7) is non-zero, i.e. not a push.
        let mut body = Vec::new();
        body.push(0x03u8); // MULTI_CONT_FINAL
        body.write_u32::<LittleEndian>(7).unwrap();
        body.extend_from_slice(b"garbage");
        let mut wire = Vec::new();
        wire.write_u16::<byteorder::BigEndian>(body.len() as u16).unwrap();
        wire.extend_from_slice(&body);
        client.write_all(&wire).unwrap();

        let resp_body = read_frame(&mut client).unwrap().unwrap();
        let mut pending = cluster_core::RespReassembly::new();
        let resp = cluster_core::decode_resp(&resp_body, &mut pending).unwrap().unwrap();
        assert_eq!(resp.session, 7);
        assert!(!resp.ok);
    }

    #[test]
    fn malformed_continuation_for_a_push_is_logged_only() {
        use byteorder::{LittleEndian, WriteBytesExt};

        let dispatcher = add_dispatcher();
        let listener = GateListener::new(dispatcher, GateOptions::new(), cluster_core::logging::discard());
        let addr = listener.start("127.0.0.1:0").unwrap();
        let mut client = ClientStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(300))).unwrap();

        // Session 0 means push -- the same unknown-session decode error must
        // not produce a response frame.
        let mut body = Vec::new();
        body.push(0x03u8); // MULTI_CONT_FINAL
        body.write_u32::<LittleEndian>(0).unwrap();
        body.extend_from_slice(b"garbage");
        let mut wire = Vec::new();
        wire.write_u16::<byteorder::BigEndian>(body.len() as u16).unwrap();
        wire.extend_from_slice(&body);
        client.write_all(&wire).unwrap();

        let result = read_frame(&mut client);
        assert!(result.is_err(), "expected a read timeout, got {:?}", result);
    }
}
