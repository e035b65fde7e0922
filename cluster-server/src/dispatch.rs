//! Dispatcher and Service table.
//!
//! Registration is an explicit builder: each call to [`ServiceBuilder::method`]
//! adds one eligible method descriptor. A service built with zero methods
//! fails to build.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use cluster_core::{is_null, marshal, unmarshal, ClusterError, ClusterResult, CodecName};

use crate::context::Context;
use crate::monitor::{clamp_monitor_interval, default_monitor_interval, SyncWorker};

/// Invoked when a handler panics, or when the synchronous-mode monitor
/// detects a stuck method. Carries a formatted message; the caller decides
/// how to surface it (log, page, etc).
pub type RecoveryHook = Arc<dyn Fn(&str) + Send + Sync>;

fn default_recovery_hook(log: slog::Logger) -> RecoveryHook {
    Arc::new(move |message: &str| {
        slog::error!(log, "recovered"; "message" => message);
    })
}

type Handler = Box<dyn Fn(&Context, &[u8], &CodecName) -> ClusterResult<Option<Vec<u8>>> + Send + Sync>;

struct MethodDescriptor {
    handler: Handler,
    call_counter: AtomicU64,
}

#[derive(Clone)]
pub struct ServiceOptions {
    pub codec: CodecName,
    pub synchronous: bool,
    pub monitor_interval: Duration,
    pub recovery: Option<RecoveryHook>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            codec: CodecName::Json,
            synchronous: false,
            monitor_interval: default_monitor_interval(),
            recovery: None,
        }
    }
}

impl ServiceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, codec: CodecName) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = clamp_monitor_interval(interval);
        self
    }

    pub fn with_recovery_hook(mut self, hook: RecoveryHook) -> Self {
        self.recovery = Some(hook);
        self
    }
}

/// Builds a [`Service`]: registers methods, then validates and freezes it.
pub struct ServiceBuilder {
    name: String,
    options: ServiceOptions,
    methods: HashMap<String, MethodDescriptor>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>, options: ServiceOptions) -> Self {
        ServiceBuilder { name: name.into(), options, methods: HashMap::new() }
    }

    /// Registers one eligible method. `handler` receives the decoded
    /// argument (`None` when the caller sent no payload) and returns the
    /// reply to encode back, or `None` when the method declares no reply.
    pub fn method<A, R, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&Context, Option<A>) -> ClusterResult<Option<R>> + Send + Sync + 'static,
    {
        let boxed: Handler = Box::new(move |ctx, payload, codec| {
            let arg = if is_null(payload, codec) { None } else { Some(unmarshal::<A>(payload, codec)?) };
            let reply = handler(ctx, arg)?;
            match reply {
                Some(value) => Ok(Some(marshal(&value, codec)?)),
                None => Ok(None),
            }
        });
        self.methods.insert(name.into(), MethodDescriptor { handler: boxed, call_counter: AtomicU64::new(0) });
        self
    }

    /// Freezes the service. Fails if no eligible methods were registered.
    pub fn build(self, log: slog::Logger) -> ClusterResult<Service> {
        if self.methods.is_empty() {
            return Err(ClusterError::validation(format!("service {:?} has zero eligible methods", self.name)));
        }

        let recovery = self.options.recovery.clone().unwrap_or_else(|| default_recovery_hook(log.clone()));
        let sync = if self.options.synchronous {
            Some(SyncWorker::new(self.name.clone(), self.options.monitor_interval, recovery.clone(), log.clone()))
        } else {
            None
        };

        Ok(Service {
            name: self.name,
            default_codec: self.options.codec,
            methods: self.methods,
            sync,
            recovery,
            log,
        })
    }
}

/// A registered service: a name, its eligible methods, and an execution mode.
pub struct Service {
    name: String,
    default_codec: CodecName,
    methods: HashMap<String, MethodDescriptor>,
    sync: Option<SyncWorker>,
    recovery: RecoveryHook,
    log: slog::Logger,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn dispatch_now(&self, method: &str, payload: &[u8], codec: &CodecName) -> (Context, ClusterResult<Option<Vec<u8>>>) {
        let descriptor = match self.methods.get(method) {
            Some(descriptor) => descriptor,
            None => {
                let ctx = Context::new(0, None);
                let err = ClusterError::routing(format!("unknown method {:?} on service {:?}", method, self.name));
                return (ctx, Err(err));
            }
        };
        let call_count = descriptor.call_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = Context::new(call_count, None);
        let result = (descriptor.handler)(&ctx, payload, codec);
        (ctx, result)
    }

    /// Runs one request to completion: async mode spawns a dedicated thread,
    /// synchronous mode enqueues onto this service's ordered worker. Either
    /// way `respond` is invoked exactly once with the context and outcome.
    /// `is_push` requests still run (counters still tick, panics still
    /// recover) but their outcome is discarded by the caller.
    pub fn handle<F>(self: &Arc<Self>, session: u32, method: String, payload: Vec<u8>, codec: CodecName, respond: F)
    where
        F: FnOnce(Context, ClusterResult<Option<Vec<u8>>>) + Send + 'static,
    {
        let this = Arc::clone(self);
        let job_method = method.clone();
        let run = move || {
            let outcome = catch_panic(|| this.dispatch_now(&job_method, &payload, &codec));
            let (ctx, result) = match outcome {
                Ok((ctx, result)) => (ctx, result),
                Err(panic_msg) => {
                    let message = format!("[panic] call={}.{} err={}", this.name, job_method, panic_msg);
                    (this.recovery)(&message);
                    (Context::new(0, None), Err(ClusterError::Remote(message)))
                }
            };
            respond(ctx, result);
        };

        match &self.sync {
            Some(worker) => worker.submit(session, method, run),
            None => {
                thread::Builder::new()
                    .name(format!("cluster-server-dispatch-{}-{}", self.name, method))
                    .spawn(run)
                    .expect("failed to spawn dispatch thread");
            }
        }
    }
}

fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        }
    })
}

/// Process-wide name → Service registry. Many concurrent readers,
/// insert-once per name.
pub struct Dispatcher {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher { services: RwLock::new(HashMap::new()) }
    }

    /// Registers a service. Fails if the name is already taken: registration
    /// is one-shot per name.
    pub fn register(&self, service: Service) -> ClusterResult<()> {
        let mut services = self.services.write();
        if services.contains_key(service.name()) {
            return Err(ClusterError::validation(format!("service {:?} is already registered", service.name())));
        }
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().get(name).cloned()
    }

    pub fn default_codec(&self, name: &str) -> Option<CodecName> {
        self.services.read().get(name).map(|svc| svc.default_codec.clone())
    }

    /// Looks up the service and runs the request, deferring to
    /// [`Service::handle`] for the execution mode.
    pub fn dispatch<F>(&self, service_name: &str, session: u32, method: String, payload: Vec<u8>, codec_override: Option<CodecName>, respond: F)
    where
        F: FnOnce(Context, ClusterResult<Option<Vec<u8>>>) + Send + 'static,
    {
        let service = match self.service(service_name) {
            Some(service) => service,
            None => {
                let err = ClusterError::routing(format!("unknown service {:?}", service_name));
                respond(Context::new(0, None), Err(err));
                return;
            }
        };
        let codec = codec_override.unwrap_or_else(|| service.default_codec.clone());
        service.handle(session, method, payload, codec, respond);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
