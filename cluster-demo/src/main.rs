//! Wires the wire codec, client-side session machine, and server-side
//! dispatch machine together against one in-process gate and walks through
//! three end-to-end scenarios: a round-trip JSON call, a push issued while
//! disconnected, and a call whose argument spans several wire frames.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use cluster_client::{call_host, send_host, ClientOptions, ClusterRegistry};
use cluster_core::{logging, Address, ClusterError, ClusterResult, CodecName, PART_SIZE};
use cluster_server::{Context, Dispatcher, GateListener, GateOptions, ServiceBuilder, ServiceOptions};

#[derive(Serialize, Deserialize)]
struct AddArgs {
    #[serde(rename = "A")]
    a: i64,
    #[serde(rename = "B")]
    b: i64,
}

#[derive(Serialize, Deserialize)]
struct AddReply {
    #[serde(rename = "C")]
    c: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct SetxArgs {
    key: String,
    val: String,
}

fn build_dispatcher(observed_setx: Arc<Mutex<Vec<SetxArgs>>>, observed_blob_len: Arc<Mutex<Option<usize>>>) -> Arc<Dispatcher> {
    let log = logging::discard();
    let dispatcher = Arc::new(Dispatcher::new());

    let airth = ServiceBuilder::new("airth", ServiceOptions::new())
        .method("Add", |_ctx: &Context, args: Option<AddArgs>| -> ClusterResult<Option<AddReply>> {
            let args = args.ok_or_else(|| ClusterError::validation("missing arguments"))?;
            Ok(Some(AddReply { c: args.a + args.b }))
        })
        .build(log.clone())
        .expect("airth has at least one registered method");
    dispatcher.register(airth).expect("airth registers once");

    let sdb = ServiceBuilder::new("sdb", ServiceOptions::new())
        .method("SETX", move |_ctx: &Context, args: Option<SetxArgs>| -> ClusterResult<Option<()>> {
            if let Some(args) = args {
                observed_setx.lock().unwrap().push(args);
            }
            Ok(None)
        })
        .build(log.clone())
        .expect("sdb has at least one registered method");
    dispatcher.register(sdb).expect("sdb registers once");

    let blob = ServiceBuilder::new("blob", ServiceOptions::new().with_codec(CodecName::MsgPack))
        .method("Store", move |_ctx: &Context, args: Option<Vec<u8>>| -> ClusterResult<Option<()>> {
            let args = args.ok_or_else(|| ClusterError::validation("missing blob"))?;
            *observed_blob_len.lock().unwrap() = Some(args.len());
            Ok(None)
        })
        .build(log)
        .expect("blob has at least one registered method");
    dispatcher.register(blob).expect("blob registers once");

    dispatcher
}

fn main() {
    let log = logging::discard();

    let observed_setx = Arc::new(Mutex::new(Vec::new()));
    let observed_blob_len = Arc::new(Mutex::new(None));

    let dispatcher = build_dispatcher(Arc::clone(&observed_setx), Arc::clone(&observed_blob_len));
    let listener = GateListener::new(dispatcher, GateOptions::new(), log.clone());
    let bound = listener.start("127.0.0.1:0").expect("gate binds to an ephemeral port");
    let address = bound.to_string();

    // S1 -- round-trip JSON call.
    let registry = ClusterRegistry::new(log.clone());
    let add_args = AddArgs { a: 7, b: 8 };
    let reply: Option<AddReply> = call_host(&registry, "demo", &address, ClientOptions::default(), Address::Name("airth".into()), "Add", Some(&add_args))
        .expect("Add call succeeds");
    let reply = reply.expect("Add declares a reply");
    println!("S1: Add(7, 8) = {}", reply.c);
    assert_eq!(reply.c, 15);

    // S2 -- push issued while the connection is still disconnected.
    let push_registry = ClusterRegistry::new(log.clone());
    let setx_args = SetxArgs { key: "srpc2".into(), val: "foobar2".into() };
    send_host(&push_registry, "db", &address, ClientOptions::default(), Address::Name("sdb".into()), "SETX", Some(&setx_args)).expect("push returns immediately");
    thread::sleep(Duration::from_millis(200));
    let seen = observed_setx.lock().unwrap().clone();
    println!("S2: server observed {} push call(s) to SETX", seen.len());
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].key, "srpc2");

    // S3 -- a MessagePack argument spanning several PART_SIZE-sized frames.
    let blob = vec![0x5au8; 3 * PART_SIZE + 7];
    let conn = registry.query("demo").expect("demo connection was registered during S1");
    let _: Option<()> = conn
        .call(Address::Name("blob".into()), "Store", Some(&blob), None, Some(CodecName::MsgPack))
        .expect("Store call succeeds");
    thread::sleep(Duration::from_millis(100));
    let len = observed_blob_len.lock().unwrap().expect("blob handler ran");
    println!("S3: server observed a {}-byte blob", len);
    assert_eq!(len, blob.len());

    println!("all scenarios passed");
}
