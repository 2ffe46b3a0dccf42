//! Scripted kernel for the integration test suite.
//!
//! Speaks the line-delimited JSON protocol on stdio with a small in-memory
//! object model: arithmetic methods, properties, an operation that calls
//! back into the host, an error response, and an abrupt crash. The version
//! announced in `hello` is overridable through `JSII_MOCK_VERSION` so the
//! handshake mismatch path can be exercised end to end.

use jsii_rs::config::KernelConfig;
use jsii_rs::wire::{CreateRequest, Request};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, StdinLock, StdoutLock, Write};

struct KernelObject {
    fqn: String,
    properties: HashMap<String, Value>,
}

struct MockKernel {
    input: StdinLock<'static>,
    output: StdoutLock<'static>,
    objects: HashMap<String, KernelObject>,
    statics: HashMap<String, Value>,
    promises: HashMap<String, Value>,
    next_object: u64,
    next_callback: u64,
    next_promise: u64,
    del_count: u64,
    trace: bool,
}

fn main() {
    let version = std::env::var("JSII_MOCK_VERSION")
        .unwrap_or_else(|_| KernelConfig::RUNTIME_VERSION.to_string());
    let trace = std::env::var("JSII_DEBUG")
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false);

    let mut kernel = MockKernel {
        input: std::io::stdin().lock(),
        output: std::io::stdout().lock(),
        objects: HashMap::new(),
        statics: HashMap::new(),
        promises: HashMap::new(),
        next_object: 10001,
        next_callback: 1,
        next_promise: 1,
        del_count: 0,
        trace,
    };

    if trace {
        eprintln!("mock-kernel: ready (version {})", version);
    }
    kernel.respond(json!({ "hello": version }));

    while let Some(request) = kernel.read_request() {
        kernel.dispatch(request);
    }
}

impl MockKernel {
    fn respond(&mut self, value: Value) {
        let mut line = serde_json::to_vec(&value).expect("response serializes");
        line.push(b'\n');
        self.output.write_all(&line).expect("stdout open");
        self.output.flush().expect("stdout open");
    }

    fn error(&mut self, message: &str) {
        self.respond(json!({"error": message, "stack": "at MockKernel.dispatch"}));
    }

    fn read_request(&mut self) -> Option<Request> {
        loop {
            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if self.trace {
                eprintln!("mock-kernel: {}", trimmed);
            }
            match serde_json::from_str(trimmed) {
                Ok(request) => return Some(request),
                Err(e) => self.error(&format!("unrecognized request: {}", e)),
            }
        }
    }

    fn dispatch(&mut self, request: Request) {
        match request {
            Request::Load { name, .. } => {
                self.respond(json!({"ok": {"assembly": name, "types": 0}}));
            }
            Request::Create(CreateRequest { fqn, .. }) => {
                let short = fqn.rsplit('.').next().unwrap_or(&fqn).to_string();
                let handle = format!("{}@{}", short, self.next_object);
                self.next_object += 1;
                self.objects.insert(
                    handle.clone(),
                    KernelObject {
                        fqn,
                        properties: HashMap::new(),
                    },
                );
                self.respond(json!({"ok": {"$jsii.byref": handle}}));
            }
            Request::Del { objref } => {
                // Idempotent on the wire: deleting an absent handle is a no-op.
                self.objects.remove(&objref.handle);
                self.del_count += 1;
                self.respond(json!({"ok": {}}));
            }
            Request::Invoke {
                objref,
                method,
                args,
            } => {
                if !self.objects.contains_key(&objref.handle) {
                    self.error(&format!("no such object: {}", objref.handle));
                    return;
                }
                self.invoke_method(&method, args);
            }
            Request::Sinvoke { method, args, .. } => {
                self.invoke_method(&method, args);
            }
            Request::Get { objref, property } => {
                let value = self
                    .objects
                    .get(&objref.handle)
                    .and_then(|object| object.properties.get(&property).cloned())
                    .unwrap_or(Value::Null);
                self.respond(json!({"ok": {"value": value}}));
            }
            Request::Sget { fqn, property } => {
                let value = self
                    .statics
                    .get(&format!("{}.{}", fqn, property))
                    .cloned()
                    .unwrap_or(Value::Null);
                self.respond(json!({"ok": {"value": value}}));
            }
            Request::Set {
                objref,
                property,
                value,
            } => match self.objects.get_mut(&objref.handle) {
                Some(object) => {
                    object.properties.insert(property, value);
                    self.respond(json!({"ok": {}}));
                }
                None => self.error(&format!("no such object: {}", objref.handle)),
            },
            Request::Sset {
                fqn,
                property,
                value,
            } => {
                self.statics.insert(format!("{}.{}", fqn, property), value);
                self.respond(json!({"ok": {}}));
            }
            Request::Begin { method, args, .. } => {
                let result = match evaluate(&method, &args) {
                    Some(result) => result,
                    None => {
                        self.error(&format!("no such method: {}", method));
                        return;
                    }
                };
                let promiseid = format!("promise-{}", self.next_promise);
                self.next_promise += 1;
                self.promises.insert(promiseid.clone(), result);
                self.respond(json!({"ok": {"promiseid": promiseid}}));
            }
            Request::End { promiseid } => match self.promises.remove(&promiseid) {
                Some(result) => self.respond(json!({"ok": {"result": result}})),
                None => self.error(&format!("no such promise: {}", promiseid)),
            },
            Request::Callbacks {} => {
                self.respond(json!({"ok": {"callbacks": []}}));
            }
            Request::Complete { cbid, .. } => {
                self.error(&format!("unexpected complete for {}", cbid));
            }
            Request::Naming { assembly } => {
                self.respond(json!({"ok": {"naming": {"rust": {"module": assembly}}}}));
            }
            Request::Stats {} => {
                self.respond(json!({"ok": {
                    "objectCount": self.objects.len(),
                    "delCount": self.del_count,
                }}));
            }
        }
    }

    fn invoke_method(&mut self, method: &str, args: Vec<Value>) {
        match method {
            "fail" => self.respond(json!({
                "error": "intentional failure",
                "stack": "at MockKernel.fail",
            })),
            "crash" => {
                eprintln!("simulated crash");
                std::process::exit(1);
            }
            "callHost" => self.call_host(args),
            _ => match evaluate(method, &args) {
                Some(result) => self.respond(json!({"ok": {"result": result}})),
                None => self.error(&format!("no such method: {}", method)),
            },
        }
    }

    /// Interrupts the response flow with a callback: invokes `args[1]` on
    /// the host object `args[0]` with the remaining arguments, then answers
    /// the original request with twice the callback's numeric result (or 0
    /// when the host reported an error).
    fn call_host(&mut self, args: Vec<Value>) {
        let (Some(target), Some(method)) = (args.first().cloned(), args.get(1).and_then(Value::as_str).map(str::to_string))
        else {
            self.error("callHost expects a target and a method name");
            return;
        };
        let callback_args: Vec<Value> = args[2..].to_vec();

        let cbid = format!("cb-{}", self.next_callback);
        self.next_callback += 1;
        self.respond(json!({"callback": {
            "cbid": cbid,
            "invoke": {"objref": target, "method": method, "args": callback_args},
        }}));

        match self.await_complete(&cbid) {
            None => {} // host went away; main loop will see EOF
            Some((_, Some(_err))) => self.respond(json!({"ok": {"result": 0}})),
            Some((result, None)) => {
                let result = match result.as_ref().and_then(Value::as_f64) {
                    Some(n) => whole(n * 2.0),
                    None => result.unwrap_or(Value::Null),
                };
                self.respond(json!({"ok": {"result": result}}));
            }
        }
    }

    /// Waits for the completion of one callback, serving any nested
    /// requests the host issues in the meantime.
    fn await_complete(&mut self, cbid: &str) -> Option<(Option<Value>, Option<String>)> {
        loop {
            let request = self.read_request()?;
            match request {
                Request::Complete {
                    cbid: completed,
                    result,
                    err,
                } => {
                    if completed != cbid {
                        self.error(&format!("complete for unknown callback {}", completed));
                        continue;
                    }
                    return Some((result, err));
                }
                other => self.dispatch(other),
            }
        }
    }
}

/// Shared method table for invoke, sinvoke, and begin.
fn evaluate(method: &str, args: &[Value]) -> Option<Value> {
    match method {
        "add" => {
            let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
            Some(whole(sum))
        }
        "echo" => Some(args.first().cloned().unwrap_or(Value::Null)),
        _ => None,
    }
}

fn whole(n: f64) -> Value {
    if n.fract() == 0.0 {
        json!(n as i64)
    } else {
        json!(n)
    }
}
