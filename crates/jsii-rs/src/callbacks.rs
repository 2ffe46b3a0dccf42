//! Callback dispatch to host objects.
//!
//! The engine hands every callback descriptor to a [`CallbackHandler`]; the
//! dispatcher here is the default one. It resolves the target host object
//! from the registry, recovers member signatures from the type cache so
//! arguments and results are marshaled under their declared descriptors,
//! and reports every host-side failure as an `err` completion. A missing
//! target is an `err` too, never a protocol failure.

use crate::engine::{CallbackHandler, KernelSession};
use crate::marshal::Marshaler;
use crate::registry::{HostObject, ObjectRegistry};
use crate::types::{TypeCache, TypeDesc};
use crate::value::Value;
use crate::wire::{Callback, WireObjRef};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

/// Default callback handler backed by the object registry and type cache.
pub struct CallbackDispatcher {
    registry: Arc<ObjectRegistry>,
    types: Arc<TypeCache>,
    marshaler: Marshaler,
}

impl CallbackDispatcher {
    pub fn new(registry: Arc<ObjectRegistry>, types: Arc<TypeCache>) -> Self {
        let marshaler = Marshaler::new(registry.clone(), types.clone());
        Self {
            registry,
            types,
            marshaler,
        }
    }

    fn target(&self, objref: &WireObjRef) -> std::result::Result<Arc<dyn HostObject>, String> {
        self.registry
            .host_object(&objref.handle)
            .ok_or_else(|| format!("no host object is registered for '{}'", objref.handle))
    }

    /// Interfaces to search for member signatures: the ones announced on the
    /// wire, falling back to the ones the object was tracked under.
    fn interfaces(&self, objref: &WireObjRef) -> Vec<String> {
        objref
            .interfaces
            .clone()
            .or_else(|| self.registry.host_interfaces(&objref.handle))
            .unwrap_or_default()
    }

    fn unmarshal(&self, wire: &JsonValue, desc: &TypeDesc) -> std::result::Result<Value, String> {
        self.marshaler
            .from_wire(wire, desc)
            .map_err(|e| e.to_string())
    }

    fn marshal(
        &self,
        value: &Value,
        desc: &TypeDesc,
    ) -> std::result::Result<Option<JsonValue>, String> {
        let wire = self
            .marshaler
            .to_wire(value, desc)
            .map_err(|e| e.to_string())?;
        // A null result completes the callback as void.
        Ok(if wire.is_null() { None } else { Some(wire) })
    }
}

#[async_trait]
impl CallbackHandler for CallbackDispatcher {
    async fn handle(
        &self,
        callback: &Callback,
        kernel: &mut KernelSession<'_>,
    ) -> std::result::Result<Option<JsonValue>, String> {
        if let Some(invoke) = &callback.invoke {
            debug!(
                "dispatching callback invoke {}.{}",
                invoke.objref.handle, invoke.method
            );
            let target = self.target(&invoke.objref)?;
            let method = self
                .interfaces(&invoke.objref)
                .iter()
                .find_map(|fqn| self.types.method(fqn, &invoke.method));

            let parameters = method.as_ref().map(|m| m.parameters.as_slice());
            let mut args = Vec::with_capacity(invoke.args.len());
            for (index, wire) in invoke.args.iter().enumerate() {
                let kind = parameters
                    .and_then(|p| p.get(index))
                    .map(|p| p.kind.clone())
                    .unwrap_or(TypeDesc::Any);
                args.push(self.unmarshal(wire, &kind)?);
            }

            let result = target
                .invoke(&invoke.method, args, kernel)
                .await
                .map_err(|e| e.report().to_string())?;
            let returns = method.and_then(|m| m.returns).unwrap_or(TypeDesc::Any);
            return self.marshal(&result, &returns);
        }

        if let Some(get) = &callback.get {
            debug!(
                "dispatching callback get {}.{}",
                get.objref.handle, get.property
            );
            let target = self.target(&get.objref)?;
            let kind = self
                .interfaces(&get.objref)
                .iter()
                .find_map(|fqn| self.types.property(fqn, &get.property))
                .map(|p| p.kind)
                .unwrap_or(TypeDesc::Any);

            let value = target
                .get(&get.property, kernel)
                .await
                .map_err(|e| e.report().to_string())?;
            return self.marshal(&value, &kind);
        }

        if let Some(set) = &callback.set {
            debug!(
                "dispatching callback set {}.{}",
                set.objref.handle, set.property
            );
            let target = self.target(&set.objref)?;
            let kind = self
                .interfaces(&set.objref)
                .iter()
                .find_map(|fqn| self.types.property(fqn, &set.property))
                .map(|p| p.kind)
                .unwrap_or(TypeDesc::Any);

            let value = self.unmarshal(&set.value, &kind)?;
            target
                .set(&set.property, value, kernel)
                .await
                .map_err(|e| e.report().to_string())?;
            return Ok(None);
        }

        Err("callback descriptor carries no invoke, get, or set body".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::types::{
        ClassDescriptor, MethodDescriptor, ParameterDescriptor, PropertyDescriptor,
    };
    use crate::value::HostError;
    use crate::wire::Request;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct Adder;

    #[async_trait]
    impl HostObject for Adder {
        async fn invoke(
            &self,
            method: &str,
            args: Vec<Value>,
            _kernel: &mut KernelSession<'_>,
        ) -> std::result::Result<Value, HostError> {
            match method {
                "addFive" => {
                    let n = args
                        .first()
                        .and_then(Value::as_number)
                        .ok_or_else(|| HostError::new("expected a number"))?;
                    Ok(Value::Number(n + 5.0))
                }
                "fails" => Err(HostError::with_cause("invocation failed", "boom")),
                other => Err(HostError::new(format!("no such method: {}", other))),
            }
        }
    }

    struct Gauge {
        value: Mutex<f64>,
    }

    #[async_trait]
    impl HostObject for Gauge {
        async fn get(
            &self,
            property: &str,
            _kernel: &mut KernelSession<'_>,
        ) -> std::result::Result<Value, HostError> {
            match property {
                "value" => Ok(Value::Number(*self.value.lock().unwrap())),
                other => Err(HostError::new(format!("no such property: {}", other))),
            }
        }

        async fn set(
            &self,
            property: &str,
            value: Value,
            _kernel: &mut KernelSession<'_>,
        ) -> std::result::Result<(), HostError> {
            match property {
                "value" => {
                    let n = value
                        .as_number()
                        .ok_or_else(|| HostError::new("expected a number"))?;
                    *self.value.lock().unwrap() = n;
                    Ok(())
                }
                other => Err(HostError::new(format!("no such property: {}", other))),
            }
        }
    }

    struct Harness {
        engine: Engine,
        registry: Arc<ObjectRegistry>,
        types: Arc<TypeCache>,
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    fn harness() -> Harness {
        let (host, kernel) = tokio::io::duplex(64 * 1024);
        let (host_reader, host_writer) = tokio::io::split(host);
        let (kernel_reader, kernel_writer) = tokio::io::split(kernel);

        let registry = Arc::new(ObjectRegistry::new());
        let types = Arc::new(TypeCache::new());
        let engine = Engine::from_transport(host_reader, host_writer, "1.2.3", registry.clone());
        engine.set_callback_handler(Arc::new(CallbackDispatcher::new(
            registry.clone(),
            types.clone(),
        )));

        Harness {
            engine,
            registry,
            types,
            reader: BufReader::new(kernel_reader),
            writer: kernel_writer,
        }
    }

    async fn kernel_send(writer: &mut WriteHalf<DuplexStream>, value: JsonValue) {
        let mut line = serde_json::to_vec(&value).unwrap();
        line.push(b'\n');
        writer.write_all(&line).await.unwrap();
        writer.flush().await.unwrap();
    }

    async fn kernel_recv(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> JsonValue {
        let mut line = String::new();
        assert!(reader.read_line(&mut line).await.unwrap() > 0);
        serde_json::from_str(&line).unwrap()
    }

    impl Harness {
        /// Runs one host request while scripting the kernel side: handshake,
        /// swallow the triggering request, emit the callback, capture the
        /// completion, finish the request.
        async fn roundtrip_callback(self, callback: JsonValue) -> JsonValue {
            let Harness {
                engine,
                mut reader,
                mut writer,
                ..
            } = self;

            let request = engine.request(Request::Invoke {
                objref: crate::wire::WireObjRef::bare("Remote@1"),
                method: "trigger".into(),
                args: vec![],
            });

            let kernel = async move {
                kernel_send(&mut writer, json!({"hello": "1.2.3"})).await;
                kernel_recv(&mut reader).await;
                kernel_send(&mut writer, json!({ "callback": callback })).await;
                let complete = kernel_recv(&mut reader).await;
                kernel_send(&mut writer, json!({"ok": null})).await;
                complete
            };

            let (result, complete) = tokio::join!(request, kernel);
            result.unwrap();
            complete
        }
    }

    #[tokio::test]
    async fn test_invoke_uses_method_descriptor() {
        let h = harness();
        h.types.register_class(
            ClassDescriptor::new("acme.IAdder").with_method(
                MethodDescriptor::new("addFive")
                    .with_parameter(ParameterDescriptor::new("n", TypeDesc::Number))
                    .returning(TypeDesc::Number),
            ),
        );
        let objref = h.registry.track(Arc::new(Adder), &["acme.IAdder".into()]);
        let handle = objref.handle().to_string();

        let complete = h
            .roundtrip_callback(json!({
                "cbid": "cb1",
                "invoke": {"objref": handle, "method": "addFive", "args": [3]}
            }))
            .await;
        assert_eq!(complete, json!({"complete": {"cbid": "cb1", "result": 8}}));
    }

    #[tokio::test]
    async fn test_get_and_set_dispatch() {
        let h = harness();
        h.types.register_class(
            ClassDescriptor::new("acme.IGauge")
                .with_property(PropertyDescriptor::new("value", TypeDesc::Number)),
        );
        let gauge = Arc::new(Gauge {
            value: Mutex::new(1.5),
        });
        let objref = h.registry.track(gauge.clone(), &["acme.IGauge".into()]);
        let handle = objref.handle().to_string();

        let complete = h
            .roundtrip_callback(json!({
                "cbid": "cb1",
                "get": {"objref": handle, "property": "value"}
            }))
            .await;
        assert_eq!(complete, json!({"complete": {"cbid": "cb1", "result": 1.5}}));

        let h = harness();
        let objref = h.registry.track(gauge.clone(), &["acme.IGauge".into()]);
        let handle = objref.handle().to_string();
        let complete = h
            .roundtrip_callback(json!({
                "cbid": "cb2",
                "set": {"objref": handle, "property": "value", "value": 4}
            }))
            .await;
        // A set completes as void: no result, no err.
        assert_eq!(complete, json!({"complete": {"cbid": "cb2"}}));
        assert_eq!(*gauge.value.lock().unwrap(), 4.0);
    }

    #[tokio::test]
    async fn test_missing_target_is_reported_not_fatal() {
        let h = harness();
        let complete = h
            .roundtrip_callback(json!({
                "cbid": "cb1",
                "invoke": {"objref": "jsii@404", "method": "anything", "args": []}
            }))
            .await;
        assert_eq!(
            complete["complete"]["err"],
            json!("no host object is registered for 'jsii@404'")
        );
    }

    #[tokio::test]
    async fn test_host_error_reports_innermost_message() {
        let h = harness();
        let objref = h.registry.track(Arc::new(Adder), &[]);
        let handle = objref.handle().to_string();

        let complete = h
            .roundtrip_callback(json!({
                "cbid": "cb1",
                "invoke": {"objref": handle, "method": "fails", "args": []}
            }))
            .await;
        assert_eq!(complete["complete"]["err"], json!("boom"));
    }

    #[tokio::test]
    async fn test_descriptor_without_body_is_an_err() {
        let h = harness();
        let complete = h.roundtrip_callback(json!({"cbid": "cb1"})).await;
        assert_eq!(
            complete["complete"]["err"],
            json!("callback descriptor carries no invoke, get, or set body")
        );
    }
}
