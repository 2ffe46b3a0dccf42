//! Typed kernel operations.
//!
//! `JsiiClient` is the surface generated bindings talk to: each method
//! builds one request, sends it through the engine, and marshals the
//! payload using descriptors from the type cache. Returned object
//! references resolve through the registry so proxy identity holds.

use crate::engine::Engine;
use crate::error::{JsiiError, Result};
use crate::marshal::Marshaler;
use crate::registry::{ObjRef, ObjectRegistry};
use crate::types::{MethodDescriptor, ParameterDescriptor, TypeCache, TypeDesc};
use crate::value::Value;
use crate::wire::{Callback, CreateRequest, Override, Request, WireObjRef};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Client for the kernel's request vocabulary.
#[derive(Clone)]
pub struct JsiiClient {
    engine: Arc<Engine>,
    registry: Arc<ObjectRegistry>,
    types: Arc<TypeCache>,
    marshaler: Marshaler,
}

impl JsiiClient {
    pub fn new(engine: Arc<Engine>, registry: Arc<ObjectRegistry>, types: Arc<TypeCache>) -> Self {
        let marshaler = Marshaler::new(registry.clone(), types.clone());
        Self {
            engine,
            registry,
            types,
            marshaler,
        }
    }

    /// Loads an assembly into the kernel.
    pub async fn load(&self, name: &str, version: &str, tarball: &str) -> Result<JsonValue> {
        self.engine
            .request(Request::Load {
                name: name.to_string(),
                version: version.to_string(),
                tarball: tarball.to_string(),
            })
            .await
    }

    /// Instantiates a kernel object and returns its proxy.
    pub async fn create(
        &self,
        fqn: &str,
        args: Vec<Value>,
        overrides: Vec<Override>,
    ) -> Result<ObjRef> {
        let initializer = self.types.class(fqn).and_then(|c| c.initializer.clone());
        let args = self.marshal_args(
            &args,
            initializer.as_ref().map(|m| m.parameters.as_slice()),
        )?;
        let response = self
            .engine
            .request(Request::Create(CreateRequest {
                fqn: fqn.to_string(),
                args,
                overrides,
                interfaces: Vec::new(),
            }))
            .await?;

        match self.marshaler.from_wire(&response, &TypeDesc::Class(fqn.to_string()))? {
            Value::Ref(objref) => Ok(objref),
            other => Err(JsiiError::marshal(format!(
                "create returned {:?} instead of an object reference",
                other
            ))),
        }
    }

    /// Releases a kernel object. Idempotent: only the first call for a
    /// proxy sends a `del`.
    pub async fn del(&self, objref: &ObjRef) -> Result<()> {
        if !self.registry.begin_release(objref) {
            return Ok(());
        }
        if objref.is_host() {
            return Ok(());
        }
        self.engine
            .request(Request::Del {
                objref: WireObjRef::bare(objref.handle()),
            })
            .await?;
        Ok(())
    }

    /// Calls an instance method.
    pub async fn invoke(&self, objref: &ObjRef, method: &str, args: Vec<Value>) -> Result<Value> {
        let descriptor = self.method_descriptor(objref.interfaces(), method);
        let args = self.marshal_args(
            &args,
            descriptor.as_ref().map(|m| m.parameters.as_slice()),
        )?;
        let response = self
            .engine
            .request(Request::Invoke {
                objref: WireObjRef::bare(objref.handle()),
                method: method.to_string(),
                args,
            })
            .await?;
        let returns = descriptor
            .and_then(|m| m.returns)
            .unwrap_or(TypeDesc::Any);
        self.marshaler.from_wire(&field(&response, "result"), &returns)
    }

    /// Calls a static method.
    pub async fn sinvoke(&self, fqn: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let descriptor = self.types.method(fqn, method);
        let args = self.marshal_args(
            &args,
            descriptor.as_ref().map(|m| m.parameters.as_slice()),
        )?;
        let response = self
            .engine
            .request(Request::Sinvoke {
                fqn: fqn.to_string(),
                method: method.to_string(),
                args,
            })
            .await?;
        let returns = descriptor
            .and_then(|m| m.returns)
            .unwrap_or(TypeDesc::Any);
        self.marshaler.from_wire(&field(&response, "result"), &returns)
    }

    /// Reads an instance property.
    pub async fn get(&self, objref: &ObjRef, property: &str) -> Result<Value> {
        let kind = self.property_kind(objref.interfaces(), property);
        let response = self
            .engine
            .request(Request::Get {
                objref: WireObjRef::bare(objref.handle()),
                property: property.to_string(),
            })
            .await?;
        self.marshaler.from_wire(&field(&response, "value"), &kind)
    }

    /// Reads a static property.
    pub async fn sget(&self, fqn: &str, property: &str) -> Result<Value> {
        let kind = self
            .types
            .property(fqn, property)
            .map(|p| p.kind)
            .unwrap_or(TypeDesc::Any);
        let response = self
            .engine
            .request(Request::Sget {
                fqn: fqn.to_string(),
                property: property.to_string(),
            })
            .await?;
        self.marshaler.from_wire(&field(&response, "value"), &kind)
    }

    /// Writes an instance property.
    pub async fn set(&self, objref: &ObjRef, property: &str, value: Value) -> Result<()> {
        let kind = self.property_kind(objref.interfaces(), property);
        let value = self.marshaler.to_wire(&value, &kind)?;
        self.engine
            .request(Request::Set {
                objref: WireObjRef::bare(objref.handle()),
                property: property.to_string(),
                value,
            })
            .await?;
        Ok(())
    }

    /// Writes a static property.
    pub async fn sset(&self, fqn: &str, property: &str, value: Value) -> Result<()> {
        let kind = self
            .types
            .property(fqn, property)
            .map(|p| p.kind)
            .unwrap_or(TypeDesc::Any);
        let value = self.marshaler.to_wire(&value, &kind)?;
        self.engine
            .request(Request::Sset {
                fqn: fqn.to_string(),
                property: property.to_string(),
                value,
            })
            .await?;
        Ok(())
    }

    /// Starts an async kernel method; returns the promise id to pass to
    /// [`JsiiClient::end`].
    pub async fn begin(&self, objref: &ObjRef, method: &str, args: Vec<Value>) -> Result<String> {
        let descriptor = self.method_descriptor(objref.interfaces(), method);
        let args = self.marshal_args(
            &args,
            descriptor.as_ref().map(|m| m.parameters.as_slice()),
        )?;
        let response = self
            .engine
            .request(Request::Begin {
                objref: WireObjRef::bare(objref.handle()),
                method: method.to_string(),
                args,
            })
            .await?;
        field(&response, "promiseid")
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| JsiiError::marshal("begin response is missing its promiseid"))
    }

    /// Awaits an async kernel method started with [`JsiiClient::begin`].
    pub async fn end(&self, promiseid: &str) -> Result<Value> {
        let response = self
            .engine
            .request(Request::End {
                promiseid: promiseid.to_string(),
            })
            .await?;
        self.marshaler
            .from_wire(&field(&response, "result"), &TypeDesc::Any)
    }

    /// Fetches callbacks pending for async methods.
    pub async fn callbacks(&self) -> Result<Vec<Callback>> {
        let response = self.engine.request(Request::Callbacks {}).await?;
        serde_json::from_value(field(&response, "callbacks"))
            .map_err(|e| JsiiError::marshal(format!("malformed callbacks payload: {}", e)))
    }

    /// The kernel's naming table for an assembly. Cached after the first
    /// request.
    pub async fn naming(&self, assembly: &str) -> Result<JsonValue> {
        if let Some(cached) = self.types.naming(assembly) {
            return Ok(cached);
        }
        let response = self
            .engine
            .request(Request::Naming {
                assembly: assembly.to_string(),
            })
            .await?;
        let naming = field(&response, "naming");
        self.types.cache_naming(assembly, naming.clone());
        Ok(naming)
    }

    /// Kernel statistics.
    pub async fn stats(&self) -> Result<JsonValue> {
        self.engine.request(Request::Stats {}).await
    }

    fn marshal_args(
        &self,
        args: &[Value],
        parameters: Option<&[ParameterDescriptor]>,
    ) -> Result<Vec<JsonValue>> {
        args.iter()
            .enumerate()
            .map(|(index, value)| {
                let kind = parameters
                    .and_then(|p| p.get(index))
                    .map(|p| p.kind.clone())
                    .unwrap_or(TypeDesc::Any);
                self.marshaler.to_wire(value, &kind)
            })
            .collect()
    }

    fn method_descriptor(&self, interfaces: &[String], method: &str) -> Option<MethodDescriptor> {
        interfaces
            .iter()
            .find_map(|fqn| self.types.method(fqn, method))
    }

    fn property_kind(&self, interfaces: &[String], property: &str) -> TypeDesc {
        interfaces
            .iter()
            .find_map(|fqn| self.types.property(fqn, property))
            .map(|p| p.kind)
            .unwrap_or(TypeDesc::Any)
    }
}

fn field(response: &JsonValue, name: &str) -> JsonValue {
    response.get(name).cloned().unwrap_or(JsonValue::Null)
}
