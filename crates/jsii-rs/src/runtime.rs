//! Runtime facade.
//!
//! Owns the engine, registry, and type cache, wires the default callback
//! dispatcher, and hands out the typed client. One `JsiiRuntime` maps to
//! one kernel process; after a fatal failure or a shutdown a fresh instance
//! must be constructed.

use crate::callbacks::CallbackDispatcher;
use crate::client::JsiiClient;
use crate::engine::{CallbackHandler, Engine};
use crate::error::Result;
use crate::process::KernelSpec;
use crate::registry::ObjectRegistry;
use crate::types::TypeCache;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Entry point for host applications and generated bindings.
pub struct JsiiRuntime {
    engine: Arc<Engine>,
    registry: Arc<ObjectRegistry>,
    types: Arc<TypeCache>,
    client: JsiiClient,
}

impl Default for JsiiRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl JsiiRuntime {
    /// Runtime that locates the kernel from the environment and spawns it
    /// lazily on first use.
    pub fn new() -> Self {
        Self::with_spec(KernelSpec::from_env())
    }

    /// Runtime with an explicit kernel configuration.
    pub fn with_spec(spec: KernelSpec) -> Self {
        let registry = Arc::new(ObjectRegistry::new());
        let engine = Arc::new(Engine::new(spec, registry.clone()));
        Self::wire(engine, registry)
    }

    /// Runtime speaking over an already-connected transport, for embedding
    /// and tests.
    pub fn from_transport<R, W>(reader: R, writer: W, expected_version: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let registry = Arc::new(ObjectRegistry::new());
        let engine = Arc::new(Engine::from_transport(
            reader,
            writer,
            expected_version,
            registry.clone(),
        ));
        Self::wire(engine, registry)
    }

    fn wire(engine: Arc<Engine>, registry: Arc<ObjectRegistry>) -> Self {
        let types = Arc::new(TypeCache::new());
        engine.set_callback_handler(Arc::new(CallbackDispatcher::new(
            registry.clone(),
            types.clone(),
        )));
        let client = JsiiClient::new(engine.clone(), registry.clone(), types.clone());
        Self {
            engine,
            registry,
            types,
            client,
        }
    }

    /// The typed operation surface.
    pub fn client(&self) -> &JsiiClient {
        &self.client
    }

    /// The handle/proxy table.
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// The descriptor cache generated bindings populate.
    pub fn types(&self) -> &Arc<TypeCache> {
        &self.types
    }

    /// The raw engine, for requests outside the typed vocabulary.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Replaces the default callback dispatcher.
    pub fn set_callback_handler(&self, handler: Arc<dyn CallbackHandler>) {
        self.engine.set_callback_handler(handler);
    }

    /// Starts the kernel and performs the handshake. Idempotent.
    pub async fn start(&self) -> Result<()> {
        self.engine.start().await
    }

    /// Terminates the kernel: graceful stdin close, bounded wait, kill.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_facade_wiring() {
        let (host, kernel) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(host);
        let runtime = JsiiRuntime::from_transport(reader, writer, "1.2.3");

        let script = tokio::spawn(async move {
            let (kernel_reader, mut kernel_writer) = tokio::io::split(kernel);
            kernel_writer
                .write_all(b"{\"hello\":\"1.2.3\"}\n")
                .await
                .unwrap();

            let mut reader = BufReader::new(kernel_reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request, json!({"stats": {}}));

            kernel_writer
                .write_all(b"{\"ok\":{\"objectCount\":0}}\n")
                .await
                .unwrap();
        });

        runtime.start().await.unwrap();
        let stats = runtime.client().stats().await.unwrap();
        assert_eq!(stats["objectCount"], json!(0));
        script.await.unwrap();
    }
}
